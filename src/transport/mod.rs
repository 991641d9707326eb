//! Collaborator transports
//!
//! This module handles:
//! - The command and subscription transport traits
//! - An in-process simulated endpoint
//! - A TCP client for the frame protocol

pub mod memory;
pub mod tcp;
pub mod traits;

pub use memory::{DeliveredCommand, InMemoryTransport};
pub use tcp::TcpTransport;
pub use traits::{CommandTransport, SubscriptionTransport, TransportError};
