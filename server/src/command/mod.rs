//! Command handling for the simulated endpoint
//!
//! This module handles:
//! - Accepting or rejecting delivered commands
//! - Remembering the status each command sets
//! - Re-publishing last known status to subscribers

mod handler;
mod publisher;

pub use handler::CommandHandler;
pub use publisher::StatusPublisher;
