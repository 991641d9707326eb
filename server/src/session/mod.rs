//! Session management for connected control-plane clients
//!
//! This module handles:
//! - Reading frames from each client connection
//! - Tracking which connection carries each device's status feed
//! - Pushing status frames to subscribers

mod connection;
mod manager;

pub use connection::Session;
pub use manager::SessionManager;
