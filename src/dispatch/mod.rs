//! Command dispatch with bounded retries
//!
//! This module handles:
//! - Sending a command through the transport, one attempt at a time
//! - Bounding each attempt with a timeout
//! - Fixed-interval retries up to the policy's attempt limit
//! - Turning exhaustion into a terminal failed result
//! - On-demand device status queries under the same policy

mod dispatcher;
mod policy;

pub use dispatcher::RetryingDispatcher;
pub use policy::{default_recovery, RecoveryCallback, RetryExhausted, RetryPolicy};
