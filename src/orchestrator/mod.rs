//! Command orchestration
//!
//! This module handles:
//! - The single-command flow: validate, subscribe, assign, dispatch
//! - Batches with per-item isolation and positional results
//! - Optional identity gating before dispatch
//! - On-demand device status queries through the shard endpoint

mod batch;
mod executor;

pub use batch::{BatchItem, BatchResult};
pub use executor::CommandOrchestrator;

use thiserror::Error;

use crate::command::ValidationError;
use crate::routing::AssignError;
use crate::transport::TransportError;

/// Failures surfaced to the caller of a single command or status query
///
/// Command transport failures never appear here; they end as a failed
/// `CommandResult`. A status query has no result to carry them, so its
/// exhausted retries surface as `StatusQueryFailed`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),

    #[error("shard assignment failed: {0}")]
    Assignment(#[from] AssignError),

    #[error("identity rejected for device {0}")]
    IdentityRejected(String),

    #[error("status query for {device_id} failed after {attempts} attempts: {source}")]
    StatusQueryFailed {
        device_id: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },
}
