//! Batch execution with positional results

use std::fmt;

use fleet_shared::{CommandResult, ShardAssignment};
use serde::{Serialize, Serializer};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::executor::CommandOrchestrator;
use super::OrchestratorError;
use crate::command::CommandTemplate;
use crate::routing::group_by_shard;

/// Outcome of one batch input
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchItem {
    /// Never dispatched: validation or assignment failed
    Rejected {
        #[serde(serialize_with = "serialize_display")]
        error: OrchestratorError,
    },
    /// Dispatched; the result may still be a terminal failure
    Completed { result: CommandResult },
}

fn serialize_display<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: fmt::Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

impl BatchItem {
    pub fn is_accepted(&self) -> bool {
        matches!(self, BatchItem::Completed { result } if result.is_accepted())
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, BatchItem::Rejected { .. })
    }

    pub fn result(&self) -> Option<&CommandResult> {
        match self {
            BatchItem::Completed { result } => Some(result),
            BatchItem::Rejected { .. } => None,
        }
    }

    /// Why the input never reached dispatch
    pub fn error(&self) -> Option<&OrchestratorError> {
        match self {
            BatchItem::Rejected { error } => Some(error),
            BatchItem::Completed { .. } => None,
        }
    }
}

/// Summary of a batch; `results[i]` belongs to input `i`
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub total_count: usize,
    pub success_count: usize,
    pub results: Vec<BatchItem>,
}

impl BatchResult {
    pub fn rejected_count(&self) -> usize {
        self.results.iter().filter(|item| item.is_rejected()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.total_count - self.success_count - self.rejected_count()
    }
}

/// Progress of one input; `Pending` carries what the next stage needs
enum Slot<T> {
    Done(BatchItem),
    Pending(T),
}

impl<T> Slot<T> {
    fn rejected(error: impl Into<OrchestratorError>) -> Self {
        Slot::Done(BatchItem::Rejected {
            error: error.into(),
        })
    }

    fn pending(&self) -> Option<&T> {
        match self {
            Slot::Pending(next) => Some(next),
            Slot::Done(_) => None,
        }
    }
}

/// Validated and assigned, ready to dispatch
struct Planned {
    template: CommandTemplate,
    shard: ShardAssignment,
}

/// Dispatch running on its own task
struct Dispatching {
    device_id: String,
    region: String,
    handle: JoinHandle<CommandResult>,
}

impl Dispatching {
    async fn finish(self, index: usize) -> CommandResult {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(index, device_id = %self.device_id, "Dispatch task failed: {}", e);
                CommandResult::failed(
                    self.device_id,
                    self.region,
                    0,
                    format!("dispatch task failed: {}", e),
                )
            }
        }
    }
}

impl CommandOrchestrator {
    /// Execute many raw commands
    ///
    /// Bad inputs are recorded in place and never abort the batch. Valid
    /// commands are subscribed together, then dispatched in parallel under
    /// the worker limit.
    pub async fn execute_batch<S>(&self, raws: &[S]) -> BatchResult
    where
        S: AsRef<str>,
    {
        let total_count = raws.len();
        info!("Executing batch of {} commands", total_count);

        let validated: Vec<Slot<CommandTemplate>> = raws
            .iter()
            .enumerate()
            .map(|(index, raw)| match self.validator.validate(raw.as_ref()) {
                Ok(template) => Slot::Pending(template),
                Err(e) => {
                    warn!(index, "Batch item rejected: {}", e);
                    Slot::rejected(e)
                }
            })
            .collect();

        let device_ids: Vec<&str> = validated
            .iter()
            .filter_map(Slot::pending)
            .map(|t| t.device_id())
            .collect();
        let subscribed = self.subscriptions.ensure_subscribed_batch(&device_ids).await;
        let unsubscribed = subscribed.iter().filter(|(_, outcome)| outcome.is_err()).count();
        if unsubscribed > 0 {
            warn!("{} devices without status subscription, dispatching anyway", unsubscribed);
        }

        let planned: Vec<Slot<Planned>> = validated
            .into_iter()
            .enumerate()
            .map(|(index, slot)| match slot {
                Slot::Pending(template) => {
                    match self.assigner.assign(template.device_id(), template.region()) {
                        Ok(shard) => Slot::Pending(Planned { template, shard }),
                        Err(e) => {
                            warn!(index, "Batch item not assignable: {}", e);
                            Slot::rejected(e)
                        }
                    }
                }
                Slot::Done(item) => Slot::Done(item),
            })
            .collect();

        let routed = planned
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.pending().map(|p| (index, &p.shard)));
        for (shard_key, indexes) in group_by_shard(routed) {
            debug!(shard = %shard_key, "{} commands routed", indexes.len());
        }

        // Every dispatch is spawned before any is awaited
        let dispatching: Vec<Slot<Dispatching>> = planned
            .into_iter()
            .map(|slot| match slot {
                Slot::Pending(p) => Slot::Pending(self.spawn_dispatch(p)),
                Slot::Done(item) => Slot::Done(item),
            })
            .collect();

        let mut results = Vec::with_capacity(total_count);
        for (index, slot) in dispatching.into_iter().enumerate() {
            results.push(match slot {
                Slot::Done(item) => item,
                Slot::Pending(running) => BatchItem::Completed {
                    result: running.finish(index).await,
                },
            });
        }

        let batch = BatchResult {
            total_count,
            success_count: results.iter().filter(|item| item.is_accepted()).count(),
            results,
        };

        info!(
            "Batch complete: total {}, accepted {}, failed {}, rejected {}",
            batch.total_count,
            batch.success_count,
            batch.failed_count(),
            batch.rejected_count()
        );
        batch
    }

    fn spawn_dispatch(&self, planned: Planned) -> Dispatching {
        let dispatcher = self.dispatcher.clone();
        let workers = self.workers.clone();
        let device_id = planned.template.device_id().to_string();
        let region = planned.shard.region.clone();
        let handle = tokio::spawn(async move {
            // The semaphore is never closed
            let _permit = workers.acquire_owned().await.ok();
            dispatcher.dispatch(&planned.template, &planned.shard).await
        });
        Dispatching {
            device_id,
            region,
            handle,
        }
    }
}
