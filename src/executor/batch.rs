use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::ErrorKind;
use crate::model::{DeviceId, DeviceResult};

use super::command::{CommandExecutor, interrupted};
use super::{CancelToken, DevicePlan};

/// Results of one plan run over a set of devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: BTreeMap<DeviceId, DeviceResult>,
    pub success_count: usize,
    pub total: usize,
}

impl BatchOutcome {
    pub fn any_success(&self) -> bool {
        self.success_count > 0
    }
}

/// Fans a plan out over many devices with at most `limit` in flight.
pub struct BatchExecutor {
    executor: Arc<CommandExecutor>,
    limit: Arc<Semaphore>,
    concurrency: usize,
}

impl BatchExecutor {
    pub fn new(executor: Arc<CommandExecutor>, concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            executor,
            limit: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Runs `plan` once per distinct target.
    ///
    /// `on_result` sees each device result as it completes, in completion
    /// order. Every target ends up with exactly one result, including devices
    /// that never started because the batch was cancelled.
    pub async fn run<F>(
        &self,
        targets: &[DeviceId],
        plan: Arc<DevicePlan>,
        cancel: &CancelToken,
        mut on_result: F,
    ) -> BatchOutcome
    where
        F: FnMut(&DeviceResult),
    {
        let mut seen = BTreeSet::new();
        let targets: Vec<DeviceId> = targets
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect();
        debug!(
            "batch {} over {} devices, concurrency {}",
            plan.describe(),
            targets.len(),
            self.concurrency
        );

        let mut set = JoinSet::new();
        let mut running = HashMap::new();
        for device_id in &targets {
            let executor = self.executor.clone();
            let limit = self.limit.clone();
            let plan = plan.clone();
            let cancel = cancel.clone();
            let id = device_id.clone();
            let handle = set.spawn(async move {
                let queued = Instant::now();
                let permit = match cancel.guard(limit.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return DeviceResult::failure(
                            id,
                            plan.describe(),
                            ErrorKind::Cancelled,
                            "executor shut down",
                            queued.elapsed(),
                        );
                    }
                    Err(cause) => return interrupted(&id, &plan, &cause, queued.elapsed()),
                };
                let result = executor.run(&id, &plan, &cancel).await;
                drop(permit);
                result
            });
            running.insert(handle.id(), device_id.clone());
        }

        let mut outcome = BatchOutcome {
            total: targets.len(),
            ..BatchOutcome::default()
        };
        while let Some(joined) = set.join_next_with_id().await {
            let result = match joined {
                Ok((_, result)) => result,
                Err(err) => {
                    let Some(device_id) = running.get(&err.id()).cloned() else {
                        error!("device task failed outside the batch: {err}");
                        continue;
                    };
                    error!("{device_id} device task aborted: {err}");
                    DeviceResult::failure(
                        device_id,
                        plan.describe(),
                        ErrorKind::SessionLost,
                        format!("device task aborted: {err}"),
                        std::time::Duration::ZERO,
                    )
                }
            };
            if result.success {
                outcome.success_count += 1;
            }
            on_result(&result);
            outcome.results.insert(result.device_id.clone(), result);
        }
        outcome
    }
}
