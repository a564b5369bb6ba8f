//! Task submission and control.
//!
//! The engine owns an in-memory table of tasks. Each task runs on its own
//! tokio task; its state lives in a `watch` cell that the runner updates
//! between device calls, so snapshots and waiters never block device I/O.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use moka::future::Cache;
use tokio::sync::watch;

use crate::audit::{
    AuditEvent, AuditSink, DeviceStatusSink, LogAuditSink, MemoryStatusSink, Notifier, SYSTEM_ACTOR,
};
use crate::config::EngineConfig;
use crate::error::{ConfigError, ErrorKind, TaskError};
use crate::executor::{BatchExecutor, CancelCause, CancelHandle, CancelToken, CommandExecutor};
use crate::inventory::{CredentialStore, DeviceInventory};
use crate::model::{DeviceId, DeviceResult};
use crate::registry::ConnectionRegistry;
use crate::render::{MemoryTemplates, TemplateRenderer};
use crate::session::{SessionFactory, TransportFactory};
use crate::task::{Operation, TaskId, TaskState};

/// A batch task to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub name: String,
    pub operation: Operation,
    pub targets: Vec<DeviceId>,
    /// Falls back to `EngineConfig::default_max_retries`.
    pub max_retries: Option<u32>,
    /// Wall-clock budget per run; the task ends in `Timeout` when exceeded.
    pub budget: Option<Duration>,
}

impl TaskRequest {
    pub fn new(name: impl Into<String>, operation: Operation, targets: Vec<DeviceId>) -> Self {
        Self {
            name: name.into(),
            operation,
            targets,
            max_retries: None,
            budget: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

struct TaskEntry {
    state: watch::Sender<TaskState>,
    cancel: Mutex<CancelHandle>,
    budget: Option<Duration>,
}

impl TaskEntry {
    fn snapshot(&self) -> TaskState {
        (*self.state.borrow()).clone()
    }

    /// Signals the current run unless the task is already terminal.
    ///
    /// The terminal check and the signal happen under the state lock, so a
    /// run cannot finish in between.
    fn signal(&self, cause: CancelCause) -> Result<(), TaskError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| {
            if state.status.is_terminal() {
                outcome = Err(TaskError::CannotCancelTerminal(state.id.to_string()));
            } else {
                self.cancel
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .cancel(cause);
            }
            false
        });
        outcome
    }

    /// Times out run `run` if it is still the current, unfinished run.
    ///
    /// Checked under the state lock so a retry that lands after the budget
    /// elapsed keeps its fresh run. Returns whether the signal was sent.
    fn expire(&self, run: u32) -> bool {
        let mut fired = false;
        self.state.send_if_modified(|state| {
            if !state.status.is_terminal() && state.retry_count == run {
                fired = self
                    .cancel
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .cancel(CancelCause::Timeout);
            }
            false
        });
        fired
    }
}

/// Wires collaborators into an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    inventory: Arc<dyn DeviceInventory>,
    credentials: Arc<dyn CredentialStore>,
    factory: Option<Arc<dyn SessionFactory>>,
    renderer: Arc<dyn TemplateRenderer>,
    audit: Arc<dyn AuditSink>,
    status: Arc<dyn DeviceStatusSink>,
    actor: String,
}

impl EngineBuilder {
    pub fn new(
        config: EngineConfig,
        inventory: Arc<dyn DeviceInventory>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            inventory,
            credentials,
            factory: None,
            renderer: Arc::new(MemoryTemplates::new()),
            audit: Arc::new(LogAuditSink),
            status: Arc::new(MemoryStatusSink::new()),
            actor: SYSTEM_ACTOR.to_string(),
        }
    }

    /// Replaces the default [`TransportFactory`].
    pub fn session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn status_sink(mut self, status: Arc<dyn DeviceStatusSink>) -> Self {
        self.status = status;
        self
    }

    /// Actor recorded on audit events.
    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Validates the config and starts the notification worker.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Engine, ConfigError> {
        self.config.validate()?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => Arc::new(TransportFactory::new(&self.config)),
        };
        let (notifier, _worker) =
            Notifier::spawn(self.audit, self.status, self.config.notify_queue_capacity);
        let registry = ConnectionRegistry::from_config(&self.config);
        let executor = CommandExecutor::new(
            self.inventory,
            self.credentials,
            factory,
            registry.clone(),
            notifier.clone(),
            self.config.connect_timeout(),
        )
        .with_actor(self.actor.clone());
        let batch = BatchExecutor::new(Arc::new(executor), self.config.concurrency_limit);
        let tasks = Cache::builder()
            .max_capacity(self.config.task_capacity)
            .time_to_idle(self.config.task_retention())
            .build();
        info!(
            "engine ready, concurrency {} security {:?}",
            self.config.concurrency_limit, self.config.security
        );
        Ok(Engine {
            inner: Arc::new(Inner {
                config: self.config,
                batch,
                registry,
                renderer: self.renderer,
                notifier,
                tasks,
                actor: self.actor,
            }),
        })
    }
}

struct Inner {
    config: EngineConfig,
    batch: BatchExecutor,
    registry: ConnectionRegistry,
    renderer: Arc<dyn TemplateRenderer>,
    notifier: Notifier,
    tasks: Cache<TaskId, Arc<TaskEntry>>,
    actor: String,
}

/// Entry point for submitting and controlling batch tasks.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Registers a pending task and starts running it.
    pub async fn submit_task(&self, request: TaskRequest) -> Result<TaskId, TaskError> {
        if request.targets.is_empty() {
            return Err(TaskError::EmptyTargets);
        }
        let max_retries = request
            .max_retries
            .unwrap_or(self.inner.config.default_max_retries);
        let state = TaskState::new(request.name, request.operation, request.targets, max_retries);
        let id = state.id;
        let handle = CancelHandle::new();
        let token = handle.token();

        self.inner.audit(
            AuditEvent::new(&self.inner.actor, "task.submitted", id.to_string(), true)
                .with_detail("name", &state.name)
                .with_detail("operation", state.operation.name())
                .with_detail("targets", state.total_count()),
        );
        let (sender, _) = watch::channel(state);
        let entry = Arc::new(TaskEntry {
            state: sender,
            cancel: Mutex::new(handle),
            budget: request.budget,
        });
        self.inner.tasks.insert(id, entry.clone()).await;
        debug!("task {id} submitted");
        self.inner.spawn_run(entry, token);
        Ok(id)
    }

    pub async fn get_task_state(&self, id: &TaskId) -> Result<TaskState, TaskError> {
        Ok(self.inner.entry(id).await?.snapshot())
    }

    /// Requests cooperative cancellation of a pending or running task.
    pub async fn cancel_task(&self, id: &TaskId, reason: impl Into<String>) -> Result<(), TaskError> {
        let reason = reason.into();
        self.inner
            .entry(id)
            .await?
            .signal(CancelCause::Cancelled(reason.clone()))?;
        info!("task {id} cancel requested: {reason}");
        Ok(())
    }

    /// Ends a pending or running task with `Timeout`.
    pub async fn timeout_task(&self, id: &TaskId) -> Result<(), TaskError> {
        self.inner.entry(id).await?.signal(CancelCause::Timeout)?;
        info!("task {id} timed out");
        Ok(())
    }

    /// Resets a failed or timed-out task and runs it again.
    pub async fn retry_task(&self, id: &TaskId) -> Result<(), TaskError> {
        let entry = self.inner.entry(id).await?;
        let mut outcome = Ok(());
        let mut token = None;
        entry.state.send_if_modified(|state| match state.apply_retry() {
            Ok(()) => {
                let handle = CancelHandle::new();
                token = Some(handle.token());
                *entry
                    .cancel
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = handle;
                true
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });
        if let Err(err) = outcome {
            self.inner.audit(
                AuditEvent::new(&self.inner.actor, "task.retry", id.to_string(), false)
                    .with_detail("error", &err),
            );
            return Err(err);
        }
        let Some(token) = token else {
            return Ok(());
        };
        let retry_count = entry.state.borrow().retry_count;
        self.inner.audit(
            AuditEvent::new(&self.inner.actor, "task.retry", id.to_string(), true)
                .with_detail("retry_count", retry_count),
        );
        self.inner.spawn_run(entry, token);
        Ok(())
    }

    /// Waits until the task reaches a terminal status and returns it.
    pub async fn wait_for_terminal(&self, id: &TaskId) -> Result<TaskState, TaskError> {
        let entry = self.inner.entry(id).await?;
        let mut receiver = entry.state.subscribe();
        let state = receiver
            .wait_for(|state| state.status.is_terminal())
            .await
            .map(|state| (*state).clone())
            .map_err(|_| TaskError::NotFound(id.to_string()))?;
        Ok(state)
    }

    /// Waits until queued audit events and status updates reached the sinks.
    pub async fn flush_notifications(&self) {
        self.inner.notifier.flush().await;
    }
}

impl Inner {
    async fn entry(&self, id: &TaskId) -> Result<Arc<TaskEntry>, TaskError> {
        self.tasks
            .get(id)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    fn audit(&self, event: AuditEvent) {
        self.notifier.audit(event);
    }

    fn spawn_run(self: &Arc<Self>, entry: Arc<TaskEntry>, token: CancelToken) {
        if let Some(budget) = entry.budget {
            let watched = entry.clone();
            let run = entry.state.borrow().retry_count;
            tokio::spawn(async move {
                let mut receiver = watched.state.subscribe();
                let finished = receiver.wait_for(|state| state.status.is_terminal() || state.retry_count != run);
                if tokio::time::timeout(budget, finished).await.is_err() && watched.expire(run) {
                    warn!("task {} exceeded its budget of {budget:?}", watched.snapshot().id);
                }
            });
        }
        let inner = self.clone();
        tokio::spawn(async move { inner.run(entry, token).await });
    }

    async fn run(&self, entry: Arc<TaskEntry>, cancel: CancelToken) {
        let mut begun = false;
        entry.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            begun = state.start().is_ok();
            begun
        });
        let state = entry.snapshot();
        if !begun {
            if cancel.is_cancelled() {
                self.finish(&entry, &cancel);
            } else {
                warn!("task {} not started from {}", state.id, state.status);
            }
            return;
        }
        self.audit(
            AuditEvent::new(&self.actor, "task.started", state.id.to_string(), true)
                .with_detail("retry_count", state.retry_count),
        );

        let plan = match state.operation.plan(self.renderer.as_ref()) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("task {} render failed: {err}", state.id);
                entry.state.send_modify(|current| {
                    for target in &state.targets {
                        current.record_result(DeviceResult::failure(
                            target.clone(),
                            state.operation.name(),
                            ErrorKind::RenderFailed,
                            err.to_string(),
                            Duration::ZERO,
                        ));
                    }
                });
                self.finish(&entry, &cancel);
                return;
            }
        };

        let outcome = self
            .batch
            .run(&state.targets, Arc::new(plan), &cancel, |result| {
                entry
                    .state
                    .send_modify(|current| current.record_result(result.clone()));
            })
            .await;
        debug!(
            "task {} batch done, {}/{} succeeded",
            state.id, outcome.success_count, outcome.total
        );
        self.finish(&entry, &cancel);
    }

    fn finish(&self, entry: &TaskEntry, cancel: &CancelToken) {
        entry.state.send_modify(|state| match cancel.cause() {
            Some(cause) => state.interrupt(&cause),
            None => state.complete(),
        });
        let state = entry.snapshot();
        info!(
            "task {} {} ({})",
            state.id,
            state.status,
            state.message.as_deref().unwrap_or_default()
        );
        let mut event = AuditEvent::new(
            &self.actor,
            format!("task.{}", state.status),
            state.id.to_string(),
            state.success_count() > 0,
        )
        .with_detail("success_count", state.success_count())
        .with_detail("total_count", state.total_count());
        if let Some(kind) = state.dominant_failure_kind() {
            event = event.with_detail("dominant_failure", format!("{kind:?}"));
        }
        self.audit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{MemoryCredentials, MemoryInventory};

    fn engine() -> Engine {
        EngineBuilder::new(
            EngineConfig::default(),
            Arc::new(MemoryInventory::new()),
            Arc::new(MemoryCredentials::new()),
        )
        .build()
        .expect("engine")
    }

    #[tokio::test]
    async fn empty_targets_are_rejected() {
        let err = engine()
            .submit_task(TaskRequest::new("noop", Operation::TestConnection, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::EmptyTargets);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let engine = engine();
        let id = TaskId::new();
        assert!(matches!(engine.get_task_state(&id).await, Err(TaskError::NotFound(_))));
        assert!(matches!(engine.cancel_task(&id, "x").await, Err(TaskError::NotFound(_))));
    }

    #[tokio::test]
    async fn unknown_devices_fail_without_sessions() {
        let engine = engine();
        let id = engine
            .submit_task(TaskRequest::new(
                "probe",
                Operation::TestConnection,
                vec![DeviceId::from("ghost")],
            ))
            .await
            .expect("submit");
        let state = engine.wait_for_terminal(&id).await.expect("terminal");
        assert_eq!(state.status, crate::task::TaskStatus::Failed);
        assert_eq!(
            state.results[&DeviceId::from("ghost")].error_kind,
            Some(ErrorKind::DeviceNotFound)
        );
        assert_eq!(engine.registry().active_count().await, 0);

        let err = engine.cancel_task(&id, "late").await.unwrap_err();
        assert!(matches!(err, TaskError::CannotCancelTerminal(_)));
    }

    #[tokio::test]
    async fn missing_template_fails_every_target_as_render_failure() {
        let engine = engine();
        let id = engine
            .submit_task(TaskRequest::new(
                "vlan",
                Operation::ApplyTemplate {
                    template_id: "vlan".into(),
                    vars: Default::default(),
                },
                vec![DeviceId::from("a"), DeviceId::from("b")],
            ))
            .await
            .expect("submit");
        let state = engine.wait_for_terminal(&id).await.expect("terminal");
        assert_eq!(state.results.len(), 2);
        assert!(
            state
                .results
                .values()
                .all(|result| result.error_kind == Some(ErrorKind::RenderFailed))
        );
        assert!(matches!(
            engine.retry_task(&id).await,
            Err(TaskError::NonRetryableFailure {
                kind: ErrorKind::RenderFailed,
                ..
            })
        ));
    }

    fn entry_at_run(retry_count: u32) -> (TaskEntry, CancelToken) {
        let mut state = TaskState::new(
            "watched",
            Operation::TestConnection,
            vec![DeviceId::from("r1")],
            3,
        );
        state.retry_count = retry_count;
        let handle = CancelHandle::new();
        let token = handle.token();
        let (sender, _) = watch::channel(state);
        let entry = TaskEntry {
            state: sender,
            cancel: Mutex::new(handle),
            budget: None,
        };
        (entry, token)
    }

    #[test]
    fn stale_watchdog_leaves_the_next_run_alone() {
        let (entry, token) = entry_at_run(1);
        assert!(!entry.expire(0));
        assert!(!token.is_cancelled());

        assert!(entry.expire(1));
        assert_eq!(token.cause(), Some(CancelCause::Timeout));
    }

    #[test]
    fn watchdog_ignores_finished_runs() {
        let (entry, token) = entry_at_run(0);
        entry.state.send_modify(|state| {
            state.start().expect("start");
            state.complete();
        });
        assert!(!entry.expire(0));
        assert!(!token.is_cancelled());
    }
}
