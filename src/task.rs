//! Batch task records and their state machine.
//!
//! ```text
//! Pending -> Running -> Success | Failed | Cancelled | Timeout
//!                       Failed | Timeout --retry--> Pending
//! ```
//!
//! `completed_at` is set and `progress` is 100 exactly when the status is
//! terminal. While running, progress only moves up and stays below 100.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, RenderError, TaskError};
use crate::executor::{CancelCause, DevicePlan};
use crate::model::{DeviceId, DeviceResult};
use crate::render::{TemplateRenderer, config_lines, restore_lines};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task does on every target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Command {
        command: String,
    },
    /// Ordered list, stopping at the first failing command.
    Commands {
        commands: Vec<String>,
    },
    PushConfig {
        lines: Vec<String>,
    },
    /// Rendered once per run, then pushed as configuration.
    ApplyTemplate {
        template_id: String,
        #[serde(default)]
        vars: BTreeMap<String, String>,
    },
    /// Pushes a saved running config back, minus lines that only describe
    /// the device.
    RestoreConfig {
        config: String,
    },
    TestConnection,
    BackupConfig,
}

impl Operation {
    /// Turns the descriptor into a device plan, rendering templates.
    pub fn plan(&self, renderer: &dyn TemplateRenderer) -> Result<DevicePlan, RenderError> {
        Ok(match self {
            Operation::Command { command } => DevicePlan::Execute(command.clone()),
            Operation::Commands { commands } => DevicePlan::ExecuteAll(commands.clone()),
            Operation::PushConfig { lines } => DevicePlan::PushConfig(lines.clone()),
            Operation::ApplyTemplate { template_id, vars } => {
                let lines = config_lines(&renderer.render(template_id, vars)?);
                if lines.is_empty() {
                    return Err(RenderError::Invalid(format!(
                        "template {template_id} rendered no configuration lines"
                    )));
                }
                DevicePlan::PushConfig(lines)
            }
            Operation::RestoreConfig { config } => {
                let lines = restore_lines(config);
                if lines.is_empty() {
                    return Err(RenderError::Invalid(
                        "saved config holds no restorable lines".to_string(),
                    ));
                }
                DevicePlan::PushConfig(lines)
            }
            Operation::TestConnection => DevicePlan::Probe,
            Operation::BackupConfig => DevicePlan::Backup,
        })
    }

    /// Operation name used in audit events.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Command { .. } => "command",
            Operation::Commands { .. } => "commands",
            Operation::PushConfig { .. } => "push_config",
            Operation::ApplyTemplate { .. } => "apply_template",
            Operation::RestoreConfig { .. } => "restore_config",
            Operation::TestConnection => "test_connection",
            Operation::BackupConfig => "backup_config",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub id: TaskId,
    pub name: String,
    pub operation: Operation,
    pub targets: Vec<DeviceId>,
    pub status: TaskStatus,
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub results: BTreeMap<DeviceId, DeviceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl TaskState {
    /// A pending task over the distinct `targets`, in first-seen order.
    pub fn new(
        name: impl Into<String>,
        operation: Operation,
        targets: Vec<DeviceId>,
        max_retries: u32,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let distinct: Vec<DeviceId> = targets
            .into_iter()
            .filter(|target| seen.insert(target.clone()))
            .collect();
        Self {
            id: TaskId::new(),
            name: name.into(),
            operation,
            targets: distinct,
            status: TaskStatus::Pending,
            progress: 0,
            retry_count: 0,
            max_retries,
            results: BTreeMap::new(),
            message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }

    fn invalid(&self, action: &'static str) -> TaskError {
        TaskError::InvalidState {
            task: self.id.to_string(),
            action,
            status: self.status.to_string(),
        }
    }

    pub fn start(&mut self) -> Result<(), TaskError> {
        if self.status != TaskStatus::Pending {
            return Err(self.invalid("start"));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.progress = 0;
        Ok(())
    }

    /// Stores one device result and raises progress.
    ///
    /// Ignored unless the task is running.
    pub fn record_result(&mut self, result: DeviceResult) {
        if self.status != TaskStatus::Running {
            return;
        }
        self.results.insert(result.device_id.clone(), result);
        let total = self.targets.len().max(1);
        let done = self.results.len().min(total);
        let rounded = (done * 200 + total) / (2 * total);
        let progress = rounded.min(99) as u8;
        self.progress = self.progress.max(progress);
    }

    /// Ends a run that was not interrupted: success when any device succeeded.
    pub fn complete(&mut self) {
        let status = if self.success_count() > 0 {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };
        self.finish(status);
    }

    /// Ends a run stopped by a cancel signal.
    pub fn interrupt(&mut self, cause: &CancelCause) {
        let status = match cause {
            CancelCause::Cancelled(_) => TaskStatus::Cancelled,
            CancelCause::Timeout => TaskStatus::Timeout,
        };
        self.finish(status);
        if let CancelCause::Cancelled(reason) = cause {
            if let Some(message) = self.message.as_mut() {
                message.push_str(&format!(", cancelled: {reason}"));
            }
        }
    }

    fn finish(&mut self, status: TaskStatus) {
        if self.status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.progress = 100;
        self.completed_at = Some(now);
        let since = self.started_at.unwrap_or(self.created_at);
        self.duration_ms = Some((now - since).num_milliseconds().max(0) as u64);
        self.message = Some(format!(
            "{}/{} devices succeeded",
            self.success_count(),
            self.total_count()
        ));
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|result| result.success).count()
    }

    pub fn total_count(&self) -> usize {
        self.targets.len()
    }

    /// Most frequent failure kind; ties go to a non-retryable kind.
    pub fn dominant_failure_kind(&self) -> Option<ErrorKind> {
        let mut counts: HashMap<ErrorKind, usize> = HashMap::new();
        for result in self.results.values().filter(|result| !result.success) {
            if let Some(kind) = result.error_kind {
                *counts.entry(kind).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .max_by_key(|(kind, count)| (*count, !kind.is_retryable(), *kind))
            .map(|(kind, _)| kind)
    }

    /// Checks whether [`TaskState::apply_retry`] is allowed.
    pub fn check_retry(&self) -> Result<(), TaskError> {
        if !matches!(self.status, TaskStatus::Failed | TaskStatus::Timeout) {
            return Err(self.invalid("retry"));
        }
        if self.retry_count >= self.max_retries {
            return Err(TaskError::RetryLimitExceeded {
                task: self.id.to_string(),
                max_retries: self.max_retries,
            });
        }
        match self.dominant_failure_kind() {
            Some(kind) if !kind.is_retryable() => Err(TaskError::NonRetryableFailure {
                task: self.id.to_string(),
                kind,
            }),
            _ => Ok(()),
        }
    }

    /// Resets the task to pending for another run.
    pub fn apply_retry(&mut self) -> Result<(), TaskError> {
        self.check_retry()?;
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.results.clear();
        self.message = None;
        self.started_at = None;
        self.completed_at = None;
        self.duration_ms = None;
        Ok(())
    }
}
