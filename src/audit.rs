//! Audit trail and device status reporting.
//!
//! Every connection attempt, command execution and task transition produces
//! one [`AuditEvent`]. Events and status updates travel through a bounded
//! queue drained by a background worker, so a slow or failing sink never
//! stalls device work: a full queue or a sink error is logged and dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::SinkError;
use crate::model::{DeviceId, DeviceStatus};

/// Actor recorded for events the engine emits on its own behalf.
pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    /// Dotted action name, e.g. `device.connect` or `task.cancelled`.
    pub action: String,
    pub target: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: BTreeMap<String, String>,
}

impl AuditEvent {
    pub fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        target: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            actor: actor.into(),
            action: action.into(),
            target: target.into(),
            success,
            timestamp: Utc::now(),
            detail: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.detail.insert(key.into(), value.to_string());
        self
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError>;
}

#[async_trait]
pub trait DeviceStatusSink: Send + Sync {
    async fn update(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        observed_at: DateTime<Utc>,
    ) -> Result<(), SinkError>;
}

enum Notification {
    Audit(AuditEvent),
    Status {
        device_id: DeviceId,
        status: DeviceStatus,
        observed_at: DateTime<Utc>,
    },
    Flush(oneshot::Sender<()>),
}

/// Non-blocking handle onto the reporting worker.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::Sender<Notification>,
}

impl std::fmt::Debug for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::Audit(event) => write!(f, "Audit({})", event.action),
            Notification::Status {
                device_id, status, ..
            } => write!(f, "Status({device_id}, {status:?})"),
            Notification::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl Notifier {
    /// Starts the worker on the current runtime.
    ///
    /// The worker exits once every `Notifier` clone is dropped.
    pub fn spawn(
        audit: Arc<dyn AuditSink>,
        status: Arc<dyn DeviceStatusSink>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Notification>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(notification) = receiver.recv().await {
                match notification {
                    Notification::Audit(event) => {
                        let action = event.action.clone();
                        if let Err(err) = audit.record(event).await {
                            warn!("audit event {action} dropped: {err}");
                        }
                    }
                    Notification::Status {
                        device_id,
                        status: device_status,
                        observed_at,
                    } => {
                        if let Err(err) = status.update(&device_id, device_status, observed_at).await
                        {
                            warn!("{device_id} status update dropped: {err}");
                        }
                    }
                    Notification::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { sender }, worker)
    }

    fn offer(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!("notification queue full, dropping {dropped:?}");
            }
            Err(TrySendError::Closed(dropped)) => {
                warn!("notification worker stopped, dropping {dropped:?}");
            }
        }
    }

    pub fn audit(&self, event: AuditEvent) {
        self.offer(Notification::Audit(event));
    }

    pub fn device_status(&self, device_id: &DeviceId, status: DeviceStatus) {
        self.offer(Notification::Status {
            device_id: device_id.clone(),
            status,
            observed_at: Utc::now(),
        });
    }

    /// Waits until everything queued before this call reached the sinks.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.sender.send(Notification::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn by_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.action == action)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

/// Writes events to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), SinkError> {
        info!(
            "audit actor={} action={} target={} success={} detail={:?}",
            event.actor, event.action, event.target, event.success, event.detail
        );
        Ok(())
    }
}

/// Latest status per device.
#[derive(Debug, Clone, Default)]
pub struct MemoryStatusSink {
    statuses: Arc<Mutex<HashMap<DeviceId, (DeviceStatus, DateTime<Utc>)>>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<DeviceStatus> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(device_id)
            .map(|(status, _)| *status)
    }
}

#[async_trait]
impl DeviceStatusSink for MemoryStatusSink {
    async fn update(
        &self,
        device_id: &DeviceId,
        status: DeviceStatus,
        observed_at: DateTime<Utc>,
    ) -> Result<(), SinkError> {
        self.statuses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(device_id.clone(), (status, observed_at));
        Ok(())
    }
}
