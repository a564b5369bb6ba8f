//! Per-device and fan-out execution.
//!
//! [`CommandExecutor`] drives one device through one [`DevicePlan`] and always
//! yields exactly one [`DeviceResult`](crate::model::DeviceResult).
//! [`BatchExecutor`] runs a plan over many devices with bounded concurrency.
//! Both observe a [`CancelToken`] at every await point that touches a device.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ErrorKind;

pub use batch::{BatchExecutor, BatchOutcome};
pub use command::CommandExecutor;

/// What to do on each device once a session is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePlan {
    /// One command.
    Execute(String),
    /// Commands in order, stopping at the first failure.
    ExecuteAll(Vec<String>),
    /// Configuration lines, applied and persisted.
    PushConfig(Vec<String>),
    /// The transport's probe command.
    Probe,
    /// Capture the running configuration with a digest.
    Backup,
}

impl DevicePlan {
    /// Short description stored in each device result.
    pub fn describe(&self) -> String {
        match self {
            DevicePlan::Execute(command) => format!("execute({command})"),
            DevicePlan::ExecuteAll(commands) => format!("execute_all({} commands)", commands.len()),
            DevicePlan::PushConfig(lines) => format!("push_config({} lines)", lines.len()),
            DevicePlan::Probe => "test_connection".to_string(),
            DevicePlan::Backup => "backup_config".to_string(),
        }
    }

    /// Audit action of the execution event.
    pub(crate) fn audit_action(&self) -> &'static str {
        match self {
            DevicePlan::Execute(_) | DevicePlan::ExecuteAll(_) => "device.execute",
            DevicePlan::PushConfig(_) => "device.push_config",
            DevicePlan::Probe => "device.probe",
            DevicePlan::Backup => "device.backup",
        }
    }
}

/// Why a task stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCause {
    /// Caller cancellation with its reason.
    Cancelled(String),
    /// The watchdog fired.
    Timeout,
}

impl CancelCause {
    /// Error kind recorded on results the cause interrupts.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CancelCause::Cancelled(_) => ErrorKind::Cancelled,
            CancelCause::Timeout => ErrorKind::Timeout,
        }
    }
}

/// Sending side of a task's cancel signal.
#[derive(Debug)]
pub struct CancelHandle {
    sender: watch::Sender<Option<CancelCause>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// Signals `cause`; the first cause wins. Returns whether this call set it.
    pub fn cancel(&self, cause: CancelCause) -> bool {
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(cause);
            true
        })
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a task's cancel signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<Option<CancelCause>>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> Self {
        let (_, receiver) = watch::channel(None);
        Self { receiver }
    }

    pub fn cause(&self) -> Option<CancelCause> {
        (*self.receiver.borrow()).clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Resolves once cancellation is signalled; pends forever if the handle
    /// is dropped without signalling.
    pub async fn cancelled(&self) -> CancelCause {
        let mut receiver = self.receiver.clone();
        let cause = match receiver.wait_for(Option::is_some).await {
            Ok(cause) => (*cause).clone(),
            Err(_) => None,
        };
        match cause {
            Some(cause) => cause,
            None => std::future::pending().await,
        }
    }

    /// Runs `future` unless cancellation comes first.
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, CancelCause> {
        tokio::select! {
            biased;
            cause = self.cancelled() => Err(cause),
            output = future => Ok(output),
        }
    }
}

mod batch;
mod command;
