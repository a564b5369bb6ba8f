//! Error types for device connections, command execution and task control.
//!
//! Connection and execution errors are never thrown across the batch
//! boundary: the executors fold them into a per-device
//! [`DeviceResult`](crate::model::DeviceResult) using [`ErrorKind`]. Only task
//! contract violations reach the caller as `Err`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::DeviceId;

/// Flat classification of every failure a device result can carry.
///
/// The kind, not the message, drives retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    AuthFailed,
    Unreachable,
    ProtocolError,
    UnsupportedTransport,
    CommandRejected,
    PartialConfigFailure,
    UnsupportedOperation,
    SessionLost,
    AlreadyConnected,
    Cancelled,
    DeviceNotFound,
    CredentialUnavailable,
    RenderFailed,
}

impl ErrorKind {
    /// Whether a task whose dominant failure has this kind may be retried.
    ///
    /// `AuthFailed` signals a configuration problem that retries cannot fix.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Unreachable
                | ErrorKind::ProtocolError
                | ErrorKind::CommandRejected
        )
    }
}

/// Errors raised while opening a device session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The device did not answer within the connect timeout.
    #[error("connect timeout: {0}")]
    Timeout(String),

    /// The device rejected the credentials.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The address could not be reached (refused, no route, DNS).
    #[error("device unreachable: {0}")]
    Unreachable(String),

    /// The peer answered but the protocol exchange failed.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// No session variant exists for the requested transport or platform.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),
}

impl ConnectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Timeout(_) => ErrorKind::Timeout,
            ConnectError::AuthFailed(_) => ErrorKind::AuthFailed,
            ConnectError::Unreachable(_) => ErrorKind::Unreachable,
            ConnectError::ProtocolError(_) => ErrorKind::ProtocolError,
            ConnectError::UnsupportedTransport(_) => ErrorKind::UnsupportedTransport,
        }
    }
}

/// Errors raised by an open session while running commands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The device reported an error for the command.
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// Every line was applied but leaving config mode or saving failed.
    #[error("config applied partially: {0}")]
    PartialConfigFailure(String),

    /// The transport has no mapping for the requested operation.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The underlying channel closed while the command was in flight.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// No prompt and no quiet period before the command deadline.
    ///
    /// Carries the partial output received before the deadline.
    #[error("exec command timeout: {0}")]
    Timeout(String),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutionError::CommandRejected(_) => ErrorKind::CommandRejected,
            ExecutionError::PartialConfigFailure(_) => ErrorKind::PartialConfigFailure,
            ExecutionError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            ExecutionError::SessionLost(_) => ErrorKind::SessionLost,
            ExecutionError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

/// Task-level contract violations returned to the direct caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// A session for this device is already registered.
    #[error("device {0} already has an active session")]
    AlreadyConnected(DeviceId),

    /// The task already reached a terminal status.
    #[error("task {0} is already terminal")]
    CannotCancelTerminal(String),

    /// `retry_count` reached `max_retries`.
    #[error("task {task} reached its retry limit ({max_retries})")]
    RetryLimitExceeded { task: String, max_retries: u32 },

    /// The dominant failure of the task cannot be fixed by retrying.
    #[error("task {task} failed with non-retryable {kind:?}")]
    NonRetryableFailure { task: String, kind: ErrorKind },

    /// No task is known under this id.
    #[error("task {0} not found")]
    NotFound(String),

    /// The requested transition is not valid from the current status.
    #[error("task {task} cannot {action} while {status}")]
    InvalidState {
        task: String,
        action: &'static str,
        status: String,
    },

    /// A task needs at least one target device.
    #[error("task has no target devices")]
    EmptyTargets,
}

impl TaskError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TaskError::AlreadyConnected(_) => Some(ErrorKind::AlreadyConnected),
            TaskError::NonRetryableFailure { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Errors from looking up devices or credentials in a collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("lookup backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by a [`TemplateRenderer`](crate::render::TemplateRenderer).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    #[error("template {0} not found")]
    TemplateNotFound(String),

    #[error("missing template variable {0}")]
    MissingVariable(String),

    #[error("render failed: {0}")]
    Invalid(String),
}

/// A reporting sink could not store an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sink unavailable: {0}")]
pub struct SinkError(pub String);

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid engine config: {0}")]
    Invalid(String),

    #[error("failed to parse engine config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Crate-level error wrapping every layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl Error {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Connect(err) => Some(err.kind()),
            Error::Execution(err) => Some(err.kind()),
            Error::Task(err) => err.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_is_never_retryable() {
        assert!(!ErrorKind::AuthFailed.is_retryable());
        assert!(!ConnectError::AuthFailed("bad password".into()).kind().is_retryable());
    }

    #[test]
    fn transient_kinds_are_retryable() {
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::Unreachable,
            ErrorKind::ProtocolError,
            ErrorKind::CommandRejected,
        ] {
            assert!(kind.is_retryable(), "{kind:?} should be retryable");
        }
        assert!(!ErrorKind::PartialConfigFailure.is_retryable());
        assert!(!ErrorKind::RenderFailed.is_retryable());
    }

    #[test]
    fn crate_error_keeps_layer_kind() {
        let err: Error = ExecutionError::SessionLost("eof".into()).into();
        assert_eq!(err.kind(), Some(ErrorKind::SessionLost));

        let err: Error = TaskError::AlreadyConnected(DeviceId::from("r1")).into();
        assert_eq!(err.kind(), Some(ErrorKind::AlreadyConnected));
    }

    #[test]
    fn error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::CommandRejected).expect("encode");
        assert_eq!(json, "\"command_rejected\"");
    }
}
