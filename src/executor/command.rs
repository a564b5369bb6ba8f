use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::audit::{AuditEvent, Notifier};
use crate::error::{Error, ErrorKind, ExecutionError, LookupError};
use crate::inventory::{CredentialStore, DeviceInventory};
use crate::model::{CommandResult, DeviceId, DeviceResult, DeviceStatus};
use crate::registry::{ConnectionRegistry, SessionLease};
use crate::session::SessionFactory;

use super::{CancelCause, CancelToken, DevicePlan};

/// Result for a device the task stopped before or while working on it.
pub(crate) fn interrupted(
    device_id: &DeviceId,
    plan: &DevicePlan,
    cause: &CancelCause,
    elapsed: Duration,
) -> DeviceResult {
    let message = match cause {
        CancelCause::Cancelled(reason) => format!("cancelled: {reason}"),
        CancelCause::Timeout => "task timed out".to_string(),
    };
    DeviceResult::failure(device_id.clone(), plan.describe(), cause.kind(), message, elapsed)
}

/// Hex SHA-256 of captured configuration.
pub(crate) fn config_digest(config: &str) -> String {
    format!("{:x}", Sha256::digest(config.as_bytes()))
}

/// Drives one device through one plan.
pub struct CommandExecutor {
    inventory: Arc<dyn DeviceInventory>,
    credentials: Arc<dyn CredentialStore>,
    factory: Arc<dyn SessionFactory>,
    registry: ConnectionRegistry,
    notifier: Notifier,
    connect_timeout: Duration,
    actor: String,
}

impl CommandExecutor {
    pub fn new(
        inventory: Arc<dyn DeviceInventory>,
        credentials: Arc<dyn CredentialStore>,
        factory: Arc<dyn SessionFactory>,
        registry: ConnectionRegistry,
        notifier: Notifier,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            inventory,
            credentials,
            factory,
            registry,
            notifier,
            connect_timeout,
            actor: crate::audit::SYSTEM_ACTOR.to_string(),
        }
    }

    /// Actor recorded on the audit events this executor emits.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Runs `plan` on `device_id`. Never fails: every problem becomes the
    /// returned result.
    pub async fn run(
        &self,
        device_id: &DeviceId,
        plan: &DevicePlan,
        cancel: &CancelToken,
    ) -> DeviceResult {
        let started = Instant::now();
        let operation = plan.describe();
        if let Some(cause) = cancel.cause() {
            return interrupted(device_id, plan, &cause, started.elapsed());
        }

        let device = match cancel.guard(self.inventory.get(device_id)).await {
            Err(cause) => return interrupted(device_id, plan, &cause, started.elapsed()),
            Ok(Err(err)) => {
                let message = match err {
                    LookupError::NotFound(what) => format!("{what} not found in inventory"),
                    LookupError::Unavailable(why) => format!("inventory unavailable: {why}"),
                };
                return DeviceResult::failure(
                    device_id.clone(),
                    operation,
                    ErrorKind::DeviceNotFound,
                    message,
                    started.elapsed(),
                );
            }
            Ok(Ok(device)) => device,
        };

        let credentials = match cancel.guard(self.credentials.resolve(&device.credential)).await {
            Err(cause) => return interrupted(device_id, plan, &cause, started.elapsed()),
            Ok(Err(err)) => {
                return DeviceResult::failure(
                    device_id.clone(),
                    operation,
                    ErrorKind::CredentialUnavailable,
                    err.to_string(),
                    started.elapsed(),
                );
            }
            Ok(Ok(credentials)) => credentials,
        };

        let lease = match self.registry.acquire(&device, self.factory.as_ref()).await {
            Ok(lease) => lease,
            Err(Error::Connect(err)) => {
                self.connect_event(device_id, device.transport.as_str(), Err(err.kind()));
                return DeviceResult::failure(
                    device_id.clone(),
                    operation,
                    err.kind(),
                    err.to_string(),
                    started.elapsed(),
                );
            }
            Err(err) => {
                let kind = err.kind().unwrap_or(ErrorKind::AlreadyConnected);
                warn!("{device_id} {err}");
                return DeviceResult::failure(
                    device_id.clone(),
                    operation,
                    kind,
                    err.to_string(),
                    started.elapsed(),
                );
            }
        };

        debug!("{device_id} connecting to {}", device.endpoint());
        let connected = cancel
            .guard(lease.connect(&credentials, self.connect_timeout))
            .await;
        let mut result = match connected {
            Err(cause) => {
                // Interrupted attempts say nothing about device health.
                self.connect_audit(device_id, device.transport.as_str(), Err(cause.kind()));
                interrupted(device_id, plan, &cause, started.elapsed())
            }
            Ok(Err(err)) => {
                self.connect_event(device_id, device.transport.as_str(), Err(err.kind()));
                DeviceResult::failure(
                    device_id.clone(),
                    operation,
                    err.kind(),
                    err.to_string(),
                    started.elapsed(),
                )
            }
            Ok(Ok(())) => {
                self.connect_event(device_id, device.transport.as_str(), Ok(()));
                let result = self.drive(&lease, plan, cancel).await;
                self.execution_event(plan, &result);
                result
            }
        };
        lease.release().await;

        result.execution_time_ms = started.elapsed().as_millis() as u64;
        info!(
            "{device_id} {} finished success={} in {}ms",
            result.operation, result.success, result.execution_time_ms
        );
        result
    }

    async fn drive(
        &self,
        lease: &SessionLease,
        plan: &DevicePlan,
        cancel: &CancelToken,
    ) -> DeviceResult {
        let started = Instant::now();
        let device_id = lease.device_id();
        let operation = plan.describe();

        let outcome = match plan {
            DevicePlan::Execute(command) => cancel.guard(lease.execute(command)).await,
            DevicePlan::ExecuteAll(commands) => {
                return self.drive_list(lease, plan, commands, cancel).await;
            }
            DevicePlan::PushConfig(lines) => cancel.guard(lease.push_config(lines)).await,
            DevicePlan::Probe => {
                let command = lease.probe_command().await;
                cancel.guard(lease.execute(&command)).await
            }
            DevicePlan::Backup => {
                let command = lease.running_config_command().await;
                cancel.guard(lease.execute(&command)).await
            }
        };

        match outcome {
            Err(cause) => interrupted(device_id, plan, &cause, started.elapsed()),
            Ok(Err(err)) => self.execution_failure(device_id, &operation, err, started.elapsed()),
            Ok(Ok(command)) => {
                let mut result = DeviceResult::from_command(device_id.clone(), operation, command);
                if matches!(plan, DevicePlan::Backup) && result.success {
                    result.config_digest = Some(config_digest(&result.output));
                }
                result
            }
        }
    }

    /// Runs commands in order and stops at the first one that fails.
    async fn drive_list(
        &self,
        lease: &SessionLease,
        plan: &DevicePlan,
        commands: &[String],
        cancel: &CancelToken,
    ) -> DeviceResult {
        let started = Instant::now();
        let device_id = lease.device_id();
        let operation = plan.describe();
        let mut output = String::new();

        for (index, command) in commands.iter().enumerate() {
            let step = match cancel.guard(lease.execute(command)).await {
                Err(cause) => {
                    let mut result = interrupted(device_id, plan, &cause, started.elapsed());
                    result.output = output;
                    result.failed_line_index = Some(index);
                    return result;
                }
                Ok(step) => step,
            };
            match step {
                Ok(result) if result.is_success() => {
                    output.push_str(&result.output);
                    output.push('\n');
                }
                Ok(result) => {
                    output.push_str(&result.output);
                    let message = format!(
                        "command {index} '{command}' failed after {index} of {} succeeded: {}",
                        commands.len(),
                        result.message.unwrap_or_default()
                    );
                    let failed = CommandResult {
                        output,
                        error_kind: result.error_kind,
                        message: Some(message),
                        failed_line_index: Some(index),
                        elapsed: started.elapsed(),
                    };
                    return DeviceResult::from_command(device_id.clone(), operation, failed);
                }
                Err(err) => {
                    let mut result =
                        self.execution_failure(device_id, &operation, err, started.elapsed());
                    result.output = output;
                    result.failed_line_index = Some(index);
                    return result;
                }
            }
        }
        DeviceResult::from_command(
            device_id.clone(),
            operation,
            CommandResult::ok(output.trim_end(), started.elapsed()),
        )
    }

    fn execution_failure(
        &self,
        device_id: &DeviceId,
        operation: &str,
        err: ExecutionError,
        elapsed: Duration,
    ) -> DeviceResult {
        if matches!(err, ExecutionError::SessionLost(_)) {
            self.notifier.device_status(device_id, DeviceStatus::Error);
        }
        let mut result =
            DeviceResult::failure(device_id.clone(), operation, err.kind(), err.to_string(), elapsed);
        if let ExecutionError::Timeout(partial) = err {
            result.output = partial;
        }
        result
    }

    fn connect_event(&self, device_id: &DeviceId, transport: &str, outcome: Result<(), ErrorKind>) {
        let status = match outcome {
            Ok(()) => DeviceStatus::Online,
            Err(kind) => DeviceStatus::from_failure(kind),
        };
        self.notifier.device_status(device_id, status);
        self.connect_audit(device_id, transport, outcome);
    }

    fn connect_audit(&self, device_id: &DeviceId, transport: &str, outcome: Result<(), ErrorKind>) {
        let mut event = AuditEvent::new(
            &self.actor,
            "device.connect",
            device_id.as_str(),
            outcome.is_ok(),
        )
        .with_detail("transport", transport);
        if let Err(kind) = outcome {
            event = event.with_detail("error_kind", format!("{kind:?}"));
        }
        self.notifier.audit(event);
    }

    fn execution_event(&self, plan: &DevicePlan, result: &DeviceResult) {
        let mut event = AuditEvent::new(
            &self.actor,
            plan.audit_action(),
            result.device_id.as_str(),
            result.success,
        )
        .with_detail("operation", &result.operation);
        if let Some(kind) = result.error_kind {
            event = event.with_detail("error_kind", format!("{kind:?}"));
        }
        if let Some(index) = result.failed_line_index {
            event = event.with_detail("failed_line_index", index);
        }
        self.notifier.audit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex_sha256() {
        assert_eq!(
            config_digest("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn watchdog_interruption_is_a_timeout() {
        let result = interrupted(
            &DeviceId::from("r1"),
            &DevicePlan::Probe,
            &CancelCause::Timeout,
            Duration::ZERO,
        );
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        let result = interrupted(
            &DeviceId::from("r1"),
            &DevicePlan::Probe,
            &CancelCause::Cancelled("operator".into()),
            Duration::ZERO,
        );
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
    }
}
