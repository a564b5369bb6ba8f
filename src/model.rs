//! Device descriptors, credentials and per-device results.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, ErrorKind};

/// Inventory identifier of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Transport protocol used to reach a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TransportKind {
    Ssh,
    Telnet,
    Restconf,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Ssh => "ssh",
            TransportKind::Telnet => "telnet",
            TransportKind::Restconf => "restconf",
        }
    }

    /// Port used when the inventory record does not carry one.
    pub fn default_port(self) -> u16 {
        match self {
            TransportKind::Ssh => 22,
            TransportKind::Telnet => 23,
            TransportKind::Restconf => 443,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(TransportKind::Ssh),
            "telnet" => Ok(TransportKind::Telnet),
            "restconf" => Ok(TransportKind::Restconf),
            other => Err(ConnectError::UnsupportedTransport(other.to_string())),
        }
    }
}

impl TryFrom<String> for TransportKind {
    type Error = ConnectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TransportKind> for String {
    fn from(value: TransportKind) -> Self {
        value.as_str().to_string()
    }
}

/// Opaque reference into the credential store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct CredentialHandle(pub String);

impl fmt::Display for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn default_platform() -> String {
    "cisco".to_string()
}

/// Read-only snapshot of an inventory device.
///
/// Fetched again for every execution so credential rotation is picked up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    pub address: String,
    pub port: u16,
    pub transport: TransportKind,
    /// CLI vendor profile, see [`crate::platform`].
    #[serde(default = "default_platform")]
    pub platform: String,
    pub credential: CredentialHandle,
}

impl Device {
    /// `address:port` used in log lines.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Resolved login material. Never logged.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
    pub enable_secret: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field(
                "enable_secret",
                &self.enable_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Latest observed reachability of a device, pushed to the status sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Unknown,
    Error,
}

impl DeviceStatus {
    /// Status implied by a failed connection attempt.
    pub fn from_failure(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Timeout | ErrorKind::Unreachable => DeviceStatus::Offline,
            ErrorKind::Cancelled => DeviceStatus::Unknown,
            _ => DeviceStatus::Error,
        }
    }
}

/// Output of one transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
    /// `None` when the device accepted the command.
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    /// Index of the first rejected line for config pushes and command lists.
    pub failed_line_index: Option<usize>,
    pub elapsed: Duration,
}

impl CommandResult {
    pub fn ok(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            output: output.into(),
            error_kind: None,
            message: None,
            failed_line_index: None,
            elapsed,
        }
    }

    pub fn rejected(
        output: impl Into<String>,
        message: impl Into<String>,
        failed_line_index: Option<usize>,
        elapsed: Duration,
    ) -> Self {
        Self {
            output: output.into(),
            error_kind: Some(ErrorKind::CommandRejected),
            message: Some(message.into()),
            failed_line_index,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Immutable outcome of one operation on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeviceResult {
    pub device_id: DeviceId,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_line_index: Option<usize>,
    pub execution_time_ms: u64,
    /// Human readable description of what ran, e.g. `push_config(2 lines)`.
    pub operation: String,
    /// Hex SHA-256 of captured configuration, set by backups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_digest: Option<String>,
}

impl DeviceResult {
    pub fn failure(
        device_id: DeviceId,
        operation: impl Into<String>,
        kind: ErrorKind,
        message: impl Into<String>,
        elapsed: Duration,
    ) -> Self {
        Self {
            device_id,
            success: false,
            output: String::new(),
            error_kind: Some(kind),
            message: Some(message.into()),
            failed_line_index: None,
            execution_time_ms: elapsed.as_millis() as u64,
            operation: operation.into(),
            config_digest: None,
        }
    }

    pub fn from_command(
        device_id: DeviceId,
        operation: impl Into<String>,
        result: CommandResult,
    ) -> Self {
        Self {
            device_id,
            success: result.is_success(),
            output: result.output,
            error_kind: result.error_kind,
            message: result.message,
            failed_line_index: result.failed_line_index,
            execution_time_ms: result.elapsed.as_millis() as u64,
            operation: operation.into(),
            config_digest: None,
        }
    }
}
