//! Device sessions.
//!
//! [`TransportSession`] is the capability every transport variant provides:
//! open a session, run a command, push configuration, close. Two variants
//! drive an interactive CLI through the shared prompt-driven shell driver
//! ([`SshSession`], [`TelnetSession`]); [`RestconfSession`] maps a small set
//! of read commands onto RESTCONF resources.
//!
//! Sessions are created by a [`SessionFactory`] and are owned by the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry) for the
//! duration of one executor invocation.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ConnectError, ExecutionError};
use crate::model::{CommandResult, Credentials, TransportKind};

pub use factory::{SessionFactory, TransportFactory};
pub use restconf::RestconfSession;
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::SshSession;
pub use telnet::TelnetSession;

/// Command used to probe reachability when the variant has no better one.
pub const DEFAULT_PROBE_COMMAND: &str = "show version";
/// Command that prints the running configuration.
pub const DEFAULT_RUNNING_CONFIG_COMMAND: &str = "show running-config";

/// One open (or openable) session to one device.
///
/// Device-reported problems (a rejected command, a rejected config line) come
/// back as `Ok` with `error_kind` set so the captured output is kept; `Err`
/// is reserved for the session itself failing.
#[async_trait]
pub trait TransportSession: Send {
    fn kind(&self) -> TransportKind;

    /// Opens the session and waits until it is usable.
    async fn connect(
        &mut self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), ConnectError>;

    /// Runs one command and returns its output.
    async fn execute(&mut self, command: &str) -> Result<CommandResult, ExecutionError>;

    /// Applies configuration lines in order and persists them.
    ///
    /// The first rejected line stops application and is reported through
    /// `failed_line_index`. Lines already applied stay applied.
    async fn push_config(&mut self, lines: &[String]) -> Result<CommandResult, ExecutionError>;

    /// Closes the session. Safe to call more than once.
    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Lightweight read used by connection tests.
    fn probe_command(&self) -> &str {
        DEFAULT_PROBE_COMMAND
    }

    fn running_config_command(&self) -> &str {
        DEFAULT_RUNNING_CONFIG_COMMAND
    }
}

/// Read timing of the CLI shell driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CliTiming {
    /// Upper bound for one command to finish.
    pub command_timeout: Duration,
    /// Quiet period after which output is treated as complete.
    pub settle_interval: Duration,
}

impl Default for CliTiming {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(60),
            settle_interval: Duration::from_millis(1500),
        }
    }
}

mod cli;
mod factory;
mod restconf;
mod security;
mod ssh;
mod telnet;
