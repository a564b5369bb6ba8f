use async_trait::async_trait;
use log::debug;

use crate::config::EngineConfig;
use crate::error::ConnectError;
use crate::model::{Device, TransportKind};
use crate::platform;

use super::{
    CliTiming, ConnectionSecurityOptions, RestconfSession, SecurityLevel, SshSession,
    TelnetSession, TransportSession,
};

/// Builds an unconnected session for a device.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(&self, device: &Device) -> Result<Box<dyn TransportSession>, ConnectError>;
}

/// Production factory: one match on the device transport.
#[derive(Debug, Clone)]
pub struct TransportFactory {
    timing: CliTiming,
    security: ConnectionSecurityOptions,
}

impl TransportFactory {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timing: CliTiming {
                command_timeout: config.command_timeout(),
                settle_interval: config.settle_interval(),
            },
            security: ConnectionSecurityOptions::from_level(config.security),
        }
    }

    /// Overrides the SSH negotiation settings, e.g. a custom host key check.
    pub fn with_security(mut self, security: ConnectionSecurityOptions) -> Self {
        self.security = security;
        self
    }
}

#[async_trait]
impl SessionFactory for TransportFactory {
    async fn create(&self, device: &Device) -> Result<Box<dyn TransportSession>, ConnectError> {
        debug!("{} creating {} session", device.id, device.transport);
        let session: Box<dyn TransportSession> = match device.transport {
            TransportKind::Ssh => Box::new(SshSession::new(
                device,
                platform::by_name(&device.platform)?,
                self.security.clone(),
                self.timing,
            )),
            TransportKind::Telnet => Box::new(TelnetSession::new(
                device,
                platform::by_name(&device.platform)?,
                self.timing,
            )),
            TransportKind::Restconf => Box::new(RestconfSession::new(
                device,
                self.timing.command_timeout,
                self.security.level == SecurityLevel::LegacyCompatible,
            )),
        };
        Ok(session)
    }
}
