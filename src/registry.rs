//! Per-device session registry.
//!
//! The registry is the only structure shared by concurrent device executions.
//! It guarantees at most one registered session per device id: registration
//! is an atomic check-and-insert on the moka entry API, and every acquisition
//! hands out a [`SessionLease`] that removes and disconnects the session when
//! released or dropped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use log::{debug, warn};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::EngineConfig;
use crate::error::{ConnectError, Error, ExecutionError, TaskError};
use crate::model::{CommandResult, Credentials, Device, DeviceId};
use crate::session::{SessionFactory, TransportSession};

/// Lifecycle of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionStatus {
    Opening = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
    Failed = 4,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Opening,
            1 => SessionStatus::Active,
            2 => SessionStatus::Closing,
            3 => SessionStatus::Closed,
            _ => SessionStatus::Failed,
        }
    }
}

/// Registry entry: the session plus its observable status.
pub struct RegisteredSession {
    device_id: DeviceId,
    status: AtomicU8,
    session: Mutex<Box<dyn TransportSession>>,
}

impl RegisteredSession {
    fn new(device_id: DeviceId, session: Box<dyn TransportSession>) -> Self {
        Self {
            device_id,
            status: AtomicU8::new(SessionStatus::Opening as u8),
            session: Mutex::new(session),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

impl fmt::Debug for RegisteredSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSession")
            .field("device_id", &self.device_id)
            .field("status", &self.status())
            .finish()
    }
}

/// At most one live session per device id.
#[derive(Clone)]
pub struct ConnectionRegistry {
    entries: Cache<DeviceId, Arc<RegisteredSession>>,
    grace: Duration,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("grace", &self.grace)
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// `grace` bounds how long a release waits for the session to close.
    pub fn new(grace: Duration) -> Self {
        // No capacity or expiry: entries leave only through `release`.
        let entries = Cache::builder().build();
        Self { entries, grace }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.cancel_grace())
    }

    /// Registers a new session for `device`.
    ///
    /// Fails with [`TaskError::AlreadyConnected`] when the device already has
    /// a registered session, and with the factory's [`ConnectError`] when no
    /// session variant fits the device.
    pub async fn acquire(
        &self,
        device: &Device,
        factory: &dyn SessionFactory,
    ) -> Result<SessionLease, Error> {
        if self.entries.contains_key(&device.id) {
            return Err(TaskError::AlreadyConnected(device.id.clone()).into());
        }
        let session = factory.create(device).await?;

        let device_id = device.id.clone();
        let entry = self
            .entries
            .entry(device.id.clone())
            .or_insert_with(async move { Arc::new(RegisteredSession::new(device_id, session)) })
            .await;
        if !entry.is_fresh() {
            debug!("{} lost the registration race", device.id);
            return Err(TaskError::AlreadyConnected(device.id.clone()).into());
        }

        debug!("{} session registered", device.id);
        Ok(SessionLease {
            registry: self.clone(),
            entry: entry.into_value(),
            released: false,
        })
    }

    /// Removes the device's entry and disconnects it within the grace period.
    ///
    /// Releasing an unknown id is a no-op.
    pub async fn release(&self, device_id: &DeviceId) {
        let Some(entry) = self.entries.remove(device_id).await else {
            return;
        };
        entry.set_status(SessionStatus::Closing);
        let closing = async {
            let mut session = entry.session.lock().await;
            session.disconnect().await;
        };
        match tokio::time::timeout(self.grace, closing).await {
            Ok(()) => {
                entry.set_status(SessionStatus::Closed);
                debug!("{device_id} session released");
            }
            Err(_) => {
                entry.set_status(SessionStatus::Failed);
                warn!(
                    "{device_id} session did not close within {:?}, dropped",
                    self.grace
                );
            }
        }
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.entries.contains_key(device_id)
    }

    /// Number of registered sessions.
    pub async fn active_count(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

/// Exclusive use of one registered session.
///
/// Call [`SessionLease::release`] on every exit path; a lease dropped without
/// it schedules the release on the current runtime.
pub struct SessionLease {
    registry: ConnectionRegistry,
    entry: Arc<RegisteredSession>,
    released: bool,
}

impl SessionLease {
    pub fn device_id(&self) -> &DeviceId {
        &self.entry.device_id
    }

    pub fn status(&self) -> SessionStatus {
        self.entry.status()
    }

    pub async fn connect(
        &self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let mut session = self.entry.session.lock().await;
        self.entry.set_status(SessionStatus::Opening);
        match session.connect(credentials, timeout).await {
            Ok(()) => {
                self.entry.set_status(SessionStatus::Active);
                Ok(())
            }
            Err(err) => {
                self.entry.set_status(SessionStatus::Failed);
                Err(err)
            }
        }
    }

    pub async fn execute(&self, command: &str) -> Result<CommandResult, ExecutionError> {
        let mut session = self.entry.session.lock().await;
        let result = session.execute(command).await;
        self.track(&result);
        result
    }

    pub async fn push_config(&self, lines: &[String]) -> Result<CommandResult, ExecutionError> {
        let mut session = self.entry.session.lock().await;
        let result = session.push_config(lines).await;
        self.track(&result);
        result
    }

    pub async fn probe_command(&self) -> String {
        self.entry.session.lock().await.probe_command().to_string()
    }

    pub async fn running_config_command(&self) -> String {
        self.entry
            .session
            .lock()
            .await
            .running_config_command()
            .to_string()
    }

    fn track(&self, result: &Result<CommandResult, ExecutionError>) {
        if let Err(ExecutionError::SessionLost(_)) = result {
            self.entry.set_status(SessionStatus::Failed);
        }
    }

    /// Removes the registration and disconnects.
    pub async fn release(mut self) {
        self.released = true;
        self.registry.release(&self.entry.device_id).await;
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = self.registry.clone();
        let device_id = self.entry.device_id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("{device_id} lease dropped without release, releasing in background");
                handle.spawn(async move { registry.release(&device_id).await });
            }
            Err(_) => warn!("{device_id} lease dropped outside a runtime, session leaked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialHandle, TransportKind};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Idle {
        disconnects: Arc<AtomicUsize>,
        connected: bool,
    }

    #[async_trait]
    impl TransportSession for Idle {
        fn kind(&self) -> TransportKind {
            TransportKind::Ssh
        }

        async fn connect(&mut self, _: &Credentials, _: Duration) -> Result<(), ConnectError> {
            self.connected = true;
            Ok(())
        }

        async fn execute(&mut self, _: &str) -> Result<CommandResult, ExecutionError> {
            Err(ExecutionError::SessionLost("gone".into()))
        }

        async fn push_config(&mut self, _: &[String]) -> Result<CommandResult, ExecutionError> {
            Ok(CommandResult::ok("", Duration::ZERO))
        }

        async fn disconnect(&mut self) {
            if self.connected {
                self.disconnects.fetch_add(1, Ordering::SeqCst);
            }
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct IdleFactory {
        disconnects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionFactory for IdleFactory {
        async fn create(&self, _: &Device) -> Result<Box<dyn TransportSession>, ConnectError> {
            tokio::task::yield_now().await;
            Ok(Box::new(Idle {
                disconnects: self.disconnects.clone(),
                connected: false,
            }))
        }
    }

    fn device(id: &str) -> Device {
        Device {
            id: DeviceId::from(id),
            name: id.into(),
            address: "192.0.2.10".into(),
            port: 22,
            transport: TransportKind::Ssh,
            platform: "cisco".into(),
            credential: CredentialHandle("c".into()),
        }
    }

    fn credentials() -> Credentials {
        Credentials {
            username: "u".into(),
            secret: "p".into(),
            enable_secret: None,
        }
    }

    #[tokio::test]
    async fn second_acquire_is_already_connected() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let factory = IdleFactory {
            disconnects: Arc::default(),
        };
        let lease = registry.acquire(&device("r1"), &factory).await.expect("first");
        let err = registry.acquire(&device("r1"), &factory).await.err().expect("second");
        assert_eq!(err, Error::Task(TaskError::AlreadyConnected(DeviceId::from("r1"))));

        lease.release().await;
        assert!(!registry.contains(&DeviceId::from("r1")));
        let again = registry.acquire(&device("r1"), &factory).await.expect("after release");
        again.release().await;
    }

    #[tokio::test]
    async fn release_disconnects_and_marks_closed() {
        let disconnects = Arc::new(AtomicUsize::new(0));
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let factory = IdleFactory {
            disconnects: disconnects.clone(),
        };
        let lease = registry.acquire(&device("r1"), &factory).await.expect("acquire");
        lease.connect(&credentials(), Duration::from_secs(1)).await.expect("connect");
        assert_eq!(lease.status(), SessionStatus::Active);

        let entry = lease.entry.clone();
        lease.release().await;
        assert_eq!(entry.status(), SessionStatus::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        registry.release(&DeviceId::from("r1")).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lost_session_marks_failed() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let factory = IdleFactory {
            disconnects: Arc::default(),
        };
        let lease = registry.acquire(&device("r1"), &factory).await.expect("acquire");
        let _ = lease.execute("show clock").await;
        assert_eq!(lease.status(), SessionStatus::Failed);
        lease.release().await;
    }

    #[tokio::test]
    async fn dropped_lease_is_released_in_background() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let factory = IdleFactory {
            disconnects: Arc::default(),
        };
        let lease = registry.acquire(&device("r1"), &factory).await.expect("acquire");
        drop(lease);
        for _ in 0..50 {
            if !registry.contains(&DeviceId::from("r1")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.contains(&DeviceId::from("r1")));
        assert_eq!(registry.active_count().await, 0);
    }
}
