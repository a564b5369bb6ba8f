#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use netbatch::audit::{MemoryAuditSink, MemoryStatusSink};
use netbatch::engine::{Engine, EngineBuilder};
use netbatch::error::{ConnectError, ExecutionError};
use netbatch::inventory::{MemoryCredentials, MemoryInventory};
use netbatch::model::{CommandResult, CredentialHandle, Credentials, Device, DeviceId, TransportKind};
use netbatch::session::{SessionFactory, TransportSession};
use netbatch::task::{TaskId, TaskState};
use netbatch::EngineConfig;
use tokio::time::Instant;

/// How a scripted device answers.
#[derive(Clone, Default)]
pub struct Behavior {
    pub auth_fail: bool,
    /// Connect attempts that fail as unreachable before one succeeds.
    pub unreachable: Arc<AtomicUsize>,
    /// Config line index the device rejects.
    pub reject_line: Option<usize>,
    /// Command containing this text is rejected.
    pub reject_command: Option<String>,
    pub delay: Duration,
    /// Time `connect` takes before answering.
    pub connect_delay: Duration,
}

impl Behavior {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn slow_connect(connect_delay: Duration) -> Self {
        Self {
            connect_delay,
            ..Self::default()
        }
    }

    pub fn auth_fail() -> Self {
        Self {
            auth_fail: true,
            ..Self::default()
        }
    }

    pub fn reject_line(index: usize) -> Self {
        Self {
            reject_line: Some(index),
            ..Self::default()
        }
    }

    pub fn unreachable_times(times: usize) -> Self {
        Self {
            unreachable: Arc::new(AtomicUsize::new(times)),
            ..Self::default()
        }
    }
}

/// Counters shared by every session a [`ScriptedFactory`] creates.
#[derive(Default)]
pub struct Counters {
    pub attempts: AtomicUsize,
    pub created: AtomicUsize,
    pub connects: AtomicUsize,
    pub open: AtomicUsize,
    pub max_open: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct ScriptedSession {
    device_id: DeviceId,
    behavior: Behavior,
    counters: Arc<Counters>,
    connected: bool,
}

#[async_trait]
impl TransportSession for ScriptedSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
    }

    async fn connect(&mut self, _: &Credentials, _: Duration) -> Result<(), ConnectError> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.behavior.connect_delay).await;
        if self.behavior.auth_fail {
            return Err(ConnectError::AuthFailed(format!("{} rejected login", self.device_id)));
        }
        let remaining = &self.behavior.unreachable;
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ConnectError::Unreachable(format!("{} no route", self.device_id)));
        }
        self.connected = true;
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let open = self.counters.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, ExecutionError> {
        let started = Instant::now();
        tokio::time::sleep(self.behavior.delay).await;
        if let Some(bad) = &self.behavior.reject_command {
            if command.contains(bad.as_str()) {
                return Ok(CommandResult::rejected(
                    format!("{command}\n% Invalid input detected"),
                    "% Invalid input detected",
                    None,
                    started.elapsed(),
                ));
            }
        }
        Ok(CommandResult::ok(
            format!("{} output of {command}", self.device_id),
            started.elapsed(),
        ))
    }

    async fn push_config(&mut self, lines: &[String]) -> Result<CommandResult, ExecutionError> {
        let started = Instant::now();
        tokio::time::sleep(self.behavior.delay).await;
        let mut output = String::new();
        for (index, line) in lines.iter().enumerate() {
            output.push_str(line);
            output.push('\n');
            if self.behavior.reject_line == Some(index) {
                return Ok(CommandResult::rejected(
                    output,
                    format!("line {index} '{line}': % Invalid input detected"),
                    Some(index),
                    started.elapsed(),
                ));
            }
        }
        Ok(CommandResult::ok(output, started.elapsed()))
    }

    async fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            self.counters.open.fetch_sub(1, Ordering::SeqCst);
            self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[derive(Clone, Default)]
pub struct ScriptedFactory {
    behaviors: HashMap<DeviceId, Behavior>,
    pub counters: Arc<Counters>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(DeviceId::from(id), behavior);
        self
    }

    /// Same behavior for every id in `ids`.
    pub fn with_all(mut self, ids: &[String], behavior: Behavior) -> Self {
        for id in ids {
            self.behaviors.insert(DeviceId::from(id.as_str()), behavior.clone());
        }
        self
    }
}

#[async_trait]
impl SessionFactory for ScriptedFactory {
    async fn create(&self, device: &Device) -> Result<Box<dyn TransportSession>, ConnectError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            device_id: device.id.clone(),
            behavior: self.behaviors.get(&device.id).cloned().unwrap_or_default(),
            counters: self.counters.clone(),
            connected: false,
        }))
    }
}

pub fn device(id: &str) -> Device {
    Device {
        id: DeviceId::from(id),
        name: id.to_string(),
        address: "192.0.2.1".to_string(),
        port: 22,
        transport: TransportKind::Ssh,
        platform: "cisco".to_string(),
        credential: CredentialHandle("lab".to_string()),
    }
}

pub fn ids(prefix: &str, count: usize) -> Vec<String> {
    (1..=count).map(|n| format!("{prefix}{n}")).collect()
}

pub fn targets(ids: &[String]) -> Vec<DeviceId> {
    ids.iter().map(|id| DeviceId::from(id.as_str())).collect()
}

pub struct Harness {
    pub engine: Engine,
    pub audit: MemoryAuditSink,
    pub status: MemoryStatusSink,
    pub counters: Arc<Counters>,
}

impl Harness {
    pub fn new(ids: &[String], factory: ScriptedFactory) -> Self {
        Self::with_config(ids, factory, EngineConfig::default())
    }

    pub fn with_config(ids: &[String], factory: ScriptedFactory, config: EngineConfig) -> Self {
        let inventory = MemoryInventory::with_devices(ids.iter().map(|id| device(id)));
        let credentials = MemoryCredentials::new();
        credentials.insert(
            CredentialHandle("lab".to_string()),
            Credentials {
                username: "admin".to_string(),
                secret: "secret".to_string(),
                enable_secret: None,
            },
        );
        let audit = MemoryAuditSink::new();
        let status = MemoryStatusSink::new();
        let counters = factory.counters.clone();
        let engine = EngineBuilder::new(config, Arc::new(inventory), Arc::new(credentials))
            .session_factory(Arc::new(factory))
            .audit_sink(Arc::new(audit.clone()))
            .status_sink(Arc::new(status.clone()))
            .actor("tester")
            .build()
            .expect("engine");
        Self {
            engine,
            audit,
            status,
            counters,
        }
    }

    pub async fn finish(&self, id: &TaskId) -> TaskState {
        let state = tokio::time::timeout(Duration::from_secs(10), self.engine.wait_for_terminal(id))
            .await
            .expect("task did not finish in time")
            .expect("task state");
        self.engine.flush_notifications().await;
        state
    }

    /// Waits until `count` connect attempts have started.
    pub async fn wait_for_attempts(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Counters::get(&self.counters.attempts) < count {
            assert!(Instant::now() < deadline, "no connect attempt started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Waits until `count` sessions have connected.
    pub async fn wait_for_connects(&self, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Counters::get(&self.counters.connects) < count {
            assert!(Instant::now() < deadline, "devices never connected");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
