mod common;

use std::time::Duration;

use common::{Counters, ScriptedFactory, device};
use netbatch::error::{Error, TaskError};
use netbatch::model::{Credentials, DeviceId};
use netbatch::registry::{ConnectionRegistry, SessionStatus};
use tokio::task::JoinSet;

fn credentials() -> Credentials {
    Credentials {
        username: "admin".into(),
        secret: "secret".into(),
        enable_secret: None,
    }
}

#[tokio::test]
async fn concurrent_acquires_register_one_session() {
    let registry = ConnectionRegistry::new(Duration::from_secs(1));
    let factory = ScriptedFactory::new();

    let mut set = JoinSet::new();
    for _ in 0..16 {
        let registry = registry.clone();
        let factory = factory.clone();
        set.spawn(async move { registry.acquire(&device("core-1"), &factory).await });
    }
    let mut leases = Vec::new();
    let mut rejected = 0;
    while let Some(joined) = set.join_next().await {
        match joined.expect("join") {
            Ok(lease) => leases.push(lease),
            Err(Error::Task(TaskError::AlreadyConnected(id))) => {
                assert_eq!(id, DeviceId::from("core-1"));
                rejected += 1;
            }
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    assert_eq!(leases.len(), 1);
    assert_eq!(rejected, 15);
    assert_eq!(registry.active_count().await, 1);

    for lease in leases {
        lease.release().await;
    }
    assert_eq!(registry.active_count().await, 0);
}

#[tokio::test]
async fn different_devices_are_not_serialized() {
    let registry = ConnectionRegistry::new(Duration::from_secs(1));
    let factory = ScriptedFactory::new();
    let a = registry.acquire(&device("a"), &factory).await.expect("a");
    let b = registry.acquire(&device("b"), &factory).await.expect("b");
    assert_eq!(registry.active_count().await, 2);
    a.release().await;
    b.release().await;
}

#[tokio::test]
async fn release_is_idempotent() {
    let registry = ConnectionRegistry::new(Duration::from_secs(1));
    let factory = ScriptedFactory::new();
    let counters = factory.counters.clone();

    let lease = registry.acquire(&device("r1"), &factory).await.expect("acquire");
    lease
        .connect(&credentials(), Duration::from_secs(1))
        .await
        .expect("connect");
    assert_eq!(lease.status(), SessionStatus::Active);
    lease.release().await;
    registry.release(&DeviceId::from("r1")).await;
    registry.release(&DeviceId::from("r1")).await;

    assert_eq!(Counters::get(&counters.disconnects), 1);
    assert_eq!(Counters::get(&counters.open), 0);
    assert!(!registry.contains(&DeviceId::from("r1")));
}
