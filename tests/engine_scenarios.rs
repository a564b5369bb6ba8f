mod common;

use std::time::Duration;

use common::{Behavior, Counters, Harness, ScriptedFactory, ids, targets};
use netbatch::engine::TaskRequest;
use netbatch::error::{ErrorKind, TaskError};
use netbatch::model::{DeviceId, DeviceStatus};
use netbatch::task::{Operation, TaskState, TaskStatus};
use netbatch::EngineConfig;

fn show_clock() -> Operation {
    Operation::Command {
        command: "show clock".into(),
    }
}

#[tokio::test]
async fn all_devices_succeed() {
    let devices = ids("edge-", 3);
    let harness = Harness::new(&devices, ScriptedFactory::new());

    let id = harness
        .engine
        .submit_task(TaskRequest::new("clock", show_clock(), targets(&devices)))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    assert_eq!(state.status, TaskStatus::Success);
    assert_eq!(state.progress, 100);
    assert_eq!(state.success_count(), 3);
    assert_eq!(state.message.as_deref(), Some("3/3 devices succeeded"));
    assert!(state.completed_at.is_some() && state.duration_ms.is_some());
    for device in &devices {
        let result = &state.results[&DeviceId::from(device.as_str())];
        assert!(result.success);
        assert!(result.output.contains("show clock"));
        assert_eq!(result.operation, "execute(show clock)");
        assert_eq!(harness.status.get(&result.device_id), Some(DeviceStatus::Online));
    }

    assert_eq!(harness.audit.by_action("device.connect").len(), 3);
    assert_eq!(harness.audit.by_action("device.execute").len(), 3);
    assert_eq!(harness.audit.by_action("task.started").len(), 1);
    assert_eq!(harness.audit.by_action("task.success").len(), 1);
    assert_eq!(Counters::get(&harness.counters.open), 0);
    assert_eq!(harness.engine.registry().active_count().await, 0);
}

#[tokio::test]
async fn rejected_config_line_fails_only_that_device() {
    let devices = vec!["core-1".to_string(), "core-2".to_string()];
    let factory = ScriptedFactory::new().with("core-2", Behavior::reject_line(1));
    let harness = Harness::new(&devices, factory);

    let lines = vec![
        "interface Gi0/1".to_string(),
        "bogus command".to_string(),
        "description uplink".to_string(),
    ];
    let id = harness
        .engine
        .submit_task(TaskRequest::new(
            "uplinks",
            Operation::PushConfig { lines },
            targets(&devices),
        ))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    assert_eq!(state.status, TaskStatus::Success);
    assert_eq!(state.success_count(), 1);
    assert_eq!(state.total_count(), 2);
    let failed = &state.results[&DeviceId::from("core-2")];
    assert!(!failed.success);
    assert_eq!(failed.error_kind, Some(ErrorKind::CommandRejected));
    assert_eq!(failed.failed_line_index, Some(1));
    assert!(failed.output.contains("interface Gi0/1"));
    assert!(state.results[&DeviceId::from("core-1")].success);

    let pushes = harness.audit.by_action("device.push_config");
    assert_eq!(pushes.len(), 2);
    assert!(pushes.iter().any(|event| !event.success
        && event.detail.get("failed_line_index").map(String::as_str) == Some("1")));
}

#[tokio::test]
async fn restore_pushes_saved_config_without_banner_lines() {
    let devices = vec!["core-1".to_string(), "core-2".to_string()];
    let factory = ScriptedFactory::new().with("core-2", Behavior::reject_line(1));
    let harness = Harness::new(&devices, factory);

    let saved = "!\nversion 15.2\nboot-start-marker\nboot-end-marker\n!\nhostname core\nbogus command\nntp server 192.0.2.1\n";
    let id = harness
        .engine
        .submit_task(TaskRequest::new(
            "restore",
            Operation::RestoreConfig {
                config: saved.into(),
            },
            targets(&devices),
        ))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    let applied = &state.results[&DeviceId::from("core-1")];
    assert!(applied.success);
    assert_eq!(applied.output, "hostname core\nbogus command\nntp server 192.0.2.1\n");

    let failed = &state.results[&DeviceId::from("core-2")];
    assert_eq!(failed.error_kind, Some(ErrorKind::CommandRejected));
    assert_eq!(failed.failed_line_index, Some(1));
    assert!(!failed.output.contains("version"));
    assert!(!failed.output.contains("ntp server"));
    assert_eq!(harness.audit.by_action("device.push_config").len(), 2);
}

#[tokio::test]
async fn command_list_stops_at_first_failure() {
    let devices = vec!["r1".to_string()];
    let factory = ScriptedFactory::new().with(
        "r1",
        Behavior {
            reject_command: Some("bad".into()),
            ..Behavior::default()
        },
    );
    let harness = Harness::new(&devices, factory);
    let id = harness
        .engine
        .submit_task(TaskRequest::new(
            "list",
            Operation::Commands {
                commands: vec!["show clock".into(), "show bad".into(), "show users".into()],
            },
            targets(&devices),
        ))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    let result = &state.results[&DeviceId::from("r1")];
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(result.failed_line_index, Some(1));
    assert!(result.output.contains("show clock"));
    assert!(!result.output.contains("show users"));
    assert!(result.message.as_deref().unwrap_or_default().contains("1 of 3"));
}

#[tokio::test]
async fn cancel_stops_in_flight_devices_and_closes_sessions() {
    let devices = ids("slow-", 2);
    let factory = ScriptedFactory::new().with_all(&devices, Behavior::slow(Duration::from_secs(30)));
    let harness = Harness::new(&devices, factory);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("stuck", show_clock(), targets(&devices)))
        .await
        .expect("submit");
    harness.wait_for_connects(2).await;
    harness
        .engine
        .cancel_task(&id, "maintenance window closed")
        .await
        .expect("cancel");
    let state = harness.finish(&id).await;

    assert_eq!(state.status, TaskStatus::Cancelled);
    assert_eq!(state.progress, 100);
    assert_eq!(state.results.len(), 2);
    assert!(
        state
            .results
            .values()
            .all(|result| result.error_kind == Some(ErrorKind::Cancelled))
    );
    assert_eq!(Counters::get(&harness.counters.open), 0);
    assert_eq!(Counters::get(&harness.counters.disconnects), 2);
    assert_eq!(harness.engine.registry().active_count().await, 0);
    assert_eq!(harness.audit.by_action("task.cancelled").len(), 1);

    let again = harness.engine.cancel_task(&id, "twice").await.unwrap_err();
    assert!(matches!(again, TaskError::CannotCancelTerminal(_)));
    assert_eq!(harness.engine.get_task_state(&id).await.expect("state"), state);
}

#[tokio::test]
async fn cancel_during_connect_still_audits_the_attempt() {
    let devices = ids("far-", 1);
    let factory =
        ScriptedFactory::new().with_all(&devices, Behavior::slow_connect(Duration::from_secs(30)));
    let harness = Harness::new(&devices, factory);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("unlucky", show_clock(), targets(&devices)))
        .await
        .expect("submit");
    harness.wait_for_attempts(1).await;
    harness.engine.cancel_task(&id, "operator").await.expect("cancel");
    let state = harness.finish(&id).await;

    assert_eq!(state.status, TaskStatus::Cancelled);
    let connects = harness.audit.by_action("device.connect");
    assert_eq!(connects.len(), 1);
    assert!(!connects[0].success);
    assert_eq!(connects[0].detail["error_kind"], "Cancelled");
    assert_eq!(harness.status.get(&DeviceId::from("far-1")), None);
    assert_eq!(Counters::get(&harness.counters.connects), 0);
    assert_eq!(harness.engine.registry().active_count().await, 0);
}

#[tokio::test]
async fn auth_failure_cannot_be_retried() {
    let devices = vec!["r1".to_string()];
    let factory = ScriptedFactory::new().with("r1", Behavior::auth_fail());
    let harness = Harness::new(&devices, factory);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("probe", Operation::TestConnection, targets(&devices)))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;
    assert_eq!(state.status, TaskStatus::Failed);
    assert_eq!(
        state.results[&DeviceId::from("r1")].error_kind,
        Some(ErrorKind::AuthFailed)
    );
    assert_eq!(harness.status.get(&DeviceId::from("r1")), Some(DeviceStatus::Error));

    let err = harness.engine.retry_task(&id).await.unwrap_err();
    assert!(matches!(
        err,
        TaskError::NonRetryableFailure {
            kind: ErrorKind::AuthFailed,
            ..
        }
    ));
    assert_eq!(harness.engine.get_task_state(&id).await.expect("state"), state);
}

#[tokio::test]
async fn unreachable_device_succeeds_on_retry() {
    let devices = vec!["r1".to_string()];
    let factory = ScriptedFactory::new().with("r1", Behavior::unreachable_times(1));
    let harness = Harness::new(&devices, factory);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("probe", Operation::TestConnection, targets(&devices)))
        .await
        .expect("submit");
    let first = harness.finish(&id).await;
    assert_eq!(first.status, TaskStatus::Failed);
    assert_eq!(first.dominant_failure_kind(), Some(ErrorKind::Unreachable));
    assert_eq!(harness.status.get(&DeviceId::from("r1")), Some(DeviceStatus::Offline));

    harness.engine.retry_task(&id).await.expect("retry");
    let second = harness.finish(&id).await;
    assert_eq!(second.status, TaskStatus::Success);
    assert_eq!(second.retry_count, 1);
    assert_eq!(second.results[&DeviceId::from("r1")].operation, "test_connection");
    assert_eq!(harness.audit.by_action("task.retry").len(), 1);
}

#[tokio::test]
async fn budget_watchdog_times_the_task_out() {
    let devices = ids("slow-", 2);
    let factory = ScriptedFactory::new().with_all(&devices, Behavior::slow(Duration::from_secs(30)));
    let harness = Harness::new(&devices, factory);

    let id = harness
        .engine
        .submit_task(
            TaskRequest::new("stuck", show_clock(), targets(&devices))
                .with_budget(Duration::from_millis(150)),
        )
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    assert_eq!(state.status, TaskStatus::Timeout);
    assert!(
        state
            .results
            .values()
            .all(|result| result.error_kind == Some(ErrorKind::Timeout))
    );
    assert_eq!(Counters::get(&harness.counters.open), 0);
    assert!(state.check_retry().is_ok());
}

#[tokio::test]
async fn explicit_timeout_ends_running_task() {
    let devices = ids("slow-", 1);
    let factory = ScriptedFactory::new().with_all(&devices, Behavior::slow(Duration::from_secs(30)));
    let harness = Harness::new(&devices, factory);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("stuck", show_clock(), targets(&devices)))
        .await
        .expect("submit");
    harness.wait_for_connects(1).await;
    harness.engine.timeout_task(&id).await.expect("timeout");
    let state = harness.finish(&id).await;
    assert_eq!(state.status, TaskStatus::Timeout);
    assert_eq!(harness.audit.by_action("task.timeout").len(), 1);
}

#[tokio::test]
async fn open_sessions_never_exceed_concurrency_limit() {
    let devices = ids("leaf-", 12);
    let factory = ScriptedFactory::new().with_all(&devices, Behavior::slow(Duration::from_millis(30)));
    let config = EngineConfig {
        concurrency_limit: 3,
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(&devices, factory, config);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("wide", show_clock(), targets(&devices)))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    assert_eq!(state.success_count(), 12);
    assert!(Counters::get(&harness.counters.max_open) <= 3);
    assert!(Counters::get(&harness.counters.max_open) >= 1);
    assert_eq!(Counters::get(&harness.counters.disconnects), 12);
}

#[tokio::test]
async fn progress_never_goes_backwards() {
    let devices = ids("r", 5);
    let factory = ScriptedFactory::new().with_all(&devices, Behavior::slow(Duration::from_millis(20)));
    let config = EngineConfig {
        concurrency_limit: 1,
        ..EngineConfig::default()
    };
    let harness = Harness::with_config(&devices, factory, config);

    let id = harness
        .engine
        .submit_task(TaskRequest::new("slow", show_clock(), targets(&devices)))
        .await
        .expect("submit");
    let mut seen = Vec::new();
    loop {
        let state = harness.engine.get_task_state(&id).await.expect("state");
        seen.push(state.progress);
        if state.status.is_terminal() {
            break;
        }
        assert!(state.progress < 100);
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&100));
}

#[tokio::test]
async fn backup_attaches_config_digest() {
    let devices = vec!["r1".to_string()];
    let harness = Harness::new(&devices, ScriptedFactory::new());
    let id = harness
        .engine
        .submit_task(TaskRequest::new("backup", Operation::BackupConfig, targets(&devices)))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;
    let result = &state.results[&DeviceId::from("r1")];
    assert!(result.output.contains("show running-config"));
    let digest = result.config_digest.as_deref().expect("digest");
    assert_eq!(digest.len(), 64);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(harness.audit.by_action("device.backup").len(), 1);
}

#[tokio::test]
async fn task_state_survives_json_round_trip() {
    let devices = vec!["core-1".to_string(), "core-2".to_string()];
    let factory = ScriptedFactory::new().with("core-2", Behavior::reject_line(0));
    let harness = Harness::new(&devices, factory);
    let id = harness
        .engine
        .submit_task(TaskRequest::new(
            "push",
            Operation::PushConfig {
                lines: vec!["ntp server 192.0.2.123".into()],
            },
            targets(&devices),
        ))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;

    let json = serde_json::to_string(&state).expect("encode");
    let back: TaskState = serde_json::from_str(&json).expect("decode");
    assert_eq!(back, state);
}

#[tokio::test]
async fn duplicate_targets_run_once() {
    let devices = vec!["r1".to_string()];
    let harness = Harness::new(&devices, ScriptedFactory::new());
    let id = harness
        .engine
        .submit_task(TaskRequest::new(
            "dup",
            show_clock(),
            vec![DeviceId::from("r1"), DeviceId::from("r1")],
        ))
        .await
        .expect("submit");
    let state = harness.finish(&id).await;
    assert_eq!(state.total_count(), 1);
    assert_eq!(Counters::get(&harness.counters.connects), 1);
}
