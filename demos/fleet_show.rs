//! Runs one show command across an inventory file.
//!
//! ```text
//! NETBATCH_USER=admin NETBATCH_PASSWORD=secret \
//!     cargo run --example fleet_show -- inventory.json "show version" [--timeout-secs 120]
//! ```
//!
//! Every device in the inventory must use the credential handle `default`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use netbatch::audit::LogAuditSink;
use netbatch::engine::{EngineBuilder, TaskRequest};
use netbatch::inventory::{MemoryCredentials, MemoryInventory};
use netbatch::model::{CredentialHandle, Credentials};
use netbatch::task::Operation;
use netbatch::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(path), Some(command)) = (args.first(), args.get(1)) else {
        bail!("usage: fleet_show <inventory.json> <command> [--timeout-secs N]");
    };
    let budget = match args.iter().position(|arg| arg == "--timeout-secs") {
        Some(index) => {
            let value = args.get(index + 1).context("--timeout-secs needs a value")?;
            Some(Duration::from_secs(value.parse().context("invalid --timeout-secs")?))
        }
        None => None,
    };

    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let devices: Vec<netbatch::Device> = serde_json::from_str(&text).context("parsing inventory")?;
    let targets = devices.iter().map(|device| device.id.clone()).collect();
    let inventory = MemoryInventory::with_devices(devices);

    let credentials = MemoryCredentials::new();
    credentials.insert(
        CredentialHandle("default".into()),
        Credentials {
            username: std::env::var("NETBATCH_USER").context("NETBATCH_USER not set")?,
            secret: std::env::var("NETBATCH_PASSWORD").context("NETBATCH_PASSWORD not set")?,
            enable_secret: std::env::var("NETBATCH_ENABLE").ok(),
        },
    );

    let config = match std::env::var("NETBATCH_CONFIG") {
        Ok(config_path) => EngineConfig::from_json(&std::fs::read_to_string(&config_path)?)?,
        Err(_) => EngineConfig::default(),
    };
    let engine = EngineBuilder::new(config, Arc::new(inventory), Arc::new(credentials))
        .audit_sink(Arc::new(LogAuditSink))
        .actor("fleet_show")
        .build()?;

    let mut request = TaskRequest::new(
        format!("fleet_show {command}"),
        Operation::Command {
            command: command.clone(),
        },
        targets,
    );
    if let Some(budget) = budget {
        request = request.with_budget(budget);
    }
    let id = engine.submit_task(request).await?;
    let state = engine.wait_for_terminal(&id).await?;

    for result in state.results.values() {
        if result.success {
            println!("== {} ({} ms)\n{}", result.device_id, result.execution_time_ms, result.output);
        } else {
            println!(
                "!! {} {:?}: {}",
                result.device_id,
                result.error_kind,
                result.message.as_deref().unwrap_or_default()
            );
        }
    }
    println!(
        "task {} {}: {}",
        state.id,
        state.status,
        state.message.as_deref().unwrap_or_default()
    );
    engine.flush_notifications().await;
    Ok(())
}
