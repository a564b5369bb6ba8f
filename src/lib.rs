//! # netbatch - Network Device Batch Execution Engine
//!
//! `netbatch` connects to network devices over SSH, Telnet or RESTCONF and
//! runs commands, configuration pushes, connection tests and config backups
//! across many devices as one tracked task.
//!
//! ## Features
//!
//! - **Three transports** behind one [`session::TransportSession`] trait
//! - **Prompt state machine** for interactive CLIs with vendor profiles (Cisco, Huawei, H3C)
//! - **Bounded fan-out**: at most `concurrency_limit` devices in flight
//! - **One session per device**, registered in a [`registry::ConnectionRegistry`]
//! - **Task lifecycle** with progress, cooperative cancel, watchdog timeout and retry
//! - **Audit trail** and device status reporting through non-blocking sinks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use netbatch::engine::{EngineBuilder, TaskRequest};
//! use netbatch::inventory::{MemoryCredentials, MemoryInventory};
//! use netbatch::model::{CredentialHandle, Credentials, DeviceId};
//! use netbatch::task::Operation;
//! use netbatch::EngineConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let inventory = MemoryInventory::from_json(
//!         r#"[{"id":"core-1","address":"192.168.1.1","port":22,"transport":"ssh","credential":"lab"}]"#,
//!     )?;
//!     let credentials = MemoryCredentials::new();
//!     credentials.insert(
//!         CredentialHandle("lab".into()),
//!         Credentials {
//!             username: "admin".into(),
//!             secret: "password".into(),
//!             enable_secret: None,
//!         },
//!     );
//!
//!     let engine = EngineBuilder::new(
//!         EngineConfig::default(),
//!         Arc::new(inventory),
//!         Arc::new(credentials),
//!     )
//!     .build()?;
//!
//!     let id = engine
//!         .submit_task(TaskRequest::new(
//!             "versions",
//!             Operation::Command { command: "show version".into() },
//!             vec![DeviceId::from("core-1")],
//!         ))
//!         .await?;
//!     let state = engine.wait_for_terminal(&id).await?;
//!     println!("{} {}", state.status, state.message.unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`engine::Engine`] - Task submission, snapshots, cancel, timeout and retry
//! - [`executor::BatchExecutor`] - Bounded concurrent fan-out of one plan
//! - [`executor::CommandExecutor`] - One device through one plan
//! - [`session`] - SSH, Telnet and RESTCONF session variants
//! - [`prompt::PromptHandler`] - CLI prompt state machine
//! - [`error`] - Layered error types and [`error::ErrorKind`]

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod model;
pub mod platform;
pub mod prompt;
pub mod registry;
pub mod render;
pub mod session;
pub mod task;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, TaskRequest};
pub use error::{ConnectError, Error, ErrorKind, ExecutionError, TaskError};
pub use model::{Device, DeviceId, DeviceResult, TransportKind};
pub use task::{Operation, TaskId, TaskState, TaskStatus};
