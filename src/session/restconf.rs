//! Read-only RESTCONF session.
//!
//! RESTCONF has no CLI, so a fixed table maps the common `show` commands
//! onto YANG resources. Anything outside the table is rejected before a
//! request is made.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use tokio::time::Instant;

use crate::error::{ConnectError, ErrorKind, ExecutionError};
use crate::model::{CommandResult, Credentials, Device, TransportKind};

use super::TransportSession;

const YANG_JSON: &str = "application/yang-data+json";

/// Resource fetched by `connect` to validate reachability and credentials.
const SYSTEM_STATE: &str = "data/ietf-system:system-state";

const PSEUDO_COMMANDS: &[(&str, &str)] = &[
    ("show version", SYSTEM_STATE),
    ("show system", SYSTEM_STATE),
    ("show interfaces", "data/ietf-interfaces:interfaces"),
    ("show interfaces state", "data/ietf-interfaces:interfaces-state"),
    ("show running-config", "data?content=config"),
    (
        "show capabilities",
        "data/ietf-restconf-monitoring:restconf-state/capabilities",
    ),
];

/// Resource path (relative to `/restconf/`) for a pseudo-command.
pub fn resource_for(command: &str) -> Option<&'static str> {
    let normalized = command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    PSEUDO_COMMANDS
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, resource)| *resource)
}

/// `https` on 443, plain `http` otherwise.
pub fn base_url(address: &str, port: u16) -> String {
    let scheme = if port == 443 { "https" } else { "http" };
    format!("{scheme}://{address}:{port}/restconf/")
}

fn is_auth_rejection(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// Pretty-prints JSON bodies; other payloads are returned as-is.
fn render_body(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string()),
        Err(_) => body.to_string(),
    }
}

pub struct RestconfSession {
    label: String,
    base_url: String,
    request_timeout: Duration,
    accept_invalid_certs: bool,
    client: Option<reqwest::Client>,
    credentials: Option<Credentials>,
}

impl RestconfSession {
    pub fn new(device: &Device, request_timeout: Duration, accept_invalid_certs: bool) -> Self {
        Self {
            label: format!("{}@{}", device.id, device.endpoint()),
            base_url: base_url(&device.address, device.port),
            request_timeout,
            accept_invalid_certs,
            client: None,
            credentials: None,
        }
    }

    fn build_client(&self, connect_timeout: Duration) -> Result<reqwest::Client, ConnectError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(YANG_JSON));
        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|err| ConnectError::ProtocolError(format!("http client: {err}")))
    }

    async fn get(
        &self,
        client: &reqwest::Client,
        credentials: &Credentials,
        resource: &str,
    ) -> Result<(StatusCode, String), reqwest::Error> {
        let url = format!("{}{resource}", self.base_url);
        debug!("{} GET {url}", self.label);
        let response = client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.secret))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        Ok((status, body))
    }
}

#[async_trait]
impl TransportSession for RestconfSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Restconf
    }

    async fn connect(
        &mut self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let client = self.build_client(timeout)?;
        let probe = tokio::time::timeout(timeout, self.get(&client, credentials, SYSTEM_STATE));
        let (status, _) = match probe.await {
            Err(_) => {
                return Err(ConnectError::Timeout(format!(
                    "{} no response within {timeout:?}",
                    self.label
                )));
            }
            Ok(Err(err)) if err.is_timeout() => {
                return Err(ConnectError::Timeout(format!("{}: {err}", self.label)));
            }
            Ok(Err(err)) if err.is_connect() => {
                return Err(ConnectError::Unreachable(format!("{}: {err}", self.label)));
            }
            Ok(Err(err)) => {
                return Err(ConnectError::ProtocolError(format!("{}: {err}", self.label)));
            }
            Ok(Ok(reply)) => reply,
        };

        if is_auth_rejection(status) {
            return Err(ConnectError::AuthFailed(format!(
                "{} answered HTTP {status}",
                self.label
            )));
        }
        if !(status.is_success() || status == StatusCode::NOT_FOUND) {
            return Err(ConnectError::ProtocolError(format!(
                "{} answered HTTP {status}",
                self.label
            )));
        }
        debug!("{} RESTCONF session ready ({status})", self.label);
        self.client = Some(client);
        self.credentials = Some(credentials.clone());
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, ExecutionError> {
        let Some(resource) = resource_for(command) else {
            return Err(ExecutionError::UnsupportedOperation(format!(
                "'{command}' has no RESTCONF mapping"
            )));
        };
        let (Some(client), Some(credentials)) = (self.client.as_ref(), self.credentials.as_ref())
        else {
            return Err(ExecutionError::SessionLost(format!(
                "{} is not connected",
                self.label
            )));
        };

        let started = Instant::now();
        let (status, body) = self
            .get(client, credentials, resource)
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    ExecutionError::Timeout(String::new())
                } else {
                    ExecutionError::SessionLost(format!("{}: {err}", self.label))
                }
            })?;
        let elapsed = started.elapsed();

        if status.is_success() {
            return Ok(CommandResult::ok(render_body(&body), elapsed));
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(CommandResult::ok(String::new(), elapsed));
        }
        if is_auth_rejection(status) {
            return Err(ExecutionError::SessionLost(format!(
                "{} revoked access (HTTP {status})",
                self.label
            )));
        }
        warn!("{} GET {resource} answered HTTP {status}", self.label);
        Ok(CommandResult {
            output: body,
            error_kind: Some(ErrorKind::ProtocolError),
            message: Some(format!("HTTP {status}")),
            failed_line_index: None,
            elapsed,
        })
    }

    async fn push_config(&mut self, _lines: &[String]) -> Result<CommandResult, ExecutionError> {
        Err(ExecutionError::UnsupportedOperation(
            "configuration push is not available over RESTCONF".to_string(),
        ))
    }

    async fn disconnect(&mut self) {
        if self.client.take().is_some() {
            debug!("{} RESTCONF session closed", self.label);
        }
        self.credentials = None;
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}
