//! Interactive CLI over a raw Telnet connection.
//!
//! Option negotiation is kept to the minimum a device CLI needs: the server
//! may echo and suppress go-ahead, everything else is refused.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ConnectError, ExecutionError};
use crate::model::{CommandResult, Credentials, Device, TransportKind};
use crate::platform::CliProfile;
use crate::prompt::{IGNORE_START_LINE, PromptHandler};

use super::cli::{CliShell, Utf8Chunks};
use super::{CliTiming, TransportSession};

const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

fn login_regex(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => panic!("invalid telnet login regex {pattern}: {err}"),
    }
}

static USERNAME_PROMPT: Lazy<Regex> =
    Lazy::new(|| login_regex(r"(?i)(user\s*name|login)\s*:\s*$"));
static PASSWORD_PROMPT: Lazy<Regex> = Lazy::new(|| login_regex(r"(?i)pass(word|code)\s*:\s*$"));
static LOGIN_REJECTED: Lazy<Regex> = Lazy::new(|| {
    login_regex(
        r"(?i)(login incorrect|login invalid|authentication failed|access denied|bad passwords?)",
    )
});

/// Strips Telnet commands from the byte stream and produces the replies.
///
/// Sequences split across reads are carried over to the next call.
#[derive(Debug, Default)]
pub(crate) struct Negotiator {
    carry: Vec<u8>,
}

impl Negotiator {
    /// Returns `(data, replies)` for one chunk read from the socket.
    pub(crate) fn feed(&mut self, input: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(input);

        let mut data = Vec::with_capacity(bytes.len());
        let mut replies = Vec::new();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] != IAC {
                data.push(bytes[i]);
                i += 1;
                continue;
            }
            let Some(&command) = bytes.get(i + 1) else {
                self.carry = bytes[i..].to_vec();
                break;
            };
            match command {
                IAC => {
                    data.push(IAC);
                    i += 2;
                }
                DO | DONT | WILL | WONT => {
                    let Some(&option) = bytes.get(i + 2) else {
                        self.carry = bytes[i..].to_vec();
                        break;
                    };
                    match (command, option) {
                        (WILL, OPT_ECHO | OPT_SGA) => replies.extend_from_slice(&[IAC, DO, option]),
                        (WILL, _) => replies.extend_from_slice(&[IAC, DONT, option]),
                        (DO, OPT_SGA) => replies.extend_from_slice(&[IAC, WILL, option]),
                        (DO, _) => replies.extend_from_slice(&[IAC, WONT, option]),
                        _ => {}
                    }
                    i += 3;
                }
                SB => {
                    let end = bytes[i + 2..]
                        .windows(2)
                        .position(|pair| pair == [IAC, SE]);
                    match end {
                        Some(offset) => i += 2 + offset + 2,
                        None => {
                            self.carry = bytes[i..].to_vec();
                            break;
                        }
                    }
                }
                _ => i += 2,
            }
        }
        (data, replies)
    }
}

/// Answers the username and password prompts.
///
/// Returns the text read after the password was accepted, which holds the
/// first CLI prompt once the device printed it.
async fn login(
    label: &str,
    sender: &Sender<String>,
    receiver: &mut Receiver<String>,
    credentials: &Credentials,
    handler: &PromptHandler,
) -> Result<String, ConnectError> {
    let mut tail = String::new();
    let mut sent_username = false;
    let mut sent_password = false;

    loop {
        let Some(data) = receiver.recv().await else {
            return Err(if sent_password {
                ConnectError::AuthFailed(format!("{label} closed the connection after login"))
            } else {
                ConnectError::ProtocolError(format!("{label} closed the connection during login"))
            });
        };
        trace!("{label} {data:?}");
        tail.push_str(&data);

        if sent_password && LOGIN_REJECTED.is_match(&tail) {
            return Err(ConnectError::AuthFailed(format!(
                "{label} rejected the credentials"
            )));
        }

        let last_line = tail.rsplit('\n').next().unwrap_or_default();
        let last_line = IGNORE_START_LINE.replace(last_line, "").into_owned();
        if handler.is_prompt(&last_line) {
            return Ok(tail);
        }
        if USERNAME_PROMPT.is_match(&last_line) {
            if sent_password {
                return Err(ConnectError::AuthFailed(format!(
                    "{label} asked for the username again"
                )));
            }
            send(sender, format!("{}\n", credentials.username)).await?;
            sent_username = true;
            tail.clear();
        } else if PASSWORD_PROMPT.is_match(&last_line) {
            if sent_password {
                return Err(ConnectError::AuthFailed(format!(
                    "{label} asked for the password again"
                )));
            }
            if !sent_username {
                debug!("{label} asks for a password without a username");
            }
            send(sender, format!("{}\n", credentials.secret)).await?;
            sent_password = true;
            tail.clear();
        }
    }
}

async fn send(sender: &Sender<String>, data: String) -> Result<(), ConnectError> {
    sender
        .send(data)
        .await
        .map_err(|_| ConnectError::ProtocolError("telnet connection closed".to_string()))
}

/// Interactive CLI over Telnet.
pub struct TelnetSession {
    label: String,
    address: String,
    port: u16,
    profile: CliProfile,
    timing: CliTiming,
    shell: Option<CliShell>,
    io_task: Option<JoinHandle<()>>,
}

impl TelnetSession {
    pub fn new(device: &Device, profile: CliProfile, timing: CliTiming) -> Self {
        Self {
            label: format!("{}@{}", device.id, device.endpoint()),
            address: device.address.clone(),
            port: device.port,
            profile,
            timing,
            shell: None,
            io_task: None,
        }
    }

    fn shell(&mut self) -> Result<&mut CliShell, ExecutionError> {
        match self.shell.as_mut() {
            Some(shell) => Ok(shell),
            None => Err(ExecutionError::SessionLost(format!(
                "{} is not connected",
                self.label
            ))),
        }
    }

    async fn open(&mut self, credentials: &Credentials, deadline: Instant) -> Result<(), ConnectError> {
        let stream = TcpStream::connect((self.address.as_str(), self.port))
            .await
            .map_err(|err| ConnectError::Unreachable(format!("{}: {err}", self.label)))?;
        debug!("{} TCP connection successful", self.label);

        let (sender_to_device, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, mut receiver_from_device) = mpsc::channel::<String>(256);
        let (mut reader, mut writer) = stream.into_split();

        let io_label = self.label.clone();
        self.io_task = Some(tokio::spawn(async move {
            let mut negotiator = Negotiator::default();
            let mut decoder = Utf8Chunks::default();
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    data = receiver_from_user.recv() => {
                        let Some(data) = data else { break };
                        let wire = data.replace('\n', "\r\n");
                        if let Err(e) = writer.write_all(wire.as_bytes()).await {
                            debug!("{io_label} failed to write: {e}");
                            break;
                        }
                    }
                    read = reader.read(&mut buf) => {
                        let n = match read {
                            Ok(0) => {
                                debug!("{io_label} closed by peer");
                                break;
                            }
                            Ok(n) => n,
                            Err(e) => {
                                debug!("{io_label} read failed: {e}");
                                break;
                            }
                        };
                        let (data, replies) = negotiator.feed(&buf[..n]);
                        if !replies.is_empty() && writer.write_all(&replies).await.is_err() {
                            break;
                        }
                        if !data.is_empty() {
                            let text = decoder.decode(&data);
                            if sender_to_user.send(text).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            let _ = writer.shutdown().await;
            debug!("{io_label} Telnet I/O task ended");
        }));

        let pending = login(
            &self.label,
            &sender_to_device,
            &mut receiver_from_device,
            credentials,
            &self.profile.handler,
        )
        .await?;
        debug!("{} login accepted", self.label);

        let mut shell = CliShell::new(
            self.label.clone(),
            sender_to_device,
            receiver_from_device,
            self.profile.clone(),
            self.timing,
        )
        .with_pending(pending);
        shell
            .open(credentials.enable_secret.as_deref(), deadline)
            .await?;
        self.shell = Some(shell);
        Ok(())
    }
}

#[async_trait]
impl TransportSession for TelnetSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Telnet
    }

    async fn connect(
        &mut self,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<(), ConnectError> {
        let deadline = Instant::now() + timeout;
        match tokio::time::timeout_at(deadline, self.open(credentials, deadline)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.disconnect().await;
                Err(err)
            }
            Err(_) => {
                self.disconnect().await;
                Err(ConnectError::Timeout(format!(
                    "{} no session within {timeout:?}",
                    self.label
                )))
            }
        }
    }

    async fn execute(&mut self, command: &str) -> Result<CommandResult, ExecutionError> {
        self.shell()?.write(command).await
    }

    async fn push_config(&mut self, lines: &[String]) -> Result<CommandResult, ExecutionError> {
        self.shell()?.push_config(lines).await
    }

    async fn disconnect(&mut self) {
        if let Some(shell) = self.shell.take() {
            shell.logout();
        }
        if let Some(mut task) = self.io_task.take() {
            // The task ends once the shell's channels drop; abort covers a
            // peer that never closes.
            if tokio::time::timeout(Duration::from_millis(500), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
            debug!("{} Telnet connection closed", self.label);
        }
    }

    fn is_connected(&self) -> bool {
        self.shell.is_some()
            && self
                .io_task
                .as_ref()
                .map(|task| !task.is_finished())
                .unwrap_or(false)
    }

    fn probe_command(&self) -> &str {
        self.profile.probe_command
    }

    fn running_config_command(&self) -> &str {
        self.profile.running_config_command
    }
}
