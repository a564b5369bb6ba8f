use std::time::Duration;

use async_ssh2_tokio::Config;
use async_ssh2_tokio::client::{AuthMethod, Client};
use async_trait::async_trait;
use log::debug;
use russh::ChannelMsg;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{ConnectError, ExecutionError};
use crate::model::{CommandResult, Credentials, Device, TransportKind};
use crate::platform::CliProfile;

use super::cli::{CliShell, Utf8Chunks};
use super::{CliTiming, ConnectionSecurityOptions, TransportSession};

/// Interactive CLI over an SSH shell channel.
pub struct SshSession {
    label: String,
    address: String,
    port: u16,
    profile: CliProfile,
    security: ConnectionSecurityOptions,
    timing: CliTiming,
    client: Option<Client>,
    shell: Option<CliShell>,
}

impl SshSession {
    pub fn new(
        device: &Device,
        profile: CliProfile,
        security: ConnectionSecurityOptions,
        timing: CliTiming,
    ) -> Self {
        Self {
            label: format!("{}@{}", device.id, device.endpoint()),
            address: device.address.clone(),
            port: device.port,
            profile,
            security,
            timing,
            client: None,
            shell: None,
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
        let config = Config {
            preferred: self.security.preferred(),
            inactivity_timeout: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let client = Client::connect_with_config(
            (self.address.clone(), self.port),
            &credentials.username,
            AuthMethod::with_password(&credentials.secret),
            self.security.server_check.clone(),
            config,
        )
        .await
        .map_err(map_ssh_error)?;
        debug!("{} TCP connection successful", self.label);

        let mut channel = client
            .get_channel()
            .await
            .map_err(|err| ConnectError::ProtocolError(format!("open channel: {err}")))?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await
            .map_err(|err| ConnectError::ProtocolError(format!("request pty: {err}")))?;
        channel
            .request_shell(false)
            .await
            .map_err(|err| ConnectError::ProtocolError(format!("request shell: {err}")))?;
        debug!("{} shell request successful", self.label);

        let (sender_to_shell, mut receiver_from_user) = mpsc::channel::<String>(256);
        let (sender_to_user, receiver_from_shell) = mpsc::channel::<String>(256);

        let io_label = self.label.clone();
        tokio::spawn(async move {
            let mut decoder = Utf8Chunks::default();
            loop {
                tokio::select! {
                    data = receiver_from_user.recv() => {
                        let Some(data) = data else {
                            debug!("{io_label} session dropped its writer");
                            let _ = channel.eof().await;
                            break;
                        };
                        if let Err(e) = channel.data(data.as_bytes()).await {
                            debug!("{io_label} failed to send data to shell: {e:?}");
                            break;
                        }
                    },
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { ref data }) => {
                                let text = decoder.decode(data);
                                if sender_to_user.send(text).await.is_err() {
                                    debug!("{io_label} shell output receiver dropped");
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                debug!("{io_label} shell exited with status {exit_status}");
                                let _ = channel.eof().await;
                                break;
                            }
                            Some(ChannelMsg::Eof) | None => {
                                debug!("{io_label} shell sent EOF");
                                break;
                            }
                            Some(_) => {}
                        }
                    }
                }
            }
            debug!("{io_label} SSH I/O task ended");
        });

        let mut shell = CliShell::new(
            self.label.clone(),
            sender_to_shell,
            receiver_from_shell,
            self.profile.clone(),
            self.timing,
        );
        self.client = Some(client);
        shell
            .open(credentials.enable_secret.as_deref(), deadline)
            .await?;
        self.shell = Some(shell);
        Ok(())
    }
}

/// Folds async-ssh2-tokio failures into the connect error kinds.
fn map_ssh_error(err: async_ssh2_tokio::Error) -> ConnectError {
    match err {
        async_ssh2_tokio::Error::PasswordWrong | async_ssh2_tokio::Error::KeyAuthFailed => {
            ConnectError::AuthFailed(err.to_string())
        }
        async_ssh2_tokio::Error::AddressInvalid(_)
        | async_ssh2_tokio::Error::SshError(russh::Error::IO(_)) => {
            ConnectError::Unreachable(err.to_string())
        }
        _ => ConnectError::ProtocolError(err.to_string()),
    }
}

#[async_trait]
impl TransportSession for SshSession {
    fn kind(&self) -> TransportKind {
        TransportKind::Ssh
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
        if let Some(client) = self.client.take() {
            if let Err(err) = client.disconnect().await {
                debug!("{} disconnect: {err}", self.label);
            }
            debug!("{} SSH connection closed", self.label);
        }
    }

    fn is_connected(&self) -> bool {
        self.shell.is_some()
            && self
                .client
                .as_ref()
                .map(|client| !client.is_closed())
                .unwrap_or(false)
    }

    fn probe_command(&self) -> &str {
        self.profile.probe_command
    }

    fn running_config_command(&self) -> &str {
        self.profile.running_config_command
    }
}
