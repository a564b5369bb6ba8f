//! Prompt-driven shell driver shared by the SSH and Telnet sessions.
//!
//! The transport hands over a pair of channels carrying raw text in both
//! directions; the driver writes commands, classifies every line through the
//! vendor [`PromptHandler`](crate::prompt::PromptHandler) and decides when a
//! command is finished.

use log::{debug, trace};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::Instant;

use crate::error::{ConnectError, ExecutionError};
use crate::model::CommandResult;
use crate::platform::{CliProfile, ENABLE_SECRET_PARAM};
use crate::prompt::IGNORE_START_LINE;

use super::CliTiming;

/// How a read loop ended.
enum ReadEnd {
    Prompt,
    Settled,
}

/// Decodes device output chunk by chunk, holding back a multi-byte
/// character split across reads until its remaining bytes arrive.
#[derive(Debug, Default)]
pub(crate) struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let complete = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }
}

/// Length of an unfinished UTF-8 sequence at the end of `bytes`.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF8..=0xFF => 1,
            0xF0..=0xF7 => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

pub(crate) struct CliShell {
    label: String,
    sender: Sender<String>,
    receiver: Receiver<String>,
    profile: CliProfile,
    timing: CliTiming,
    prompt: String,
    /// Output read by the transport before the driver took over.
    pending: String,
}

impl CliShell {
    pub(crate) fn new(
        label: String,
        sender: Sender<String>,
        receiver: Receiver<String>,
        profile: CliProfile,
        timing: CliTiming,
    ) -> Self {
        Self {
            label,
            sender,
            receiver,
            profile,
            timing,
            prompt: String::new(),
            pending: String::new(),
        }
    }

    /// Seeds the driver with text the transport already consumed, e.g. the
    /// tail of a Telnet login exchange.
    pub(crate) fn with_pending(mut self, pending: String) -> Self {
        self.pending = pending;
        self
    }

    pub(crate) fn profile(&self) -> &CliProfile {
        &self.profile
    }

    /// Waits for the first prompt after login, moves to the exec mode and
    /// turns paging off.
    pub(crate) async fn open(
        &mut self,
        enable_secret: Option<&str>,
        deadline: Instant,
    ) -> Result<(), ConnectError> {
        if let Some(secret) = enable_secret {
            self.profile
                .handler
                .set_param(ENABLE_SECRET_PARAM, format!("{secret}\n"));
        }

        self.wait_initial_prompt(deadline).await?;
        debug!("{} initial prompt {:?}", self.label, self.prompt);

        let exec_mode = self.profile.exec_mode;
        if let Err(err) = self.enter_mode(exec_mode).await {
            return Err(match err {
                ExecutionError::CommandRejected(msg) => {
                    ConnectError::AuthFailed(format!("entering {exec_mode} mode failed: {msg}"))
                }
                ExecutionError::Timeout(_) => ConnectError::Timeout(format!(
                    "{} no prompt after entering {exec_mode} mode",
                    self.label
                )),
                other => ConnectError::ProtocolError(other.to_string()),
            });
        }

        if let Some(paging) = self.profile.disable_paging {
            // Some images reject the paging command; output still works with
            // `--More--` answered.
            if let Err(err) = self.write(paging).await {
                debug!("{} disabling paging failed: {err}", self.label);
            }
        }
        Ok(())
    }

    async fn wait_initial_prompt(&mut self, deadline: Instant) -> Result<(), ConnectError> {
        let mut buffer = std::mem::take(&mut self.pending);
        let mut seen = buffer.clone();
        let result = tokio::time::timeout_at(deadline, async {
            loop {
                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer.drain(..=newline_pos).collect::<String>();
                    self.profile.handler.read(line.trim_end());
                }

                if !buffer.is_empty() {
                    let pending = IGNORE_START_LINE.replace(&buffer, "").to_string();
                    if self.profile.handler.is_prompt(&pending) {
                        self.profile.handler.read(&pending);
                        self.prompt = pending;
                        return Ok(());
                    }
                    if let Some(answer) = self.profile.handler.answer_for(&pending) {
                        self.profile.handler.read(&pending);
                        buffer.clear();
                        self.send(answer)
                            .await
                            .map_err(|err| ConnectError::ProtocolError(err.to_string()))?;
                    }
                }

                let Some(data) = self.receiver.recv().await else {
                    return Err(ConnectError::ProtocolError(format!(
                        "{} channel closed before the first prompt",
                        self.label
                    )));
                };
                trace!("{} {:?}", self.label, data);
                buffer.push_str(&data);
                seen.push_str(&data);
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(ConnectError::Timeout(if seen.is_empty() {
                "waiting for initial prompt".to_string()
            } else {
                seen
            })),
        }
    }

    async fn send(&self, data: String) -> Result<(), ExecutionError> {
        self.sender
            .send(data)
            .await
            .map_err(|_| ExecutionError::SessionLost(format!("{} shell writer closed", self.label)))
    }

    /// Writes one command and reads until a prompt or the settle interval.
    ///
    /// A line matching the vendor error patterns makes the result
    /// `CommandRejected`; the output is kept either way.
    pub(crate) async fn write(&mut self, command: &str) -> Result<CommandResult, ExecutionError> {
        let started = Instant::now();
        let deadline = started + self.timing.command_timeout;

        while self.receiver.try_recv().is_ok() {}
        self.send(format!("{command}\n")).await?;

        let mut output = String::new();
        let mut line_buffer = String::new();
        let mut rejection: Option<String> = None;
        let mut received_any = false;

        let end = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ExecutionError::Timeout(output));
            }
            let wait = if received_any {
                self.timing.settle_interval.min(remaining)
            } else {
                remaining
            };

            let data = match tokio::time::timeout(wait, self.receiver.recv()).await {
                Ok(Some(data)) => data,
                Ok(None) => {
                    return Err(ExecutionError::SessionLost(format!(
                        "{} channel closed while running '{command}'",
                        self.label
                    )));
                }
                Err(_) if received_any && Instant::now() < deadline => break ReadEnd::Settled,
                Err(_) => return Err(ExecutionError::Timeout(output)),
            };
            received_any = true;
            line_buffer.push_str(&data);

            while let Some(newline_pos) = line_buffer.find('\n') {
                let line = line_buffer.drain(..=newline_pos).collect::<String>();
                let line = IGNORE_START_LINE.replace(&line, "");
                let trimmed = line.trim_end();
                self.profile.handler.read(trimmed);
                if rejection.is_none() && self.profile.handler.is_error(trimmed) {
                    rejection = Some(trimmed.to_string());
                }
                output.push_str(&line);
            }

            if line_buffer.is_empty() {
                continue;
            }
            let pending = IGNORE_START_LINE.replace(&line_buffer, "").to_string();
            if self.profile.handler.is_prompt(&pending) {
                self.profile.handler.read(&pending);
                output.push_str(&pending);
                self.prompt = pending;
                break ReadEnd::Prompt;
            }
            if let Some(answer) = self.profile.handler.answer_for(&pending) {
                self.profile.handler.read(&pending);
                trace!("{} answering {:?}", self.label, pending);
                if self.profile.handler.current_state() != "more" {
                    output.push_str(&pending);
                }
                line_buffer.clear();
                self.send(answer).await?;
            }
        };

        if matches!(end, ReadEnd::Settled) {
            debug!(
                "{} '{command}' settled without a prompt after {:?}",
                self.label, self.timing.settle_interval
            );
            output.push_str(&line_buffer);
        }

        let content = strip_echo_and_prompt(&output, command, matches!(end, ReadEnd::Prompt));
        let elapsed = started.elapsed();
        Ok(match rejection {
            Some(message) => CommandResult::rejected(content, message, None, elapsed),
            None => CommandResult::ok(content, elapsed),
        })
    }

    /// Walks the mode graph to `mode`, checking every hop lands where
    /// expected.
    pub(crate) async fn enter_mode(&mut self, mode: &str) -> Result<(), ExecutionError> {
        let path = self
            .profile
            .handler
            .path_to(mode)
            .map_err(|err| ExecutionError::CommandRejected(err.to_string()))?;

        for (command, expected) in path {
            debug!("{} mode transition via '{command}'", self.label);
            let result = self.write(&command).await?;
            if !result.is_success() {
                return Err(ExecutionError::CommandRejected(format!(
                    "'{command}' rejected: {}",
                    result.message.unwrap_or_default()
                )));
            }
            let current = self.profile.handler.current_state();
            if current != expected {
                return Err(ExecutionError::CommandRejected(format!(
                    "'{command}' left the device in mode '{current}' instead of '{expected}'"
                )));
            }
        }
        Ok(())
    }

    /// Enters config mode, applies `lines` fail-fast, returns to exec mode and
    /// saves.
    pub(crate) async fn push_config(
        &mut self,
        lines: &[String],
    ) -> Result<CommandResult, ExecutionError> {
        let started = Instant::now();
        let config_mode = self.profile.config_mode;
        let exec_mode = self.profile.exec_mode;

        if let Err(err) = self.enter_mode(config_mode).await {
            return match err {
                ExecutionError::CommandRejected(message) => Ok(CommandResult::rejected(
                    String::new(),
                    message,
                    None,
                    started.elapsed(),
                )),
                other => Err(other),
            };
        }

        let mut transcript = String::new();
        for (index, line) in lines.iter().enumerate() {
            let result = self.write(line).await?;
            transcript.push_str(&result.output);
            transcript.push('\n');
            if !result.is_success() {
                debug!("{} config line {index} rejected: {line}", self.label);
                return Ok(CommandResult::rejected(
                    transcript,
                    result.message.unwrap_or_else(|| format!("line {index} rejected")),
                    Some(index),
                    started.elapsed(),
                ));
            }
        }

        self.enter_mode(exec_mode).await.map_err(|err| {
            ExecutionError::PartialConfigFailure(format!(
                "{} lines applied but leaving config mode failed: {err}",
                lines.len()
            ))
        })?;

        let save_command = self.profile.save_command;
        let saved = self.write(save_command).await.map_err(|err| {
            ExecutionError::PartialConfigFailure(format!(
                "{} lines applied but '{save_command}' failed: {err}",
                lines.len()
            ))
        })?;
        if !saved.is_success() {
            return Err(ExecutionError::PartialConfigFailure(format!(
                "{} lines applied but '{save_command}' was rejected: {}",
                lines.len(),
                saved.message.unwrap_or_default()
            )));
        }
        transcript.push_str(&saved.output);

        Ok(CommandResult::ok(transcript, started.elapsed()))
    }

    /// Best-effort logout.
    pub(crate) fn logout(&self) {
        if self.sender.try_send("exit\n".to_string()).is_err() {
            trace!("{} shell already closed", self.label);
        }
    }
}

/// Removes the echoed command from the head of `all` and, when the read
/// ended on a prompt, the prompt line from its tail.
fn strip_echo_and_prompt(all: &str, command: &str, ends_with_prompt: bool) -> String {
    let mut content = all;
    if !command.is_empty()
        && let Some(rest) = content.strip_prefix(command)
    {
        content = rest.trim_start_matches(['\n', '\r']);
    }
    if ends_with_prompt {
        content = match content.rfind('\n') {
            Some(pos) => &content[..pos],
            None => "",
        };
    }
    content.trim_end_matches(['\r', '\n']).to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::platform;
    use tokio::sync::mpsc;

    #[test]
    fn split_multibyte_character_survives_chunking() {
        let text = "描述 uplink café ok";
        let bytes = text.as_bytes();
        let mut decoder = Utf8Chunks::default();
        let mut out = String::new();
        for chunk in bytes.chunks(1) {
            out.push_str(&decoder.decode(chunk));
        }
        assert_eq!(out, text);
        assert!(!out.contains('\u{FFFD}'));
    }

    #[test]
    fn invalid_bytes_are_not_held_back() {
        let mut decoder = Utf8Chunks::default();
        assert_eq!(decoder.decode(b"ok\xFF"), "ok\u{FFFD}");
        assert_eq!(decoder.decode(b"\xE6\x8F"), "");
        assert_eq!(decoder.decode(b"\x8F!"), "\u{63CF}!");
    }

    struct FakeDevice {
        input: mpsc::Receiver<String>,
        output: mpsc::Sender<String>,
    }

    fn shell() -> (CliShell, FakeDevice) {
        let (to_device, input) = mpsc::channel(64);
        let (output, from_device) = mpsc::channel(64);
        let timing = CliTiming {
            command_timeout: Duration::from_secs(2),
            settle_interval: Duration::from_millis(200),
        };
        let profile = platform::cisco().expect("cisco profile");
        let shell = CliShell::new("r1".into(), to_device, from_device, profile, timing);
        (shell, FakeDevice { input, output })
    }

    #[test]
    fn echo_and_prompt_are_stripped() {
        let all = "show clock\r\n*10:00:00 UTC\r\nR1#";
        assert_eq!(strip_echo_and_prompt(all, "show clock", true), "*10:00:00 UTC");
    }

    #[test]
    fn settled_output_keeps_last_line() {
        let all = "show clock\r\n*10:00:00 UTC";
        assert_eq!(strip_echo_and_prompt(all, "show clock", false), "*10:00:00 UTC");
    }

    #[tokio::test]
    async fn write_reads_until_prompt() {
        let (mut shell, mut device) = shell();
        let responder = tokio::spawn(async move {
            let command = device.input.recv().await.expect("command");
            assert_eq!(command, "show clock\n");
            device
                .output
                .send("show clock\r\n*10:00:00 UTC\r\nR1#".to_string())
                .await
                .expect("send");
            device
        });

        let result = shell.write("show clock").await.expect("write");
        assert!(result.is_success());
        assert_eq!(result.output, "*10:00:00 UTC");
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn error_line_marks_command_rejected() {
        let (mut shell, mut device) = shell();
        let responder = tokio::spawn(async move {
            let _ = device.input.recv().await;
            device
                .output
                .send("shw\r\n% Invalid input detected at '^' marker.\r\nR1#".to_string())
                .await
                .expect("send");
            device
        });

        let result = shell.write("shw").await.expect("write");
        assert!(!result.is_success());
        assert_eq!(
            result.message.as_deref(),
            Some("% Invalid input detected at '^' marker.")
        );
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn quiet_output_settles_without_prompt() {
        let (mut shell, mut device) = shell();
        let responder = tokio::spawn(async move {
            let _ = device.input.recv().await;
            device
                .output
                .send("banner text".to_string())
                .await
                .expect("send");
            device
        });

        let result = shell.write("show banner").await.expect("settled");
        assert!(result.is_success());
        assert_eq!(result.output, "banner text");
        let _device = responder.await.expect("responder");
    }

    #[tokio::test]
    async fn closed_channel_is_session_lost() {
        let (mut shell, device) = shell();
        drop(device);
        let err = shell.write("show clock").await.unwrap_err();
        assert!(matches!(err, ExecutionError::SessionLost(_)));
    }

    #[tokio::test]
    async fn pagination_is_answered_with_space() {
        let (mut shell, mut device) = shell();
        let responder = tokio::spawn(async move {
            let _ = device.input.recv().await;
            device
                .output
                .send("show run\r\nline 1\r\n --More-- ".to_string())
                .await
                .expect("send");
            let answer = device.input.recv().await.expect("more answer");
            assert_eq!(answer, " ");
            device
                .output
                .send("\rline 2\r\nR1#".to_string())
                .await
                .expect("send");
            device
        });

        let result = shell.write("show run").await.expect("write");
        assert!(result.output.contains("line 1"));
        assert!(result.output.contains("line 2"));
        assert!(!result.output.contains("More"));
        responder.await.expect("responder");
    }

    #[tokio::test]
    async fn open_enters_enable_mode_with_secret() {
        let (mut shell, mut device) = shell();
        let responder = tokio::spawn(async move {
            device.output.send("\r\nR1>".to_string()).await.expect("send");
            assert_eq!(device.input.recv().await.as_deref(), Some("enable\n"));
            device.output.send("enable\r\nPassword: ".to_string()).await.expect("send");
            assert_eq!(device.input.recv().await.as_deref(), Some("s3cret\n"));
            device.output.send("\r\nR1#".to_string()).await.expect("send");
            assert_eq!(
                device.input.recv().await.as_deref(),
                Some("terminal length 0\n")
            );
            device
                .output
                .send("terminal length 0\r\nR1#".to_string())
                .await
                .expect("send");
            device
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        shell.open(Some("s3cret"), deadline).await.expect("open");
        assert_eq!(shell.profile().handler.current_state(), "enable");
        responder.await.expect("responder");
    }
}
