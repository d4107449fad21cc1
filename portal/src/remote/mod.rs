//! Remote session provider
//!
//! A [`SessionProvider`] opens an authenticated command channel to a target.
//! Sessions run commands either captured ([`Session::run`]) or streamed line by
//! line into a channel ([`Session::stream`]). Callers close every session they
//! open, on success and failure alike; [`with_session`] does this for one-shot
//! operations.

pub mod simulated;
pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::PortalError;
use crate::models::target::Target;

/// Which output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of remote output, without its terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputLine {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into a `RemoteCommandError` carrying the output tail
    pub fn check(self, command: &str, tail_lines: usize) -> Result<Self, PortalError> {
        if self.success() {
            return Ok(self);
        }
        let detail = failure_detail(&self.stderr, &self.stdout, tail_lines);
        Err(PortalError::RemoteCommandError {
            command: command.to_string(),
            exit_code: self.exit_code,
            detail,
        })
    }
}

/// Last `n` non-blank lines of `text`
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Error detail for a failed command: stderr tail, else stdout tail, never empty
pub fn failure_detail(stderr: &str, stdout: &str, tail_lines: usize) -> String {
    let detail = tail(stderr, tail_lines);
    if !detail.is_empty() {
        return detail;
    }
    let detail = tail(stdout, tail_lines);
    if !detail.is_empty() {
        return detail;
    }
    "command produced no output".to_string()
}

/// An open command channel to a target
#[async_trait]
pub trait Session: Send {
    /// Run a command to completion and capture its output
    async fn run(&mut self, command: &str) -> Result<CommandOutput, PortalError>;

    /// Run a command, sending each output line to `lines` as it arrives.
    ///
    /// Returns the exit code once the remote process exits. Dropping the
    /// returned future abandons the command.
    async fn stream(
        &mut self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<u32, PortalError>;

    /// Release the underlying connection
    async fn close(&mut self) -> Result<(), PortalError>;
}

/// Opens sessions to targets
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Connect and authenticate. Unreachable hosts and rejected credentials
    /// are `ConnectionError`s.
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, PortalError>;

    /// Provider name (for logs)
    fn name(&self) -> &str;
}

/// Connect, bounding the attempt by `timeout`
pub async fn connect_with_timeout(
    provider: &dyn SessionProvider,
    target: &Target,
    timeout: Duration,
) -> Result<Box<dyn Session>, PortalError> {
    match tokio::time::timeout(timeout, provider.connect(target)).await {
        Ok(result) => result,
        Err(_) => Err(PortalError::ConnectionError(format!(
            "timed out after {:?} connecting to {}",
            timeout,
            target.ssh_destination()
        ))),
    }
}

/// Open a session, run `op` on it and close it whatever the outcome.
///
/// `op` must finish within `command_timeout`, otherwise it is dropped and the
/// call fails with `Timeout`.
pub async fn with_session<T, F>(
    provider: &dyn SessionProvider,
    target: &Target,
    connect_timeout: Duration,
    command_timeout: Duration,
    op: F,
) -> Result<T, PortalError>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut Box<dyn Session>) -> BoxFuture<'s, Result<T, PortalError>> + Send,
{
    let mut session = connect_with_timeout(provider, target, connect_timeout).await?;
    let result = match tokio::time::timeout(command_timeout, op(&mut session)).await {
        Ok(result) => result,
        Err(_) => Err(PortalError::Timeout(format!(
            "remote command on {} did not finish within {:?}",
            target.ssh_destination(),
            command_timeout
        ))),
    };
    if let Err(e) = session.close().await {
        warn!("Failed to close session to {}: {}", target.ssh_destination(), e);
    }
    result
}

/// Splits a byte stream into lines, buffering partial lines between chunks
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every line it completes
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            lines.push(Self::decode(&line[..line.len() - 1]));
        }
        lines
    }

    /// Flush a trailing unterminated line
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = Self::decode(&self.buf);
        self.buf.clear();
        Some(line)
    }

    fn decode(bytes: &[u8]) -> String {
        let text = String::from_utf8_lossy(bytes);
        let text: &str = &text;
        text.strip_suffix('\r').unwrap_or(text).to_string()
    }
}
