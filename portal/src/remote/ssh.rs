//! SSH session provider built on `russh`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client;
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use russh_keys::load_secret_key;
use tokio::sync::mpsc;
use tracing::debug;

use crate::errors::PortalError;
use crate::models::target::Target;
use crate::remote::{CommandOutput, LineSplitter, OutputLine, Session, SessionProvider};

/// SSH transport options
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Port used when a target address carries none
    pub default_port: u16,

    /// Drop the connection after this much silence
    pub inactivity_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            default_port: 22,
            inactivity_timeout: Duration::from_secs(600),
        }
    }
}

struct ClientHandler {
    destination: String,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Host keys are not pinned; any server key is accepted
        debug!("Accepting host key for {}", self.destination);
        Ok(true)
    }
}

/// Opens key-authenticated SSH sessions
pub struct SshSessionProvider {
    options: SshOptions,
}

impl SshSessionProvider {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl SessionProvider for SshSessionProvider {
    async fn connect(&self, target: &Target) -> Result<Box<dyn Session>, PortalError> {
        let (host, port) = target.host_and_port(self.options.default_port);
        let destination = target.ssh_destination();

        let key_pair = load_secret_key(&target.ssh_key_path, None).map_err(|e| {
            PortalError::ConnectionError(format!(
                "unable to load SSH key {}: {}",
                target.ssh_key_path, e
            ))
        })?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.options.inactivity_timeout),
            ..Default::default()
        });
        let handler = ClientHandler {
            destination: destination.clone(),
        };

        debug!("Connecting to {}:{} as {}", host, port, target.ssh_user);
        let mut handle = client::connect(config, (host.as_str(), port), handler)
            .await
            .map_err(|e| {
                PortalError::ConnectionError(format!("failed to reach {}: {}", destination, e))
            })?;

        let authenticated = handle
            .authenticate_publickey(&target.ssh_user, Arc::new(key_pair))
            .await
            .map_err(|e| {
                PortalError::ConnectionError(format!(
                    "authentication with {} failed: {}",
                    destination, e
                ))
            })?;

        if !authenticated {
            return Err(PortalError::ConnectionError(format!(
                "authentication rejected for {}",
                destination
            )));
        }

        Ok(Box::new(SshSession {
            handle,
            destination,
        }))
    }

    fn name(&self) -> &str {
        "ssh"
    }
}

/// An authenticated SSH connection; each command gets its own channel
pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    destination: String,
}

impl SshSession {
    fn channel_error(&self, e: russh::Error) -> PortalError {
        PortalError::ConnectionError(format!("SSH channel to {} failed: {}", self.destination, e))
    }

    fn missing_exit_status(&self) -> PortalError {
        PortalError::ConnectionError(format!(
            "channel to {} closed without an exit status",
            self.destination
        ))
    }

    async fn open_exec(&self, command: &str) -> Result<russh::Channel<client::Msg>, PortalError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| self.channel_error(e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| self.channel_error(e))?;
        Ok(channel)
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&mut self, command: &str) -> Result<CommandOutput, PortalError> {
        debug!("[{}] run: {}", self.destination, command);
        let mut channel = self.open_exec(command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code.ok_or_else(|| self.missing_exit_status())?,
        })
    }

    async fn stream(
        &mut self,
        command: &str,
        lines: mpsc::Sender<OutputLine>,
    ) -> Result<u32, PortalError> {
        debug!("[{}] stream: {}", self.destination, command);
        let mut channel = self.open_exec(command).await?;

        let mut stdout = LineSplitter::new();
        let mut stderr = LineSplitter::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            let batch: Vec<OutputLine> = match msg {
                ChannelMsg::Data { ref data } => stdout
                    .push(data)
                    .into_iter()
                    .map(OutputLine::stdout)
                    .collect(),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr
                    .push(data)
                    .into_iter()
                    .map(OutputLine::stderr)
                    .collect(),
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(exit_status);
                    Vec::new()
                }
                _ => Vec::new(),
            };

            for line in batch {
                if lines.send(line).await.is_err() {
                    // Nobody is listening any more
                    return Err(PortalError::Cancelled);
                }
            }
        }

        let trailing = [
            stdout.finish().map(OutputLine::stdout),
            stderr.finish().map(OutputLine::stderr),
        ];
        for line in trailing.into_iter().flatten() {
            if lines.send(line).await.is_err() {
                return Err(PortalError::Cancelled);
            }
        }

        exit_code.ok_or_else(|| self.missing_exit_status())
    }

    async fn close(&mut self) -> Result<(), PortalError> {
        debug!("Closing SSH session to {}", self.destination);
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| self.channel_error(e))
    }
}
