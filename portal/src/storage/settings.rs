//! Settings file management

use serde::{Deserialize, Serialize};

use crate::errors::PortalError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Portal settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub json_logs: bool,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerSettings,

    /// Deployment executor configuration
    #[serde(default)]
    pub executor: ExecutorSettings,

    /// SSH transport configuration
    #[serde(default)]
    pub ssh: SshSettings,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageSettings,

    /// Use the in-memory docker simulator instead of SSH
    #[serde(default)]
    pub simulate: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            json_logs: false,
            server: ServerSettings::default(),
            executor: ExecutorSettings::default(),
            ssh: SshSettings::default(),
            storage: StorageSettings::default(),
            simulate: false,
        }
    }
}

impl Settings {
    /// Read settings from `file`; a missing file yields the defaults
    pub async fn load(file: &File) -> Result<Self, PortalError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            PortalError::ConfigError(format!(
                "invalid settings file {}: {}",
                file.path().display(),
                e
            ))
        })
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix every route is mounted under
    #[serde(default = "default_api_prefix")]
    pub api_prefix: String,

    /// Origins allowed by CORS
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_api_prefix() -> String {
    "/api".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".to_string(),
        "http://localhost:3000".to_string(),
    ]
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_prefix: default_api_prefix(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// Deployment executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSettings {
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_lock_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    900
}

fn default_stderr_tail_lines() -> usize {
    20
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            lock_timeout_secs: default_lock_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Port used when a target address has none
    #[serde(default = "default_ssh_port")]
    pub default_port: u16,

    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_inactivity_timeout() -> u64 {
    600
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            default_port: default_ssh_port(),
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Base directory; the platform default when absent
    #[serde(default)]
    pub data_dir: Option<String>,

    /// Mirror the target registry to `targets.json`
    #[serde(default = "default_true")]
    pub persist_targets: bool,

    /// Also write logs to daily files under `<data_dir>/logs`
    #[serde(default)]
    pub log_to_file: bool,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            persist_targets: true,
            log_to_file: false,
        }
    }
}
