//! Application configuration options

use std::time::Duration;

use crate::deploy::executor::ExecutorOptions;
use crate::remote::ssh::SshOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Server configuration
    pub server: ServerOptions,

    /// Deployment executor options
    pub executor: ExecutorOptions,

    /// SSH transport options
    pub ssh: SshOptions,

    /// Run against the in-memory docker simulator
    pub simulate: bool,
}

impl AppOptions {
    /// Runtime options from a settings file
    pub fn from_settings(settings: &Settings) -> Self {
        let layout = match &settings.storage.data_dir {
            Some(dir) => StorageLayout::new(dir),
            None => StorageLayout::default(),
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions {
                layout,
                persist_targets: settings.storage.persist_targets,
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                api_prefix: settings.server.api_prefix.clone(),
                cors_origins: settings.server.cors_origins.clone(),
            },
            executor: ExecutorOptions {
                lock_timeout: Duration::from_secs(settings.executor.lock_timeout_secs),
                connect_timeout: Duration::from_secs(settings.executor.connect_timeout_secs),
                command_timeout: Duration::from_secs(settings.executor.command_timeout_secs),
                stderr_tail_lines: settings.executor.stderr_tail_lines,
            },
            ssh: SshOptions {
                default_port: settings.ssh.default_port,
                inactivity_timeout: Duration::from_secs(settings.ssh.inactivity_timeout_secs),
            },
            simulate: settings.simulate,
        }
    }
}

/// Lifecycle options for the portal
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Mirror the target registry to disk
    pub persist_targets: bool,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            persist_targets: false,
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Prefix the API is mounted under; empty for the root
    pub api_prefix: String,

    /// Origins allowed by CORS
    pub cors_origins: Vec<String>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            api_prefix: "/api".to_string(),
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}
