//! Target models

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Target identifier, assigned sequentially from 1
pub type TargetId = u64;

/// Environment variable map (sorted for stable output)
pub type EnvVars = BTreeMap<String, String>;

/// A registered remote VM reachable over SSH
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,

    pub name: String,

    /// `host` or `host:port`
    pub address: String,

    pub ssh_user: String,

    /// Path of the private key on the portal host
    pub ssh_key_path: String,

    pub created_at: DateTime<Utc>,

    /// VM-level environment variables
    #[serde(default)]
    pub env: EnvVars,
}

impl Target {
    /// Split `address` into host and port, falling back to `default_port`.
    ///
    /// Accepts `host`, `host:port`, `[v6]:port` and bare IPv6 addresses.
    pub fn host_and_port(&self, default_port: u16) -> (String, u16) {
        let address = self.address.trim();

        if let Some(rest) = address.strip_prefix('[') {
            if let Some((host, tail)) = rest.split_once(']') {
                let port = tail
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(default_port);
                return (host.to_string(), port);
            }
        }

        match address.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => match port.parse() {
                Ok(port) => (host.to_string(), port),
                Err(_) => (address.to_string(), default_port),
            },
            _ => (address.to_string(), default_port),
        }
    }

    /// `user@address`, used in log lines
    pub fn ssh_destination(&self) -> String {
        format!("{}@{}", self.ssh_user, self.address)
    }
}

/// Fields required to register a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTarget {
    pub name: String,
    pub address: String,
    pub ssh_key_path: String,
    pub ssh_user: String,
}
