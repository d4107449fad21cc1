//! Deployment models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentStatus;
use crate::models::target::TargetId;

/// Deployment identifier, assigned sequentially from 1
pub type DeploymentId = u64;

/// Transport protocol of a port binding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// A `host:container[/proto]` port binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortMapping {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_port,
            container_port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host_port, self.container_port)?;
        if self.protocol == Protocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

impl FromStr for PortMapping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some((_, other)) => return Err(format!("unsupported protocol '{}' in '{}'", other, s)),
            None => (s, Protocol::Tcp),
        };

        let (host, container) = ports
            .split_once(':')
            .ok_or_else(|| format!("expected host:container, got '{}'", s))?;

        let parse_port = |value: &str| -> Result<u16, String> {
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format!("'{}' is not a port number", value));
            }
            match value.parse::<u16>() {
                Ok(0) | Err(_) => Err(format!("port {} is out of range 1-65535", value)),
                Ok(port) => Ok(port),
            }
        };

        Ok(Self {
            host_port: parse_port(host)?,
            container_port: parse_port(container)?,
            protocol,
        })
    }
}

impl TryFrom<String> for PortMapping {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortMapping> for String {
    fn from(value: PortMapping) -> Self {
        value.to_string()
    }
}

/// Render a list of port mappings the way clients send them (`8080:80,8443:443`)
pub fn format_ports(ports: &[PortMapping]) -> String {
    ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// What a deployment runs on the target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workload {
    /// A single container, replaced if one with the same name exists
    Container {
        image: String,
        container_name: String,
        #[serde(default)]
        ports: Vec<PortMapping>,
    },

    /// A Compose stack whose manifest already lives on the remote host
    Compose { compose_file_path: String },
}

/// A validated deployment request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub target_id: TargetId,
    pub workload: Workload,
}

/// Severity of a deployment log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// One captured line of deployment progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Position in the deployment's log; authoritative ordering
    pub seq: u64,

    /// Best-effort wall clock at emission
    pub timestamp: DateTime<Utc>,

    pub level: EventLevel,

    pub message: String,
}

/// A deployment tracked through its lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: DeploymentId,

    pub target_id: TargetId,

    #[serde(flatten)]
    pub workload: Workload,

    pub status: DeploymentStatus,

    /// Human-readable status detail; error text once failed
    pub message: String,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
