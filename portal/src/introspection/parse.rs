//! Parsers for `docker ps` and `docker inspect` output

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use crate::errors::PortalError;
use crate::models::container::Container;
use crate::models::deployment::{PortMapping, Protocol};
use crate::models::target::EnvVars;

/// Go template passed to `docker ps --format`; one tab-separated row per container
pub const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.Ports}}";

/// Parse `docker ps` rows. Malformed rows are skipped.
pub fn parse_ps(stdout: &str) -> Vec<Container> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields: Vec<&str> = line.splitn(5, '\t').collect();
            match fields.as_slice() {
                [id, name, image, status, rest @ ..] if !id.is_empty() && !name.is_empty() => {
                    Some(Container {
                        id: id.trim().to_string(),
                        name: name.trim().to_string(),
                        image: image.trim().to_string(),
                        status: status.trim().to_string(),
                        ports: rest.first().map(|p| p.trim().to_string()).unwrap_or_default(),
                    })
                }
                _ => {
                    debug!("Skipping malformed container row: {:?}", line);
                    None
                }
            }
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    name: String,
    config: InspectConfig,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    port_bindings: Option<HashMap<String, Option<Vec<InspectBinding>>>>,
    #[serde(default)]
    restart_policy: Option<InspectRestartPolicy>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectBinding {
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    #[serde(default)]
    name: String,
}

/// What the portal needs from `docker inspect` to recreate a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectedContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub env: EnvVars,
    pub ports: Vec<PortMapping>,
    /// `None` for the engine default (`no`)
    pub restart_policy: Option<String>,
}

/// Parse `docker inspect --type container` output for a single container
pub fn parse_inspect(stdout: &str) -> Result<Option<InspectedContainer>, PortalError> {
    let records: Vec<InspectRecord> = serde_json::from_str(stdout.trim())?;
    let Some(record) = records.into_iter().next() else {
        return Ok(None);
    };

    let host_config = record.host_config.unwrap_or_default();
    let restart_policy = host_config
        .restart_policy
        .map(|p| p.name)
        .filter(|name| !name.is_empty() && name != "no");

    Ok(Some(InspectedContainer {
        id: record.id,
        name: record.name.trim_start_matches('/').to_string(),
        image: record.config.image,
        env: parse_env(record.config.env.as_deref().unwrap_or_default()),
        ports: parse_port_bindings(host_config.port_bindings.unwrap_or_default()),
        restart_policy,
    }))
}

/// `KEY=VALUE` entries to a map; entries without `=` map to an empty value
pub fn parse_env(entries: &[String]) -> EnvVars {
    entries
        .iter()
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (entry.to_string(), String::new()),
        })
        .collect()
}

fn parse_port_bindings(bindings: HashMap<String, Option<Vec<InspectBinding>>>) -> Vec<PortMapping> {
    let mut ports = Vec::new();
    for (key, hosts) in bindings {
        let (container, protocol) = match key.split_once('/') {
            Some((port, "udp")) => (port, Protocol::Udp),
            Some((port, _)) => (port, Protocol::Tcp),
            None => (key.as_str(), Protocol::Tcp),
        };
        let Ok(container_port) = container.parse::<u16>() else {
            debug!("Skipping unparseable port binding {}", key);
            continue;
        };
        // Bindings without a host port were published to a random port
        for host in hosts.unwrap_or_default() {
            if let Ok(host_port) = host.host_port.parse::<u16>() {
                ports.push(PortMapping {
                    host_port,
                    container_port,
                    protocol,
                });
            }
        }
    }
    ports.sort_by_key(|p| (p.host_port, p.container_port));
    ports.dedup();
    ports
}

/// Whether engine output reports a missing container
pub fn is_not_found(output: &str) -> bool {
    output.contains("No such container") || output.contains("No such object")
}
