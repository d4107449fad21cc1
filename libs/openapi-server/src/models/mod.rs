//! Deploy portal API models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Root response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
    pub message: String,
    pub version: String,
}

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body, shaped like `{"detail": "..."}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Body of `POST /targets`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetCreateRequest {
    pub name: String,
    pub address: String,
    pub ssh_key_path: String,
    pub ssh_user: String,
}

/// Environment variable map, used by both target and container env routes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvBody {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Body of `POST /deployments/preview` and `POST /deployments/apply`.
///
/// Exactly one of the container fields (`image`, `container_name`, `ports`)
/// or `compose_file_path` must be provided.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentBody {
    pub target_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file_path: Option<String>,
}

/// Response of `POST /deployments/preview`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewResponse {
    pub ok: bool,
    pub target_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_file_path: Option<String>,
    pub summary: String,
    pub commands: Vec<String>,
}

/// Query of `GET /deployments/{id}/logs`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogsQuery {
    /// Only return events whose sequence number is at least this value
    #[serde(default)]
    pub since: Option<u64>,
}

/// Query of `GET /targets/{id}/containers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainersQuery {
    #[serde(default)]
    pub all: Option<bool>,
}

/// Query of `GET /targets/{id}/containers/{name}/logs`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerLogsQuery {
    #[serde(default)]
    pub lines: Option<u32>,
}

/// Response of `GET /targets/{id}/containers/{name}/logs`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLogsResponse {
    pub container_name: String,
    pub lines: u32,
    pub logs: String,
}
