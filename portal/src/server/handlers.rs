//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use openapi_server::models::{
    ContainerLogsQuery, ContainerLogsResponse, ContainersQuery, DeploymentBody, EnvBody,
    HealthResponse, LogsQuery, PreviewResponse, RootResponse, TargetCreateRequest,
    VersionResponse,
};

use crate::deploy::translator;
use crate::errors::PortalError;
use crate::models::deployment::{format_ports, DeploymentId, Workload};
use crate::models::target::{NewTarget, TargetId};
use crate::server::state::ServerState;
use crate::utils::{version_info, SERVICE_NAME};

type SharedState = State<Arc<ServerState>>;

// ================================== SERVICE ====================================== //

/// Root handler
pub async fn root_handler() -> impl IntoResponse {
    Json(RootResponse {
        message: format!("{} API", SERVICE_NAME),
        version: version_info().version,
    })
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deploy-portal".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================== TARGETS ====================================== //

pub async fn create_target_handler(
    State(state): SharedState,
    Json(body): Json<TargetCreateRequest>,
) -> Result<impl IntoResponse, PortalError> {
    let target = state
        .targets
        .create(NewTarget {
            name: body.name,
            address: body.address,
            ssh_key_path: body.ssh_key_path,
            ssh_user: body.ssh_user,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn list_targets_handler(State(state): SharedState) -> impl IntoResponse {
    Json(state.targets.list())
}

pub async fn get_target_handler(
    State(state): SharedState,
    Path(target_id): Path<TargetId>,
) -> Result<impl IntoResponse, PortalError> {
    Ok(Json(state.targets.require(target_id)?))
}

pub async fn get_target_env_handler(
    State(state): SharedState,
    Path(target_id): Path<TargetId>,
) -> Result<impl IntoResponse, PortalError> {
    let env = state.targets.get_env(target_id)?;
    Ok(Json(EnvBody { env }))
}

pub async fn update_target_env_handler(
    State(state): SharedState,
    Path(target_id): Path<TargetId>,
    Json(body): Json<EnvBody>,
) -> Result<impl IntoResponse, PortalError> {
    translator::validate_env(&body.env)?;
    let env = state.targets.update_env(target_id, body.env).await?;
    Ok(Json(EnvBody { env }))
}

// ================================ DEPLOYMENTS ==================================== //

pub async fn preview_handler(
    State(state): SharedState,
    Json(body): Json<DeploymentBody>,
) -> Result<impl IntoResponse, PortalError> {
    let request = translator::parse_request(&body)?;
    let preview = state.executor.preview(&request)?;

    let mut response = PreviewResponse {
        ok: true,
        target_id: request.target_id,
        image: None,
        container_name: None,
        ports: None,
        compose_file_path: None,
        summary: preview.summary,
        commands: preview.commands,
    };
    match request.workload {
        Workload::Container {
            image,
            container_name,
            ports,
        } => {
            response.image = Some(image);
            response.container_name = Some(container_name);
            response.ports = (!ports.is_empty()).then(|| format_ports(&ports));
        }
        Workload::Compose { compose_file_path } => {
            response.compose_file_path = Some(compose_file_path);
        }
    }
    Ok(Json(response))
}

pub async fn apply_handler(
    State(state): SharedState,
    Json(body): Json<DeploymentBody>,
) -> Result<impl IntoResponse, PortalError> {
    let request = translator::parse_request(&body)?;
    let deployment = state.executor.submit(request)?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

pub async fn list_deployments_handler(State(state): SharedState) -> impl IntoResponse {
    Json(state.deployments.list())
}

pub async fn get_deployment_handler(
    State(state): SharedState,
    Path(deployment_id): Path<DeploymentId>,
) -> Result<impl IntoResponse, PortalError> {
    state
        .deployments
        .get(deployment_id)
        .map(Json)
        .ok_or_else(|| PortalError::NotFound(format!("Deployment {} not found", deployment_id)))
}

pub async fn deployment_logs_handler(
    State(state): SharedState,
    Path(deployment_id): Path<DeploymentId>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, PortalError> {
    let events = state
        .deployments
        .logs(deployment_id, query.since.unwrap_or(0))?;
    Ok(Json(events))
}

// ================================= CONTAINERS ==================================== //

pub async fn list_containers_handler(
    State(state): SharedState,
    Path(target_id): Path<TargetId>,
    Query(query): Query<ContainersQuery>,
) -> Result<impl IntoResponse, PortalError> {
    let containers = state
        .introspector
        .list(target_id, query.all.unwrap_or(false))
        .await?;
    Ok(Json(containers))
}

pub async fn container_logs_handler(
    State(state): SharedState,
    Path((target_id, name)): Path<(TargetId, String)>,
    Query(query): Query<ContainerLogsQuery>,
) -> Result<impl IntoResponse, PortalError> {
    let (lines, logs) = state.introspector.logs(target_id, &name, query.lines).await?;
    Ok(Json(ContainerLogsResponse {
        container_name: name,
        lines,
        logs,
    }))
}

pub async fn get_container_env_handler(
    State(state): SharedState,
    Path((target_id, name)): Path<(TargetId, String)>,
) -> Result<impl IntoResponse, PortalError> {
    let env = state.introspector.get_env(target_id, &name).await?;
    Ok(Json(EnvBody { env }))
}

pub async fn update_container_env_handler(
    State(state): SharedState,
    Path((target_id, name)): Path<(TargetId, String)>,
    Json(body): Json<EnvBody>,
) -> Result<impl IntoResponse, PortalError> {
    let env = state
        .introspector
        .update_env(target_id, &name, body.env)
        .await?;
    Ok(Json(EnvBody { env }))
}

pub async fn remove_container_handler(
    State(state): SharedState,
    Path((target_id, name)): Path<(TargetId, String)>,
) -> Result<impl IntoResponse, PortalError> {
    state.introspector.remove(target_id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}
