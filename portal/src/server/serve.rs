//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::options::ServerOptions;
use crate::errors::PortalError;
use crate::server::handlers::{
    apply_handler, container_logs_handler, create_target_handler, deployment_logs_handler,
    get_container_env_handler, get_deployment_handler, get_target_env_handler,
    get_target_handler, health_handler, list_containers_handler, list_deployments_handler,
    list_targets_handler, preview_handler, remove_container_handler, root_handler,
    update_container_env_handler, update_target_env_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the API router, nested under `options.api_prefix`
pub fn router(options: &ServerOptions, state: Arc<ServerState>) -> Router {
    let api = Router::new()
        // Service
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Targets
        .route("/targets", get(list_targets_handler).post(create_target_handler))
        .route("/targets/{target_id}", get(get_target_handler))
        .route(
            "/targets/{target_id}/env",
            get(get_target_env_handler).put(update_target_env_handler),
        )
        // Deployments
        .route("/deployments", get(list_deployments_handler))
        .route("/deployments/preview", post(preview_handler))
        .route("/deployments/apply", post(apply_handler))
        .route("/deployments/{deployment_id}", get(get_deployment_handler))
        .route("/deployments/{deployment_id}/logs", get(deployment_logs_handler))
        // Containers
        .route("/targets/{target_id}/containers", get(list_containers_handler))
        .route(
            "/targets/{target_id}/containers/{name}",
            axum::routing::delete(remove_container_handler),
        )
        .route(
            "/targets/{target_id}/containers/{name}/logs",
            get(container_logs_handler),
        )
        .route(
            "/targets/{target_id}/containers/{name}/env",
            get(get_container_env_handler).put(update_container_env_handler),
        )
        .with_state(state);

    let app = match options.api_prefix.trim_end_matches('/') {
        "" => api,
        prefix => Router::new().nest(prefix, api),
    };

    app.layer(cors_layer(&options.cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// CORS for the configured origins. A `*` entry allows any origin without
/// credentials.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request());

    if origins.iter().any(|origin| origin.trim() == "*") {
        warn!("CORS allows any origin, credentials are disabled");
        return layer.allow_origin(AllowOrigin::any());
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    layer.allow_origin(origins).allow_credentials(true)
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), PortalError>>, PortalError> {
    let app = router(options, state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}{}", addr, options.api_prefix);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| PortalError::ServerError(format!("failed to bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| PortalError::ServerError(e.to_string()))
    });

    Ok(handle)
}
