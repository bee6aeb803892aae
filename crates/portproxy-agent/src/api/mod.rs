//! HTTP surface of the agent
//!
//! Console-facing routes live under `/api/agent`; `/health` and the OpenAPI
//! document sit at the root.

pub mod error;
pub mod handlers;
pub mod models;

use axum::{
    routing::{get, post},
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use utoipa::OpenApi;

use crate::dispatcher::CommandDispatcher;
use crate::failover::FailoverController;
use crate::status::StatusReporter;

/// Application state shared across handlers
pub struct AppState {
    pub dispatcher: CommandDispatcher,
    pub failover: Arc<FailoverController>,
    pub status: StatusReporter,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "PortProxy Agent API",
        description = "Encrypted rule management and failover control for one host"
    ),
    paths(
        handlers::execute,
        handlers::status,
        handlers::ping,
        handlers::configure_failover,
        handlers::failover_status,
        handlers::manual_failover,
        handlers::health_check,
    ),
    components(
        schemas(
            portproxy_proto::Envelope,
            portproxy_proto::Rule,
            portproxy_proto::Protocol,
            portproxy_proto::Response,
            portproxy_proto::FailoverConfig,
            portproxy_proto::FailoverStatus,
            portproxy_proto::HealthStatus,
            portproxy_proto::AgentStatus,
            portproxy_proto::PingResponse,
            models::ErrorResponse,
            models::ValidationErrorResponse,
            models::MessageResponse,
            models::ManualFailoverResponse,
            models::HealthResponse,
        )
    ),
    tags(
        (name = "commands", description = "Encrypted rule management"),
        (name = "failover", description = "A/B failover configuration and control"),
        (name = "system", description = "Status and liveness endpoints")
    )
)]
pub struct ApiDoc;

/// Build the agent router
pub fn build_router(state: Arc<AppState>) -> Router {
    let agent_routes = Router::new()
        .route("/execute", post(handlers::execute))
        .route("/status", get(handlers::status))
        .route("/ping", get(handlers::ping))
        .route("/configure-failover", post(handlers::configure_failover))
        .route("/failover-status", get(handlers::failover_status))
        .route("/manual-failover", post(handlers::manual_failover));

    Router::new()
        .nest("/api/agent", agent_routes)
        .route("/health", get(handlers::health_check))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve the agent API until `shutdown` is cancelled
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let addr: Option<SocketAddr> = listener.local_addr().ok();
    if let Some(addr) = addr {
        info!("Agent API listening on {}", addr);
        info!("OpenAPI document: http://{}/api/openapi.json", addr);
    }

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
