//! Request handlers for the agent API

use axum::{extract::State, Json};
use chrono::Utc;
use portproxy_proto::{AgentStatus, Envelope, FailoverConfig, FailoverStatus, PingResponse};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::error::ApiError;
use super::models::*;
use super::AppState;

/// Execute an encrypted command
#[utoipa::path(
    post,
    path = "/api/agent/execute",
    request_body = Envelope,
    responses(
        (status = 200, description = "Encrypted response", body = Envelope),
        (status = 401, description = "Message authentication failed", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "commands"
)]
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<Envelope>, ApiError> {
    debug!("Received encrypted command");

    match state.dispatcher.handle(&envelope).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            warn!("Command rejected: {}", e);
            Err(e.into())
        }
    }
}

/// Agent status
#[utoipa::path(
    get,
    path = "/api/agent/status",
    responses(
        (status = 200, description = "Agent status", body = AgentStatus)
    ),
    tag = "system"
)]
pub async fn status(State(state): State<Arc<AppState>>) -> Json<AgentStatus> {
    Json(state.status.status().await)
}

/// Connectivity check
#[utoipa::path(
    get,
    path = "/api/agent/ping",
    responses(
        (status = 200, description = "Pong", body = PingResponse)
    ),
    tag = "system"
)]
pub async fn ping(State(state): State<Arc<AppState>>) -> Json<PingResponse> {
    Json(state.status.ping())
}

/// Configure failover for this agent
#[utoipa::path(
    post,
    path = "/api/agent/configure-failover",
    request_body = FailoverConfig,
    responses(
        (status = 200, description = "Configuration applied", body = MessageResponse),
        (status = 400, description = "Invalid configuration", body = ValidationErrorResponse),
        (status = 500, description = "Configuration could not be applied", body = ErrorResponse)
    ),
    tag = "failover"
)]
pub async fn configure_failover(
    State(state): State<Arc<AppState>>,
    Json(config): Json<FailoverConfig>,
) -> Result<Json<MessageResponse>, ApiError> {
    info!(
        enabled = config.enabled,
        mappings = config.server_mappings.len(),
        "Received failover configuration"
    );

    state.failover.configure(config).await?;

    Ok(Json(MessageResponse {
        message: "Failover configuration applied successfully".to_string(),
    }))
}

/// Current failover status
#[utoipa::path(
    get,
    path = "/api/agent/failover-status",
    responses(
        (status = 200, description = "Failover status", body = FailoverStatus)
    ),
    tag = "failover"
)]
pub async fn failover_status(State(state): State<Arc<AppState>>) -> Json<FailoverStatus> {
    Json(state.failover.status().await)
}

/// Switch rules to B (`true`) or back to A (`false`), ignoring health
#[utoipa::path(
    post,
    path = "/api/agent/manual-failover",
    request_body(content = bool, description = "True to fail over to B servers"),
    responses(
        (status = 200, description = "Failover executed", body = ManualFailoverResponse),
        (status = 500, description = "Failover failed", body = ErrorResponse)
    ),
    tag = "failover"
)]
pub async fn manual_failover(
    State(state): State<Arc<AppState>>,
    Json(fail_to_b): Json<bool>,
) -> Result<Json<ManualFailoverResponse>, ApiError> {
    info!(fail_to_b, "Manual failover requested");

    match state.failover.manual_failover(fail_to_b).await {
        Ok(report) => Ok(Json(ManualFailoverResponse::from_report(&report))),
        Err(e) => {
            error!("Manual failover failed: {}", e);
            Err(e.into())
        }
    }
}

/// Health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Agent is running", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let identity = state.status.identity();
    Json(HealthResponse {
        status: "PortProxy Agent is running".to_string(),
        name: identity.name.clone(),
        port: identity.port,
        timestamp: Utc::now(),
    })
}
