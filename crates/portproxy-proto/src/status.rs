//! Unauthenticated operational status documents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent health reported by `GET /status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    /// False when the rule store could not be queried
    pub is_online: bool,
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub active_rules_count: usize,
    pub last_health_check: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub status_message: String,
}

/// Fixed liveness payload returned by `GET /ping`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub agent_name: String,
    pub port: u16,
    pub max_rules: usize,
}
