//! Response bodies of the agent API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::failover::RemapReport;

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Rejected failover configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ValidationErrorResponse {
    /// Every validation failure found
    pub errors: Vec<String>,
}

/// Plain acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

/// Outcome of a manual failover
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManualFailoverResponse {
    pub message: String,
    pub rules_processed: usize,
    pub rules_changed: usize,
    pub rules_restored: usize,
    pub rules_lost: usize,
}

impl ManualFailoverResponse {
    pub fn from_report(report: &RemapReport) -> Self {
        Self {
            message: "Manual failover executed successfully".to_string(),
            rules_processed: report.processed,
            rules_changed: report.changed,
            rules_restored: report.restored,
            rules_lost: report.lost,
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Agent name
    pub name: String,
    /// Listening port
    pub port: u16,
    pub timestamp: DateTime<Utc>,
}
