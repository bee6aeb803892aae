//! Read-only agent status for the unauthenticated endpoints

use chrono::{DateTime, Utc};
use portproxy_proto::{AgentStatus, PingResponse, AGENT_VERSION};
use std::sync::Arc;
use tracing::error;

use crate::rule_store::RuleStore;

/// Identity reported by `/ping` and `/health`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    pub name: String,
    pub port: u16,
    pub max_rules: usize,
}

pub struct StatusReporter {
    identity: AgentIdentity,
    store: Arc<dyn RuleStore>,
    started_at: DateTime<Utc>,
}

impl StatusReporter {
    pub fn new(identity: AgentIdentity, store: Arc<dyn RuleStore>) -> Self {
        Self {
            identity,
            store,
            started_at: Utc::now(),
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    fn uptime_seconds(&self, now: DateTime<Utc>) -> u64 {
        (now - self.started_at).num_seconds().max(0) as u64
    }

    /// Online flag and live rule count; offline when the store cannot be read
    pub async fn status(&self) -> AgentStatus {
        let now = Utc::now();
        let (is_online, active_rules_count, status_message) = match self.store.list().await {
            Ok(snapshot) if snapshot.success => (true, snapshot.rules.len(), "Agent is running".to_string()),
            Ok(snapshot) => {
                error!("Error getting agent status: {}", snapshot.error_text());
                (false, 0, format!("Failed to list rules: {}", snapshot.error_text()))
            }
            Err(e) => {
                error!("Error getting agent status: {}", e);
                (false, 0, format!("Failed to list rules: {}", e))
            }
        };

        AgentStatus {
            is_online,
            start_time: self.started_at,
            uptime_seconds: self.uptime_seconds(now),
            active_rules_count,
            last_health_check: now,
            version: AGENT_VERSION.to_string(),
            status_message,
        }
    }

    pub fn ping(&self) -> PingResponse {
        PingResponse {
            message: "Pong".to_string(),
            timestamp: Utc::now(),
            version: AGENT_VERSION.to_string(),
            agent_name: self.identity.name.clone(),
            port: self.identity.port,
            max_rules: self.identity.max_rules,
        }
    }
}
