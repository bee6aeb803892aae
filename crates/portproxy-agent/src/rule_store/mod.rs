//! Port-forwarding rule store contract and backends
//!
//! The host tool is the source of truth for live rules: nothing here caches
//! them, every [`RuleStore::list`] re-reads and re-parses the tool output.

mod memory;
mod netsh;
pub mod parser;

pub use memory::MemoryRuleStore;
pub use netsh::NetshRuleStore;

use async_trait::async_trait;
use portproxy_proto::{Protocol, Rule};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// The host tool could not be run at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleStoreError {
    #[error("Failed to start {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("{tool} did not finish within {timeout:?}")]
    Timeout { tool: String, timeout: Duration },

    #[error("Rule store unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of one tool invocation.
///
/// `success == false` is a tool error: reported, not raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl ToolOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: error.into(),
        }
    }

    /// Best available description of a failure
    pub fn error_text(&self) -> &str {
        if !self.error.trim().is_empty() {
            self.error.trim()
        } else if !self.output.trim().is_empty() {
            self.output.trim()
        } else {
            "unknown error"
        }
    }
}

/// Result of listing the live rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSnapshot {
    pub success: bool,
    pub rules: Vec<Rule>,
    pub output: String,
    pub error: String,
}

impl RuleSnapshot {
    pub fn from_output(tool: ToolOutput) -> Self {
        let rules = if tool.success {
            parser::parse_show_all(&tool.output)
        } else {
            Vec::new()
        };
        Self {
            success: tool.success,
            rules,
            output: tool.output,
            error: tool.error,
        }
    }

    pub fn error_text(&self) -> &str {
        if self.error.trim().is_empty() {
            "unknown error"
        } else {
            self.error.trim()
        }
    }
}

/// Operations on the host's port-forwarding table
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Add a rule
    async fn add(&self, rule: &Rule) -> Result<ToolOutput, RuleStoreError>;

    /// Delete the rule listening on `(listen_address, listen_port)`
    async fn delete(
        &self,
        listen_address: &str,
        listen_port: u16,
        protocol: Protocol,
    ) -> Result<ToolOutput, RuleStoreError>;

    /// Read and parse every live rule
    async fn list(&self) -> Result<RuleSnapshot, RuleStoreError>;

    /// Remove every rule
    async fn reset(&self) -> Result<ToolOutput, RuleStoreError>;
}

/// Which rule store backend the agent runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStoreKind {
    #[default]
    Netsh,
    Memory,
}

impl FromStr for RuleStoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "netsh" => Ok(RuleStoreKind::Netsh),
            "memory" => Ok(RuleStoreKind::Memory),
            other => Err(format!(
                "Unknown rule store '{}' (expected netsh or memory)",
                other
            )),
        }
    }
}
