//! In-process rule store

use async_trait::async_trait;
use portproxy_proto::{Protocol, Rule};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::{parser, RuleSnapshot, RuleStore, RuleStoreError, ToolOutput};

#[derive(Debug, Default)]
struct MemoryInner {
    rules: Vec<Rule>,
    rejected_connect_addresses: HashSet<String>,
    unavailable: bool,
}

/// In-process rule store for development hosts and tests.
///
/// Behaves like the host tool: listing renders the rules as `show all` text
/// and parses them back, duplicates and unknown rules are tool errors.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rules(rules: impl IntoIterator<Item = Rule>) -> Self {
        let store = Self::new();
        store.lock().rules.extend(rules);
        store
    }

    /// Make every add targeting `connect_address` fail with a tool error
    pub fn reject_connect_address(&self, connect_address: impl Into<String>) {
        self.lock()
            .rejected_connect_addresses
            .insert(connect_address.into());
    }

    pub fn clear_rejections(&self) {
        self.lock().rejected_connect_addresses.clear();
    }

    /// Make every operation fail as if the tool could not be started
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Current rules, without going through the text round trip
    pub fn rules(&self) -> Vec<Rule> {
        self.lock().rules.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned store only means a test panicked mid-operation
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(inner: &MemoryInner) -> Result<(), RuleStoreError> {
        if inner.unavailable {
            Err(RuleStoreError::Unavailable("memory store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn add(&self, rule: &Rule) -> Result<ToolOutput, RuleStoreError> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;

        if inner.rejected_connect_addresses.contains(&rule.connect_address) {
            warn!(rule = %rule, "Memory store rejecting add");
            return Ok(ToolOutput::failed(
                "",
                format!("The requested address {} is not valid.", rule.connect_address),
            ));
        }
        if inner.rules.iter().any(|r| r.same_listener(rule)) {
            return Ok(ToolOutput::failed("", "The object already exists."));
        }

        debug!(rule = %rule, "Memory store add");
        inner.rules.push(rule.clone());
        Ok(ToolOutput::ok("\n"))
    }

    async fn delete(
        &self,
        listen_address: &str,
        listen_port: u16,
        protocol: Protocol,
    ) -> Result<ToolOutput, RuleStoreError> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;

        let before = inner.rules.len();
        inner.rules.retain(|r| {
            !(r.listen_address == listen_address
                && r.listen_port == listen_port
                && r.protocol == protocol)
        });

        if inner.rules.len() == before {
            Ok(ToolOutput::failed("", "The system cannot find the file specified."))
        } else {
            debug!(listen_address, listen_port, "Memory store delete");
            Ok(ToolOutput::ok("\n"))
        }
    }

    async fn list(&self) -> Result<RuleSnapshot, RuleStoreError> {
        let text = {
            let inner = self.lock();
            Self::check_available(&inner)?;
            parser::render_show_all(&inner.rules)
        };
        Ok(RuleSnapshot::from_output(ToolOutput::ok(text)))
    }

    async fn reset(&self) -> Result<ToolOutput, RuleStoreError> {
        let mut inner = self.lock();
        Self::check_available(&inner)?;
        inner.rules.clear();
        Ok(ToolOutput::ok("\n"))
    }
}
