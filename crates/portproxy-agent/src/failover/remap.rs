//! Retargeting live rules between A and B servers
//!
//! The host tool cannot change a rule in place, so each rule is moved with a
//! delete followed by an add. A failed add is compensated by re-adding the
//! original rule once.

use portproxy_proto::{Rule, ServerMappings, ServerSide};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::rule_store::{RuleStore, RuleStoreError};

/// Counts produced by one remap pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemapReport {
    /// Rules examined
    pub processed: usize,
    /// Rules whose connect address had to change
    pub attempted: usize,
    /// Rules moved to the target side
    pub changed: usize,
    /// Rules put back on their original target after a failed add
    pub restored: usize,
    /// Rules deleted and neither moved nor restored
    pub lost: usize,
    /// Rules left untouched because the delete was refused
    pub skipped: usize,
}

impl RemapReport {
    /// Nothing needed to move, or at least one rule moved
    pub fn is_success(&self) -> bool {
        self.attempted == 0 || self.changed > 0
    }
}

/// A pass that could not run to completion
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemapError {
    #[error("Failed to get current rules for failover: {0}")]
    List(String),

    #[error("Rule store failed while switching {rule}: {source}")]
    Store {
        rule: String,
        #[source]
        source: RuleStoreError,
        report: RemapReport,
    },
}

impl RemapError {
    /// Counts gathered before the pass stopped
    pub fn report(&self) -> Option<&RemapReport> {
        match self {
            RemapError::List(_) => None,
            RemapError::Store { report, .. } => Some(report),
        }
    }

    /// Whether any rule reached the target side before the pass stopped
    pub fn moved_any(&self) -> bool {
        self.report().is_some_and(|report| report.changed > 0)
    }
}

/// Move every mapped rule to `target`.
///
/// Tool errors are counted and the pass continues; a rule store error aborts
/// the remaining rules.
pub async fn remap_rules(
    store: &dyn RuleStore,
    mappings: &ServerMappings,
    target: ServerSide,
) -> Result<RemapReport, RemapError> {
    let snapshot = store.list().await.map_err(|e| RemapError::List(e.to_string()))?;
    if !snapshot.success {
        return Err(RemapError::List(snapshot.error_text().to_string()));
    }

    let mut report = RemapReport::default();

    for rule in &snapshot.rules {
        report.processed += 1;

        let new_target = mappings.resolve(&rule.connect_address, target);
        if new_target == rule.connect_address {
            continue;
        }

        report.attempted += 1;
        let moved = rule.retargeted(new_target);
        debug!(
            listen = %format!("{}:{}", rule.listen_address, rule.listen_port),
            from = %rule.connect_address,
            to = %moved.connect_address,
            "Switching rule target"
        );

        if let Err(source) = switch_rule(store, rule, &moved, &mut report).await {
            return Err(RemapError::Store {
                rule: rule.to_string(),
                source,
                report,
            });
        }
    }

    info!(
        target = %target,
        processed = report.processed,
        changed = report.changed,
        restored = report.restored,
        lost = report.lost,
        "Rule remap completed"
    );
    Ok(report)
}

async fn switch_rule(
    store: &dyn RuleStore,
    original: &Rule,
    moved: &Rule,
    report: &mut RemapReport,
) -> Result<(), RuleStoreError> {
    let deleted = store
        .delete(&original.listen_address, original.listen_port, original.protocol)
        .await?;
    if !deleted.success {
        warn!(rule = %original, error = %deleted.error_text(), "Failed to delete rule for target update");
        report.skipped += 1;
        return Ok(());
    }

    let added = match store.add(moved).await {
        Ok(added) => added,
        Err(e) => {
            restore(store, original, report).await;
            return Err(e);
        }
    };

    if added.success {
        report.changed += 1;
        debug!(rule = %moved, "Switched rule");
    } else {
        warn!(rule = %moved, error = %added.error_text(), "Failed to add rule with new target");
        restore(store, original, report).await;
    }
    Ok(())
}

async fn restore(store: &dyn RuleStore, original: &Rule, report: &mut RemapReport) {
    match store.add(original).await {
        Ok(out) if out.success => {
            info!(rule = %original, "Restored original rule");
            report.restored += 1;
        }
        Ok(out) => {
            error!(rule = %original, error = %out.error_text(), "Failed to restore original rule; rule is missing");
            report.lost += 1;
        }
        Err(e) => {
            error!(rule = %original, error = %e, "Failed to restore original rule; rule is missing");
            report.lost += 1;
        }
    }
}
