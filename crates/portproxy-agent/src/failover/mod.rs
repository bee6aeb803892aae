//! Health-driven failover between A and B servers
//!
//! The controller owns the failover configuration, probes both health
//! endpoints on a timer and retargets live rules when the active side dies.
//! `currently_failed_over` only changes after a successful remap.

mod decision;
mod persistence;
mod probe;
mod remap;
mod scheduler;

pub use decision::{decide, FailoverDecision};
pub use persistence::{ConfigStore, PersistenceError, DEFAULT_STATE_FILE};
pub use probe::{HealthProbe, HttpHealthProbe, ProbeError};
pub use remap::{remap_rules, RemapError, RemapReport};
pub use scheduler::MonitorTask;

use chrono::Utc;
use portproxy_proto::{FailoverConfig, FailoverStatus, HealthStatus, ServerMappings, ServerSide};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::rule_store::RuleStore;

#[derive(Error, Debug)]
pub enum FailoverError {
    #[error("Invalid failover configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Failover is not enabled")]
    Disabled,

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Remap(#[from] RemapError),

    #[error("Failover to {target} servers failed: none of {} rules could be switched", .report.attempted)]
    NothingSwitched {
        target: ServerSide,
        report: RemapReport,
    },
}

struct FailoverState {
    config: FailoverConfig,
    mappings: ServerMappings,
}

struct FailoverCore {
    store: Arc<dyn RuleStore>,
    probe: Arc<dyn HealthProbe>,
    config_store: ConfigStore,
    state: Mutex<FailoverState>,
    /// Serializes remap transactions and configuration changes
    remap_lock: tokio::sync::Mutex<()>,
    /// Serializes writes of the state file
    persist_lock: tokio::sync::Mutex<()>,
}

impl FailoverCore {
    fn lock_state(&self) -> MutexGuard<'_, FailoverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> FailoverConfig {
        self.lock_state().config.clone()
    }

    async fn persist(&self) -> Result<(), PersistenceError> {
        let _guard = self.persist_lock.lock().await;
        let config = self.snapshot();
        self.config_store.save(&config).await
    }

    /// Replace the operator settings. Which side is active carries over;
    /// health observations start fresh.
    async fn apply(&self, config: FailoverConfig, mappings: ServerMappings) -> Result<(), FailoverError> {
        let next = {
            let state = self.lock_state();
            FailoverConfig {
                health_url_a: config.health_url_a.trim().to_string(),
                health_url_b: config.health_url_b.trim().to_string(),
                server_mappings: mappings.to_map(),
                currently_failed_over: state.config.currently_failed_over,
                last_failover_time: state.config.last_failover_time,
                last_health_check: None,
                last_health_a: None,
                last_health_b: None,
                consecutive_failures_a: 0,
                consecutive_failures_b: 0,
                last_error: None,
                ..config
            }
        };

        let _guard = self.persist_lock.lock().await;
        self.config_store.save(&next).await?;

        let mut state = self.lock_state();
        state.config = next;
        state.mappings = mappings;
        Ok(())
    }

    async fn probe_cycle(&self) {
        let config = self.snapshot();
        if !config.enabled {
            return;
        }

        debug!("Performing health check...");
        let timeout = config.timeout();
        let (a, b) = tokio::join!(
            self.probe.check(&config.health_url_a, timeout),
            self.probe.check(&config.health_url_b, timeout),
        );
        let (health_a, error_a) = classify(a);
        let (health_b, error_b) = classify(b);
        debug!(%health_a, %health_b, "Health check results");

        let currently_failed_over = {
            let mut state = self.lock_state();
            let config = &mut state.config;
            config.last_health_check = Some(Utc::now());
            config.last_health_a = Some(health_a);
            config.last_health_b = Some(health_b);
            config.consecutive_failures_a = next_failure_count(config.consecutive_failures_a, health_a);
            config.consecutive_failures_b = next_failure_count(config.consecutive_failures_b, health_b);
            let errors: Vec<String> = [error_a, error_b].into_iter().flatten().collect();
            config.last_error = if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            };
            config.currently_failed_over
        };

        if let Err(e) = self.persist().await {
            warn!("Failed to save failover configuration: {}", e);
        }

        if let FailoverDecision::Switch { target, reason } =
            decide(health_a, health_b, currently_failed_over)
        {
            info!(%target, reason, "Triggering automatic failover");
            if let Err(e) = self.remap(target, reason).await {
                error!("Automatic failover failed: {}", e);
            }
        }
    }

    async fn remap(&self, target: ServerSide, reason: &str) -> Result<RemapReport, FailoverError> {
        let _guard = self.remap_lock.lock().await;

        let mappings = {
            let state = self.lock_state();
            if !state.config.enabled {
                return Err(FailoverError::Disabled);
            }
            state.mappings.clone()
        };

        info!(%target, reason, "Executing failover");
        let result = remap_rules(self.store.as_ref(), &mappings, target).await;

        let outcome = {
            let mut state = self.lock_state();
            let config = &mut state.config;
            match result {
                Ok(report) if report.is_success() => {
                    config.currently_failed_over = target.is_b();
                    config.last_failover_time = Some(Utc::now());
                    config.last_error = (report.lost > 0).then(|| {
                        format!("{} rules could not be restored after a failed switch", report.lost)
                    });
                    Ok(report)
                }
                Ok(report) => {
                    let err = FailoverError::NothingSwitched { target, report };
                    config.last_error = Some(err.to_string());
                    Err(err)
                }
                Err(e) => {
                    // Rules already moved before the abort follow the target side
                    if e.moved_any() {
                        warn!(%target, "Failover pass aborted after moving some rules");
                        config.currently_failed_over = target.is_b();
                        config.last_failover_time = Some(Utc::now());
                    }
                    config.last_error = Some(e.to_string());
                    Err(FailoverError::Remap(e))
                }
            }
        };

        if let Err(e) = self.persist().await {
            error!("Failed to save failover configuration: {}", e);
        }
        outcome
    }
}

fn classify(result: Result<HealthStatus, ProbeError>) -> (HealthStatus, Option<String>) {
    match result {
        Ok(health) => (health, None),
        Err(e) => {
            debug!("Health check failed: {}", e);
            (HealthStatus::Dead, Some(e.to_string()))
        }
    }
}

fn next_failure_count(current: u32, health: HealthStatus) -> u32 {
    if health.is_alive() {
        0
    } else {
        current.saturating_add(1)
    }
}

fn spawn_monitor(core: &Arc<FailoverCore>) -> Option<MonitorTask> {
    let config = core.snapshot();
    if !config.enabled {
        info!("Failover monitoring is disabled");
        return None;
    }

    info!(
        "Starting failover health monitoring with {} second interval",
        config.check_interval().as_secs()
    );
    let core = core.clone();
    Some(MonitorTask::spawn(config.check_interval(), move || {
        let core = core.clone();
        async move { core.probe_cycle().await }
    }))
}

/// Owns failover state and the background health monitor
pub struct FailoverController {
    core: Arc<FailoverCore>,
    monitor: tokio::sync::Mutex<Option<MonitorTask>>,
}

impl FailoverController {
    pub fn new(
        store: Arc<dyn RuleStore>,
        probe: Arc<dyn HealthProbe>,
        config_store: ConfigStore,
    ) -> Self {
        Self {
            core: Arc::new(FailoverCore {
                store,
                probe,
                config_store,
                state: Mutex::new(FailoverState {
                    config: FailoverConfig::default(),
                    mappings: ServerMappings::default(),
                }),
                remap_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
            monitor: tokio::sync::Mutex::new(None),
        }
    }

    /// Reload the saved configuration, runtime state included, and start
    /// monitoring if it is enabled. Returns whether a saved file was found.
    pub async fn restore(&self) -> Result<bool, FailoverError> {
        let Some(config) = self.core.config_store.load().await? else {
            info!(path = %self.core.config_store.path().display(), "No saved failover configuration");
            return Ok(false);
        };

        let mappings = config.validate().map_err(FailoverError::Validation)?;
        info!(
            enabled = config.enabled,
            mappings = mappings.len(),
            currently_failed_over = config.currently_failed_over,
            "Loaded failover configuration"
        );
        {
            let mut state = self.core.lock_state();
            state.config = config;
            state.mappings = mappings;
        }

        self.start_monitoring().await;
        Ok(true)
    }

    /// Validate, persist and apply a new configuration, then restart the
    /// monitor. Nothing changes when validation or persistence fails.
    pub async fn configure(&self, config: FailoverConfig) -> Result<(), FailoverError> {
        let mappings = config.validate().map_err(|errors| {
            warn!("Invalid failover configuration: {}", errors.join(", "));
            FailoverError::Validation(errors)
        })?;
        info!("Configuring failover with {} server mappings", mappings.len());

        let mut monitor = self.monitor.lock().await;
        let was_running = match monitor.take() {
            Some(task) => {
                task.stop().await;
                true
            }
            None => false,
        };

        let applied = {
            let _guard = self.core.remap_lock.lock().await;
            self.core.apply(config, mappings).await
        };

        if let Err(e) = applied {
            error!("Error configuring failover: {}", e);
            if was_running {
                *monitor = spawn_monitor(&self.core);
            }
            return Err(e);
        }

        *monitor = spawn_monitor(&self.core);
        info!("Failover configuration applied successfully");
        Ok(())
    }

    /// Retarget rules regardless of health. Requires failover to be enabled.
    pub async fn manual_failover(&self, fail_to_b: bool) -> Result<RemapReport, FailoverError> {
        let target = ServerSide::from_fail_to_b(fail_to_b);
        info!(%target, "Executing manual failover");
        self.core.remap(target, "manual failover").await.map_err(|e| {
            if matches!(e, FailoverError::Disabled) {
                warn!("Failover not enabled, cannot execute manual failover");
            }
            e
        })
    }

    /// Run one probe cycle now
    pub async fn run_probe_cycle(&self) {
        self.core.probe_cycle().await;
    }

    pub async fn status(&self) -> FailoverStatus {
        let config = self.core.snapshot();
        let rules_managed = match self.core.store.list().await {
            Ok(snapshot) if snapshot.success => snapshot.rules.len(),
            Ok(snapshot) => {
                debug!("Rule count unavailable: {}", snapshot.error_text());
                0
            }
            Err(e) => {
                debug!("Rule count unavailable: {}", e);
                0
            }
        };

        FailoverStatus {
            enabled: config.enabled,
            currently_failed_over: config.currently_failed_over,
            last_health_check: config.last_health_check,
            health_status_a: config.last_health_a,
            health_status_b: config.last_health_b,
            rules_managed,
            last_failover_time: config.last_failover_time,
            last_error: config.last_error,
            check_interval_seconds: config.check_interval_seconds,
            consecutive_failures_a: config.consecutive_failures_a,
            consecutive_failures_b: config.consecutive_failures_b,
        }
    }

    /// Current configuration and runtime state
    pub fn config(&self) -> FailoverConfig {
        self.core.snapshot()
    }

    /// Start the monitor if enabled and not already running
    pub async fn start_monitoring(&self) {
        let mut monitor = self.monitor.lock().await;
        if monitor.as_ref().is_some_and(MonitorTask::is_running) {
            info!("Health check timer already running");
            return;
        }
        *monitor = spawn_monitor(&self.core);
    }

    /// Stop the monitor, waiting for an in-flight cycle to finish
    pub async fn stop_monitoring(&self) {
        if let Some(task) = self.monitor.lock().await.take() {
            info!("Stopping failover monitoring");
            task.stop().await;
            info!("Failover monitoring stopped");
        }
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor
            .lock()
            .await
            .as_ref()
            .is_some_and(MonitorTask::is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule_store::{MemoryRuleStore, MockRuleStore};
    use async_trait::async_trait;
    use portproxy_proto::{Protocol, Rule};
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Probe answering from a settable URL → result table
    #[derive(Default)]
    struct FakeProbe {
        answers: Mutex<HashMap<String, Result<HealthStatus, ProbeError>>>,
    }

    impl FakeProbe {
        fn set(&self, url: &str, answer: Result<HealthStatus, ProbeError>) {
            self.answers.lock().unwrap().insert(url.to_string(), answer);
        }
    }

    #[async_trait]
    impl HealthProbe for FakeProbe {
        async fn check(&self, url: &str, _timeout: Duration) -> Result<HealthStatus, ProbeError> {
            self.answers
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or(Ok(HealthStatus::Unknown))
        }
    }

    const URL_A: &str = "http://a.test/health";
    const URL_B: &str = "http://b.test/health";

    fn config(enabled: bool) -> FailoverConfig {
        FailoverConfig {
            enabled,
            health_url_a: URL_A.to_string(),
            health_url_b: URL_B.to_string(),
            check_interval_seconds: 3600,
            server_mappings: BTreeMap::from([("10.0.0.1".to_string(), "10.0.0.2".to_string())]),
            ..FailoverConfig::default()
        }
    }

    struct Harness {
        _dir: TempDir,
        store: MemoryRuleStore,
        probe: Arc<FakeProbe>,
        controller: FailoverController,
        state_file: std::path::PathBuf,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let state_file = dir.path().join(DEFAULT_STATE_FILE);
        let store = MemoryRuleStore::with_rules([Rule::new("0.0.0.0", 80, "10.0.0.1", 80, Protocol::V4ToV4)]);
        let probe = Arc::new(FakeProbe::default());
        let controller = FailoverController::new(
            Arc::new(store.clone()),
            probe.clone(),
            ConfigStore::new(&state_file),
        );
        Harness {
            _dir: dir,
            store,
            probe,
            controller,
            state_file,
        }
    }

    #[tokio::test]
    async fn test_invalid_config_changes_nothing() {
        let h = harness();
        h.controller.configure(config(true)).await.unwrap();

        let bad = FailoverConfig {
            health_url_a: String::new(),
            ..config(true)
        };
        match h.controller.configure(bad).await {
            Err(FailoverError::Validation(errors)) => assert_eq!(
                errors,
                vec!["Health URL A is required when failover is enabled".to_string()]
            ),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(h.controller.config().health_url_a, URL_A);
        h.controller.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_configure_persists_and_starts_monitor() {
        let h = harness();
        h.controller.configure(config(true)).await.unwrap();
        assert!(h.controller.is_monitoring().await);

        let saved: FailoverConfig =
            serde_json::from_str(&std::fs::read_to_string(&h.state_file).unwrap()).unwrap();
        assert!(saved.enabled);

        h.controller.configure(config(false)).await.unwrap();
        assert!(!h.controller.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_probe_failures_count_and_record_error() {
        let h = harness();
        h.controller.configure(config(false)).await.unwrap();
        {
            // enable without starting the timer
            let mut state = h.controller.core.lock_state();
            state.config.enabled = true;
        }

        h.probe.set(
            URL_A,
            Err(ProbeError::Transport {
                url: URL_A.to_string(),
                reason: "connection refused".to_string(),
            }),
        );
        h.probe.set(URL_B, Ok(HealthStatus::Dead));

        h.controller.run_probe_cycle().await;
        h.controller.run_probe_cycle().await;

        let status = h.controller.status().await;
        assert_eq!(status.health_status_a, Some(HealthStatus::Dead));
        assert_eq!(status.consecutive_failures_a, 2);
        assert_eq!(status.consecutive_failures_b, 2);
        assert!(status.last_error.unwrap().contains("connection refused"));
        assert!(!status.currently_failed_over);

        h.probe.set(URL_A, Ok(HealthStatus::Alive));
        h.probe.set(URL_B, Ok(HealthStatus::Alive));
        h.controller.run_probe_cycle().await;

        let status = h.controller.status().await;
        assert_eq!(status.consecutive_failures_a, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_automatic_switch_and_back() {
        let h = harness();
        h.controller.configure(config(false)).await.unwrap();
        h.controller.core.lock_state().config.enabled = true;

        h.probe.set(URL_A, Ok(HealthStatus::Dead));
        h.probe.set(URL_B, Ok(HealthStatus::Alive));
        h.controller.run_probe_cycle().await;

        assert!(h.controller.config().currently_failed_over);
        assert!(h.controller.config().last_failover_time.is_some());
        assert_eq!(h.store.rules()[0].connect_address, "10.0.0.2");

        h.probe.set(URL_A, Ok(HealthStatus::Alive));
        h.probe.set(URL_B, Ok(HealthStatus::Dead));
        h.controller.run_probe_cycle().await;

        assert!(!h.controller.config().currently_failed_over);
        assert_eq!(h.store.rules()[0].connect_address, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_state() {
        let h = harness();
        h.controller.configure(config(false)).await.unwrap();
        h.controller.core.lock_state().config.enabled = true;
        h.store.reject_connect_address("10.0.0.2");

        h.probe.set(URL_A, Ok(HealthStatus::Dead));
        h.probe.set(URL_B, Ok(HealthStatus::Alive));
        h.controller.run_probe_cycle().await;

        let config = h.controller.config();
        assert!(!config.currently_failed_over);
        assert!(config.last_error.unwrap().contains("none of 1 rules"));
        assert_eq!(h.store.rules()[0].connect_address, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_manual_failover_requires_enabled() {
        let h = harness();
        let err = h.controller.manual_failover(true).await.unwrap_err();
        assert!(matches!(err, FailoverError::Disabled));
        assert_eq!(h.store.rules()[0].connect_address, "10.0.0.1");
        assert!(!h.state_file.exists());
    }

    #[tokio::test]
    async fn test_configure_keeps_active_side() {
        let h = harness();
        h.controller.configure(config(true)).await.unwrap();
        let report = h.controller.manual_failover(true).await.unwrap();
        assert_eq!(report.changed, 1);

        h.controller
            .configure(FailoverConfig {
                check_interval_seconds: 60,
                currently_failed_over: false,
                ..config(true)
            })
            .await
            .unwrap();

        let config = h.controller.config();
        assert!(config.currently_failed_over);
        assert_eq!(config.check_interval_seconds, 60);
        h.controller.stop_monitoring().await;
    }

    #[tokio::test]
    async fn test_restore_reloads_runtime_state() {
        let h = harness();
        let saved = FailoverConfig {
            currently_failed_over: true,
            consecutive_failures_a: 4,
            ..config(false)
        };
        ConfigStore::new(&h.state_file).save(&saved).await.unwrap();

        assert!(h.controller.restore().await.unwrap());
        assert_eq!(h.controller.config(), saved);
        assert!(!h.controller.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_status_counts_rules_and_tolerates_store_errors() {
        let h = harness();
        assert_eq!(h.controller.status().await.rules_managed, 1);

        let mut store = MockRuleStore::new();
        store.expect_list().returning(|| {
            Err(crate::rule_store::RuleStoreError::Unavailable("down".to_string()))
        });
        let dir = TempDir::new().unwrap();
        let controller = FailoverController::new(
            Arc::new(store),
            Arc::new(FakeProbe::default()),
            ConfigStore::new(dir.path().join(DEFAULT_STATE_FILE)),
        );
        let status = controller.status().await;
        assert_eq!(status.rules_managed, 0);
        assert!(!status.enabled);
        assert_eq!(status.check_interval_seconds, 30);
    }

    #[tokio::test]
    async fn test_stop_monitoring_is_idempotent() {
        let h = harness();
        h.controller.stop_monitoring().await;
        h.controller.configure(config(true)).await.unwrap();
        h.controller.start_monitoring().await;
        assert!(h.controller.is_monitoring().await);
        h.controller.stop_monitoring().await;
        h.controller.stop_monitoring().await;
        assert!(!h.controller.is_monitoring().await);
    }
}
