//! Wiring of the agent's components and its run loop

use portproxy_auth::MessageCodec;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::config::AgentConfig;
use crate::dispatcher::CommandDispatcher;
use crate::failover::{ConfigStore, FailoverController, HealthProbe, HttpHealthProbe};
use crate::registration::{RegistrationClient, RegistrationService};
use crate::rule_store::{MemoryRuleStore, NetshRuleStore, RuleStore, RuleStoreKind};
use crate::status::{AgentIdentity, StatusReporter};

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(std::io::Error),
}

/// A fully wired agent: rule store, dispatcher, failover controller and API
pub struct Agent {
    config: AgentConfig,
    state: Arc<AppState>,
    failover: Arc<FailoverController>,
    registration: Option<RegistrationService>,
}

impl Agent {
    /// Build an agent with the configured rule store and HTTP health probes
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let store: Arc<dyn RuleStore> = match config.rule_store {
            RuleStoreKind::Netsh => Arc::new(NetshRuleStore::new(config.command_timeout)),
            RuleStoreKind::Memory => {
                warn!("Using in-memory rule store; no host rules will be changed");
                Arc::new(MemoryRuleStore::new())
            }
        };
        Self::with_components(config, store, Arc::new(HttpHealthProbe::new()))
    }

    /// Build an agent around explicit components
    pub fn with_components(
        config: AgentConfig,
        store: Arc<dyn RuleStore>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, AgentError> {
        if config.secret_key.trim().is_empty() {
            return Err(AgentError::Config("Agent secret key not configured".to_string()));
        }

        let codec = MessageCodec::new(&config.secret_key);
        let failover = Arc::new(FailoverController::new(
            store.clone(),
            probe,
            ConfigStore::new(&config.state_file),
        ));
        let identity = AgentIdentity {
            name: config.agent_name.clone(),
            port: config.port,
            max_rules: config.max_rules,
        };

        let registration = RegistrationClient::from_config(&config)
            .map_err(|e| AgentError::Config(e.to_string()))?
            .map(|client| {
                RegistrationService::new(client, config.auto_register, config.heartbeat_interval)
            });

        let state = Arc::new(AppState {
            dispatcher: CommandDispatcher::new(codec, store.clone()),
            failover: failover.clone(),
            status: StatusReporter::new(identity, store),
        });

        Ok(Self {
            config,
            state,
            failover,
            registration,
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn failover(&self) -> &Arc<FailoverController> {
        &self.failover
    }

    /// Restore failover state, serve the API until `shutdown`, then stop
    /// the health monitor. Registration with a central manager, when
    /// configured, runs for the lifetime of the server.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let addr = self.config.bind_addr();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| AgentError::Bind { addr, source })?;
        self.run_with_listener(listener, shutdown).await
    }

    pub async fn run_with_listener(
        self,
        listener: tokio::net::TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        match self.failover.restore().await {
            Ok(true) => info!("Failover state restored from {}", self.config.state_file.display()),
            Ok(false) => info!("Failover starts disabled"),
            Err(e) => warn!("Ignoring saved failover configuration: {}", e),
        }

        let registration_stop = shutdown.child_token();
        let registration = self
            .registration
            .map(|service| tokio::spawn(service.run(registration_stop.clone())));

        let served = api::serve(listener, self.state.clone(), shutdown).await;

        registration_stop.cancel();
        if let Some(task) = registration {
            if let Err(e) = task.await {
                warn!("Registration task ended abnormally: {}", e);
            }
        }
        self.failover.stop_monitoring().await;
        info!("Agent stopped");
        served.map_err(AgentError::Serve)
    }
}
