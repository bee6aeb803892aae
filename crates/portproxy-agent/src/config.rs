//! Resolved agent settings and their defaults

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::failover::DEFAULT_STATE_FILE;
use crate::rule_store::RuleStoreKind;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_RULES: usize = 100;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_HEARTBEAT_INTERVAL_MINUTES: u64 = 5;
pub const DEFAULT_ENVIRONMENT: &str = "Production";

/// Resolved agent settings
#[derive(Clone)]
pub struct AgentConfig {
    /// Shared secret for the command channel
    pub secret_key: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub agent_name: String,
    pub max_rules: usize,
    pub command_timeout: Duration,
    pub state_file: PathBuf,
    pub rule_store: RuleStoreKind,
    /// Central manager to register with; registration is off when unset
    pub central_manager_url: Option<String>,
    /// Register at startup (heartbeats and unregistration run regardless)
    pub auto_register: bool,
    /// Environment tag reported to the manager
    pub environment: String,
    pub silo_id: Option<String>,
    pub heartbeat_interval: Duration,
    /// URL the manager uses to reach this agent
    pub advertised_url: Option<String>,
}

impl AgentConfig {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            secret_key: secret_key.into(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            agent_name: default_agent_name(),
            max_rules: DEFAULT_MAX_RULES,
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECONDS),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            rule_store: RuleStoreKind::default(),
            central_manager_url: None,
            auto_register: false,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            silo_id: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_MINUTES * 60),
            advertised_url: None,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Advertised URL, defaulting to `http://<host name>:<port>`
    pub fn advertised_url(&self) -> String {
        self.advertised_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", default_agent_name(), self.port))
    }
}

// The secret never appears in logs
impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("bind_address", &self.bind_address)
            .field("port", &self.port)
            .field("agent_name", &self.agent_name)
            .field("max_rules", &self.max_rules)
            .field("command_timeout", &self.command_timeout)
            .field("state_file", &self.state_file)
            .field("rule_store", &self.rule_store)
            .field("central_manager_url", &self.central_manager_url)
            .field("auto_register", &self.auto_register)
            .field("environment", &self.environment)
            .field("silo_id", &self.silo_id)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

/// Host name of this machine, or `portproxy-agent` if it cannot be read
pub fn default_agent_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "portproxy-agent".to_string())
}
