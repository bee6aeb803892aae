//! PortProxy Agent - encrypted port-forwarding management service
//!
//! This binary runs the agent HTTP API that the console uses to manage the
//! host's port proxy rules, and the background failover monitor.

use anyhow::{Context, Result};
use clap::Parser;
use portproxy_agent::{config, Agent, AgentConfig, RuleStoreKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PortProxy agent - manages port forwarding rules on behalf of the console
#[derive(Parser, Debug)]
#[command(name = "portproxy-agent")]
#[command(about = "PortProxy agent - manages port forwarding rules on behalf of the console")]
#[command(version)]
#[command(long_about = r#"
PortProxy Agent exposes an encrypted command channel for adding, deleting,
listing and resetting port proxy rules on this host, and optionally fails
rules over between A and B servers based on health checks.

EXAMPLES:
  # Start agent with a secret key
  portproxy-agent --secret-key $SECRET

  # Start agent using config file
  portproxy-agent --config agent-config.yaml

  # Development host without netsh
  portproxy-agent --secret-key dev --rule-store memory --log-level debug

ENVIRONMENT VARIABLES:
  PORTPROXY_SECRET_KEY   Shared secret for the command channel
  PORTPROXY_PORT         Port to listen on
  PORTPROXY_AGENT_NAME   Agent name reported by /ping
  PORTPROXY_STATE_FILE   Failover state file
  PORTPROXY_RULE_STORE   Rule store backend (netsh, memory)
  PORTPROXY_CENTRAL_MANAGER_URL  Central manager for registration
"#)]
struct Args {
    /// Shared secret for encrypting commands
    #[arg(long, env = "PORTPROXY_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Address to bind the HTTP API
    #[arg(long, env = "PORTPROXY_BIND_ADDRESS")]
    bind_address: Option<IpAddr>,

    /// Port to listen on
    #[arg(long, short = 'p', env = "PORTPROXY_PORT")]
    port: Option<u16>,

    /// Agent name (defaults to the host name)
    #[arg(long, env = "PORTPROXY_AGENT_NAME")]
    agent_name: Option<String>,

    /// Maximum number of rules advertised to the console
    #[arg(long, env = "PORTPROXY_MAX_RULES")]
    max_rules: Option<usize>,

    /// Timeout for rule store commands in seconds
    #[arg(long, env = "PORTPROXY_COMMAND_TIMEOUT")]
    command_timeout_seconds: Option<u64>,

    /// Failover state file
    #[arg(long, env = "PORTPROXY_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Rule store backend (netsh, memory)
    #[arg(long, env = "PORTPROXY_RULE_STORE")]
    rule_store: Option<RuleStoreKind>,

    /// Central manager to register with
    #[arg(long, env = "PORTPROXY_CENTRAL_MANAGER_URL")]
    central_manager_url: Option<String>,

    /// Register with the central manager at startup
    #[arg(long, env = "PORTPROXY_AUTO_REGISTER")]
    auto_register: bool,

    /// Environment tag reported to the central manager
    #[arg(long, env = "PORTPROXY_ENVIRONMENT")]
    environment: Option<String>,

    /// Silo ID reported to the central manager
    #[arg(long, env = "PORTPROXY_SILO_ID")]
    silo_id: Option<String>,

    /// Minutes between heartbeats to the central manager
    #[arg(long, env = "PORTPROXY_HEARTBEAT_INTERVAL")]
    heartbeat_interval_minutes: Option<u64>,

    /// URL the central manager should use to reach this agent
    #[arg(long, env = "PORTPROXY_ADVERTISED_URL")]
    advertised_url: Option<String>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    agent: AgentSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentSection {
    /// Environment variable holding the secret key
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key_env: Option<String>,

    /// Direct secret key (prefer using secret_key_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    bind_address: Option<IpAddr>,

    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_rules: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    command_timeout_seconds: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    state_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    rule_store: Option<RuleStoreKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    central_manager_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    auto_register: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    environment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    silo_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    heartbeat_interval_minutes: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    advertised_url: Option<String>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?.agent
        }
        None => AgentSection::default(),
    };

    let file_secret = match (&file.secret_key_env, file.secret_key) {
        (Some(env_var), _) => Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        ),
        (None, secret) => secret,
    };

    let secret_key = args.secret_key.or(file_secret).unwrap_or_default();
    if secret_key.trim().is_empty() {
        anyhow::bail!(
            "Secret key is required (use --secret-key, PORTPROXY_SECRET_KEY, or config file)"
        );
    }

    let mut config = AgentConfig::new(secret_key);
    if let Some(bind_address) = args.bind_address.or(file.bind_address) {
        config.bind_address = bind_address;
    }
    if let Some(port) = args.port.or(file.port) {
        config.port = port;
    }
    if let Some(name) = args.agent_name.or(file.name) {
        config.agent_name = name;
    }
    if let Some(max_rules) = args.max_rules.or(file.max_rules) {
        config.max_rules = max_rules;
    }
    if let Some(timeout) = args.command_timeout_seconds.or(file.command_timeout_seconds) {
        if timeout == 0 {
            anyhow::bail!("Command timeout must be greater than 0");
        }
        config.command_timeout = Duration::from_secs(timeout);
    }
    if let Some(state_file) = args.state_file.or(file.state_file) {
        config.state_file = state_file;
    }
    if let Some(rule_store) = args.rule_store.or(file.rule_store) {
        config.rule_store = rule_store;
    }

    config.central_manager_url = args.central_manager_url.or(file.central_manager_url);
    config.auto_register = args.auto_register || file.auto_register.unwrap_or(false);
    if let Some(environment) = args.environment.or(file.environment) {
        config.environment = environment;
    }
    config.silo_id = args.silo_id.or(file.silo_id);
    if let Some(minutes) = args.heartbeat_interval_minutes.or(file.heartbeat_interval_minutes) {
        if minutes == 0 {
            anyhow::bail!("Heartbeat interval must be greater than 0");
        }
        config.heartbeat_interval = Duration::from_secs(minutes * 60);
    }
    config.advertised_url = args.advertised_url.or(file.advertised_url);

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Setup logging first
    setup_logging(&args.log_level)?;

    info!("PortProxy Agent starting...");

    let config = build_agent_config(args).context("Failed to build agent configuration")?;

    // Log configuration (but not the secret key)
    info!("Agent name: {}", config.agent_name);
    info!("Listening on: {}", config.bind_addr());
    info!("Rule store: {:?}", config.rule_store);
    info!("Failover state file: {}", config.state_file.display());
    if let Some(manager) = &config.central_manager_url {
        info!("Central manager: {} (auto-register: {})", manager, config.auto_register);
    }

    let agent = Agent::new(config).context("Failed to create agent")?;

    let shutdown = CancellationToken::new();

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut agent_task = tokio::spawn(agent.run(shutdown.clone()));

    // Wait for Ctrl+C or agent error
    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
        result = &mut agent_task => {
            match result {
                Ok(Ok(())) => {
                    info!("Agent stopped normally");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    error!("Agent error: {:#}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Agent task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    // Let in-flight requests and the health monitor finish
    match agent_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Agent error during shutdown: {}", e),
        Err(e) => error!("Agent task panicked: {}", e),
    }

    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["portproxy-agent"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_secret_is_required() {
        let mut parsed = args(&[]);
        parsed.secret_key = None;
        assert!(build_agent_config(parsed).is_err());
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "agent:\n  secret_key: from-file\n  port: 9000\n  name: file-agent\n  rule_store: memory\n"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let mut parsed = args(&["--config", &path, "--port", "9100"]);
        parsed.secret_key = None;
        let config = build_agent_config(parsed).unwrap();

        assert_eq!(config.secret_key, "from-file");
        assert_eq!(config.port, 9100);
        assert_eq!(config.agent_name, "file-agent");
        assert_eq!(config.rule_store, RuleStoreKind::Memory);
        assert_eq!(config.max_rules, config::DEFAULT_MAX_RULES);
    }

    #[test]
    fn test_registration_settings_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "agent:\n  secret_key: s\n  central_manager_url: http://manager.lan\n  auto_register: true\n  silo_id: silo-2\n  heartbeat_interval_minutes: 2\n"
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let mut parsed = args(&["--config", &path, "--environment", "Staging"]);
        parsed.secret_key = None;
        let config = build_agent_config(parsed).unwrap();

        assert_eq!(config.central_manager_url.as_deref(), Some("http://manager.lan"));
        assert!(config.auto_register);
        assert_eq!(config.environment, "Staging");
        assert_eq!(config.silo_id.as_deref(), Some("silo-2"));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_zero_heartbeat_rejected() {
        let parsed = args(&["--secret-key", "s", "--heartbeat-interval-minutes", "0"]);
        assert!(build_agent_config(parsed).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let parsed = args(&["--secret-key", "s", "--command-timeout-seconds", "0"]);
        assert!(build_agent_config(parsed).is_err());
    }
}
