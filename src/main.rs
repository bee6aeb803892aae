//! PortProxy CLI - operator tool for PortProxy agents
//!
//! Sends encrypted rule commands to an agent and drives its failover
//! controller.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use portproxy_client::AgentClient;
use portproxy_proto::{FailoverConfig, Protocol, Response, Rule};
use std::collections::BTreeMap;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// PortProxy - manage port forwarding rules on remote agents
#[derive(Parser, Debug)]
#[command(name = "portproxy")]
#[command(about = "PortProxy - manage port forwarding rules on remote agents")]
#[command(version = concat!(env!("GIT_TAG"), " (", env!("GIT_HASH"), ", built ", env!("BUILD_TIME"), ")"))]
struct Cli {
    /// Agent base URL (e.g. http://10.1.2.3:8080)
    #[arg(long, global = true, env = "PORTPROXY_AGENT_URL", default_value = "http://127.0.0.1:8080")]
    agent_url: String,

    /// Shared secret for the agent command channel
    #[arg(long, global = true, env = "PORTPROXY_SECRET_KEY", hide_env_values = true)]
    secret: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the agent is reachable
    Ping,

    /// Show agent status
    Status,

    /// List port proxy rules on the agent host
    List,

    /// Add a port proxy rule
    #[command(long_about = r#"
Add a port proxy rule on the agent host.

EXAMPLES:
  # Forward RADIUS traffic to an A server
  portproxy add --listen-port 1812 --connect-address 10.0.0.1

  # IPv4 listener forwarding to an IPv6 backend
  portproxy add --listen-port 443 --connect-address fd00::10 \
    --connect-port 8443 --protocol v4tov6
"#)]
    Add {
        /// Port to listen on
        #[arg(long)]
        listen_port: u16,

        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        listen_address: String,

        /// Address to forward to
        #[arg(long)]
        connect_address: String,

        /// Port to forward to (defaults to the listen port)
        #[arg(long)]
        connect_port: Option<u16>,

        /// Address families (v4tov4, v4tov6, v6tov4, v6tov6)
        #[arg(long, default_value = "v4tov4")]
        protocol: Protocol,

        /// Free-form description
        #[arg(long, default_value = "")]
        description: String,
    },

    /// Delete a port proxy rule
    Delete {
        #[arg(long)]
        listen_port: u16,

        #[arg(long, default_value = "0.0.0.0")]
        listen_address: String,

        #[arg(long, default_value = "v4tov4")]
        protocol: Protocol,
    },

    /// Remove every port proxy rule on the agent host
    Reset {
        /// Confirm the reset
        #[arg(long)]
        yes: bool,
    },

    /// Failover configuration and control
    #[command(subcommand)]
    Failover(FailoverCommands),
}

#[derive(Subcommand, Debug)]
enum FailoverCommands {
    /// Apply a failover configuration
    #[command(long_about = r#"
Apply a failover configuration to the agent.

EXAMPLES:
  portproxy failover configure \
    --health-url-a http://10.0.0.1/health \
    --health-url-b http://10.0.0.2/health \
    --map 10.0.0.1=10.0.0.2 --map 10.0.0.3=10.0.0.4

  # Turn failover off
  portproxy failover configure --disable
"#)]
    Configure {
        /// Disable failover
        #[arg(long)]
        disable: bool,

        #[arg(long, default_value = "")]
        health_url_a: String,

        #[arg(long, default_value = "")]
        health_url_b: String,

        /// Seconds between health checks
        #[arg(long, default_value_t = portproxy_proto::DEFAULT_CHECK_INTERVAL_SECONDS)]
        interval: i64,

        /// Health check timeout in seconds
        #[arg(long, default_value_t = portproxy_proto::DEFAULT_TIMEOUT_SECONDS)]
        timeout: i64,

        /// Server mapping as A=B (repeatable)
        #[arg(long = "map", value_parser = parse_mapping)]
        mappings: Vec<(String, String)>,
    },

    /// Show failover status
    Status,

    /// Retarget rules to the B servers, or back to A with --to-a
    Manual {
        #[arg(long)]
        to_a: bool,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "warn" };

    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn parse_mapping(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((a, b)) if !a.trim().is_empty() && !b.trim().is_empty() => {
            Ok((a.trim().to_string(), b.trim().to_string()))
        }
        _ => Err(format!("expected A=B, got '{}'", value)),
    }
}

/// Print a command response and turn an agent-side failure into an error
fn report(response: Response) -> Result<()> {
    println!("{}", response.message);
    if !response.output.trim().is_empty() {
        debug!("Tool output:\n{}", response.output);
    }
    if response.success {
        Ok(())
    } else {
        bail!("Agent reported failure for command {}", response.command_id)
    }
}

fn print_rules(rules: &[Rule]) {
    if rules.is_empty() {
        return;
    }
    println!(
        "{:<8} {:<40} {:>6}  {:<40} {:>6}",
        "PROTO", "LISTEN ADDRESS", "PORT", "CONNECT ADDRESS", "PORT"
    );
    for rule in rules {
        println!(
            "{:<8} {:<40} {:>6}  {:<40} {:>6}",
            rule.protocol, rule.listen_address, rule.listen_port, rule.connect_address, rule.connect_port
        );
    }
}

async fn run(cli: Cli) -> Result<()> {
    let secret = cli
        .secret
        .filter(|s| !s.trim().is_empty())
        .context("Secret key is required (use --secret or PORTPROXY_SECRET_KEY)")?;
    let client = AgentClient::new(&cli.agent_url, &secret).context("Failed to create HTTP client")?;
    info!("Agent: {}", client.base_url());

    match cli.command {
        Commands::Ping => {
            let ping = client.ping().await.context("Ping failed")?;
            println!(
                "{} from {} (version {}, port {}, max rules {})",
                ping.message, ping.agent_name, ping.version, ping.port, ping.max_rules
            );
        }
        Commands::Status => {
            let status = client.status().await.context("Failed to fetch status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::List => {
            let response = client.list_rules().await.context("Failed to list rules")?;
            let rules = response.rules.clone();
            report(response)?;
            print_rules(&rules);
        }
        Commands::Add {
            listen_port,
            listen_address,
            connect_address,
            connect_port,
            protocol,
            description,
        } => {
            let rule = Rule::new(
                listen_address,
                listen_port,
                connect_address,
                connect_port.unwrap_or(listen_port),
                protocol,
            );
            report(client.add_rule(&rule, &description).await.context("Failed to add rule")?)?;
        }
        Commands::Delete {
            listen_port,
            listen_address,
            protocol,
        } => {
            report(
                client
                    .delete_rule(&listen_address, listen_port, protocol)
                    .await
                    .context("Failed to delete rule")?,
            )?;
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("Refusing to remove every rule without --yes");
            }
            report(client.reset_rules().await.context("Failed to reset rules")?)?;
        }
        Commands::Failover(FailoverCommands::Configure {
            disable,
            health_url_a,
            health_url_b,
            interval,
            timeout,
            mappings,
        }) => {
            let config = FailoverConfig {
                enabled: !disable,
                health_url_a,
                health_url_b,
                check_interval_seconds: interval,
                timeout_seconds: timeout,
                server_mappings: mappings.into_iter().collect::<BTreeMap<_, _>>(),
                ..FailoverConfig::default()
            };
            client
                .configure_failover(&config)
                .await
                .context("Failed to configure failover")?;
            println!("Failover configuration applied successfully");
        }
        Commands::Failover(FailoverCommands::Status) => {
            let status = client
                .failover_status()
                .await
                .context("Failed to fetch failover status")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Failover(FailoverCommands::Manual { to_a }) => {
            let outcome = client
                .manual_failover(!to_a)
                .await
                .context("Manual failover failed")?;
            println!(
                "{}: {} processed, {} changed, {} restored, {} lost",
                outcome.message,
                outcome.rules_processed,
                outcome.rules_changed,
                outcome.rules_restored,
                outcome.rules_lost
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    run(cli).await
}
