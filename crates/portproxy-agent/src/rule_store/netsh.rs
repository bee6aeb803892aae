//! Rule store backed by `netsh interface portproxy`

use async_trait::async_trait;
use portproxy_proto::{Protocol, Rule};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{RuleSnapshot, RuleStore, RuleStoreError, ToolOutput};

const NETSH: &str = "netsh";

/// Rule store backed by `netsh interface portproxy`
#[derive(Debug, Clone)]
pub struct NetshRuleStore {
    program: String,
    timeout: Duration,
}

impl NetshRuleStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: NETSH.to_string(),
            timeout,
        }
    }

    /// Use a different executable (e.g. a wrapper script)
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<ToolOutput, RuleStoreError> {
        debug!(program = %self.program, args = ?args, "Executing rule store command");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuleStoreError::Spawn {
                tool: self.program.clone(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(RuleStoreError::Unavailable(format!(
                    "failed waiting for {}: {}",
                    self.program, e
                )))
            }
            Err(_) => {
                warn!(program = %self.program, timeout = ?self.timeout, "Rule store command timed out");
                return Err(RuleStoreError::Timeout {
                    tool: self.program.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(status = ?output.status.code(), "Rule store command finished");

        if output.status.success() {
            Ok(ToolOutput::ok(stdout))
        } else {
            Ok(ToolOutput::failed(stdout, stderr))
        }
    }
}

fn portproxy_args(action: &str) -> Vec<String> {
    vec!["interface".to_string(), "portproxy".to_string(), action.to_string()]
}

#[async_trait]
impl RuleStore for NetshRuleStore {
    async fn add(&self, rule: &Rule) -> Result<ToolOutput, RuleStoreError> {
        info!(rule = %rule, "Adding port proxy rule");
        let mut args = portproxy_args("add");
        args.extend([
            rule.protocol.to_string(),
            format!("listenport={}", rule.listen_port),
            format!("listenaddress={}", rule.listen_address),
            format!("connectport={}", rule.connect_port),
            format!("connectaddress={}", rule.connect_address),
        ]);
        self.run(args).await
    }

    async fn delete(
        &self,
        listen_address: &str,
        listen_port: u16,
        protocol: Protocol,
    ) -> Result<ToolOutput, RuleStoreError> {
        info!(listen_address, listen_port, %protocol, "Deleting port proxy rule");
        let mut args = portproxy_args("delete");
        args.extend([
            protocol.to_string(),
            format!("listenport={}", listen_port),
            format!("listenaddress={}", listen_address),
        ]);
        self.run(args).await
    }

    async fn list(&self) -> Result<RuleSnapshot, RuleStoreError> {
        let mut args = portproxy_args("show");
        args.push("all".to_string());
        let snapshot = RuleSnapshot::from_output(self.run(args).await?);
        debug!(count = snapshot.rules.len(), "Parsed port proxy rules");
        Ok(snapshot)
    }

    async fn reset(&self) -> Result<ToolOutput, RuleStoreError> {
        warn!("Resetting ALL port proxy rules");
        self.run(portproxy_args("reset")).await
    }
}
