//! Console-side client for the PortProxy agent API
//!
//! Rule commands are sealed with the shared secret before they leave the
//! process, and every response envelope is verified before it is trusted.

use portproxy_auth::{CodecError, MessageCodec};
use portproxy_proto::{
    AgentStatus, Command, Envelope, FailoverConfig, FailoverStatus, PingResponse, Protocol,
    Response, Rule,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Agent rejected the message authentication")]
    Unauthorized,

    #[error("Invalid failover configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Agent returned HTTP {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Message codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Invalid agent response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Outcome of a manual failover as reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualFailoverOutcome {
    pub message: String,
    pub rules_processed: usize,
    pub rules_changed: usize,
    #[serde(default)]
    pub rules_restored: usize,
    #[serde(default)]
    pub rules_lost: usize,
}

#[derive(Deserialize)]
struct ValidationBody {
    errors: Vec<String>,
}

/// Client for one agent
#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    codec: MessageCodec,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    /// `base_url` is the agent root, e.g. `http://10.1.2.3:8080`
    pub fn new(base_url: impl Into<String>, secret: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_http_client(http, base_url, secret))
    }

    pub fn with_http_client(http: reqwest::Client, base_url: impl Into<String>, secret: &str) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            codec: MessageCodec::new(secret),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/agent/{}", self.base_url, path)
    }

    pub async fn ping(&self) -> Result<PingResponse, ClientError> {
        let response = self.http.get(self.url("ping")).send().await?;
        decode_json(response).await
    }

    pub async fn status(&self) -> Result<AgentStatus, ClientError> {
        let response = self.http.get(self.url("status")).send().await?;
        decode_json(response).await
    }

    /// Seal `command`, send it to `/execute` and open the sealed response
    pub async fn execute(&self, command: &Command) -> Result<Response, ClientError> {
        let envelope = self.codec.seal(&serde_json::to_string(command)?)?;
        debug!(verb = %command.verb, command_id = %command.command_id, "Sending command");

        let response = self
            .http
            .post(self.url("execute"))
            .json(&envelope)
            .send()
            .await?;
        let sealed: Envelope = decode_json(response).await?;
        let plaintext = self.codec.open(&sealed)?;
        Ok(serde_json::from_str(&plaintext)?)
    }

    pub async fn add_rule(&self, rule: &Rule, description: &str) -> Result<Response, ClientError> {
        self.execute(&Command::add(rule, description)).await
    }

    pub async fn delete_rule(
        &self,
        listen_address: &str,
        listen_port: u16,
        protocol: Protocol,
    ) -> Result<Response, ClientError> {
        self.execute(&Command::delete(listen_address, listen_port, protocol))
            .await
    }

    pub async fn list_rules(&self) -> Result<Response, ClientError> {
        self.execute(&Command::list()).await
    }

    pub async fn reset_rules(&self) -> Result<Response, ClientError> {
        self.execute(&Command::reset()).await
    }

    pub async fn configure_failover(&self, config: &FailoverConfig) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("configure-failover"))
            .json(config)
            .send()
            .await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await?;
            return match serde_json::from_str::<ValidationBody>(&body) {
                Ok(validation) => Err(ClientError::Validation(validation.errors)),
                Err(_) => Err(ClientError::Http {
                    status: StatusCode::BAD_REQUEST,
                    body,
                }),
            };
        }

        check_status(response).await.map(|_| ())
    }

    pub async fn failover_status(&self) -> Result<FailoverStatus, ClientError> {
        let response = self.http.get(self.url("failover-status")).send().await?;
        decode_json(response).await
    }

    pub async fn manual_failover(&self, fail_to_b: bool) -> Result<ManualFailoverOutcome, ClientError> {
        let response = self
            .http
            .post(self.url("manual-failover"))
            .json(&fail_to_b)
            .send()
            .await?;
        decode_json(response).await
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Http { status, body })
}

async fn decode_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
