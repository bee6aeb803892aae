//! Announcing the agent to a central manager
//!
//! When a manager URL is configured the agent optionally registers at
//! startup, sends periodic heartbeats while it runs and unregisters on
//! shutdown. Every failure is logged and otherwise ignored.

use chrono::{DateTime, Utc};
use portproxy_proto::AGENT_VERSION;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::failover::MonitorTask;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("central manager request {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("central manager request {url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    name: &'a str,
    agent_url: &'a str,
    secret_key: &'a str,
    environment: &'a str,
    silo_id: Option<&'a str>,
    version: &'a str,
    machine_name: String,
    user_name: String,
    os_version: String,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    name: &'a str,
    agent_url: &'a str,
    last_seen: DateTime<Utc>,
    status: &'a str,
}

/// HTTP client for the central manager's agent registry
#[derive(Clone)]
pub struct RegistrationClient {
    http: reqwest::Client,
    manager_url: String,
    name: String,
    agent_url: String,
    secret_key: String,
    environment: String,
    silo_id: Option<String>,
}

// The secret never appears in logs
impl std::fmt::Debug for RegistrationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationClient")
            .field("manager_url", &self.manager_url)
            .field("name", &self.name)
            .field("agent_url", &self.agent_url)
            .finish_non_exhaustive()
    }
}

impl RegistrationClient {
    /// Client for the manager named in `config`, if any
    pub fn from_config(config: &AgentConfig) -> Result<Option<Self>, RegistrationError> {
        let Some(manager_url) = config
            .central_manager_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        else {
            return Ok(None);
        };

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RegistrationError::Request {
                url: manager_url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Some(Self {
            http,
            manager_url: manager_url.trim_end_matches('/').to_string(),
            name: config.agent_name.clone(),
            agent_url: config.advertised_url(),
            secret_key: config.secret_key.clone(),
            environment: config.environment.clone(),
            silo_id: config.silo_id.clone(),
        }))
    }

    pub fn manager_url(&self) -> &str {
        &self.manager_url
    }

    pub async fn register(&self) -> Result<(), RegistrationError> {
        let body = RegisterRequest {
            name: &self.name,
            agent_url: &self.agent_url,
            secret_key: &self.secret_key,
            environment: &self.environment,
            silo_id: self.silo_id.as_deref(),
            version: AGENT_VERSION,
            machine_name: crate::config::default_agent_name(),
            user_name: std::env::var("USERNAME")
                .or_else(|_| std::env::var("USER"))
                .unwrap_or_default(),
            os_version: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            registered_at: Utc::now(),
        };
        let url = format!("{}/api/agents/register", self.manager_url);
        self.send(self.http.post(&url).json(&body), url).await
    }

    pub async fn heartbeat(&self) -> Result<(), RegistrationError> {
        let body = HeartbeatRequest {
            name: &self.name,
            agent_url: &self.agent_url,
            last_seen: Utc::now(),
            status: "Connected",
        };
        let url = format!("{}/api/agents/heartbeat", self.manager_url);
        self.send(self.http.post(&url).json(&body), url).await
    }

    pub async fn unregister(&self) -> Result<(), RegistrationError> {
        let url = format!("{}/api/agents/{}", self.manager_url, self.name);
        self.send(self.http.delete(&url), url).await
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: String) -> Result<(), RegistrationError> {
        let response = request.send().await.map_err(|e| RegistrationError::Request {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            debug!(%url, "Central manager request succeeded");
            Ok(())
        } else {
            Err(RegistrationError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }
}

/// Registration lifecycle run alongside the API server
#[derive(Debug, Clone)]
pub struct RegistrationService {
    client: RegistrationClient,
    auto_register: bool,
    heartbeat_interval: Duration,
}

impl RegistrationService {
    pub fn new(client: RegistrationClient, auto_register: bool, heartbeat_interval: Duration) -> Self {
        Self {
            client,
            auto_register,
            heartbeat_interval,
        }
    }

    /// Register if enabled, heartbeat until `shutdown`, then unregister
    pub async fn run(self, shutdown: CancellationToken) {
        info!(manager = %self.client.manager_url(), "Central manager registration starting");

        if self.auto_register {
            match self.client.register().await {
                Ok(()) => info!("Registered with central manager at {}", self.client.manager_url()),
                Err(e) => warn!(
                    "Registration failed, continuing without central manager: {}",
                    e
                ),
            }
        }

        let client = self.client.clone();
        let heartbeat = MonitorTask::spawn_delayed(self.heartbeat_interval, move || {
            let client = client.clone();
            async move {
                if let Err(e) = client.heartbeat().await {
                    warn!("Heartbeat to central manager failed: {}", e);
                }
            }
        });

        shutdown.cancelled().await;
        heartbeat.stop().await;

        match self.client.unregister().await {
            Ok(()) => info!("Unregistered from central manager"),
            Err(e) => warn!("Failed to unregister from central manager: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::StatusCode,
        routing::{delete, post},
        Json, Router,
    };
    use serde_json::Value;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    type Calls = Arc<Mutex<Vec<(String, Value)>>>;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn manager(status: StatusCode) -> (String, Calls) {
        let calls: Calls = Arc::default();
        let router = Router::new()
            .route(
                "/api/agents/register",
                post(move |State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    calls.lock().unwrap().push(("register".to_string(), body));
                    status
                }),
            )
            .route(
                "/api/agents/heartbeat",
                post(move |State(calls): State<Calls>, Json(body): Json<Value>| async move {
                    calls.lock().unwrap().push(("heartbeat".to_string(), body));
                    status
                }),
            )
            .route(
                "/api/agents/{name}",
                delete(move |State(calls): State<Calls>, Path(name): Path<String>| async move {
                    calls.lock().unwrap().push(("unregister".to_string(), Value::String(name)));
                    status
                }),
            )
            .with_state(calls.clone());
        (serve(router).await, calls)
    }

    fn config(manager_url: &str) -> AgentConfig {
        let mut config = AgentConfig::new("fleet-secret");
        config.agent_name = "edge-01".to_string();
        config.port = 9090;
        config.central_manager_url = Some(format!("{manager_url}/"));
        config.silo_id = Some("silo-7".to_string());
        config.advertised_url = Some("http://edge-01.lan:9090".to_string());
        config
    }

    #[test]
    fn test_no_manager_means_no_client() {
        let mut config = AgentConfig::new("s");
        assert!(RegistrationClient::from_config(&config).unwrap().is_none());
        config.central_manager_url = Some("  ".to_string());
        assert!(RegistrationClient::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_debug_omits_secret() {
        let client = RegistrationClient::from_config(&config("http://manager.lan"))
            .unwrap()
            .unwrap();
        let debug = format!("{:?}", client);
        assert!(debug.contains("manager.lan"));
        assert!(!debug.contains("fleet-secret"));
    }

    #[tokio::test]
    async fn test_register_heartbeat_unregister_payloads() {
        let (url, calls) = manager(StatusCode::OK).await;
        let client = RegistrationClient::from_config(&config(&url)).unwrap().unwrap();

        client.register().await.unwrap();
        client.heartbeat().await.unwrap();
        client.unregister().await.unwrap();

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);

        let (kind, register) = &calls[0];
        assert_eq!(kind, "register");
        assert_eq!(register["name"], "edge-01");
        assert_eq!(register["agentUrl"], "http://edge-01.lan:9090");
        assert_eq!(register["secretKey"], "fleet-secret");
        assert_eq!(register["environment"], "Production");
        assert_eq!(register["siloId"], "silo-7");
        assert_eq!(register["version"], AGENT_VERSION);

        let (kind, heartbeat) = &calls[1];
        assert_eq!(kind, "heartbeat");
        assert_eq!(heartbeat["status"], "Connected");
        assert!(heartbeat["lastSeen"].is_string());

        assert_eq!(calls[2], ("unregister".to_string(), Value::String("edge-01".to_string())));
    }

    #[tokio::test]
    async fn test_rejected_request_is_status_error() {
        let (url, _) = manager(StatusCode::SERVICE_UNAVAILABLE).await;
        let client = RegistrationClient::from_config(&config(&url)).unwrap().unwrap();

        assert!(matches!(
            client.register().await,
            Err(RegistrationError::Status { status: 503, .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_manager_is_request_error() {
        let client = RegistrationClient::from_config(&config("http://127.0.0.1:1"))
            .unwrap()
            .unwrap();
        assert!(matches!(
            client.heartbeat().await,
            Err(RegistrationError::Request { .. })
        ));
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let (url, calls) = manager(StatusCode::OK).await;
        let client = RegistrationClient::from_config(&config(&url)).unwrap().unwrap();
        let service = RegistrationService::new(client, true, Duration::from_millis(100));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
        task.await.unwrap();

        let kinds: Vec<String> = calls.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(kinds.first().map(String::as_str), Some("register"));
        assert_eq!(kinds.last().map(String::as_str), Some("unregister"));
        assert!(kinds.iter().filter(|k| *k == "heartbeat").count() >= 2);
    }

    #[tokio::test]
    async fn test_service_survives_failing_manager() {
        let (url, calls) = manager(StatusCode::INTERNAL_SERVER_ERROR).await;
        let client = RegistrationClient::from_config(&config(&url)).unwrap().unwrap();
        let service = RegistrationService::new(client, false, Duration::from_millis(50));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        task.await.unwrap();

        let calls = calls.lock().unwrap();
        assert!(calls.iter().all(|(k, _)| k != "register"));
        assert!(calls.iter().any(|(k, _)| k == "heartbeat"));
        assert_eq!(calls.last().map(|(k, _)| k.as_str()), Some("unregister"));
    }
}
