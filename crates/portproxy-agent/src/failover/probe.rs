//! Health endpoint checks

use async_trait::async_trait;
use portproxy_proto::HealthStatus;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// A health endpoint could not be read. Always classified as `Dead`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("health check {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("health check {url} returned HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("health check {url} failed: {reason}")]
    Transport { url: String, reason: String },
}

/// Fetches and classifies one health endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, url: &str, timeout: Duration) -> Result<HealthStatus, ProbeError>;
}

/// [`HealthProbe`] over HTTP GET
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, url: &str, timeout: Duration) -> Result<HealthStatus, ProbeError> {
        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                ProbeError::Timeout {
                    url: url.to_string(),
                    timeout,
                }
            } else {
                ProbeError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        };

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProbeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(transport)?;
        let health = HealthStatus::classify(&body);
        debug!(url, %health, "Health check completed");
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_classifies_bodies_and_errors() {
        let base = serve(
            Router::new()
                .route("/alive", get(|| async { "Alive\r\n" }))
                .route("/dead", get(|| async { "Dead" }))
                .route("/odd", get(|| async { "maybe" }))
                .route("/error", get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "Alive") }))
                .route(
                    "/slow",
                    get(|| async {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        "Alive"
                    }),
                ),
        )
        .await;

        let probe = HttpHealthProbe::new();
        let timeout = Duration::from_secs(2);

        assert_eq!(probe.check(&format!("{base}/alive"), timeout).await, Ok(HealthStatus::Alive));
        assert_eq!(probe.check(&format!("{base}/dead"), timeout).await, Ok(HealthStatus::Dead));
        assert_eq!(probe.check(&format!("{base}/odd"), timeout).await, Ok(HealthStatus::Unknown));
        assert!(matches!(
            probe.check(&format!("{base}/error"), timeout).await,
            Err(ProbeError::Status { status: 503, .. })
        ));
        assert!(matches!(
            probe.check(&format!("{base}/slow"), Duration::from_millis(200)).await,
            Err(ProbeError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let probe = HttpHealthProbe::new();
        let result = probe
            .check("http://127.0.0.1:1/health", Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
