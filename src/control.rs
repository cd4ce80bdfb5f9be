//! HTTP client for the companion server's loopback control surface.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{error, info, warn};

/// Every control-plane request shares one fixed timeout.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata sent once per launch, after the first healthy check.
#[derive(Debug, Clone, Serialize)]
pub struct InitPayload {
    pub client_id: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl InitPayload {
    /// Payload for this host build; `client_id` is the persisted install id.
    pub fn for_install(install_id: &str) -> Self {
        Self {
            client_id: install_id.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Client for the companion's control surface. All requests target loopback
/// and are fire-and-forget from the supervisor's point of view.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(control_port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://127.0.0.1:{control_port}"))
    }

    /// Seam for tests pointing at a mock control surface.
    pub fn with_base_url(base_url: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(CONTROL_TIMEOUT)
            .build()
            .context("failed to create control-plane http client")?;
        Ok(Self { http, base_url })
    }

    /// `GET /health`. Returns `true` only on HTTP 200; transport errors and
    /// every other status count as unhealthy.
    pub async fn health(&self) -> bool {
        match self.http.get(format!("{}/health", self.base_url)).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
            Ok(resp) => {
                warn!(status = %resp.status(), "health check failed");
                false
            }
            Err(err) => {
                warn!(error = %err, "health check failed");
                false
            }
        }
    }

    /// `POST /mcp/control` — toggle the secondary protocol inside the
    /// running companion. Failures are logged only; no retry, no restart.
    pub async fn set_protocol_enabled(&self, enabled: bool) {
        let body = serde_json::json!({ "enabled": enabled });
        match self
            .http
            .post(format!("{}/mcp/control", self.base_url))
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!(enabled, "protocol control request succeeded");
            }
            Ok(resp) => {
                error!(
                    enabled,
                    status = %resp.status(),
                    "protocol control request failed"
                );
            }
            Err(err) => {
                error!(enabled, error = %err, "protocol control request failed");
            }
        }
    }

    /// `POST /init` — one-shot handshake after the first healthy check.
    /// Failures are logged only and never retried within a launch.
    pub async fn send_init(&self, payload: &InitPayload) {
        match self
            .http
            .post(format!("{}/init", self.base_url))
            .json(payload)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => info!("init handshake succeeded"),
            Ok(resp) => warn!(status = %resp.status(), "init handshake failed"),
            Err(err) => warn!(error = %err, "init handshake failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use mockito::Matcher;

    use super::*;

    #[tokio::test]
    async fn health_is_true_only_on_200() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/health")
            .with_status(200)
            .create_async()
            .await;

        let client = ControlClient::with_base_url(server.url()).expect("client");
        assert!(client.health().await);
        ok.assert_async().await;

        let unavailable = server
            .mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;
        assert!(!client.health().await);
        unavailable.assert_async().await;
    }

    #[tokio::test]
    async fn health_is_false_on_transport_error() {
        let server = mockito::Server::new_async().await;
        let url = server.url();
        drop(server);

        let client = ControlClient::with_base_url(url).expect("client");
        assert!(!client.health().await);
    }

    #[tokio::test]
    async fn toggle_posts_enabled_flag() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/mcp/control")
            .match_body(Matcher::Json(serde_json::json!({ "enabled": false })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = ControlClient::with_base_url(server.url()).expect("client");
        client.set_protocol_enabled(false).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn init_carries_install_metadata() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/init")
            .match_body(Matcher::AllOf(vec![
                Matcher::PartialJson(serde_json::json!({ "client_id": "install-1" })),
                Matcher::PartialJson(serde_json::json!({ "os": std::env::consts::OS })),
                Matcher::PartialJson(serde_json::json!({ "arch": std::env::consts::ARCH })),
            ]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = ControlClient::with_base_url(server.url()).expect("client");
        client.send_init(&InitPayload::for_install("install-1")).await;
        mock.assert_async().await;
    }
}
