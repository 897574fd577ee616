//! HTTP transport for the analysis gateway.
//!
//! Wraps reqwest with:
//! - The gateway's standard headers (bearer credential, request id, client
//!   version, timestamp)
//! - Timeout handling distinct from transport failures
//! - Status-to-error mapping for the gateway's response conventions
//!
//! The [`GatewayTransport`] trait is the seam the orchestrator depends on, so
//! tests can substitute a scripted backend without a listening server.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand::Rng;
use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::config::{Endpoint, GatewayConfig};
use crate::error::{AegisError, Result};

/// Transport behavior the orchestrator depends on.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// POST a JSON body to an endpoint, returning the parsed JSON response.
    async fn post_json(&self, endpoint: Endpoint, body: &Value, token: Option<&str>)
        -> Result<Value>;

    /// GET an endpoint, returning the parsed JSON response.
    async fn get(&self, endpoint: Endpoint, token: Option<&str>) -> Result<Value>;
}

/// Configuration for the HTTP transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub client_version: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: GatewayConfig::DEFAULT_BASE_URL.to_string(),
            request_timeout: GatewayConfig::REQUEST_TIMEOUT,
            connect_timeout: GatewayConfig::CONNECT_TIMEOUT,
            client_version: GatewayConfig::CLIENT_VERSION.to_string(),
        }
    }
}

impl TransportConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// HTTP transport speaking to the gateway.
pub struct HttpTransport {
    client: Client,
    base: Url,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self> {
        // A trailing slash makes Url::join treat the base path as a directory.
        let mut base_url = config.base_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base = Url::parse(&base_url).map_err(|e| AegisError::Config {
            message: format!("invalid gateway base URL {}: {}", config.base_url, e),
        })?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(format!("aegis-client/{}", config.client_version))
            .build()
            .map_err(|e| AegisError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                status: None,
            })?;

        Ok(Self {
            client,
            base,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        self.base.as_str()
    }

    /// Check if an HTTP status code indicates a retryable error.
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
    }

    /// Check if an HTTP status code indicates a permanent failure.
    pub fn is_permanent_failure(status: StatusCode) -> bool {
        matches!(status.as_u16(), 400 | 401 | 403 | 404)
    }

    // Internal methods

    fn endpoint_url(&self, endpoint: Endpoint) -> Result<Url> {
        self.base
            .join(endpoint.path())
            .map_err(|e| AegisError::Config {
                message: format!("invalid endpoint path {}: {}", endpoint.path(), e),
            })
    }

    fn map_send_error(&self, err: reqwest::Error, endpoint: Endpoint) -> AegisError {
        if err.is_timeout() {
            AegisError::Timeout(self.config.request_timeout)
        } else {
            AegisError::Network {
                message: format!("{} request failed: {}", endpoint, err),
                status: None,
            }
        }
    }

    async fn handle_response(&self, response: Response, endpoint: Endpoint) -> Result<Value> {
        let status = response.status();

        if status.is_success() {
            return response.json().await.map_err(|e| AegisError::Network {
                message: format!("invalid JSON from {}: {}", endpoint, e),
                status: Some(status.as_u16()),
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            warn!(%endpoint, retry_after, "gateway rate limited the request");
            return Err(AegisError::RateLimited {
                category: "gateway".to_string(),
                retry_after_secs: retry_after,
            });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AegisError::Auth {
                message: format!("gateway rejected credentials for {} ({})", endpoint, status),
            });
        }

        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(200).collect();
        Err(AegisError::Network {
            message: format!("gateway returned {} for {}: {}", status, endpoint, snippet),
            status: Some(status.as_u16()),
        })
    }
}

#[async_trait]
impl GatewayTransport for HttpTransport {
    async fn post_json(
        &self,
        endpoint: Endpoint,
        body: &Value,
        token: Option<&str>,
    ) -> Result<Value> {
        let url = self.endpoint_url(endpoint)?;
        let request_id = generate_id("req");
        debug!(%endpoint, request_id, "POST gateway request");

        let mut request = self
            .client
            .post(url)
            .json(body)
            .header("X-Request-ID", &request_id)
            .header("X-Client-Version", &self.config.client_version)
            .header("X-Timestamp", unix_millis().to_string());
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(e, endpoint))?;
        self.handle_response(response, endpoint).await
    }

    async fn get(&self, endpoint: Endpoint, token: Option<&str>) -> Result<Value> {
        let url = self.endpoint_url(endpoint)?;
        let request_id = generate_id("req");
        debug!(%endpoint, request_id, "GET gateway request");

        let mut request = self
            .client
            .get(url)
            .header("X-Request-ID", &request_id)
            .header("X-Client-Version", &self.config.client_version)
            .header("X-Timestamp", unix_millis().to_string());
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(e, endpoint))?;
        self.handle_response(response, endpoint).await
    }
}

/// Generate a correlation id of the form `{prefix}_{unix_millis}_{suffix}`.
pub fn generate_id(prefix: &str) -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(11)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", prefix, unix_millis(), suffix)
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
