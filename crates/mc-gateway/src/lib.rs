//! Typed facade over the AI-service REST API.
//!
//! Every method wraps the secure HTTP client with the resilience layer:
//! one circuit per endpoint, retryability decided by the method's
//! idempotence, and the correlation header attached implicitly. The base
//! URL comes from config (`gateway.url`); services live on the operator's
//! own network, so private targets are opted in here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use mc_core::validate::validate_identifier;
use mc_http::{
    HttpClientError, HttpRequestDescriptor, HttpResponse, SecureHttpClient,
};
use mc_resilience::{
    retry_with_breaker, should_retry_status, CircuitBreakerRegistry, RetryError, RetryPolicy,
};

/// Default gateway base URL when config does not override it.
pub const DEFAULT_GATEWAY_URL: &str = "http://localhost:8787";

/// Connection settings resolved from config and environment.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_GATEWAY_URL.to_string(),
            token: std::env::var("GATEWAY_TOKEN").ok().filter(|v| !v.is_empty()),
            timeout_ms: mc_http::DEFAULT_TIMEOUT_MS,
        }
    }
}

/// Failures surfaced to command handlers.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    CircuitOpen(#[from] mc_resilience::CircuitOpenError),

    #[error(transparent)]
    Http(HttpClientError),

    #[error("session id rejected: {0}")]
    InvalidSessionId(#[from] mc_core::ValidationError),
}

impl From<RetryError<HttpClientError>> for GatewayError {
    fn from(error: RetryError<HttpClientError>) -> Self {
        match error {
            RetryError::CircuitOpen(open) => Self::CircuitOpen(open),
            RetryError::Exhausted(http) => Self::Http(http),
        }
    }
}

/// `GET /health` response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uptime_seconds: Option<u64>,
    #[serde(default)]
    pub components: Value,
}

/// `GET /cache/stats` response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    #[serde(default)]
    pub entries: u64,
    #[serde(default)]
    pub hits: u64,
    #[serde(default)]
    pub misses: u64,
    #[serde(default)]
    pub size_bytes: u64,
}

/// One session summary from `GET /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub updated_at: Option<String>,
}

/// `GET /slo/status` response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloStatus {
    #[serde(default)]
    pub availability_target: f64,
    #[serde(default)]
    pub availability_actual: f64,
    #[serde(default)]
    pub error_budget_remaining: f64,
    #[serde(default)]
    pub burn_rate: f64,
}

/// `GET /analytics/insights` response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsReport {
    #[serde(default)]
    pub window: String,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub top_models: Vec<Value>,
}

/// Typed client over the gateway REST surface.
pub struct GatewayClient<'a> {
    http: SecureHttpClient,
    breakers: &'a CircuitBreakerRegistry,
    retry: RetryPolicy,
    config: GatewayConfig,
}

impl<'a> GatewayClient<'a> {
    pub fn new(breakers: &'a CircuitBreakerRegistry, config: GatewayConfig) -> Self {
        Self {
            http: SecureHttpClient::new(),
            breakers,
            retry: RetryPolicy::default(),
            config,
        }
    }

    /// `GET /health` — idempotent.
    pub async fn health(&self) -> Result<HealthReport, GatewayError> {
        let response = self.get_json("/health", "gateway:health").await?;
        Ok(response)
    }

    /// `GET /cache/stats` — idempotent.
    pub async fn cache_stats(&self) -> Result<CacheStats, GatewayError> {
        self.get_json("/cache/stats", "gateway:cache").await
    }

    /// `POST /cache/clear` — mutating, never retried.
    pub async fn clear_cache(&self) -> Result<(), GatewayError> {
        let descriptor = self.descriptor(
            HttpRequestDescriptor::post(self.url("/cache/clear"), Value::Null),
        );
        self.execute("gateway:cache", false, descriptor).await?;
        Ok(())
    }

    /// `GET /sessions` — idempotent.
    pub async fn sessions(&self) -> Result<Vec<SessionSummary>, GatewayError> {
        self.get_json("/sessions", "gateway:sessions").await
    }

    /// `GET /sessions/{id}` — idempotent; the id is validated before the
    /// URL is built.
    pub async fn session(&self, session_id: &str) -> Result<Value, GatewayError> {
        validate_identifier(session_id, 64, "_-")?;
        let path = format!("/sessions/{session_id}");
        self.get_json(&path, "gateway:sessions").await
    }

    /// `GET /slo/status` — idempotent.
    pub async fn slo_status(&self) -> Result<SloStatus, GatewayError> {
        self.get_json("/slo/status", "gateway:slo").await
    }

    /// `GET /analytics/insights?window=…` — idempotent.
    pub async fn insights(&self, window: &str) -> Result<InsightsReport, GatewayError> {
        validate_identifier(window, 16, "")?;
        let path = format!("/analytics/insights?window={window}");
        self.get_json(&path, "gateway:insights").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn descriptor(&self, mut descriptor: HttpRequestDescriptor) -> HttpRequestDescriptor {
        descriptor.timeout_ms = self.config.timeout_ms;
        descriptor.allow_private_ips = true;
        if let Some(token) = &self.config.token {
            descriptor = descriptor.with_header("x-api-token", token.clone());
        }
        descriptor
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        circuit: &str,
    ) -> Result<T, GatewayError> {
        let descriptor = self.descriptor(HttpRequestDescriptor::get(self.url(path)));
        let response = self.execute(circuit, true, descriptor).await?;
        response.json().map_err(GatewayError::Http)
    }

    async fn execute(
        &self,
        circuit: &str,
        idempotent: bool,
        descriptor: HttpRequestDescriptor,
    ) -> Result<HttpResponse, GatewayError> {
        debug!(circuit, url = %descriptor.url, method = descriptor.method.as_str(), "gateway call");
        let http = &self.http;
        let descriptor = &descriptor;
        let response = retry_with_breaker(
            self.breakers,
            circuit,
            self.retry,
            idempotent,
            is_retryable,
            move || async move { http.request(descriptor).await?.error_for_status() },
        )
        .await?;
        Ok(response)
    }
}

/// Error classes the retry layer may replay.
fn is_retryable(error: &HttpClientError) -> bool {
    match error {
        HttpClientError::Timeout
        | HttpClientError::ConnectRefused
        | HttpClientError::DnsFailure { .. } => true,
        HttpClientError::HttpStatus { status } => should_retry_status(*status),
        _ => false,
    }
}
