//! Secure outbound HTTP for the MasterClaw core.
//!
//! All cross-host traffic flows through [`SecureHttpClient`]: scheme/host
//! validation, private-range policy, first-resolution pinning against DNS
//! rebinding, header sanitization, and response-size caps. The client never
//! retries; the resilience layer owns that.

mod client;
pub mod guard;

pub use client::{
    validate_header_name, validate_header_value, SecureHttpClient, DEFAULT_MAX_RESPONSE_BYTES,
    DEFAULT_TIMEOUT_MS,
};
pub use guard::{validate_and_pin, DestinationPolicy, PinnedDestination};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP methods the core is allowed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    /// Idempotent methods are retryable without caller opt-in.
    pub fn is_idempotent(self) -> bool {
        !matches!(self, Self::Post)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }
}

/// One outbound request, fully specified before any network activity.
#[derive(Debug, Clone)]
pub struct HttpRequestDescriptor {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout_ms: u64,
    pub max_response_bytes: usize,
    pub allow_private_ips: bool,
}

impl HttpRequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            allow_private_ips: false,
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            body: Some(body),
            ..Self::get(url)
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_private_ips(mut self, allow: bool) -> Self {
        self.allow_private_ips = allow;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// A completed response with its capped body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts non-2xx statuses into [`HttpClientError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, HttpClientError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(HttpClientError::HttpStatus { status: self.status })
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HttpClientError> {
        serde_json::from_slice(&self.body).map_err(|error| HttpClientError::Transport {
            detail: format!("response body is not the expected JSON shape: {error}"),
        })
    }
}

/// Typed failures surfaced by the secure client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpClientError {
    #[error("destination refused by SSRF rule '{rule}': {detail}")]
    SsrfViolation { rule: &'static str, detail: String },

    #[error("header '{name}' failed sanitization")]
    HeaderInjection { name: String },

    #[error("response exceeded the {limit}-byte cap")]
    ResponseTooLarge { limit: usize },

    #[error("request timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectRefused,

    #[error("DNS resolution failed: {detail}")]
    DnsFailure { detail: String },

    #[error("TLS failure: {detail}")]
    TlsFailure { detail: String },

    #[error("upstream returned HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("invalid URL: {detail}")]
    InvalidUrl { detail: String },

    #[error("transport failure: {detail}")]
    Transport { detail: String },
}

impl HttpClientError {
    /// Stable class label used by the retry layer and JSON output.
    pub fn class(&self) -> &'static str {
        match self {
            Self::SsrfViolation { .. } => "ssrf_violation",
            Self::HeaderInjection { .. } => "header_injection",
            Self::ResponseTooLarge { .. } => "response_too_large",
            Self::Timeout => "timeout",
            Self::ConnectRefused => "connect_refused",
            Self::DnsFailure { .. } => "dns_failure",
            Self::TlsFailure { .. } => "tls_failure",
            Self::HttpStatus { .. } => "http_status",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Transport { .. } => "transport",
        }
    }
}
