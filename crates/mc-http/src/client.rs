//! Pinned-dial HTTP execution with header sanitization and transfer caps.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use reqwest::redirect::Policy;
use tracing::debug;

use mc_core::correlation::CORRELATION_HEADER;
use mc_core::{current_correlation_id, mask_secret, sanitize_for_log};

use crate::guard::{validate_and_pin, DestinationPolicy, PinnedDestination};
use crate::{HttpClientError, HttpMethod, HttpRequestDescriptor, HttpResponse};

/// Default response-body cap.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

/// Default overall request timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-token", "x-api-key", "cookie"];

/// The only path by which the core talks to other hosts.
///
/// Dropping the returned future aborts the in-flight connection; reqwest's
/// cleanup is idempotent, so cancellation needs no extra bookkeeping here.
#[derive(Debug, Clone, Default)]
pub struct SecureHttpClient;

impl SecureHttpClient {
    pub fn new() -> Self {
        Self
    }

    /// Validates, pins, and executes one request.
    ///
    /// Non-2xx statuses are returned as responses, not errors; callers that
    /// want typed status failures use [`HttpResponse::error_for_status`].
    pub async fn request(
        &self,
        descriptor: &HttpRequestDescriptor,
    ) -> Result<HttpResponse, HttpClientError> {
        let pinned = validate_and_pin(
            &descriptor.url,
            DestinationPolicy {
                allow_private_ips: descriptor.allow_private_ips,
            },
        )
        .await?;
        let headers = build_headers(descriptor, &pinned)?;

        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .resolve(&pinned.host, pinned.address)
            .connect_timeout(Duration::from_millis(descriptor.timeout_ms))
            .timeout(Duration::from_millis(descriptor.timeout_ms))
            .build()
            .map_err(|error| HttpClientError::Transport {
                detail: format!("client construction failed: {error}"),
            })?;

        let method = match descriptor.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };

        debug!(
            method = %method,
            host = %pinned.host,
            address = %pinned.address,
            path = pinned.url.path(),
            "dispatching outbound request"
        );

        let mut request = client.request(method, pinned.url.clone()).headers(headers);
        if let Some(body) = &descriptor.body {
            request = request
                .header("content-type", "application/json")
                .body(serde_json::to_vec(body).map_err(|error| HttpClientError::Transport {
                    detail: format!("body serialization failed: {error}"),
                })?);
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let body = read_capped_body(response, descriptor.max_response_bytes).await?;

        Ok(HttpResponse { status, body })
    }
}

fn build_headers(
    descriptor: &HttpRequestDescriptor,
    pinned: &PinnedDestination,
) -> Result<HeaderMap, HttpClientError> {
    let mut headers = HeaderMap::new();

    // Pinning dials the resolved address; the Host header must carry the
    // original name so virtual hosts and TLS SNI still line up.
    let host_value = if pinned.port == default_port_for(&pinned.url) {
        pinned.host.clone()
    } else {
        format!("{}:{}", pinned.host, pinned.port)
    };
    headers.insert(
        HOST,
        HeaderValue::from_str(&host_value).map_err(|_| HttpClientError::HeaderInjection {
            name: "host".to_string(),
        })?,
    );

    if let Some(id) = current_correlation_id() {
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            headers.insert(HeaderName::from_static(CORRELATION_HEADER), value);
        }
    }

    for (name, value) in &descriptor.headers {
        validate_header_name(name)?;
        validate_header_value(name, value)?;
        let header_name =
            HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).map_err(|_| {
                HttpClientError::HeaderInjection { name: name.clone() }
            })?;
        let header_value =
            HeaderValue::from_str(value).map_err(|_| HttpClientError::HeaderInjection {
                name: name.clone(),
            })?;
        if SENSITIVE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            debug!(header = %name, value = %mask_secret(value), "attached sensitive header");
        } else {
            debug!(header = %name, value = %sanitize_for_log(value), "attached header");
        }
        headers.insert(header_name, header_value);
    }

    Ok(headers)
}

fn default_port_for(url: &url::Url) -> u16 {
    match url.scheme() {
        "https" => 443,
        _ => 80,
    }
}

/// Header names are restricted to `[A-Za-z0-9-]+`.
pub fn validate_header_name(name: &str) -> Result<(), HttpClientError> {
    if name.is_empty()
        || !name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-')
    {
        return Err(HttpClientError::HeaderInjection {
            name: sanitize_for_log(name),
        });
    }
    Ok(())
}

/// Header values must be CR/LF and null free.
pub fn validate_header_value(name: &str, value: &str) -> Result<(), HttpClientError> {
    if value.contains(['\r', '\n', '\0']) {
        return Err(HttpClientError::HeaderInjection {
            name: sanitize_for_log(name),
        });
    }
    Ok(())
}

async fn read_capped_body(
    mut response: reqwest::Response,
    max_bytes: usize,
) -> Result<Vec<u8>, HttpClientError> {
    if let Some(declared) = response.content_length() {
        if declared > max_bytes as u64 {
            return Err(HttpClientError::ResponseTooLarge { limit: max_bytes });
        }
    }
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(map_reqwest_error)? {
        if body.len() + chunk.len() > max_bytes {
            return Err(HttpClientError::ResponseTooLarge { limit: max_bytes });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn map_reqwest_error(error: reqwest::Error) -> HttpClientError {
    if error.is_timeout() {
        return HttpClientError::Timeout;
    }
    if error.is_connect() {
        let detail = format!("{error:?}");
        if detail.contains("Tls") || detail.contains("certificate") {
            return HttpClientError::TlsFailure {
                detail: "TLS handshake failed".to_string(),
            };
        }
        return HttpClientError::ConnectRefused;
    }
    HttpClientError::Transport {
        detail: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_header_name_charset_is_enforced() {
        validate_header_name("x-correlation-id").expect("valid name");
        validate_header_name("Accept").expect("valid name");
        assert!(validate_header_name("x header").is_err());
        assert!(validate_header_name("x\r\nheader").is_err());
        assert!(validate_header_name("").is_err());
        assert!(validate_header_name("x_header").is_err());
    }

    #[test]
    fn unit_header_value_rejects_crlf_injection() {
        validate_header_value("x-token", "plain-value").expect("valid value");
        assert!(validate_header_value("x-token", "a\r\nSet-Cookie: x").is_err());
        assert!(validate_header_value("x-token", "a\nb").is_err());
        assert!(validate_header_value("x-token", "a\0b").is_err());
    }

    #[test]
    fn regression_header_injection_error_sanitizes_the_name() {
        let error = validate_header_name("evil\r\nname").expect_err("invalid");
        match error {
            HttpClientError::HeaderInjection { name } => {
                assert!(!name.contains('\r'));
                assert!(!name.contains('\n'));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
