//! Status and health commands over the gateway facade.

use serde_json::json;

use mc_core::{current_unix_timestamp_ms, OpsError};
use mc_gateway::{GatewayClient, GatewayConfig, GatewayError};

use crate::context::{AppHandles, CommandContext};
use crate::output::CommandReport;

/// Maps facade failures onto the dispatcher's error kinds.
pub fn map_gateway_error(error: GatewayError) -> OpsError {
    match error {
        GatewayError::CircuitOpen(open) => OpsError::CircuitOpen {
            name: open.name,
            retry_after_ms: open.retry_after_ms,
        },
        GatewayError::Http(http) => match http {
            mc_http::HttpClientError::SsrfViolation { detail, .. } => {
                OpsError::Ssrf { detail }
            }
            mc_http::HttpClientError::HeaderInjection { name } => OpsError::Security {
                rule: "HEADER_INJECTION",
                detail: format!("header '{name}' failed sanitization"),
            },
            mc_http::HttpClientError::HttpStatus { status } => {
                OpsError::Dependency(format!("gateway returned HTTP {status}"))
            }
            other => OpsError::Dependency(other.to_string()),
        },
        GatewayError::InvalidSessionId(validation) => OpsError::Validation(validation),
    }
}

/// Resolves the gateway connection settings from the config tree.
pub fn gateway_config_from(tree: &serde_json::Value) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    if let Some(url) = tree.pointer("/gateway/url").and_then(|value| value.as_str()) {
        config.base_url = url.to_string();
    }
    if let Some(timeout) = tree
        .pointer("/gateway/timeout_ms")
        .and_then(|value| value.as_u64())
    {
        config.timeout_ms = timeout;
    }
    config
}

/// `health`: one typed gateway probe.
pub async fn handle_health(
    handles: &AppHandles,
    gateway_config: GatewayConfig,
) -> Result<CommandReport, OpsError> {
    let gateway = GatewayClient::new(&handles.breakers, gateway_config);
    let report = gateway.health().await.map_err(map_gateway_error)?;
    Ok(CommandReport::new(
        format!(
            "gateway is {} (version {})",
            report.status,
            report.version.as_deref().unwrap_or("unknown")
        ),
        serde_json::to_value(&report).unwrap_or_default(),
    ))
}

/// `status`: aggregate of gateway health, circuits, and rate-limit usage.
///
/// A sick gateway degrades the report instead of failing the command.
pub async fn handle_status(
    context: &CommandContext,
    handles: &AppHandles,
    gateway_config: GatewayConfig,
) -> Result<CommandReport, OpsError> {
    let gateway = GatewayClient::new(&handles.breakers, gateway_config);
    let gateway_status = match gateway.health().await {
        Ok(report) => json!({ "reachable": true, "status": report.status }),
        Err(error) => json!({ "reachable": false, "error": error.to_string() }),
    };

    let circuits = handles.breakers.snapshot();
    let open: Vec<&String> = circuits
        .iter()
        .filter(|(_, state)| state.phase != mc_resilience::CircuitPhase::Closed)
        .map(|(name, _)| name)
        .collect();

    let usage = handles
        .limiter
        .usage(&context.user_identity, current_unix_timestamp_ms());

    let human = format!(
        "gateway: {} | circuits: {} known, {} open | rate buckets: {}",
        if gateway_status["reachable"].as_bool().unwrap_or(false) {
            "up"
        } else {
            "down"
        },
        circuits.len(),
        open.len(),
        usage.len()
    );

    Ok(CommandReport::new(
        human,
        json!({
            "gateway": gateway_status,
            "circuits": {
                "known": circuits.len(),
                "open": open,
            },
            "rate_limits": usage,
        }),
    ))
}
