//! Configuration validation.
//!
//! Validates settings against the subsystems that are enabled for this run and
//! collects every problem into one error.

use crate::common::error::ConfigError;
use crate::config::types::Settings;

/// Subsystems enabled for this run; each one pulls in its own required keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    /// Loop inbound to outbound without a WebSocket.
    pub stub: bool,
    /// Ship structured logs.
    pub remote_logs: bool,
    /// Emit metrics.
    pub metrics: bool,
}

/// Validate bridge settings and return detailed errors.
pub fn validate_settings(settings: &Settings, features: &Features) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    check_broker(settings, &mut errors);

    if !features.stub {
        let ws = &settings.socket;
        for (key, value) in [
            ("client_id", &ws.client_id),
            ("client_secret", &ws.client_secret),
            ("api_host", &ws.api_host),
            ("api_uri", &ws.api_uri),
        ] {
            if value.is_empty() {
                errors.push(format!("ws_api.{} is required", key));
            }
        }
        if !ws.client_secret.is_empty() && hex::decode(&ws.client_secret).is_err() {
            errors.push("ws_api.client_secret must be hex-encoded".to_string());
        }
        if ws.ping_interval_secs == 0 {
            errors.push("ws_api.ws_ping_interval must be non-zero".to_string());
        }
    }

    let obs = &settings.observability;
    if features.remote_logs {
        if obs.region.is_none() {
            errors.push("aws_cloudwatch.cw_region is required for log shipping".to_string());
        }
        if obs.log_group.is_none() {
            errors.push("aws_cloudwatch.cw_log_group is required for log shipping".to_string());
        }
        if obs.log_stream.is_none() {
            errors.push("aws_cloudwatch.cw_log_stream is required for log shipping".to_string());
        }
    }
    if features.metrics {
        if obs.region.is_none() {
            errors.push("aws_cloudwatch.cw_region is required for metrics".to_string());
        }
        if obs.metrics_namespace.is_none() {
            errors.push("aws_cloudwatch.cw_metrics_namespace is required for metrics".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

/// Validate the broker-only settings the bridge tester needs.
pub fn validate_tester_settings(settings: &Settings) -> Result<(), ConfigError> {
    let mut errors = Vec::new();
    check_broker(settings, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError {
            message: errors.join("\n"),
        })
    }
}

fn check_broker(settings: &Settings, errors: &mut Vec<String>) {
    let mq = &settings.broker;
    for (key, value) in [
        ("mq_broker_id", &mq.broker_id),
        ("mq_user_id", &mq.user_id),
        ("mq_password", &mq.password),
        ("mq_qname_to_ws", &mq.queue_to_socket),
        ("mq_qname_from_ws", &mq.queue_from_socket),
    ] {
        if value.is_empty() {
            errors.push(format!("aws_mq.{} is required", key));
        }
    }
    if mq.port == 0 {
        errors.push("aws_mq.mq_port must be non-zero".to_string());
    }
    if !mq.queue_to_socket.is_empty() && mq.queue_to_socket == mq.queue_from_socket {
        errors.push("aws_mq.mq_qname_to_ws and aws_mq.mq_qname_from_ws must differ".to_string());
    }
}
