//! Recognized configuration sections and keys.

/// WebSocket API section.
pub const WS_API: &str = "ws_api";
/// Message broker section.
pub const AWS_MQ: &str = "aws_mq";
/// Log shipping and metrics section.
pub const AWS_CLOUDWATCH: &str = "aws_cloudwatch";

/// Every `(section, key)` pair the bridge reads.
///
/// Migration copies exactly these keys, and the remote snapshot fetches them.
pub const RECOGNIZED_KEYS: &[(&str, &str)] = &[
    (WS_API, "client_id"),
    (WS_API, "client_secret"),
    (WS_API, "api_host"),
    (WS_API, "api_uri"),
    (WS_API, "ws_ping_interval"),
    (WS_API, "ws_max_connect_attempts"),
    (WS_API, "ws_attempt_window_secs"),
    (AWS_MQ, "mq_broker_id"),
    (AWS_MQ, "mq_user_id"),
    (AWS_MQ, "mq_password"),
    (AWS_MQ, "mq_region"),
    (AWS_MQ, "mq_port"),
    (AWS_MQ, "mq_qname_to_ws"),
    (AWS_MQ, "mq_qname_from_ws"),
    (AWS_MQ, "mq_ttl_from_ws"),
    (AWS_MQ, "mq_consumer_tag"),
    (AWS_CLOUDWATCH, "cw_retention_days"),
    (AWS_CLOUDWATCH, "cw_region"),
    (AWS_CLOUDWATCH, "cw_log_stream"),
    (AWS_CLOUDWATCH, "cw_log_group"),
    (AWS_CLOUDWATCH, "cw_metrics_namespace"),
    (AWS_CLOUDWATCH, "cw_metrics_resolution"),
];

/// Whether `section.key` is one of the recognized settings.
pub fn is_recognized(section: &str, key: &str) -> bool {
    RECOGNIZED_KEYS
        .iter()
        .any(|(s, k)| *s == section && *k == key)
}
