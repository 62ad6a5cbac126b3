//! Environment variable overrides for configuration.
//!
//! Supports overriding config values with environment variables:
//! - `MQWS_CONFIG` - Config file path
//! - `MQWS_CLIENT_SECRET` - WebSocket API client secret (hex)
//! - `MQWS_MQ_PASSWORD` - Broker password
//! - `MQWS_REMOTE_TOKEN` - Access token for the remote config store

use std::env;

use crate::config::types::Settings;

/// Environment variable prefix for all config overrides.
const ENV_PREFIX: &str = "MQWS";

/// Apply environment variable overrides to settings.
///
/// This allows secrets to be provided via environment variables instead of
/// the config file or remote store.
pub fn apply_env_overrides(mut settings: Settings) -> Settings {
    if let Ok(secret) = env::var(format!("{}_CLIENT_SECRET", ENV_PREFIX)) {
        if !secret.is_empty() {
            settings.socket.client_secret = secret;
        }
    }
    if let Ok(password) = env::var(format!("{}_MQ_PASSWORD", ENV_PREFIX)) {
        if !password.is_empty() {
            settings.broker.password = password;
        }
    }

    settings
}

/// Check if any override variables are set but empty.
///
/// Returns a list of variable names that are set but empty.
pub fn check_empty_env_vars() -> Vec<String> {
    let vars = [
        format!("{}_CLIENT_SECRET", ENV_PREFIX),
        format!("{}_MQ_PASSWORD", ENV_PREFIX),
        format!("{}_REMOTE_TOKEN", ENV_PREFIX),
    ];

    vars.into_iter()
        .filter(|var| env::var(var).map(|v| v.is_empty()).unwrap_or(false))
        .collect()
}

/// Get the config file path from environment or use default.
///
/// Checks `MQWS_CONFIG` environment variable, otherwise returns "mq2wsbridge.conf".
pub fn get_config_path() -> String {
    env::var(format!("{}_CONFIG", ENV_PREFIX)).unwrap_or_else(|_| "mq2wsbridge.conf".to_string())
}

/// Access token for the remote config store, if one is set.
pub fn remote_token() -> Option<String> {
    env::var(format!("{}_REMOTE_TOKEN", ENV_PREFIX))
        .ok()
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::source::MemorySource;

    fn make_test_settings() -> Settings {
        let source = MemorySource::new("test")
            .with("ws_api", "client_secret", "aabb")
            .with("aws_mq", "mq_password", "original_password");
        Settings::from_source(&source).unwrap()
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(ENV_PREFIX, "MQWS");
    }

    #[test]
    fn test_get_config_path_default() {
        // Clear the env var first
        env::remove_var("MQWS_CONFIG");
        assert_eq!(get_config_path(), "mq2wsbridge.conf");
    }

    #[test]
    fn test_apply_env_overrides_no_vars() {
        // Clear all relevant env vars
        env::remove_var("MQWS_CLIENT_SECRET");
        env::remove_var("MQWS_MQ_PASSWORD");

        let settings = make_test_settings();
        let result = apply_env_overrides(settings);

        // Should remain unchanged
        assert_eq!(result.socket.client_secret, "aabb");
        assert_eq!(result.broker.password, "original_password");
    }
}
