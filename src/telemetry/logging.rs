//! Logging setup.
//!
//! WARN and ERROR are always emitted. INFO and DEBUG are switched on
//! independently, so `-d` without `-v` shows debug lines but no info lines.
//! `RUST_LOG`, when set, replaces the toggles entirely.

use tracing::Level;
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Logging switches collected from the command line and settings.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub info: bool,
    pub debug: bool,
    /// Emit JSON lines for a log shipper.
    pub json: bool,
    pub log_group: Option<String>,
    pub log_stream: Option<String>,
    /// Days the shipper should keep shipped lines.
    pub retention_days: Option<u32>,
}

/// Whether an event at `level` passes the toggles.
pub fn level_enabled(level: &Level, info: bool, debug: bool) -> bool {
    match *level {
        Level::ERROR | Level::WARN => true,
        Level::INFO => info,
        Level::DEBUG => debug,
        Level::TRACE => false,
    }
}

/// Install the global subscriber.
pub fn init_logging(options: &LogOptions) -> Result<(), TryInitError> {
    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(false).boxed()
    };

    if std::env::var_os("RUST_LOG").is_some() {
        tracing_subscriber::registry()
            .with(fmt_layer.with_filter(EnvFilter::from_default_env()))
            .try_init()
    } else {
        let (info, debug) = (options.info, options.debug);
        tracing_subscriber::registry()
            .with(fmt_layer.with_filter(filter_fn(move |meta| {
                level_enabled(meta.level(), info, debug)
            })))
            .try_init()
    }
}

/// Root span carrying the log shipping destination.
///
/// Every event recorded inside it is stamped with `log_group`, `log_stream`
/// and `retention_days` by the JSON formatter.
pub fn shipping_span(options: &LogOptions) -> tracing::Span {
    tracing::error_span!(
        "mqws",
        log_group = options.log_group.as_deref().unwrap_or_default(),
        log_stream = options.log_stream.as_deref().unwrap_or_default(),
        retention_days = options.retention_days,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warn_and_error_always_on() {
        for (info, debug) in [(false, false), (true, false), (false, true), (true, true)] {
            assert!(level_enabled(&Level::WARN, info, debug));
            assert!(level_enabled(&Level::ERROR, info, debug));
        }
    }

    #[test]
    fn test_info_and_debug_are_independent() {
        assert!(!level_enabled(&Level::INFO, false, true));
        assert!(level_enabled(&Level::DEBUG, false, true));
        assert!(level_enabled(&Level::INFO, true, false));
        assert!(!level_enabled(&Level::DEBUG, true, false));
        assert!(!level_enabled(&Level::TRACE, true, true));
    }

    #[test]
    fn test_shipping_span_carries_destination() {
        let span = shipping_span(&LogOptions {
            log_group: Some("bridge".to_string()),
            log_stream: Some("prod".to_string()),
            retention_days: Some(30),
            ..LogOptions::default()
        });
        let fields = span.metadata().unwrap().fields();
        for name in ["log_group", "log_stream", "retention_days"] {
            assert!(fields.field(name).is_some(), "missing {}", name);
        }
    }
}
