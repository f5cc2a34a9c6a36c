// Logging setup
//
// Structured JSON logs by default, human-readable output with PRETTY_LOG.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "pgq_worker=info,pgq_queue=info";

/// Build the env filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// Must be called once, before any spans are created.
pub fn init_logging(pretty: bool) {
    let (pretty_layer, json_layer) = if pretty {
        (Some(fmt::layer().with_target(true)), None)
    } else {
        (
            None,
            Some(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true),
            ),
        )
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(pretty_layer)
        .with(json_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
