//! Tracing subscriber setup for worker processes.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogFormat;

const DEFAULT_FILTER: &str = "docpipe=info,docpipe_worker=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
///
/// Returns `false` when a subscriber was already installed, e.g. by a test
/// harness.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer().with_target(true).compact()), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_current_span(false).flatten_event(true)),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .try_init()
        .is_ok()
}
