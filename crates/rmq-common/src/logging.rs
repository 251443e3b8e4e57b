//! Structured logging setup
//!
//! - `LOG_FORMAT=json` selects JSON lines for log shipping; anything else
//!   prints human-readable text.
//! - `RUST_LOG` filters as usual, default `info`, e.g.
//!   `RUST_LOG=rmq_consumer=debug,redis=warn`.
//!
//! Consumer code logs with structured fields (`queue`, `virtual_queue`,
//! `message_id`, `client_id`) so one message can be followed across the
//! claim, execute and release steps.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_logging(service_name: &str) {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let installed = if json {
        init_json_logging(default_filter())
    } else {
        init_text_logging(default_filter())
    };

    if installed {
        tracing::debug!(service = service_name, json, "Logging initialized");
    }
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_json_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(false)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::NONE),
        )
        .try_init()
        .is_ok()
}

fn init_text_logging(env_filter: EnvFilter) -> bool {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .try_init()
        .is_ok()
}

/// Test helper: text output captured by the test harness.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(default_filter())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_test_logging();
        init_logging("rmq-test");
        init_logging("rmq-test");
    }
}
