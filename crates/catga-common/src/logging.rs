//! Tracing bootstrap.
//!
//! Catga components emit spans and events through the `tracing` facade and
//! record nothing until the host process installs a subscriber. This module
//! is that installation for binaries and tests that do not bring their own:
//! newline-delimited JSON when `CATGA_LOG_FORMAT=json`, compact
//! human-readable output otherwise, filtered by `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

use crate::telemetry::MESSAGING_SYSTEM_NAME;

/// Environment variable selecting the output format.
pub const LOG_FORMAT_VAR: &str = "CATGA_LOG_FORMAT";

/// Install the process-wide subscriber and stamp a startup event.
///
/// Panics if a global subscriber is already set, so a process calls this
/// exactly once at startup.
pub fn init_logging(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if wants_json() {
        // One flat object per line for log shippers: the enclosing span is
        // inlined, the ancestor chain is not repeated on every event.
        builder
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .init();
    } else {
        builder.compact().init();
    }

    tracing::info!(
        "messaging.system" = MESSAGING_SYSTEM_NAME,
        service = service_name,
        "telemetry initialized"
    );
}

fn wants_json() -> bool {
    std::env::var(LOG_FORMAT_VAR)
        .map(|value| value.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_selection_defaults_to_text() {
        // CATGA_LOG_FORMAT is unset in the test environment.
        assert!(!wants_json());
    }
}
