//! Observability for the replication core
//!
//! Structured logging goes through `tracing`. Lifecycle moments are named by
//! the [`Event`] catalogue so they can be grepped for regardless of which
//! component emitted them.
//!
//! # Usage
//!
//! ```ignore
//! use stripekeeper::observability::{init_logging, log_event, Event};
//!
//! init_logging("info");
//! log_event(Event::PassiveSyncAdmitted, &[("node", "NodeID[...]")]);
//! ```

mod events;

pub use events::Event;

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Logs go to stderr so
/// stdout stays free for command output. Calling this more than once is
/// harmless: later calls leave the first subscriber in place.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Log a lifecycle event with fields.
///
/// Fatal events log at ERROR, everything else at INFO.
pub fn log_event(event: Event, fields: &[(&str, &str)]) {
    let rendered = render_fields(fields);
    if event.is_fatal() {
        tracing::error!(event = event.as_str(), fields = %rendered);
    } else {
        tracing::info!(event = event.as_str(), fields = %rendered);
    }
}

/// Renders fields as `k=v` pairs in key order, so identical events produce
/// identical lines.
fn render_fields(fields: &[(&str, &str)]) -> String {
    let mut sorted: Vec<_> = fields.iter().collect();
    sorted.sort_by_key(|(k, _)| *k);
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fields_sorted() {
        let rendered = render_fields(&[("node", "b"), ("count", "3")]);
        assert_eq!(rendered, "count=3 node=b");
    }

    #[test]
    fn test_log_event_does_not_panic() {
        init_logging("debug");
        init_logging("debug");
        log_event(Event::NodeStarted, &[]);
        log_event(Event::ArbitrationLost, &[("peer", "x")]);
    }
}
