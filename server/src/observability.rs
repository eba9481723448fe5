//! Structured logging setup.
//!
//! JSON lines on stdout, filtered by `RUST_LOG` (default `vc_relay=info`).

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "vc_relay=info,tower_http=info";

/// Build the log filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Call once, before any logging.
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_current_span(false))
        .init();
}
