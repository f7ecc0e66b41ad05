//! Process logging: `tracing` output with runtime filters, plus the access log.

pub mod access;
pub mod filter;

use filter::{FilterLayer, LogFilters};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` overrides the default `hostgate=info`.
///
/// `filters` starts empty and is filled from the configuration on every (re)load.
pub fn init(filters: LogFilters) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("hostgate=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(FilterLayer::new(filters))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
