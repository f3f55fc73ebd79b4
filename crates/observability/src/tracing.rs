//! Subscriber initialization.
//!
//! JSON lines with a wall-clock timestamp, filtered through `RUST_LOG`. Without
//! `RUST_LOG` the given default directive applies.

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset. Keeps the pipeline crates at
/// `info` and quiets the sqlx statement logger.
pub const DEFAULT_FILTER: &str = "info,sqlx::query=warn";

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init(default: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter(default))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}
