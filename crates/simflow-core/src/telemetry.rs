//! Tracing subscriber setup for the `simflow` binary.
//!
//! Log lines go to stderr so that plans and tuples printed on stdout stay
//! machine-readable.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "SIMFLOW_LOG";

fn env_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber.
///
/// `json` switches to newline-delimited JSON records. `level` applies when
/// neither `SIMFLOW_LOG` nor `RUST_LOG` is set. Only the first call in a
/// process has an effect.
pub fn init_tracing(json: bool, level: Level) {
    let layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(env_filter(level));
    if json {
        registry.with(layer.json()).try_init().ok();
    } else {
        registry.with(layer).try_init().ok();
    }
}
