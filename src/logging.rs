//! Logging setup for applications embedding the pipeline.
//!
//! The library itself only emits `tracing` events; hosts that don't have
//! their own subscriber can call [`init`] once at startup.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize a stderr tracing subscriber.
///
/// Log level is controlled via the `PHOTOMAP_LOG` environment variable:
/// - `PHOTOMAP_LOG=debug` for verbose output
/// - `PHOTOMAP_LOG=info` for standard output (default)
/// - `PHOTOMAP_LOG=warn` for warnings and errors only
///
/// Returns an error if a global subscriber is already set.
pub fn init() -> Result<(), tracing_subscriber::util::TryInitError> {
    let env_filter =
        EnvFilter::try_from_env("PHOTOMAP_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
}
