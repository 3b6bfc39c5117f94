//! Tracing initialization for binaries and examples embedding the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging.
///
/// Respects `RUST_LOG`; defaults to `info` with engine debug output.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,oxflow_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
