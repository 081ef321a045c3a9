mod metrics;

pub use metrics::MetricsRecorder;

use tracing_subscriber::EnvFilter;

/// Initialize logging. Call once at startup; RUST_LOG overrides the
/// default level.
pub fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}
