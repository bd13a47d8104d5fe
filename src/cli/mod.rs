//! Shared CLI plumbing for the axon-run binary.

/// Initialize tracing/logging to stderr.
///
/// Respects the `RUST_LOG` env var, defaulting to WARN. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
