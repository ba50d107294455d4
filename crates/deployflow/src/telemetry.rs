use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "deployflow=info,worker=info,deployctl=info";

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the default
/// filter. Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
