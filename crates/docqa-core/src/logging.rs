use tracing_subscriber::{fmt, EnvFilter};

/// Install the process-wide fmt subscriber. `RUST_LOG` overrides the default
/// `info` level. Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
