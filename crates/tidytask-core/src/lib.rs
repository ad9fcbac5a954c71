pub mod config;
pub mod error;

pub use config::{BatchConfig, CacheConfig, MonitorConfig, PerfConfig, ThrottleConfig};
pub use error::{Result, TidyTaskError};

/// Install a global `tracing` subscriber honoring `RUST_LOG`.
///
/// Optional convenience for binaries and examples; embedding
/// applications that already configure tracing should skip this.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
