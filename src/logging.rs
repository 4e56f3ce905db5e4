//! Logging setup. Levels follow the usual tracing ladder; kernel sources
//! show up at `debug`, scheduling decisions at `debug`, per-range worker
//! chatter at `trace`.

use tracing_subscriber::EnvFilter;

/// Installs a formatting subscriber driven by `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
