//! Tracing initialisation shared by binaries and integration tests.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber once.
///
/// `RUST_LOG` wins when set; otherwise `quiet` selects `error` and the
/// default is `info`. Repeated calls are no-ops, so tests can call this
/// freely.
pub fn init(quiet: bool) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let default = if quiet { "error" } else { "info" };
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
