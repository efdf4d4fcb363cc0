//! Structured logging setup. No external diagnostic-endpoint reporting —
//! out of scope here.

use tracing_subscriber::filter::EnvFilter;

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        return EnvFilter::new("info").add_directive("index_proxy=debug".parse().unwrap());

        #[cfg(not(debug_assertions))]
        return EnvFilter::new("info");
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
}
