//! Logging initialization.
//!
//! Everything goes to stderr through `tracing-subscriber`. The level comes
//! from `RUST_LOG` when set:
//!
//! ```bash
//! # per-connection lifecycle and request traces
//! RUST_LOG=webserv_core=debug webserv conf/webserv.conf
//!
//! # warnings and errors only
//! RUST_LOG=warn webserv conf/webserv.conf
//! ```
//!
//! Both functions use `try_init`, so a second call (for example from a
//! test) leaves the first subscriber in place instead of panicking.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging at `info` unless `RUST_LOG` says otherwise.
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initialize logging with a fallback level used when `RUST_LOG` is unset.
pub fn init_logging_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
