//! Store Core - Foundation for the coordination store
//!
//! Provides the shared types, configuration, error handling and wire
//! protocol used by the server and its clients.

pub mod config;
pub mod error;
pub mod protocol;
pub mod store;
pub mod types;

pub use config::{NetworkConfig, RetryConfig, StoreOptions, DEFAULT_PORT, DEFAULT_TIMEOUT, NO_TIMEOUT};
pub use error::{Error, ErrorKind, Result, WireError};
pub use store::Store;
pub use types::*;

/// Install a `tracing` subscriber honouring `RUST_LOG`, for binaries and tests.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
