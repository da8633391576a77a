//! Authoritative server for the coordination store
//!
//! This crate hosts the canonical key-value map and serves it over TCP:
//! - **State**: entries, blocking waiters, watch registry, worker count
//! - **Connections**: one reader loop and one writer task per socket
//! - **Tenancy**: optional sharing of one endpoint by several local stores
//! - **Status**: HTTP endpoints for health and counters
//!
//! # Example
//!
//! ```ignore
//! use store_server::{ServerConfig, StoreServer};
//!
//! #[tokio::main]
//! async fn main() -> store_core::Result<()> {
//!     let server = StoreServer::start(ServerConfig::default()).await?;
//!     println!("listening on {}", server.local_addr());
//!     Ok(())
//! }
//! ```

mod connection;
pub mod http_api;
pub mod server;
pub mod state;
pub mod tenancy;

pub use server::{ServerConfig, ServerStats, StoreServer};
pub use state::StoreState;
pub use tenancy::acquire_server;
