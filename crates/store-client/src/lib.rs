//! Client side of the coordination store
//!
//! - [`Client`]: request/response connection for every non-watch operation
//! - [`CallbackClient`]: watch connection dispatching change notifications
//! - [`TcpStore`]: the handle participants hold, combining both
//!
//! # Example
//!
//! ```ignore
//! use store_client::TcpStore;
//! use store_core::StoreOptions;
//!
//! #[tokio::main]
//! async fn main() -> store_core::Result<()> {
//!     let store = TcpStore::new("127.0.0.1", StoreOptions::server(29500).with_num_workers(1)).await?;
//!     store.set("rank0/addr", b"10.0.0.1:4000".to_vec()).await?;
//!     let addr = store.get("rank0/addr").await?;
//!     Ok(())
//! }
//! ```

pub mod callback;
pub mod client;
mod connect;
pub mod store;

pub use callback::{CallbackClient, FailureCallback};
pub use client::Client;
pub use store::{TcpStore, TcpStoreBuilder};
pub use store_core::Store;
