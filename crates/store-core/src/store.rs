//! Store trait definition
//!
//! Defines the async interface every coordination store exposes.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::types::{Value, WatchKeyCallback};

/// Async key-value coordination interface
///
/// Keys are user keys; implementations apply their own namespacing.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or overwrite `key`
    async fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Atomically replace `key` with `desired` if it currently holds `expected`
    ///
    /// An absent key matches an empty `expected`.
    ///
    /// # Returns
    /// The value stored after the operation, whether or not the swap happened
    async fn compare_set(&self, key: &str, expected: Value, desired: Value) -> Result<Value>;

    /// Read `key`, waiting up to the default timeout for it to be set
    ///
    /// # Errors
    /// Returns a timeout error if the key does not appear in time
    async fn get(&self, key: &str) -> Result<Value>;

    /// Atomically add `delta` to the integer stored at `key` (0 if absent)
    ///
    /// # Returns
    /// The new value
    async fn add(&self, key: &str, delta: i64) -> Result<i64>;

    /// Remove `key`
    ///
    /// # Returns
    /// `true` if the key existed
    async fn delete_key(&self, key: &str) -> Result<bool>;

    /// `true` iff every key currently exists; never blocks
    async fn check(&self, keys: &[String]) -> Result<bool>;

    /// Number of user keys currently stored
    async fn num_keys(&self) -> Result<i64>;

    /// Wait for every key to exist, using the default timeout
    async fn wait(&self, keys: &[String]) -> Result<()>;

    /// Wait for every key to exist, using an explicit timeout
    async fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()>;

    /// Register `callback` for future changes to `key`
    ///
    /// Returns once the registration is live.
    async fn watch_key(&self, key: &str, callback: WatchKeyCallback) -> Result<()>;
}
