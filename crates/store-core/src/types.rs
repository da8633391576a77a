//! Core type definitions for the coordination store

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Stored values are opaque bytes
pub type Value = Vec<u8>;

/// Identifies one accepted connection on the server
pub type ConnectionId = u64;

/// Prefix applied to every user key
pub const KEY_PREFIX: &str = "/";

/// Prefix reserved for rendezvous bookkeeping
pub const INIT_PREFIX: &str = "init/";

/// Callback invoked with the old and new value of a watched key.
///
/// `None` as the old value means the key did not exist; `None` as the new
/// value means the key was deleted.
pub type WatchKeyCallback = Arc<dyn Fn(Option<Value>, Option<Value>) + Send + Sync>;

/// Server endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    host: String,
    port: u16,
}

impl Address {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Map a user key into the store's namespace
pub fn user_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

/// Rendezvous key for one participant
pub fn init_key(participant: &str) -> String {
    format!("{INIT_PREFIX}{participant}")
}

/// True for keys reserved for rendezvous bookkeeping
pub fn is_internal_key(key: &str) -> bool {
    key.starts_with(INIT_PREFIX)
}

/// Deadline for a blocking call; `None` when the timeout is zero (no deadline)
pub fn deadline_after(timeout: Duration) -> Option<Instant> {
    if timeout.is_zero() {
        None
    } else {
        Some(Instant::now() + timeout)
    }
}

/// Parse a stored counter; absent values count as zero
pub fn parse_counter(value: Option<&[u8]>) -> Option<i64> {
    match value {
        None => Some(0),
        Some(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
    }
}

/// Encode a counter the way `add` stores it
pub fn encode_counter(value: i64) -> Value {
    value.to_string().into_bytes()
}
