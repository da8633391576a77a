//! Store configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Port the store listens on when none is given
pub const DEFAULT_PORT: u16 = 29500;

/// Default deadline for blocking calls
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// A zero timeout means "wait forever"
pub const NO_TIMEOUT: Duration = Duration::ZERO;

/// Options accepted by the store constructor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// Port of the server (listen port when hosting)
    pub port: u16,

    /// Whether this process hosts the server
    pub is_server: bool,

    /// Number of participants the rendezvous barrier waits for
    pub num_workers: Option<usize>,

    /// Block construction until `num_workers` participants have joined
    pub wait_workers: bool,

    /// Default timeout for blocking calls
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Allow several stores in this process to share one listening endpoint
    pub multi_tenant: bool,

    /// Interface the server binds when hosting
    pub bind_address: String,

    /// Network settings
    pub network: NetworkConfig,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            is_server: false,
            num_workers: None,
            wait_workers: true,
            timeout: DEFAULT_TIMEOUT,
            multi_tenant: false,
            bind_address: "0.0.0.0".to_string(),
            network: NetworkConfig::default(),
        }
    }
}

impl StoreOptions {
    /// Options for the process that hosts the server
    pub fn server(port: u16) -> Self {
        Self {
            port,
            is_server: true,
            ..Default::default()
        }
    }

    /// Options for a participant connecting to an existing server
    pub fn client(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Set the rendezvous size
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = Some(num_workers);
        self
    }

    /// Set whether construction waits for all workers
    pub fn with_wait_workers(mut self, wait_workers: bool) -> Self {
        self.wait_workers = wait_workers;
        self
    }

    /// Set the default blocking timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set multi-tenancy
    pub fn with_multi_tenant(mut self, multi_tenant: bool) -> Self {
        self.multi_tenant = multi_tenant;
        self
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Timeout for a single connect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Extra time the client waits past a server-enforced timeout
    #[serde(with = "humantime_serde")]
    pub response_grace: Duration,

    /// Maximum frame size in bytes
    pub max_frame_size: usize,

    /// Disable Nagle on store sockets
    pub tcp_nodelay: bool,

    /// Connect retry configuration
    pub retry: RetryConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            response_grace: Duration::from_secs(5),
            max_frame_size: 64 * 1024 * 1024, // 64MB
            tcp_nodelay: true,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = StoreOptions::default();
        assert_eq!(options.port, 29500);
        assert!(!options.is_server);
        assert!(options.wait_workers);
        assert!(!options.multi_tenant);
        assert_eq!(options.timeout, Duration::from_secs(300));
        assert!(options.num_workers.is_none());
    }

    #[test]
    fn test_options_serialization() {
        let options = StoreOptions::server(1234).with_num_workers(4);
        let json = serde_json::to_string(&options).unwrap();
        let parsed: StoreOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.port, 1234);
        assert!(parsed.is_server);
        assert_eq!(parsed.num_workers, Some(4));
        assert_eq!(parsed.timeout, options.timeout);
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(10), Duration::from_secs(2));
    }
}
