//! TCP-backed coordination store
//!
//! `TcpStore` is what participants hold. It optionally hosts the server,
//! opens a request connection and a watch connection, and joins the worker
//! rendezvous before handing control back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use store_core::{
    init_key, user_key, Address, Result, Store, StoreOptions, Value, WatchKeyCallback,
};
use store_server::{acquire_server, ServerConfig, StoreServer};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::callback::{CallbackClient, FailureCallback};
use crate::client::Client;

/// Builder for TcpStore
pub struct TcpStoreBuilder {
    host: String,
    options: StoreOptions,
    on_watch_failure: Option<FailureCallback>,
}

impl TcpStoreBuilder {
    /// Create a new builder targeting `host` with default options
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            options: StoreOptions::default(),
            on_watch_failure: None,
        }
    }

    /// Set the options
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = port;
        self
    }

    /// Host the server in this process
    pub fn is_server(mut self, is_server: bool) -> Self {
        self.options.is_server = is_server;
        self
    }

    /// Set the expected number of workers
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.options.num_workers = Some(num_workers);
        self
    }

    /// Set the default timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Called once if the watch connection breaks
    pub fn on_watch_failure(mut self, callback: FailureCallback) -> Self {
        self.on_watch_failure = Some(callback);
        self
    }

    /// Connect, join the rendezvous and return the store
    pub async fn build(self) -> Result<TcpStore> {
        TcpStore::connect(self.host, self.options, self.on_watch_failure).await
    }
}

/// Client handle onto a store server, optionally hosting it
pub struct TcpStore {
    address: Address,
    server: Option<Arc<StoreServer>>,
    client: Client,
    callback_client: CallbackClient,
    num_workers: Option<usize>,
    timeout: RwLock<Duration>,
    watch_lock: tokio::sync::Mutex<()>,
    participant: Uuid,
}

impl TcpStore {
    /// Create a store for `host` with `options`.
    ///
    /// # Errors
    /// - `InvalidConfig` if this store should host the server and the port is taken
    /// - `Connection` if the server cannot be reached
    /// - `Timeout` if the workers do not all join in time
    pub async fn new(host: impl Into<String>, options: StoreOptions) -> Result<Self> {
        Self::connect(host.into(), options, None).await
    }

    /// Builder for a store on `host`
    pub fn builder(host: impl Into<String>) -> TcpStoreBuilder {
        TcpStoreBuilder::new(host)
    }

    async fn connect(
        host: String,
        options: StoreOptions,
        on_watch_failure: Option<FailureCallback>,
    ) -> Result<Self> {
        let server = if options.is_server {
            Some(acquire_server(ServerConfig::from(&options), options.multi_tenant).await?)
        } else {
            None
        };

        let port = server.as_ref().map_or(options.port, |s| s.port());
        let address = Address::new(host, port);

        let client = Client::connect(address.clone(), &options.network, options.timeout).await?;
        let callback_client = CallbackClient::connect(
            address.clone(),
            &options.network,
            options.network.connect_timeout + options.network.response_grace,
            on_watch_failure,
        )
        .await?;

        let store = Self {
            address,
            server,
            client,
            callback_client,
            num_workers: options.num_workers,
            timeout: RwLock::new(options.timeout),
            watch_lock: tokio::sync::Mutex::new(()),
            participant: Uuid::new_v4(),
        };

        let workers = store
            .client
            .add(&init_key(&store.participant.to_string()), 1)
            .await?;
        info!(
            address = %store.address,
            participant = %store.participant,
            hosting = store.server.is_some(),
            joined = workers,
            "Joined store"
        );

        if options.wait_workers && store.num_workers.is_some() {
            store.wait_for_workers().await?;
        }

        Ok(store)
    }

    pub fn host(&self) -> &str {
        self.address.host()
    }

    /// Server port; the bound one when hosting on port 0
    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Default timeout for blocking operations
    pub fn timeout(&self) -> Duration {
        *self.timeout.read()
    }

    /// Change the default timeout; zero waits forever
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    pub fn num_workers(&self) -> Option<usize> {
        self.num_workers
    }

    /// The hosted server, if this store started one
    pub fn server(&self) -> Option<&Arc<StoreServer>> {
        self.server.as_ref()
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.client.set(&user_key(key), value).await
    }

    /// Read `key`, waiting up to the default timeout for it to be set
    pub async fn get(&self, key: &str) -> Result<Value> {
        self.client.get(&user_key(key), self.timeout()).await
    }

    pub async fn compare_set(&self, key: &str, expected: Value, desired: Value) -> Result<Value> {
        self.client.compare_set(&user_key(key), expected, desired).await
    }

    pub async fn add(&self, key: &str, delta: i64) -> Result<i64> {
        self.client.add(&user_key(key), delta).await
    }

    pub async fn delete_key(&self, key: &str) -> Result<bool> {
        self.client.delete(&user_key(key)).await
    }

    pub async fn check(&self, keys: &[String]) -> Result<bool> {
        self.client.check(prefixed(keys)).await
    }

    /// Number of user keys; rendezvous bookkeeping is not counted
    pub async fn num_keys(&self) -> Result<i64> {
        self.client.num_keys().await
    }

    pub async fn wait(&self, keys: &[String]) -> Result<()> {
        self.wait_timeout(keys, self.timeout()).await
    }

    pub async fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        self.client.wait(prefixed(keys), timeout).await
    }

    /// Register `callback` for future changes to `key`.
    ///
    /// Registrations are serialized. The callback runs on the watch worker;
    /// it must not call back into this store.
    #[instrument(skip(self, callback))]
    pub async fn watch_key(&self, key: &str, callback: WatchKeyCallback) -> Result<()> {
        let _serialized = self.watch_lock.lock().await;
        self.callback_client
            .register_watch(&user_key(key), callback)
            .await
    }

    /// Block until `num_workers` participants have joined; no-op when unset
    pub async fn wait_for_workers(&self) -> Result<()> {
        match self.num_workers {
            None => Ok(()),
            Some(expected) => {
                self.client
                    .wait_for_workers(expected as u64, self.timeout())
                    .await
            }
        }
    }
}

fn prefixed(keys: &[String]) -> Vec<String> {
    keys.iter().map(|k| user_key(k)).collect()
}

#[async_trait]
impl Store for TcpStore {
    async fn set(&self, key: &str, value: Value) -> Result<()> {
        TcpStore::set(self, key, value).await
    }

    async fn compare_set(&self, key: &str, expected: Value, desired: Value) -> Result<Value> {
        TcpStore::compare_set(self, key, expected, desired).await
    }

    async fn get(&self, key: &str) -> Result<Value> {
        TcpStore::get(self, key).await
    }

    async fn add(&self, key: &str, delta: i64) -> Result<i64> {
        TcpStore::add(self, key, delta).await
    }

    async fn delete_key(&self, key: &str) -> Result<bool> {
        TcpStore::delete_key(self, key).await
    }

    async fn check(&self, keys: &[String]) -> Result<bool> {
        TcpStore::check(self, keys).await
    }

    async fn num_keys(&self) -> Result<i64> {
        TcpStore::num_keys(self).await
    }

    async fn wait(&self, keys: &[String]) -> Result<()> {
        TcpStore::wait(self, keys).await
    }

    async fn wait_timeout(&self, keys: &[String], timeout: Duration) -> Result<()> {
        TcpStore::wait_timeout(self, keys, timeout).await
    }

    async fn watch_key(&self, key: &str, callback: WatchKeyCallback) -> Result<()> {
        TcpStore::watch_key(self, key, callback).await
    }
}
