//! Authoritative key-value state
//!
//! A single mutex guards the entry map, the watch registry and every waiter
//! list. Requests that cannot complete yet register a `oneshot` waiter under
//! the lock, release it, and re-check once woken or time out.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use store_core::protocol::{Reply, Request, ServerMessage, WatchEvent};
use store_core::{
    deadline_after, encode_counter, is_internal_key, parse_counter, ConnectionId, Error, Result,
    Value,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Outbound queue of a watch connection
pub type WatchSender = mpsc::UnboundedSender<ServerMessage>;

/// What `apply` could do with a request without waiting
#[derive(Debug)]
pub enum Outcome {
    /// The request completed
    Ready(Reply),

    /// The request has to wait; resolve it with [`StoreState::resolve`]
    Park,
}

#[derive(Default)]
struct KvState {
    /// Stored entries
    entries: HashMap<String, Value>,

    /// Parked `get`/`wait` requests keyed by the key they wait on
    key_waiters: HashMap<String, Vec<oneshot::Sender<()>>>,

    /// Rendezvous keys ever created
    worker_keys: HashSet<String>,

    /// Parked `wait_for_workers` requests
    worker_waiters: Vec<oneshot::Sender<()>>,

    /// key -> watch connections interested in it
    watchers: HashMap<String, HashSet<ConnectionId>>,

    /// Outbound queues of live watch connections
    watch_channels: HashMap<ConnectionId, WatchSender>,
}

impl KvState {
    /// Store `value`, wake waiters, notify watchers; returns the previous value
    fn write(&mut self, key: &str, value: Value) -> Option<Value> {
        let old = self.entries.insert(key.to_string(), value.clone());

        if old.is_none() {
            if is_internal_key(key) {
                self.observe_worker(key);
            }
            self.wake_key(key);
        }

        self.notify(key, old.clone(), Some(value));
        old
    }

    fn remove(&mut self, key: &str) -> Option<Value> {
        let old = self.entries.remove(key)?;
        self.notify(key, Some(old.clone()), None);
        Some(old)
    }

    fn observe_worker(&mut self, key: &str) {
        if self.worker_keys.insert(key.to_string()) {
            info!(key = %key, workers = self.worker_keys.len(), "Worker joined");
            for waiter in self.worker_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn wake_key(&mut self, key: &str) {
        if let Some(waiters) = self.key_waiters.remove(key) {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }

    fn notify(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        let Some(connections) = self.watchers.get(key) else {
            return;
        };

        for connection_id in connections {
            if let Some(tx) = self.watch_channels.get(connection_id) {
                let event = WatchEvent {
                    key: key.to_string(),
                    old_value: old_value.clone(),
                    new_value: new_value.clone(),
                };
                if tx.send(ServerMessage::Notification(event)).is_err() {
                    debug!(connection_id, key = %key, "Watch channel closed, dropping notification");
                }
            }
        }
    }

    fn park_on_key(&mut self, key: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let waiters = self.key_waiters.entry(key.to_string()).or_default();
        waiters.retain(|w| !w.is_closed());
        waiters.push(tx);
        rx
    }

    fn park_on_workers(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.worker_waiters.retain(|w| !w.is_closed());
        self.worker_waiters.push(tx);
        rx
    }

    /// Drop waiters whose request gave up, and empty waiter lists
    fn prune_waiters(&mut self) {
        self.key_waiters.retain(|_, waiters| {
            waiters.retain(|w| !w.is_closed());
            !waiters.is_empty()
        });
        self.worker_waiters.retain(|w| !w.is_closed());
    }

    fn first_missing<'a>(&self, keys: &'a [String]) -> Option<&'a String> {
        keys.iter().find(|k| !self.entries.contains_key(k.as_str()))
    }
}

/// Prunes abandoned waiters when a parked request times out or is dropped.
///
/// Declared before the waiter's receiver so the receiver is already gone,
/// and its sender closed, when this runs.
struct PruneOnExit<'a> {
    inner: &'a Mutex<KvState>,
    armed: bool,
}

impl Drop for PruneOnExit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock().prune_waiters();
        }
    }
}

/// Shared, thread-safe store state
#[derive(Default)]
pub struct StoreState {
    inner: Mutex<KvState>,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconditionally insert or overwrite `key`
    pub fn set(&self, key: &str, value: Value) {
        self.inner.lock().write(key, value);
    }

    /// Compare-and-set; returns the value stored after the operation.
    ///
    /// An absent key matches an empty `expected`. When the key is absent and
    /// does not match, nothing is stored and an empty value is returned.
    pub fn compare_set(&self, key: &str, expected: &[u8], desired: Value) -> Value {
        let mut state = self.inner.lock();
        match state.entries.get(key).cloned() {
            None if expected.is_empty() => {
                state.write(key, desired.clone());
                desired
            }
            None => Value::new(),
            Some(current) if current == expected => {
                if current != desired {
                    state.write(key, desired.clone());
                }
                desired
            }
            Some(current) => current,
        }
    }

    /// Non-blocking read
    pub fn try_get(&self, key: &str) -> Option<Value> {
        self.inner.lock().entries.get(key).cloned()
    }

    /// Atomically add `delta` to the integer at `key`
    pub fn add(&self, key: &str, delta: i64) -> Result<i64> {
        let mut state = self.inner.lock();
        let current =
            parse_counter(state.entries.get(key).map(Vec::as_slice)).ok_or_else(|| {
                Error::InvalidValue {
                    key: key.to_string(),
                    message: "stored value is not a base-10 integer".to_string(),
                }
            })?;
        let updated = current.checked_add(delta).ok_or_else(|| Error::InvalidValue {
            key: key.to_string(),
            message: format!("adding {delta} to {current} overflows"),
        })?;

        state.write(key, encode_counter(updated));
        Ok(updated)
    }

    /// Remove `key`; returns whether it existed
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// True iff every key exists
    pub fn check(&self, keys: &[String]) -> bool {
        self.inner.lock().first_missing(keys).is_none()
    }

    /// Number of stored keys outside the rendezvous namespace
    pub fn num_keys(&self) -> i64 {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|k| !is_internal_key(k))
            .count() as i64
    }

    /// Number of distinct participants that ever joined
    pub fn num_workers(&self) -> u64 {
        self.inner.lock().worker_keys.len() as u64
    }

    /// Number of (key, connection) watch registrations
    pub fn num_watchers(&self) -> usize {
        self.inner.lock().watchers.values().map(HashSet::len).sum()
    }

    /// Read `key`, parking until it exists or `timeout` elapses (zero = forever)
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Value> {
        self.park_until("get", timeout, |state| match state.entries.get(key) {
            Some(value) => Ok(value.clone()),
            None => Err(state.park_on_key(key)),
        })
        .await
    }

    /// Park until every key exists or `timeout` elapses (zero = forever)
    pub async fn wait(&self, keys: &[String], timeout: Duration) -> Result<()> {
        self.park_until("wait", timeout, |state| match state.first_missing(keys) {
            Some(missing) => Err(state.park_on_key(missing)),
            None => Ok(()),
        })
        .await
    }

    /// Park until at least `expected` participants joined
    pub async fn wait_for_workers(&self, expected: u64, timeout: Duration) -> Result<()> {
        self.park_until("wait_for_workers", timeout, |state| {
            if state.worker_keys.len() as u64 >= expected {
                Ok(())
            } else {
                Err(state.park_on_workers())
            }
        })
        .await
    }

    async fn park_until<T>(
        &self,
        operation: &str,
        timeout: Duration,
        mut poll: impl FnMut(&mut KvState) -> std::result::Result<T, oneshot::Receiver<()>>,
    ) -> Result<T> {
        let deadline = deadline_after(timeout);
        let mut prune = PruneOnExit {
            inner: &self.inner,
            armed: true,
        };

        loop {
            let polled = {
                let mut state = self.inner.lock();
                poll(&mut *state)
            };
            let woken = match polled {
                Ok(value) => {
                    prune.armed = false;
                    return Ok(value);
                }
                Err(woken) => woken,
            };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, woken).await.is_err() {
                        debug!(operation, timeout_ms = timeout.as_millis() as u64, "Wait timed out");
                        return Err(Error::Timeout {
                            operation: operation.to_string(),
                            timeout_ms: timeout.as_millis() as u64,
                        });
                    }
                }
                None => {
                    let _ = woken.await;
                }
            }
        }
    }

    /// Apply a request if it can complete without waiting
    pub fn apply(&self, request: &Request) -> Outcome {
        let reply = match request {
            Request::Set { key, value } => {
                self.set(key, value.clone());
                Reply::Done
            }
            Request::CompareSet {
                key,
                expected,
                desired,
            } => Reply::Value(self.compare_set(key, expected, desired.clone())),
            Request::Get { key, .. } => match self.try_get(key) {
                Some(value) => Reply::Value(value),
                None => return Outcome::Park,
            },
            Request::Add { key, delta } => match self.add(key, *delta) {
                Ok(value) => Reply::Integer(value),
                Err(e) => Reply::Error(e.to_wire()),
            },
            Request::Delete { key } => Reply::Bool(self.delete(key)),
            Request::Check { keys } => Reply::Bool(self.check(keys)),
            Request::NumKeys => Reply::Integer(self.num_keys()),
            Request::Wait { keys, .. } => {
                if self.check(keys) {
                    Reply::Done
                } else {
                    return Outcome::Park;
                }
            }
            Request::WaitForWorkers { expected, .. } => {
                if self.num_workers() >= *expected {
                    Reply::Done
                } else {
                    return Outcome::Park;
                }
            }
        };

        Outcome::Ready(reply)
    }

    /// Resolve a request, waiting if necessary
    pub async fn resolve(&self, request: Request) -> Reply {
        let timeout = request.server_timeout().unwrap_or_default();
        let result = match &request {
            Request::Get { key, .. } => self.get(key, timeout).await.map(Reply::Value),
            Request::Wait { keys, .. } => self.wait(keys, timeout).await.map(|_| Reply::Done),
            Request::WaitForWorkers { expected, .. } => self
                .wait_for_workers(*expected, timeout)
                .await
                .map(|_| Reply::Done),
            other => match self.apply(other) {
                Outcome::Ready(reply) => Ok(reply),
                Outcome::Park => Err(Error::Internal {
                    message: format!("{} cannot park", other.name()),
                }),
            },
        };

        result.unwrap_or_else(|e| Reply::Error(e.to_wire()))
    }

    /// Attach the outbound queue of a new watch connection
    pub fn attach_watcher(&self, connection_id: ConnectionId, tx: WatchSender) {
        self.inner.lock().watch_channels.insert(connection_id, tx);
    }

    /// Install a watch on `key` and acknowledge it on the connection's queue.
    ///
    /// The acknowledgement is queued under the lock, so every change applied
    /// after installation reaches the watcher after the ack.
    pub fn watch(&self, connection_id: ConnectionId, seq: u64, key: &str) -> Result<()> {
        let mut state = self.inner.lock();
        let tx = state
            .watch_channels
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| Error::Internal {
                message: format!("connection {connection_id} is not a watch connection"),
            })?;

        state
            .watchers
            .entry(key.to_string())
            .or_default()
            .insert(connection_id);

        tx.send(ServerMessage::WatchAck { seq })
            .map_err(|_| Error::ChannelClosed {
                channel: format!("watch-{connection_id}"),
            })?;

        debug!(connection_id, key = %key, "Watch registered");
        Ok(())
    }

    /// Drop every watch held by a connection
    pub fn detach_watcher(&self, connection_id: ConnectionId) {
        let mut state = self.inner.lock();
        state.watch_channels.remove(&connection_id);

        let mut removed = 0usize;
        state.watchers.retain(|_, connections| {
            if connections.remove(&connection_id) {
                removed += 1;
            }
            !connections.is_empty()
        });

        if removed > 0 {
            warn!(connection_id, removed, "Watch connection closed, watches unregistered");
        }
    }
}
