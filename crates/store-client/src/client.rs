//! Synchronous request channel
//!
//! One connection carries every non-watch operation. Requests are tagged
//! with a sequence number; a reader task routes each response to the caller
//! waiting on that sequence, so concurrent callers may share the client.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use store_core::protocol::{
    ClientMessage, ConnectionRole, Reply, Request, RequestFrame, ServerMessage,
};
use store_core::{Address, ConnectionId, Error, NetworkConfig, Result, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, instrument, warn};

use crate::connect::{self, ClientFramed};

type PendingMap = DashMap<u64, oneshot::Sender<Reply>>;

/// Request/response connection to the store server
pub struct Client {
    address: Address,
    connection_id: ConnectionId,
    next_seq: AtomicU64,
    pending: Arc<PendingMap>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
    response_grace: Duration,
    _shutdown: DropGuard,
}

impl Client {
    /// Connect to `address`.
    ///
    /// `request_timeout` bounds requests that never park on the server.
    pub async fn connect(
        address: Address,
        network: &NetworkConfig,
        request_timeout: Duration,
    ) -> Result<Self> {
        let (framed, connection_id) =
            connect::open(&address, network, ConnectionRole::Requests).await?;

        let pending = Arc::new(PendingMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let (outbound, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::io_loop(
            framed,
            rx,
            pending.clone(),
            closed.clone(),
            cancel.clone(),
            connection_id,
        ));

        Ok(Self {
            address,
            connection_id,
            next_seq: AtomicU64::new(1),
            pending,
            outbound,
            closed,
            request_timeout,
            response_grace: network.response_grace,
            _shutdown: cancel.drop_guard(),
        })
    }

    /// Drives the socket: writes queued requests, routes responses
    async fn io_loop(
        framed: ClientFramed,
        mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
        pending: Arc<PendingMap>,
        closed: Arc<AtomicBool>,
        cancel: CancellationToken,
        connection_id: ConnectionId,
    ) {
        let (mut sink, mut frames) = framed.split();

        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "client dropped".to_string(),
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            break format!("write failed: {e}");
                        }
                    }
                    None => break "client dropped".to_string(),
                },
                frame = frames.next() => match frame {
                    Some(Ok(ServerMessage::Response(response))) => {
                        match pending.remove(&response.seq) {
                            Some((_, tx)) => {
                                let _ = tx.send(response.reply);
                            }
                            None => {
                                debug!(connection_id, seq = response.seq, "Dropping response nobody waits for");
                            }
                        }
                    }
                    Some(Ok(other)) => break format!("unexpected message: {other:?}"),
                    Some(Err(e)) => break e.to_string(),
                    None => break "connection closed by server".to_string(),
                },
            }
        };

        // Mark closed before failing waiters so late callers see it.
        closed.store(true, Ordering::SeqCst);
        let failed = pending.len();
        pending.clear();

        if failed > 0 {
            warn!(connection_id, failed, reason = %reason, "Request connection lost with calls in flight");
        } else {
            debug!(connection_id, reason = %reason, "Request connection closed");
        }
    }

    /// Server address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Identifier the server assigned to this connection
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Whether the connection is gone
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> Error {
        Error::connection(self.address.to_string(), "connection closed")
    }

    /// Send one request and wait for its reply
    pub async fn call(&self, request: Request) -> Result<Reply> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let operation = request.name();
        // (requested timeout, local deadline); parking requests get a grace
        // period so the server's own timeout reply normally wins.
        let deadline = match request.server_timeout() {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some((timeout, timeout + self.response_grace)),
            None if self.request_timeout.is_zero() => None,
            None => Some((self.request_timeout, self.request_timeout)),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(self.closed_error());
        }

        if self
            .outbound
            .send(ClientMessage::Request(RequestFrame { seq, request }))
            .is_err()
        {
            self.pending.remove(&seq);
            return Err(self.closed_error());
        }

        let reply = match deadline {
            None => rx.await,
            Some((requested, deadline)) => match tokio::time::timeout(deadline, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.remove(&seq);
                    warn!(
                        operation,
                        timeout_ms = requested.as_millis() as u64,
                        grace_ms = (deadline - requested).as_millis() as u64,
                        "No reply before the local deadline"
                    );
                    return Err(Error::Timeout {
                        operation: operation.to_string(),
                        timeout_ms: requested.as_millis() as u64,
                    });
                }
            },
        };

        match reply {
            Ok(Reply::Error(e)) => Err(e.into_error(&self.address.to_string())),
            Ok(reply) => Ok(reply),
            Err(_) => Err(self.closed_error()),
        }
    }

    fn unexpected(&self, operation: &str, reply: Reply) -> Error {
        Error::protocol(format!("unexpected reply to {operation}: {reply:?}"))
    }

    #[instrument(skip(self, value), fields(len = value.len()))]
    pub async fn set(&self, key: &str, value: Value) -> Result<()> {
        match self
            .call(Request::Set {
                key: key.to_string(),
                value,
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(self.unexpected("set", other)),
        }
    }

    pub async fn compare_set(&self, key: &str, expected: Value, desired: Value) -> Result<Value> {
        match self
            .call(Request::CompareSet {
                key: key.to_string(),
                expected,
                desired,
            })
            .await?
        {
            Reply::Value(value) => Ok(value),
            other => Err(self.unexpected("compare_set", other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Value> {
        match self
            .call(Request::Get {
                key: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?
        {
            Reply::Value(value) => Ok(value),
            other => Err(self.unexpected("get", other)),
        }
    }

    pub async fn add(&self, key: &str, delta: i64) -> Result<i64> {
        match self
            .call(Request::Add {
                key: key.to_string(),
                delta,
            })
            .await?
        {
            Reply::Integer(value) => Ok(value),
            other => Err(self.unexpected("add", other)),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        match self
            .call(Request::Delete {
                key: key.to_string(),
            })
            .await?
        {
            Reply::Bool(existed) => Ok(existed),
            other => Err(self.unexpected("delete_key", other)),
        }
    }

    pub async fn check(&self, keys: Vec<String>) -> Result<bool> {
        match self.call(Request::Check { keys }).await? {
            Reply::Bool(all) => Ok(all),
            other => Err(self.unexpected("check", other)),
        }
    }

    pub async fn num_keys(&self) -> Result<i64> {
        match self.call(Request::NumKeys).await? {
            Reply::Integer(count) => Ok(count),
            other => Err(self.unexpected("num_keys", other)),
        }
    }

    #[instrument(skip(self))]
    pub async fn wait(&self, keys: Vec<String>, timeout: Duration) -> Result<()> {
        match self
            .call(Request::Wait {
                keys,
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(self.unexpected("wait", other)),
        }
    }

    pub async fn wait_for_workers(&self, expected: u64, timeout: Duration) -> Result<()> {
        match self
            .call(Request::WaitForWorkers {
                expected,
                timeout_ms: timeout.as_millis() as u64,
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(self.unexpected("wait_for_workers", other)),
        }
    }
}
