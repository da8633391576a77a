//! Watch channel
//!
//! A dedicated connection that only registers watches and receives change
//! notifications. The caller side writes registrations to the socket; a
//! long-lived worker task owns the callback table and reads every frame the
//! server sends on this connection.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use store_core::protocol::{ClientMessage, ConnectionRole, ServerMessage, WatchEvent};
use store_core::{Address, ConnectionId, Error, NetworkConfig, Result, WatchKeyCallback};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::connect::{self, ClientFramed};

/// Invoked once when the watch connection breaks
pub type FailureCallback = Arc<dyn Fn(&Error) + Send + Sync>;

enum Command {
    Register {
        seq: u64,
        key: String,
        callback: WatchKeyCallback,
        installed: oneshot::Sender<()>,
        acked: oneshot::Sender<Result<()>>,
    },
    /// The caller gave up on a registration
    Cancel { seq: u64, key: String },
}

/// Registration waiting for the server's ack
struct PendingWatch {
    key: String,
    callback: WatchKeyCallback,
    acked: oneshot::Sender<Result<()>>,
}

/// Withdraws a registration unless disarmed, so a timed out or dropped
/// `register_watch` never leaves a live callback behind.
struct CancelOnDrop<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    seq: u64,
    key: &'a str,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.commands.send(Command::Cancel {
                seq: self.seq,
                key: self.key.to_string(),
            });
        }
    }
}

/// Client side of the watch connection
pub struct CallbackClient {
    address: Address,
    connection_id: ConnectionId,
    sink: Mutex<SplitSink<ClientFramed, ClientMessage>>,
    commands: mpsc::UnboundedSender<Command>,
    next_seq: AtomicU64,
    broken: Arc<AtomicBool>,
    ack_timeout: Duration,
    _shutdown: DropGuard,
}

impl CallbackClient {
    /// Open the watch connection and start its worker
    pub async fn connect(
        address: Address,
        network: &NetworkConfig,
        ack_timeout: Duration,
        on_failure: Option<FailureCallback>,
    ) -> Result<Self> {
        let (framed, connection_id) =
            connect::open(&address, network, ConnectionRole::Watches).await?;
        let (sink, frames) = framed.split();

        let (commands, rx) = mpsc::unbounded_channel();
        let broken = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let worker = Worker {
            connection_id,
            callbacks: HashMap::new(),
            pending: HashMap::new(),
            broken: broken.clone(),
            on_failure,
        };
        tokio::spawn(worker.run(frames, rx, cancel.clone()));

        Ok(Self {
            address,
            connection_id,
            sink: Mutex::new(sink),
            commands,
            next_seq: AtomicU64::new(1),
            broken,
            ack_timeout,
            _shutdown: cancel.drop_guard(),
        })
    }

    /// Identifier the server assigned to this connection
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Whether the connection has failed
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    fn broken_error(&self) -> Error {
        Error::connection(self.address.to_string(), "watch connection is broken")
    }

    /// Register `callback` for changes to `key`.
    ///
    /// Returns once the worker holds the callback and the server has
    /// acknowledged the watch. The callback goes live at the ack: changes
    /// applied after it are delivered, earlier ones are not. On error the
    /// callback is withdrawn.
    pub async fn register_watch(&self, key: &str, callback: WatchKeyCallback) -> Result<()> {
        if self.is_broken() {
            return Err(self.broken_error());
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (installed_tx, installed_rx) = oneshot::channel();
        let (acked_tx, acked_rx) = oneshot::channel();

        self.commands
            .send(Command::Register {
                seq,
                key: key.to_string(),
                callback,
                installed: installed_tx,
                acked: acked_tx,
            })
            .map_err(|_| self.broken_error())?;

        let mut cancel = CancelOnDrop {
            commands: &self.commands,
            seq,
            key,
            armed: true,
        };

        installed_rx.await.map_err(|_| self.broken_error())?;

        self.sink
            .lock()
            .await
            .send(ClientMessage::Watch {
                seq,
                key: key.to_string(),
            })
            .await
            .map_err(|e| Error::connection(self.address.to_string(), e.to_string()))?;

        match tokio::time::timeout(self.ack_timeout, acked_rx).await {
            Ok(Ok(Ok(()))) => {
                cancel.armed = false;
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(self.broken_error()),
            Err(_) => {
                warn!(key = %key, seq, "Watch not acknowledged in time, withdrawing");
                Err(Error::Timeout {
                    operation: "watch_key".to_string(),
                    timeout_ms: self.ack_timeout.as_millis() as u64,
                })
            }
        }
    }
}

/// Owns the callback table for one watch connection
struct Worker {
    connection_id: ConnectionId,
    /// key -> live callbacks, tagged with the seq that registered them
    callbacks: HashMap<String, Vec<(u64, WatchKeyCallback)>>,
    pending: HashMap<u64, PendingWatch>,
    broken: Arc<AtomicBool>,
    on_failure: Option<FailureCallback>,
}

impl Worker {
    async fn run(
        mut self,
        mut frames: SplitStream<ClientFramed>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) {
        let failure = loop {
            // Commands first: a withdrawal queued before a frame arrived
            // must apply before that frame is dispatched.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break None,
                },
                frame = frames.next() => match frame {
                    Some(Ok(ServerMessage::WatchAck { seq })) => self.acknowledge(seq),
                    Some(Ok(ServerMessage::Notification(event))) => self.dispatch(event),
                    Some(Ok(other)) => {
                        break Some(Error::protocol(format!(
                            "unexpected message on watch connection: {other:?}"
                        )))
                    }
                    Some(Err(e)) => break Some(e),
                    None => break Some(Error::ChannelClosed {
                        channel: format!("watch-{}", self.connection_id),
                    }),
                },
            }
        };

        match failure {
            Some(e) => self.fail(e),
            None => debug!(connection_id = self.connection_id, "Watch worker stopped"),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                seq,
                key,
                callback,
                installed,
                acked,
            } => {
                self.pending.insert(
                    seq,
                    PendingWatch {
                        key,
                        callback,
                        acked,
                    },
                );
                let _ = installed.send(());
            }
            Command::Cancel { seq, key } => {
                self.pending.remove(&seq);
                if let Some(callbacks) = self.callbacks.get_mut(&key) {
                    callbacks.retain(|(registered, _)| *registered != seq);
                    if callbacks.is_empty() {
                        self.callbacks.remove(&key);
                    }
                }
                debug!(connection_id = self.connection_id, seq, key = %key, "Watch withdrawn");
            }
        }
    }

    /// The server installed the watch; notifications for the key that
    /// arrive from here on reach the new callback.
    fn acknowledge(&mut self, seq: u64) {
        match self.pending.remove(&seq) {
            Some(PendingWatch {
                key,
                callback,
                acked,
            }) => {
                self.callbacks.entry(key).or_default().push((seq, callback));
                let _ = acked.send(Ok(()));
            }
            None => debug!(connection_id = self.connection_id, seq, "Ack for unknown watch"),
        }
    }

    fn dispatch(&self, event: WatchEvent) {
        let Some(callbacks) = self.callbacks.get(&event.key) else {
            debug!(key = %event.key, "Notification for key without callbacks");
            return;
        };

        for (_, callback) in callbacks {
            let old_value = event.old_value.clone();
            let new_value = event.new_value.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(old_value, new_value))).is_err() {
                error!(key = %event.key, "Watch callback panicked");
            }
        }
    }

    fn fail(mut self, e: Error) {
        self.broken.store(true, Ordering::SeqCst);
        warn!(
            connection_id = self.connection_id,
            pending = self.pending.len(),
            error = %e,
            "Watch connection lost"
        );

        for (_, pending) in self.pending.drain() {
            let _ = pending.acked.send(Err(Error::ChannelClosed {
                channel: format!("watch-{}", self.connection_id),
            }));
        }

        if let Some(on_failure) = self.on_failure.take() {
            info!(connection_id = self.connection_id, "Invoking watch failure callback");
            on_failure(&e);
        }
    }
}
