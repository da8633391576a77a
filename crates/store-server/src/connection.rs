//! Per-connection handling
//!
//! Each accepted socket runs a reader loop (this module) and a writer task
//! draining an unbounded outbound queue. The first frame fixes the role of
//! the connection: request traffic or watch traffic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use store_core::protocol::{
    ClientMessage, ConnectionRole, RequestFrame, ResponseFrame, ServerCodec, ServerMessage,
    PROTOCOL_VERSION,
};
use store_core::{ConnectionId, Error, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::{Outcome, StoreState};

type ServerFramed = Framed<TcpStream, ServerCodec>;
type FrameStream = futures::stream::SplitStream<ServerFramed>;

/// Settings a connection needs from the server
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
}

/// Serve one accepted connection until it closes or `cancel` fires
pub(crate) async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    connection_id: ConnectionId,
    state: Arc<StoreState>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) -> Result<()> {
    let mut framed = Framed::new(stream, ServerCodec::new(settings.max_frame_size));

    let role = match tokio::time::timeout(settings.handshake_timeout, framed.next()).await {
        Err(_) => {
            return Err(Error::Timeout {
                operation: "handshake".to_string(),
                timeout_ms: settings.handshake_timeout.as_millis() as u64,
            })
        }
        Ok(None) => return Ok(()),
        Ok(Some(frame)) => match frame? {
            ClientMessage::Hello { role, version } if version == PROTOCOL_VERSION => role,
            ClientMessage::Hello { version, .. } => {
                let reason = format!(
                    "protocol version {version} not supported (server speaks {PROTOCOL_VERSION})"
                );
                framed
                    .send(ServerMessage::Rejected {
                        reason: reason.clone(),
                    })
                    .await?;
                return Err(Error::protocol(reason));
            }
            other => {
                return Err(Error::protocol(format!(
                    "expected hello, got {other:?}"
                )))
            }
        },
    };

    framed.send(ServerMessage::HelloAck { connection_id }).await?;
    debug!(connection_id, peer = %peer_addr, ?role, "Connection established");

    let (mut sink, frames) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!(connection_id, error = %e, "Write failed, closing connection");
                break;
            }
        }
    });

    // Cancels parked requests of this connection once the reader loop exits.
    let connection_cancel = cancel.child_token();
    let cancel_on_exit = connection_cancel.clone().drop_guard();

    let result = match role {
        ConnectionRole::Requests => {
            request_loop(connection_id, frames, &state, tx, &connection_cancel).await
        }
        ConnectionRole::Watches => {
            state.attach_watcher(connection_id, tx);
            let result = watch_loop(connection_id, frames, &state, &connection_cancel).await;
            state.detach_watcher(connection_id);
            result
        }
    };

    // All senders are gone once parked requests observe the cancellation.
    drop(cancel_on_exit);
    let _ = writer.await;

    info!(connection_id, peer = %peer_addr, ?role, "Connection closed");
    result
}

async fn request_loop(
    connection_id: ConnectionId,
    mut frames: FrameStream,
    state: &Arc<StoreState>,
    tx: mpsc::UnboundedSender<ServerMessage>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = frames.next() => frame,
        };

        let RequestFrame { seq, request } = match frame {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(ClientMessage::Request(frame))) => frame,
            Some(Ok(other)) => {
                return Err(Error::protocol(format!(
                    "unexpected message on request connection: {other:?}"
                )))
            }
        };

        debug!(connection_id, seq, op = request.name(), "Request");

        match state.apply(&request) {
            Outcome::Ready(reply) => {
                if tx
                    .send(ServerMessage::Response(ResponseFrame { seq, reply }))
                    .is_err()
                {
                    return Ok(());
                }
            }
            Outcome::Park => {
                let state = state.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(connection_id, seq, "Parked request dropped with its connection");
                        }
                        reply = state.resolve(request) => {
                            let _ = tx.send(ServerMessage::Response(ResponseFrame { seq, reply }));
                        }
                    }
                });
            }
        }
    }
}

async fn watch_loop(
    connection_id: ConnectionId,
    mut frames: FrameStream,
    state: &Arc<StoreState>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = frames.next() => frame,
        };

        match frame {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(ClientMessage::Watch { seq, key })) => {
                state.watch(connection_id, seq, &key)?;
            }
            Some(Ok(other)) => {
                warn!(connection_id, "Unexpected message on watch connection");
                return Err(Error::protocol(format!(
                    "unexpected message on watch connection: {other:?}"
                )));
            }
        }
    }
}
