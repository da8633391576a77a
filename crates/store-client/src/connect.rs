//! Connection setup shared by the request and watch channels

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use store_core::protocol::{ClientCodec, ClientMessage, ConnectionRole, ServerMessage, PROTOCOL_VERSION};
use store_core::{Address, ConnectionId, Error, NetworkConfig, Result, RetryConfig};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

pub(crate) type ClientFramed = Framed<TcpStream, ClientCodec>;

/// Connect and handshake, retrying transient failures with backoff
pub(crate) async fn open(
    address: &Address,
    network: &NetworkConfig,
    role: ConnectionRole,
) -> Result<(ClientFramed, ConnectionId)> {
    let mut attempt = 0u32;

    loop {
        match try_open(address, network, role).await {
            Ok(opened) => return Ok(opened),
            Err(e) if e.is_retryable() && attempt < network.retry.max_retries => {
                let delay = retry_delay(&network.retry, attempt);
                warn!(
                    address = %address,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Connect failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_open(
    address: &Address,
    network: &NetworkConfig,
    role: ConnectionRole,
) -> Result<(ClientFramed, ConnectionId)> {
    let connect = TcpStream::connect((address.host(), address.port()));
    let stream = tokio::time::timeout(network.connect_timeout, connect)
        .await
        .map_err(|_| Error::connection(address.to_string(), "connect timed out"))?
        .map_err(|e| Error::connection(address.to_string(), e.to_string()))?;

    if network.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(address = %address, error = %e, "Failed to set TCP_NODELAY");
        }
    }

    let mut framed = Framed::new(stream, ClientCodec::new(network.max_frame_size));
    framed
        .send(ClientMessage::Hello {
            role,
            version: PROTOCOL_VERSION,
        })
        .await
        .map_err(|e| Error::connection(address.to_string(), e.to_string()))?;

    let reply = tokio::time::timeout(network.connect_timeout, framed.next())
        .await
        .map_err(|_| Error::connection(address.to_string(), "handshake timed out"))?;

    match reply {
        Some(Ok(ServerMessage::HelloAck { connection_id })) => {
            debug!(address = %address, connection_id, ?role, "Connected");
            Ok((framed, connection_id))
        }
        Some(Ok(ServerMessage::Rejected { reason })) => Err(Error::protocol(reason)),
        Some(Ok(other)) => Err(Error::protocol(format!(
            "expected hello ack, got {other:?}"
        ))),
        Some(Err(e)) => Err(e),
        None => Err(Error::connection(
            address.to_string(),
            "connection closed during handshake",
        )),
    }
}

fn retry_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let base = retry.backoff(attempt);
    if retry.jitter {
        base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    } else {
        base
    }
}
