//! TCP server with graceful shutdown
//!
//! Binds the listening endpoint, accepts connections and hands each one to
//! its own task. Shutdown (explicit or on drop) cancels the accept loop and
//! every live connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use store_core::{Error, Result, StoreOptions, DEFAULT_PORT};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{serve_connection, ConnectionSettings};
use crate::state::StoreState;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind
    pub bind_address: String,

    /// Port to bind; 0 picks an ephemeral port
    pub port: u16,

    /// Maximum frame size in bytes
    pub max_frame_size: usize,

    /// Disable Nagle on accepted sockets
    pub tcp_nodelay: bool,

    /// How long a new connection may take to send its hello
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_frame_size: 64 * 1024 * 1024, // 64MB
            tcp_nodelay: true,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl From<&StoreOptions> for ServerConfig {
    fn from(options: &StoreOptions) -> Self {
        Self {
            bind_address: options.bind_address.clone(),
            port: options.port,
            max_frame_size: options.network.max_frame_size,
            tcp_nodelay: options.network.tcp_nodelay,
            ..Default::default()
        }
    }
}

/// Point-in-time view of the server
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub address: String,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub num_keys: i64,
    pub num_workers: u64,
    pub num_watchers: usize,
    pub num_connections: usize,
}

/// The authoritative store server
pub struct StoreServer {
    local_addr: SocketAddr,
    state: Arc<StoreState>,
    connections: Arc<AtomicUsize>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
    start_time: Instant,
}

impl StoreServer {
    /// Bind and start serving.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the endpoint is already bound.
    pub async fn start(config: ServerConfig) -> Result<Arc<Self>> {
        let bind = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&bind).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::InvalidConfig {
                    message: format!("{bind} is already bound by another store server"),
                }
            } else {
                Error::Io(e)
            }
        })?;
        let local_addr = listener.local_addr()?;

        let server = Arc::new(Self {
            local_addr,
            state: Arc::new(StoreState::new()),
            connections: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            started_at: Utc::now(),
            start_time: Instant::now(),
        });

        info!(address = %local_addr, "Store server listening");

        tokio::spawn(accept_loop(
            listener,
            server.state.clone(),
            server.connections.clone(),
            config,
            server.cancel.clone(),
        ));

        Ok(server)
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port (the real one when started on port 0)
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Shared state, for in-process inspection
    pub fn state(&self) -> &Arc<StoreState> {
        &self.state
    }

    pub fn num_keys(&self) -> i64 {
        self.state.num_keys()
    }

    pub fn num_workers(&self) -> u64 {
        self.state.num_workers()
    }

    pub fn num_watchers(&self) -> usize {
        self.state.num_watchers()
    }

    /// Currently open connections
    pub fn num_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            address: self.local_addr.to_string(),
            started_at: self.started_at,
            uptime_secs: self.uptime().as_secs(),
            num_keys: self.num_keys(),
            num_workers: self.num_workers(),
            num_watchers: self.num_watchers(),
            num_connections: self.num_connections(),
        }
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(address = %self.local_addr, "Store server shutting down");
            self.cancel.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<StoreState>,
    connections: Arc<AtomicUsize>,
    config: ServerConfig,
    cancel: CancellationToken,
) {
    let next_id = AtomicU64::new(1);
    let settings = ConnectionSettings {
        max_frame_size: config.max_frame_size,
        handshake_timeout: config.handshake_timeout,
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer_addr)) => {
                        if config.tcp_nodelay {
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                            }
                        }

                        let connection_id = next_id.fetch_add(1, Ordering::Relaxed);
                        debug!(connection_id, peer = %peer_addr, "Accepted connection");

                        let state = state.clone();
                        let connections = connections.clone();
                        let settings = settings.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            connections.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = serve_connection(
                                stream,
                                peer_addr,
                                connection_id,
                                state,
                                settings,
                                cancel,
                            )
                            .await
                            {
                                warn!(connection_id, peer = %peer_addr, error = %e, "Connection ended with error");
                            }
                            connections.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = cancel.cancelled() => {
                info!("Accept loop stopped");
                break;
            }
        }
    }
}
