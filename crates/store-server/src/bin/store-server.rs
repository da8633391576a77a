//! Store server binary entry point
//!
//! Usage: `store-server [PORT] [HTTP_PORT]`. Serves the store on PORT
//! (default 29500) and, when HTTP_PORT is given, the status API on it.

use std::net::SocketAddr;

use tokio::signal;

use store_server::{http_api, ServerConfig, StoreServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    store_core::init_tracing("store_server=info,store_core=info");

    let mut args = std::env::args().skip(1);
    let port: u16 = match args.next() {
        Some(arg) => arg.parse()?,
        None => store_core::DEFAULT_PORT,
    };
    let http_port: Option<u16> = args.next().map(|arg| arg.parse::<u16>()).transpose()?;

    let server = StoreServer::start(ServerConfig {
        port,
        ..Default::default()
    })
    .await?;

    if let Some(http_port) = http_port {
        let http_addr = SocketAddr::from(([0, 0, 0, 0], http_port));
        let router = http_api::create_router(server.clone());
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        tracing::info!("HTTP status API listening on {}", http_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "HTTP server stopped");
            }
        });
    }

    shutdown_signal().await;
    server.shutdown();

    tracing::info!("Store server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
