//! HTTP status API
//!
//! Read-only REST endpoints exposing server health and counters.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::server::{ServerStats, StoreServer};

/// Shared state for HTTP handlers
pub type AppState = Arc<StoreServer>;

/// Status payload
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    #[serde(flatten)]
    pub stats: ServerStats,
}

/// Create the HTTP API router
pub fn create_router(server: Arc<StoreServer>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        .layer(cors)
        .with_state(server)
}

/// Health check endpoint
async fn health_check(State(server): State<AppState>) -> impl IntoResponse {
    if server.is_shutdown() {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "shutting_down"})),
        )
    } else {
        (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
    }
}

/// Server status with counters
async fn get_status(State(server): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: server.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn fetch(port: u16, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let server = StoreServer::start(ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        })
        .await
        .unwrap();
        server.state().set("/a", b"1".to_vec());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_port = listener.local_addr().unwrap().port();
        let router = create_router(server.clone());
        tokio::spawn(async move { axum::serve(listener, router).await });

        let health = fetch(http_port, "/api/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#""status":"ok""#));

        let status = fetch(http_port, "/api/status").await;
        assert!(status.contains(r#""num_keys":1"#));

        server.shutdown();
        let health = fetch(http_port, "/api/health").await;
        assert!(health.starts_with("HTTP/1.1 503"));
    }
}
