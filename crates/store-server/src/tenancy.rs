//! Process-wide registry of multi-tenant servers
//!
//! Stores created with `multi_tenant = true` in the same process share one
//! server per port. The registry only holds weak references, so the server
//! goes away with its last store.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use store_core::Result;
use tokio::sync::Mutex;
use tracing::info;

use crate::server::{ServerConfig, StoreServer};

static TENANTS: OnceLock<Mutex<HashMap<u16, Weak<StoreServer>>>> = OnceLock::new();

fn tenants() -> &'static Mutex<HashMap<u16, Weak<StoreServer>>> {
    TENANTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Get a server for `config`.
///
/// Without multi-tenancy a fresh server is bound, failing with a
/// configuration error if the endpoint is taken. With multi-tenancy a live
/// server on the same port is reused.
pub async fn acquire_server(config: ServerConfig, multi_tenant: bool) -> Result<Arc<StoreServer>> {
    if !multi_tenant {
        return StoreServer::start(config).await;
    }

    let mut registry = tenants().lock().await;
    registry.retain(|_, server| server.strong_count() > 0);

    if config.port != 0 {
        if let Some(server) = registry.get(&config.port).and_then(Weak::upgrade) {
            if !server.is_shutdown() {
                info!(port = config.port, "Reusing multi-tenant store server");
                return Ok(server);
            }
        }
    }

    let server = StoreServer::start(config).await?;
    registry.insert(server.port(), Arc::downgrade(&server));
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".to_string(),
            port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_multi_tenant_shares_server() {
        let first = acquire_server(config(0), true).await.unwrap();
        let second = acquire_server(config(first.port()), true).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_single_tenant_rejects_bound_port() {
        let first = acquire_server(config(0), true).await.unwrap();
        let err = acquire_server(config(first.port()), false)
            .await
            .err()
            .expect("bound port must be rejected");
        assert_eq!(err.kind(), store_core::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_registry_forgets_dropped_servers() {
        let port = {
            let server = acquire_server(config(0), true).await.unwrap();
            server.port()
        };
        // Give the accept loop a moment to release the socket.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let fresh = acquire_server(config(port), true).await.unwrap();
        assert_eq!(fresh.port(), port);
        assert_eq!(fresh.num_keys(), 0);
    }
}
