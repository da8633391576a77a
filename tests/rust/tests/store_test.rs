use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use store_client::TcpStore;
use store_core::{ErrorKind, StoreOptions, Value};
use store_server::{ServerConfig, StoreServer};
use tokio::sync::mpsc;
use tokio::time::sleep;

const HOST: &str = "127.0.0.1";

fn free_port() -> u16 {
    portpicker::pick_unused_port().expect("No ports free")
}

// Hosting store plus a plain participant on the same port
async fn pair() -> Result<(TcpStore, TcpStore)> {
    // RUST_LOG=store_client=debug to see connection traffic
    store_core::init_tracing("warn");
    let port = free_port();
    let server = TcpStore::new(HOST, StoreOptions::server(port)).await?;
    let client = TcpStore::new(HOST, StoreOptions::client(port)).await?;
    Ok((server, client))
}

#[tokio::test]
async fn test_set_then_get_across_connections() -> Result<()> {
    let (server, client) = pair().await?;

    server.set("rank0/addr", b"10.0.0.1:4000".to_vec()).await?;
    assert_eq!(client.get("rank0/addr").await?, b"10.0.0.1:4000".to_vec());

    client.set("rank0/addr", b"10.0.0.2:4000".to_vec()).await?;
    assert_eq!(server.get("rank0/addr").await?, b"10.0.0.2:4000".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_get_blocks_until_set() -> Result<()> {
    let (server, client) = pair().await?;

    let reader = tokio::spawn(async move { client.get("late").await });
    sleep(Duration::from_millis(100)).await;
    assert!(!reader.is_finished());

    server.set("late", b"here".to_vec()).await?;
    assert_eq!(reader.await??, b"here".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_compare_set() -> Result<()> {
    let (store, _client) = pair().await?;

    // Absent key with a non-empty expectation: nothing is stored
    assert!(store.compare_set("k", b"a".to_vec(), b"b".to_vec()).await?.is_empty());
    assert!(!store.check(&["k".to_string()]).await?);

    // Absent key matches an empty expectation
    assert_eq!(store.compare_set("k", vec![], b"a".to_vec()).await?, b"a".to_vec());

    // Mismatch leaves the value alone and returns it
    assert_eq!(store.compare_set("k", b"x".to_vec(), b"b".to_vec()).await?, b"a".to_vec());

    // Match swaps
    assert_eq!(store.compare_set("k", b"a".to_vec(), b"b".to_vec()).await?, b"b".to_vec());
    assert_eq!(store.get("k").await?, b"b".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_add_accumulates_from_zero() -> Result<()> {
    let (server, client) = pair().await?;

    assert_eq!(server.add("counter", 5).await?, 5);
    assert_eq!(client.add("counter", -2).await?, 3);
    assert_eq!(server.get("counter").await?, b"3".to_vec());

    server.set("text", b"not a number".to_vec()).await?;
    let err = client.add("text", 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_adds_are_atomic() -> Result<()> {
    let port = free_port();
    let _server = TcpStore::new(HOST, StoreOptions::server(port)).await?;

    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(tokio::spawn(async move {
            let store = TcpStore::new(HOST, StoreOptions::client(port)).await?;
            for _ in 0..25 {
                store.add("hits", 1).await?;
            }
            Ok::<_, store_core::Error>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }

    let reader = TcpStore::new(HOST, StoreOptions::client(port)).await?;
    assert_eq!(reader.add("hits", 0).await?, 100);
    Ok(())
}

#[tokio::test]
async fn test_wait_times_out_without_creating_key() -> Result<()> {
    let (store, _client) = pair().await?;

    let started = Instant::now();
    let err = store
        .wait_timeout(&["never".to_string()], Duration::from_millis(100))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(!store.check(&["never".to_string()]).await?);
    assert_eq!(store.num_keys().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_wait_releases_when_all_keys_exist() -> Result<()> {
    let (server, client) = pair().await?;
    let keys = vec!["a".to_string(), "b".to_string()];

    let waiter = {
        let keys = keys.clone();
        tokio::spawn(async move { client.wait(&keys).await })
    };

    server.set("a", b"1".to_vec()).await?;
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    server.set("b", b"2".to_vec()).await?;
    waiter.await??;
    assert!(server.check(&keys).await?);
    Ok(())
}

#[tokio::test]
async fn test_watch_fires_exactly_once_per_change() -> Result<()> {
    let (watcher, writer) = pair().await?;

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let counter = calls.clone();
    watcher
        .watch_key(
            "status",
            Arc::new(move |old: Option<Value>, new: Option<Value>| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((old, new));
            }),
        )
        .await?;

    writer.set("status", b"ready".to_vec()).await?;

    let event = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?;
    assert_eq!(event, Some((None, Some(b"ready".to_vec()))));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_watch_sees_changes_in_order() -> Result<()> {
    let (watcher, writer) = pair().await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    watcher
        .watch_key(
            "step",
            Arc::new(move |_old: Option<Value>, new: Option<Value>| {
                let _ = tx.send(new);
            }),
        )
        .await?;

    for _ in 0..5 {
        writer.add("step", 1).await?;
    }
    writer.delete_key("step").await?;

    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await?.flatten());
    }

    let expected: Vec<Option<Value>> = (1..=5)
        .map(|n: i64| Some(n.to_string().into_bytes()))
        .chain(std::iter::once(None))
        .collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[tokio::test]
async fn test_second_watch_on_same_key() -> Result<()> {
    let (watcher, writer) = pair().await?;

    let first = Arc::new(std::sync::Mutex::new(Vec::new()));
    let second = Arc::new(std::sync::Mutex::new(Vec::new()));
    let record = |log: &Arc<std::sync::Mutex<Vec<Value>>>| {
        let log = log.clone();
        Arc::new(move |_old: Option<Value>, new: Option<Value>| {
            log.lock().unwrap().extend(new);
        })
    };

    watcher.watch_key("leader", record(&first)).await?;
    writer.set("leader", b"rank0".to_vec()).await?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while first.lock().unwrap().is_empty() && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }

    watcher.watch_key("leader", record(&second)).await?;
    writer.set("leader", b"rank1".to_vec()).await?;
    writer.set("leader", b"rank2".to_vec()).await?;

    let deadline = Instant::now() + Duration::from_secs(5);
    while second.lock().unwrap().len() < 2 && Instant::now() < deadline {
        sleep(Duration::from_millis(10)).await;
    }
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        *first.lock().unwrap(),
        vec![b"rank0".to_vec(), b"rank1".to_vec(), b"rank2".to_vec()]
    );
    assert_eq!(*second.lock().unwrap(), vec![b"rank1".to_vec(), b"rank2".to_vec()]);
    Ok(())
}

#[tokio::test]
async fn test_delete_key() -> Result<()> {
    let (store, _client) = pair().await?;

    store.set("gone", b"x".to_vec()).await?;
    assert!(store.delete_key("gone").await?);
    assert!(!store.delete_key("gone").await?);
    assert!(!store.check(&["gone".to_string()]).await?);
    Ok(())
}

#[tokio::test]
async fn test_num_keys_ignores_rendezvous() -> Result<()> {
    let (store, _client) = pair().await?;

    for i in 0u8..4 {
        store.set(&format!("key{i}"), vec![i]).await?;
    }
    store.set("key0", b"again".to_vec()).await?;

    assert_eq!(store.num_keys().await?, 4);
    assert_eq!(store.server().map(|s| s.num_workers()), Some(2));
    Ok(())
}

#[tokio::test]
async fn test_rendezvous_releases_on_last_worker() -> Result<()> {
    let port = free_port();

    let spawn_worker = |options: StoreOptions| {
        tokio::spawn(async move { TcpStore::new(HOST, options.with_num_workers(3)).await })
    };

    let first = spawn_worker(StoreOptions::server(port));
    sleep(Duration::from_millis(200)).await;
    let second = spawn_worker(StoreOptions::client(port));
    sleep(Duration::from_millis(200)).await;

    assert!(!first.is_finished());
    assert!(!second.is_finished());

    let third = spawn_worker(StoreOptions::client(port));
    let stores = tokio::time::timeout(Duration::from_secs(10), async {
        Ok::<_, anyhow::Error>(vec![first.await??, second.await??, third.await??])
    })
    .await??;

    assert!(stores.iter().all(|s| s.num_workers() == Some(3)));
    assert_eq!(stores[0].server().map(|s| s.num_workers()), Some(3));
    Ok(())
}

#[tokio::test]
async fn test_rendezvous_times_out() -> Result<()> {
    let port = free_port();
    let options = StoreOptions::server(port)
        .with_num_workers(2)
        .with_timeout(Duration::from_millis(200));

    let err = TcpStore::new(HOST, options).await.err().expect("only one worker joined");
    assert_eq!(err.kind(), ErrorKind::Timeout);
    Ok(())
}

#[tokio::test]
async fn test_single_tenant_port_conflict() -> Result<()> {
    let port = free_port();
    let _first = TcpStore::new(HOST, StoreOptions::server(port)).await?;

    let err = TcpStore::new(HOST, StoreOptions::server(port)).await.err().expect("port is taken");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    Ok(())
}

#[tokio::test]
async fn test_multi_tenant_stores_share_server() -> Result<()> {
    let port = free_port();
    let options = StoreOptions::server(port).with_multi_tenant(true);

    let first = TcpStore::new(HOST, options.clone()).await?;
    let second = TcpStore::new(HOST, options).await?;

    match (first.server(), second.server()) {
        (Some(a), Some(b)) => assert!(Arc::ptr_eq(a, b)),
        _ => panic!("both stores host"),
    }

    first.set("shared", b"1".to_vec()).await?;
    assert_eq!(second.get("shared").await?, b"1".to_vec());
    Ok(())
}

#[tokio::test]
async fn test_connection_loss_fails_pending_calls() -> Result<()> {
    let server = StoreServer::start(ServerConfig {
        bind_address: HOST.to_string(),
        port: 0,
        ..Default::default()
    })
    .await?;
    let store = TcpStore::new(HOST, StoreOptions::client(server.port())).await?;
    store.set_timeout(store_core::NO_TIMEOUT);

    let shutdown = async {
        sleep(Duration::from_millis(100)).await;
        server.shutdown();
    };
    let (result, _) = tokio::join!(store.get("never"), shutdown);

    assert_eq!(result.unwrap_err().kind(), ErrorKind::Connection);
    Ok(())
}

#[tokio::test]
async fn test_dropping_store_unregisters_watches() -> Result<()> {
    let (host, participant) = pair().await?;
    let server = host.server().cloned().expect("hosting store");

    let ignore = Arc::new(|_: Option<Value>, _: Option<Value>| {});
    participant.watch_key("a", ignore.clone()).await?;
    participant.watch_key("b", ignore).await?;
    assert_eq!(server.num_watchers(), 2);

    drop(participant);

    let deadline = Instant::now() + Duration::from_secs(5);
    while server.num_watchers() != 0 && Instant::now() < deadline {
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.num_watchers(), 0);

    // Writes keep working with no one listening
    host.set("a", b"1".to_vec()).await?;
    Ok(())
}
