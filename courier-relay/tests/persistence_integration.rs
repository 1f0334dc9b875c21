//! Offline queue persistence across relay restarts.

use courier_relay::client::RelayClient;
use courier_relay::protocol::{Envelope, EnvelopeKind};
use courier_relay::push::{LogNotifier, PushConfig, PushDispatcher};
use courier_relay::server::{RelayServer, ServerConfig};
use courier_relay::storage::{RelayStore, StoreConfig};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct RunningRelay {
    url: String,
    store: Arc<RelayStore>,
    push: PushDispatcher,
    stop: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

async fn start_relay(path: &Path) -> RunningRelay {
    let port = free_port().await;
    let store = Arc::new(RelayStore::open(StoreConfig::for_testing(path)).unwrap());
    let push = PushDispatcher::start(Arc::new(LogNotifier), PushConfig::for_testing());
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };
    let server = RelayServer::new(config, store.clone(), push.handle());

    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    RunningRelay {
        url: format!("ws://127.0.0.1:{port}/ws"),
        store,
        push,
        stop,
        task,
    }
}

/// Stop accepting, wait for connection tasks to release the store, then close it.
async fn stop_relay(relay: RunningRelay) {
    let RunningRelay {
        store,
        push,
        stop,
        task,
        ..
    } = relay;
    stop.send(()).unwrap();
    task.await.unwrap();
    push.shutdown().await;

    let released = timeout(Duration::from_secs(2), async {
        while Arc::strong_count(&store) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(released.is_ok(), "connection tasks still hold the store");
    store.flush().unwrap();
}

fn chat(id: &str) -> Envelope {
    Envelope::new(
        EnvelopeKind::Message,
        json!({"_id": id, "sender_id": "alice", "receiver_id": "bob", "content": id}),
    )
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay");

    let relay = start_relay(&path).await;
    let mut alice = RelayClient::connect(&relay.url, "alice").await.unwrap();
    for id in ["m1", "m2"] {
        alice.send(&chat(id)).await.unwrap();
        let ack = alice.recv(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(ack.kind, EnvelopeKind::AckSent);
    }
    alice.close().await.unwrap();
    stop_relay(relay).await;

    let relay = start_relay(&path).await;
    assert_eq!(relay.store.pending_count("bob").unwrap(), 2);

    let mut bob = RelayClient::connect(&relay.url, "bob").await.unwrap();
    let first = bob.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    let second = bob.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    assert_eq!(first, chat("m1"));
    assert_eq!(second, chat("m2"));
}

#[tokio::test]
async fn test_acknowledged_entries_stay_gone_after_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("relay");

    let relay = start_relay(&path).await;
    let mut alice = RelayClient::connect(&relay.url, "alice").await.unwrap();
    alice.send(&chat("m1")).await.unwrap();
    alice.recv(Duration::from_secs(2)).await.unwrap().unwrap();
    alice.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut bob = RelayClient::connect(&relay.url, "bob").await.unwrap();
    assert_eq!(
        bob.recv(Duration::from_secs(2)).await.unwrap().unwrap(),
        chat("m1")
    );
    let ack = Envelope::new(
        EnvelopeKind::AckDelivered,
        json!({"message_id": "m1", "sender_id": "alice", "receiver_id": "bob"}),
    );
    bob.send(&ack).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    bob.close().await.unwrap();
    stop_relay(relay).await;

    let relay = start_relay(&path).await;
    assert_eq!(relay.store.pending_count("bob").unwrap(), 0);
    // Alice was offline when bob acknowledged; the acknowledgment waits for her
    assert_eq!(relay.store.pending_count("alice").unwrap(), 1);

    let mut bob = RelayClient::connect(&relay.url, "bob").await.unwrap();
    assert!(bob.recv(Duration::from_millis(200)).await.unwrap().is_none());
}
