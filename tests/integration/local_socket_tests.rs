//! Integration tests for the local socket listener.

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced};
use serde_json::json;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

use vault_intercom::intercom::{handler_fn, IntercomClient, IntercomServer};

use super::test_helpers::WAIT;

fn unique_name() -> String {
    format!("vault-intercom-test-{}", uuid::Uuid::new_v4().simple())
}

async fn connect(name: &str) -> IntercomClient {
    let ns_name = name
        .to_ns_name::<GenericNamespaced>()
        .expect("valid socket name");
    let stream = LocalSocketStream::connect(ns_name).await.expect("connect");
    let (reader, writer) = stream.split();
    IntercomClient::from_split(reader, writer)
}

#[tokio::test]
#[serial]
async fn serves_requests_over_local_socket() {
    let cancel = CancellationToken::new();
    let server = IntercomServer::new(cancel.clone());
    server
        .subscribe_to_requests(handler_fn(|origin, payload| async move {
            Ok(json!({ "channel": origin.id().to_string(), "payload": payload }))
        }))
        .await;

    let name = unique_name();
    let listener = server.spawn_local_listener(&name).expect("listener");

    let first = connect(&name).await;
    let second = connect(&name).await;

    let a = tokio::time::timeout(WAIT, first.request(json!("a")))
        .await
        .expect("deadline")
        .expect("response");
    let b = tokio::time::timeout(WAIT, second.request(json!("b")))
        .await
        .expect("deadline")
        .expect("response");
    assert_eq!(a["payload"], "a");
    assert_eq!(b["payload"], "b");
    assert_ne!(a["channel"], b["channel"]);
    assert_eq!(server.channel_count().await, 2);

    server.shutdown().await;
    tokio::time::timeout(WAIT, listener)
        .await
        .expect("listener stops")
        .expect("listener task");
    tokio::time::timeout(WAIT, first.closed())
        .await
        .expect("client observes shutdown");
}

#[tokio::test]
#[serial]
async fn broadcast_over_local_socket() {
    let server = IntercomServer::new(CancellationToken::new());
    let name = unique_name();
    let listener = server.spawn_local_listener(&name).expect("listener");

    let client = connect(&name).await;
    let mut events = client.subscribe();

    // The accept loop registers the channel asynchronously.
    tokio::time::timeout(WAIT, async {
        while server.channel_count().await < 1 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("channel registered");

    assert_eq!(server.broadcast(json!({ "type": "state_updated" })).await, 1);
    let data = tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("deadline")
        .expect("broadcast");
    assert_eq!(data, json!({ "type": "state_updated" }));

    server.shutdown().await;
    let _ = tokio::time::timeout(WAIT, listener).await;
}
