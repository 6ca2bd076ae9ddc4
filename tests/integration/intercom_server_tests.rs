//! Integration tests for the intercom server and client over in-memory channels.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use vault_intercom::intercom::envelope::ServerMessage;
use vault_intercom::intercom::server::FALLBACK_ERROR;
use vault_intercom::intercom::{
    handler_fn, BroadcastEvent, ChannelState, IntercomClient, IntercomServer,
};
use vault_intercom::AppError;

use super::test_helpers::{connect_client, RawPeer, WAIT};

async fn echo_server() -> IntercomServer {
    let server = IntercomServer::new(CancellationToken::new());
    server
        .subscribe_to_requests(handler_fn(|_origin, payload: Value| async move {
            // Later requests finish first so responses arrive out of order.
            let delay = 50 - payload["n"].as_u64().unwrap_or(0).min(50);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({ "echo": payload }))
        }))
        .await;
    server
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let server = echo_server().await;
    let client = connect_client(&server).await;

    let requests = (0..20u64).map(|n| client.request(json!({ "n": n })));
    let responses = tokio::time::timeout(WAIT, join_all(requests))
        .await
        .expect("responses within deadline");

    for (n, response) in responses.into_iter().enumerate() {
        let response = response.expect("response");
        assert_eq!(response["echo"]["n"], json!(n));
    }
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn req_ids_are_monotonic_per_channel() {
    let (probe_client, probe_server) = tokio::io::duplex(4096);
    let client = Arc::new(IntercomClient::connect(probe_client));
    let mut peer = RawPeer::new(probe_server);

    let first = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request(json!({ "type": "ping" })).await }
    });
    let line = peer.read_line().await;
    let envelope: Value = serde_json::from_str(&line).expect("json");
    assert_eq!(envelope["reqId"], json!(1));

    // An answer for an unknown id is dropped; the real answer still lands.
    peer.send_line(r#"{"type":"response","reqId":999,"data":"stray"}"#)
        .await;
    peer.send_line(r#"{"type":"response","reqId":1,"data":"ok"}"#)
        .await;
    let response = first.await.expect("join").expect("response");
    assert_eq!(response, json!("ok"));

    let second = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.request(json!({ "type": "ping" })).await }
    });
    let line = peer.read_line().await;
    let envelope: Value = serde_json::from_str(&line).expect("json");
    assert_eq!(envelope["reqId"], json!(2));
    peer.send_line(r#"{"type":"error","reqId":2,"data":"not found: nothing"}"#)
        .await;
    let err = second.await.expect("join").expect_err("error response");
    assert!(matches!(err, AppError::Remote(msg) if msg == "not found: nothing"));
}

#[tokio::test]
async fn broadcast_reaches_every_channel() {
    let server = echo_server().await;
    let clients = [
        connect_client(&server).await,
        connect_client(&server).await,
        connect_client(&server).await,
    ];
    let mut receivers: Vec<_> = clients.iter().map(|client| client.subscribe()).collect();

    let delivered = server.broadcast(json!({ "type": "state_updated" })).await;
    assert_eq!(delivered, 3);

    for rx in &mut receivers {
        let data = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("broadcast within deadline")
            .expect("broadcast");
        assert_eq!(data, json!({ "type": "state_updated" }));
    }
}

#[tokio::test]
async fn every_subscriber_on_a_channel_sees_broadcasts() {
    let server = echo_server().await;
    let client = connect_client(&server).await;
    let mut first = client.subscribe();
    let mut second = client.subscribe();

    let delivered = server
        .broadcast_event(&BroadcastEvent::StateUpdated)
        .await
        .expect("encode");
    assert_eq!(delivered, 1);

    for rx in [&mut first, &mut second] {
        let data = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("deadline")
            .expect("broadcast");
        assert_eq!(data, json!({ "type": "state_updated" }));
    }
}

#[tokio::test]
async fn disconnect_closes_only_that_channel() {
    let server = echo_server().await;
    let (first_handle, first_stream) = server.attach_in_memory().await;
    let first = IntercomClient::connect(first_stream);
    let second = connect_client(&server).await;
    assert_eq!(server.channel_count().await, 2);

    server.disconnect(first_handle.id()).await.expect("disconnect");

    tokio::time::timeout(WAIT, first.closed())
        .await
        .expect("client observes close");
    assert_eq!(first_handle.state(), ChannelState::Closed);
    assert_eq!(server.channel_count().await, 1);

    let response = second.request(json!({ "n": 50 })).await.expect("still served");
    assert_eq!(response["echo"]["n"], json!(50));

    let again = server.disconnect(first_handle.id()).await;
    assert!(matches!(again, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn peer_hangup_removes_channel() {
    let server = echo_server().await;
    let (handle, stream) = server.attach_in_memory().await;
    assert_eq!(handle.state(), ChannelState::Active);

    drop(stream);

    tokio::time::timeout(WAIT, handle.closed())
        .await
        .expect("server observes hangup");
    tokio::time::timeout(WAIT, async {
        while server.channel_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("registry drained");
}

#[tokio::test]
async fn handler_error_becomes_error_response() {
    let server = IntercomServer::default();
    server
        .subscribe_to_requests(handler_fn(|_origin, _payload| async move {
            Err::<Value, _>(AppError::NotFound("confirmation abc".into()))
        }))
        .await;
    let client = connect_client(&server).await;

    let err = client.request(json!({})).await.expect_err("error response");
    assert!(matches!(err, AppError::Remote(msg) if msg == "not found: confirmation abc"));
}

#[tokio::test]
async fn handler_panic_still_answers() {
    let server = IntercomServer::default();
    server
        .subscribe_to_requests(handler_fn(|_origin, payload: Value| async move {
            if payload["boom"].as_bool().unwrap_or(false) {
                panic!("handler exploded");
            }
            Ok(json!("fine"))
        }))
        .await;
    let client = connect_client(&server).await;

    let err = client
        .request(json!({ "boom": true }))
        .await
        .expect_err("error response");
    assert!(matches!(err, AppError::Remote(msg) if msg.contains(FALLBACK_ERROR)));

    let ok = client.request(json!({ "boom": false })).await.expect("next request");
    assert_eq!(ok, json!("fine"));
}

#[tokio::test]
async fn missing_handler_is_reported() {
    let server = IntercomServer::default();
    let client = connect_client(&server).await;

    let err = client.request(json!({})).await.expect_err("error response");
    assert!(matches!(err, AppError::Remote(msg) if msg.contains("no request handler")));
}

#[tokio::test]
async fn malformed_lines_do_not_close_the_channel() {
    let server = echo_server().await;
    let (_handle, stream) = server.attach_in_memory().await;
    let mut peer = RawPeer::new(stream);

    // No usable reqId: dropped silently.
    peer.send_line("this is not json").await;
    // reqId present but no payload: answered with an error.
    peer.send_line(r#"{"reqId": 5}"#).await;

    match peer.read_message().await {
        ServerMessage::Error { req_id, data } => {
            assert_eq!(req_id, 5);
            assert!(data.starts_with("protocol:"), "{data}");
        }
        other => panic!("expected error response, got {other:?}"),
    }

    peer.send_line(r#"{"reqId": 6, "payload": {"n": 50}}"#).await;
    match peer.read_message().await {
        ServerMessage::Response { req_id, data } => {
            assert_eq!(req_id, 6);
            assert_eq!(data["echo"]["n"], json!(50));
        }
        other => panic!("expected response, got {other:?}"),
    }
}

#[tokio::test]
async fn timed_out_request_releases_its_slot() {
    let server = IntercomServer::default();
    server
        .subscribe_to_requests(handler_fn(|_origin, _payload| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }))
        .await;
    let client = connect_client(&server).await;

    let err = client
        .request_with_timeout(json!({}), Duration::from_millis(50))
        .await
        .expect_err("timeout");
    assert!(matches!(err, AppError::Ipc(msg) if msg.contains("timed out")));
    assert_eq!(client.pending_count().await, 0);
}

#[tokio::test]
async fn shutdown_closes_all_channels() {
    let server = echo_server().await;
    let first = connect_client(&server).await;
    let second = connect_client(&server).await;

    tokio::time::timeout(WAIT, server.shutdown())
        .await
        .expect("shutdown within deadline");

    for client in [first, second] {
        tokio::time::timeout(WAIT, client.closed())
            .await
            .expect("client observes shutdown");
        assert!(!client.is_connected());
    }
    assert_eq!(server.channel_count().await, 0);
}
