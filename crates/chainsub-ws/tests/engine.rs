//! End-to-end tests against an in-process mock WebSocket server.
//!
//! Each test binds a listener on an ephemeral port, drives the client, and
//! plays the server side frame by frame.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use chainsub_core::{
    EngineConfig, EngineError, ReconnectConfig, RpcTransport, SubscribeRequest, SubscriptionId,
};
use chainsub_core::transport::HealthStatus;
use chainsub_ws::{
    ConnectionState, EngineEvent, SubscriptionClient, SubscriptionHandle, SubscriptionState,
};

const WAIT: Duration = Duration::from_secs(5);
/// How long to watch for a frame or connection that must not arrive.
const QUIET: Duration = Duration::from_millis(200);

// ─── Helpers ──────────────────────────────────────────────────────────────────

type ServerConn = WebSocketStream<TcpStream>;

struct MockServer {
    url: String,
    conns: mpsc::UnboundedReceiver<ServerConn>,
    listener: JoinHandle<()>,
}

impl MockServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, conns) = mpsc::unbounded_channel();
        let listener = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            url: format!("ws://{addr}"),
            conns,
            listener,
        }
    }

    /// Stop listening. Connections already accepted stay open.
    async fn stop(&mut self) {
        self.listener.abort();
        let _ = (&mut self.listener).await;
    }

    async fn accept(&mut self) -> ServerConn {
        timeout(WAIT, self.conns.recv())
            .await
            .expect("no connection within timeout")
            .expect("listener stopped")
    }
}

async fn recv_json(ws: &mut ServerConn) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("no frame within timeout")
            .expect("connection closed")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn send_json(ws: &mut ServerConn, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn next(handle: &mut SubscriptionHandle) -> Value {
    timeout(WAIT, handle.next())
        .await
        .expect("no payload within timeout")
        .expect("subscription ended")
}

async fn wait_event(
    events: &mut broadcast::Receiver<EngineEvent>,
    matches: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event channel closed: {e}"),
            }
        }
    })
    .await
    .expect("event not observed")
}

fn config(url: &str) -> EngineConfig {
    EngineConfig::new(url).with_reconnect(ReconnectConfig::disabled())
}

fn reconnecting(url: &str, max_attempts: u32) -> EngineConfig {
    EngineConfig::new(url).with_reconnect(ReconnectConfig {
        min_delay_ms: 10,
        max_attempts: Some(max_attempts),
        ..ReconnectConfig::default()
    })
}

fn heads() -> SubscribeRequest {
    SubscribeRequest::new("subscribeForHeadBlockHash")
}

fn logs() -> SubscribeRequest {
    SubscribeRequest::new("subscribeForLogs").with_params(json!({"address": "0x1"}))
}

async fn notify(ws: &mut ServerConn, sub_id: &str, payload: Value) {
    send_json(
        ws,
        json!({"params": {"subscription": sub_id, "result": payload}}),
    )
    .await;
}

/// Subscribe on a fresh connection, acknowledging with `sub_id`.
async fn subscribed(
    client: &SubscriptionClient,
    server: &mut MockServer,
    sub_id: &str,
) -> (SubscriptionHandle, ServerConn) {
    let (handle, ws) = tokio::join!(client.subscribe(heads()), async {
        let mut ws = server.accept().await;
        let req = recv_json(&mut ws).await;
        send_json(&mut ws, json!({"id": req["id"], "result": sub_id})).await;
        ws
    });
    (handle.unwrap(), ws)
}

// ─── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn subscribe_delivers_first_notification() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);

    let (handle, _ws) = tokio::join!(client.subscribe(heads()), async {
        let mut ws = server.accept().await;
        let req = recv_json(&mut ws).await;
        assert_eq!(req["id"], 1);
        assert_eq!(req["method"], "subscribeForHeadBlockHash");
        send_json(&mut ws, json!({"id": 1, "result": "0xabc123"})).await;
        // Pushed right behind the ack: must not be lost.
        send_json(
            &mut ws,
            json!({"params": {"subscription": "0xabc123", "result": "0xdeadbeef"}}),
        )
        .await;
        ws
    });

    let mut handle = handle.unwrap();
    assert_eq!(handle.id(), Some(SubscriptionId::from("0xabc123")));
    assert_eq!(handle.state(), SubscriptionState::Active);
    assert_eq!(next(&mut handle).await, json!("0xdeadbeef"));
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test]
async fn notifications_arrive_in_server_order() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    for payload in ["a", "b", "c"] {
        send_json(
            &mut ws,
            json!({"params": {"subscription": "0xabc123", "result": payload}}),
        )
        .await;
    }

    assert_eq!(next(&mut handle).await, "a");
    assert_eq!(next(&mut handle).await, "b");
    assert_eq!(next(&mut handle).await, "c");
}

#[tokio::test]
async fn subscribe_times_out_without_response() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        config(&server.url).with_request_timeout(Duration::from_millis(50)),
    )
    .unwrap();
    let mut events = client.events();

    let started = Instant::now();
    let (result, mut ws) = tokio::join!(client.subscribe(heads()), async {
        let mut ws = server.accept().await;
        recv_json(&mut ws).await;
        ws
    });

    assert!(matches!(result, Err(EngineError::RequestTimeout { ms: 50 })));
    assert!(started.elapsed() < Duration::from_secs(2));
    // A timeout is not a transport failure.
    assert_eq!(client.state(), ConnectionState::Open);
    assert_eq!(client.subscription_count(), 0);

    // The late ack no longer matches a pending entry.
    send_json(&mut ws, json!({"id": 1, "result": "0xlate"})).await;
    wait_event(&mut events, |e| matches!(e, EngineEvent::DecodeFailed { .. })).await;
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn subscribe_error_response_rejects() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();

    let (result, _ws) = tokio::join!(client.subscribe(heads()), async {
        let mut ws = server.accept().await;
        let req = recv_json(&mut ws).await;
        send_json(
            &mut ws,
            json!({"id": req["id"], "error": {"code": -32601, "message": "method not found"}}),
        )
        .await;
        ws
    });

    match result {
        Err(EngineError::Subscription(e)) => {
            assert_eq!(e.code, -32601);
            assert_eq!(e.message, "method not found");
        }
        other => panic!("expected subscription error, got {other:?}"),
    }
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn request_round_trip() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();

    let (result, _ws) = tokio::join!(
        client.call::<String>("eth_blockNumber", Some(json!([]))),
        async {
            let mut ws = server.accept().await;
            let req = recv_json(&mut ws).await;
            assert_eq!(req["method"], "eth_blockNumber");
            assert_eq!(req["params"], json!([]));
            send_json(&mut ws, json!({"id": req["id"], "result": "0x10"})).await;
            ws
        }
    );

    assert_eq!(result.unwrap(), "0x10");
    assert_eq!(client.health(), HealthStatus::Healthy);
    assert_eq!(client.url(), server.url);
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        config(&server.url).with_unsubscribe_method("unsubscribe"),
    )
    .unwrap();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    let (first, ()) = tokio::join!(handle.unsubscribe(), async {
        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "unsubscribe");
        assert_eq!(req["params"], json!(["0xabc123"]));
        send_json(&mut ws, json!({"id": req["id"], "result": true})).await;
    });
    first.unwrap();
    assert_eq!(handle.state(), SubscriptionState::Closed);

    // No second round trip: the server is not polled here.
    handle.unsubscribe().await.unwrap();
    assert_eq!(handle.state(), SubscriptionState::Closed);
    assert_eq!(handle.id(), None);
    assert_eq!(client.subscription_count(), 0);
    assert!(timeout(WAIT, handle.next()).await.unwrap().is_none());
}

#[tokio::test]
async fn dropping_handle_unsubscribes() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        config(&server.url).with_unsubscribe_method("unsubscribe"),
    )
    .unwrap();
    let (handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    drop(handle);
    let req = recv_json(&mut ws).await;
    assert_eq!(req["method"], "unsubscribe");
    assert_eq!(req["params"], json!(["0xabc123"]));
}

#[tokio::test]
async fn resubscribes_after_reconnect() {
    let mut server = MockServer::start().await;
    let reconnect = ReconnectConfig {
        min_delay_ms: 10,
        max_attempts: Some(1),
        ..ReconnectConfig::default()
    };
    let client =
        SubscriptionClient::new(EngineConfig::new(&server.url).with_reconnect(reconnect)).unwrap();
    let mut events = client.events();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xold").await;
    let key = handle.key();

    // Force-close the first socket.
    ws.close(None).await.unwrap();
    drop(ws);

    let mut ws = server.accept().await;
    let req = recv_json(&mut ws).await;
    assert_eq!(req["method"], "subscribeForHeadBlockHash");
    assert_eq!(req["id"], 2);
    send_json(&mut ws, json!({"id": 2, "result": "0xnew"})).await;
    send_json(
        &mut ws,
        json!({"params": {"subscription": "0xnew", "result": "0xresumed"}}),
    )
    .await;

    assert_eq!(next(&mut handle).await, "0xresumed");
    assert_eq!(handle.key(), key);
    assert_eq!(handle.id(), Some(SubscriptionId::from("0xnew")));
    assert_eq!(handle.state(), SubscriptionState::Active);

    wait_event(&mut events, |e| matches!(e, EngineEvent::Disconnected { .. })).await;
    let event = wait_event(&mut events, |e| matches!(e, EngineEvent::Resubscribed { .. })).await;
    assert_eq!(
        event,
        EngineEvent::Resubscribed {
            key,
            id: SubscriptionId::from("0xnew"),
        }
    );
}

#[tokio::test]
async fn close_rejects_pending_and_ends_subscriptions() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    let (result, ()) = tokio::join!(client.request("eth_blockNumber", None), async {
        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "eth_blockNumber");
        client.close().await;
    });

    assert!(matches!(result, Err(EngineError::ConnectionClosed { .. })));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(handle.state(), SubscriptionState::Closed);
    assert_eq!(handle.close_reason().as_deref(), Some("closed by caller"));
    assert!(timeout(WAIT, handle.next()).await.unwrap().is_none());
    assert_eq!(client.subscription_count(), 0);

    // Second close and unsubscribe are no-ops.
    client.close().await;
    handle.unsubscribe().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn failing_sink_does_not_affect_others() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        config(&server.url).with_shared_subscriptions(true),
    )
    .unwrap();
    let mut events = client.events();
    let (mut failing, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    // Identical request: attaches to the same server subscription.
    let mut healthy = client.subscribe(heads()).await.unwrap();
    assert_eq!(healthy.key(), failing.key());
    assert_eq!(client.subscription_count(), 1);

    failing.on_message(|_| Err("sink rejected payload".into()));
    send_json(
        &mut ws,
        json!({"params": {"subscription": "0xabc123", "result": "0x1"}}),
    )
    .await;

    assert_eq!(next(&mut healthy).await, "0x1");
    let event = wait_event(&mut events, |e| matches!(e, EngineEvent::SinkFailed { .. })).await;
    let EngineEvent::SinkFailed {
        subscription,
        error,
        ..
    } = event
    else {
        unreachable!();
    };
    assert_eq!(subscription, SubscriptionId::from("0xabc123"));
    assert!(error.contains("sink rejected payload"));
    assert_eq!(failing.state(), SubscriptionState::Active);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn callback_sink_receives_buffered_and_live_payloads() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();
    let mut events = client.events();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    send_json(&mut ws, json!({"params": {"subscription": "0xabc123", "result": 1}})).await;
    // Wait until the first payload is buffered.
    send_json(&mut ws, json!({"params": {"subscription": "0xabc123"}})).await;
    wait_event(&mut events, |e| matches!(e, EngineEvent::DecodeFailed { .. })).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    handle.on_message(move |payload| {
        tx.send(payload)?;
        Ok(())
    });
    send_json(&mut ws, json!({"params": {"subscription": "0xabc123", "result": 2}})).await;

    for expected in [1, 2] {
        let payload = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(payload, expected);
    }
    assert!(handle.next().await.is_none());
}

#[tokio::test]
async fn malformed_frames_are_skipped() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();
    let mut events = client.events();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    send_json(
        &mut ws,
        json!({"params": {"subscription": "0xabc123", "result": "0xafter"}}),
    )
    .await;

    assert_eq!(next(&mut handle).await, "0xafter");
    wait_event(&mut events, |e| matches!(e, EngineEvent::DecodeFailed { .. })).await;
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn concurrent_subscribes_get_distinct_ids() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();

    let (a, b, ws) = tokio::join!(
        client.subscribe(heads()),
        client.subscribe(SubscribeRequest::new("subscribeForLogs").with_params(json!({"address": "0x1"}))),
        async {
            let mut ws = server.accept().await;
            let first = recv_json(&mut ws).await;
            let second = recv_json(&mut ws).await;
            assert_ne!(first["id"], second["id"]);
            // Acknowledge out of order.
            for req in [&second, &first] {
                let sub = format!("0x{}", req["method"].as_str().unwrap());
                send_json(&mut ws, json!({"id": req["id"], "result": sub})).await;
            }
            ws
        }
    );
    let (mut a, mut b, mut ws) = (a.unwrap(), b.unwrap(), ws);

    assert_eq!(a.id(), Some(SubscriptionId::from("0xsubscribeForHeadBlockHash")));
    assert_eq!(b.id(), Some(SubscriptionId::from("0xsubscribeForLogs")));
    assert_ne!(a.key(), b.key());

    send_json(
        &mut ws,
        json!({"params": {"subscription": "0xsubscribeForLogs", "result": "log"}}),
    )
    .await;
    send_json(
        &mut ws,
        json!({"params": {"subscription": "0xsubscribeForHeadBlockHash", "result": "head"}}),
    )
    .await;
    assert_eq!(next(&mut a).await, "head");
    assert_eq!(next(&mut b).await, "log");
}

#[tokio::test]
async fn unreachable_server_fails_without_reconnect() {
    // Reserve a port, then free it so nothing is listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = SubscriptionClient::connect(config(&format!("ws://{addr}"))).await;
    assert!(matches!(result, Err(EngineError::WebSocket(_))));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let result = SubscriptionClient::new(EngineConfig::new("http://localhost:8545"));
    assert!(matches!(result, Err(EngineError::Config(_))));
}

#[tokio::test]
async fn inflight_subscribe_survives_reconnect() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(reconnecting(&server.url, 3)).unwrap();

    let (handle, mut ws) = tokio::join!(client.subscribe(heads()), async {
        let mut ws = server.accept().await;
        let req = recv_json(&mut ws).await;
        assert_eq!(req["id"], 1);
        // Drop the socket before the ack.
        ws.close(None).await.unwrap();
        drop(ws);

        let mut ws = server.accept().await;
        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "subscribeForHeadBlockHash");
        assert_eq!(req["id"], 2);
        send_json(&mut ws, json!({"id": 2, "result": "0xsub"})).await;
        ws
    });

    let mut handle = handle.unwrap();
    assert_eq!(handle.id(), Some(SubscriptionId::from("0xsub")));
    notify(&mut ws, "0xsub", json!("0xafter")).await;
    assert_eq!(next(&mut handle).await, "0xafter");
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test]
async fn inflight_call_is_resent_after_reconnect() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(reconnecting(&server.url, 3)).unwrap();

    let (result, _ws) = tokio::join!(client.request("eth_blockNumber", Some(json!([]))), async {
        let mut ws = server.accept().await;
        recv_json(&mut ws).await;
        ws.close(None).await.unwrap();
        drop(ws);

        let mut ws = server.accept().await;
        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "eth_blockNumber");
        assert_eq!(req["params"], json!([]));
        send_json(&mut ws, json!({"id": req["id"], "result": "0x10"})).await;
        ws
    });

    assert_eq!(result.unwrap(), "0x10");
}

#[tokio::test]
async fn replays_all_subscriptions_in_creation_order() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(reconnecting(&server.url, 1)).unwrap();
    let (mut head_handle, mut ws) = subscribed(&client, &mut server, "0xa1").await;
    let (log_handle, ()) = tokio::join!(client.subscribe(logs()), async {
        let req = recv_json(&mut ws).await;
        send_json(&mut ws, json!({"id": req["id"], "result": "0xb1"})).await;
    });
    let mut log_handle = log_handle.unwrap();

    ws.close(None).await.unwrap();
    drop(ws);

    let mut ws = server.accept().await;
    let first = recv_json(&mut ws).await;
    let second = recv_json(&mut ws).await;
    assert_eq!(first["method"], "subscribeForHeadBlockHash");
    assert_eq!(second["method"], "subscribeForLogs");
    assert_eq!(second["params"], json!({"address": "0x1"}));
    send_json(&mut ws, json!({"id": first["id"], "result": "0xa2"})).await;
    send_json(&mut ws, json!({"id": second["id"], "result": "0xb2"})).await;

    notify(&mut ws, "0xb2", json!("log")).await;
    notify(&mut ws, "0xa2", json!("head")).await;
    assert_eq!(next(&mut log_handle).await, "log");
    assert_eq!(next(&mut head_handle).await, "head");
    assert_eq!(head_handle.id(), Some(SubscriptionId::from("0xa2")));
    assert_eq!(log_handle.id(), Some(SubscriptionId::from("0xb2")));
    assert_eq!(client.subscription_count(), 2);
}

#[tokio::test]
async fn exhausted_reconnect_closes_subscriptions() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(reconnecting(&server.url, 2)).unwrap();
    let mut events = client.events();
    let (mut handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;
    let key = handle.key();

    server.stop().await;
    ws.close(None).await.unwrap();
    drop(ws);

    wait_event(&mut events, |e| {
        matches!(e, EngineEvent::Reconnecting { attempt: 2, .. })
    })
    .await;
    let event = wait_event(&mut events, |e| {
        matches!(e, EngineEvent::SubscriptionClosed { .. })
    })
    .await;
    let EngineEvent::SubscriptionClosed { key: closed, reason } = event else {
        unreachable!();
    };
    assert_eq!(closed, key);
    assert!(reason.starts_with("connect failed"), "{reason}");

    timeout(WAIT, client.wait_for_state(ConnectionState::Closed))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.state(), SubscriptionState::Closed);
    assert_eq!(handle.close_reason(), Some(reason));
    assert!(timeout(WAIT, handle.next()).await.unwrap().is_none());
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn concurrent_connects_share_one_socket() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(config(&server.url)).unwrap();

    let (a, b, c, _ws) = tokio::join!(
        client.ensure_connected(),
        client.ensure_connected(),
        client.ensure_connected(),
        server.accept(),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    assert_eq!(client.state(), ConnectionState::Open);
    assert!(timeout(QUIET, server.conns.recv()).await.is_err());
}

#[tokio::test]
async fn unsubscribing_one_shared_sink_sends_nothing() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        config(&server.url)
            .with_shared_subscriptions(true)
            .with_unsubscribe_method("unsubscribe"),
    )
    .unwrap();
    let (mut kept, mut ws) = subscribed(&client, &mut server, "0xabc123").await;
    let dropped = client.subscribe(heads()).await.unwrap();
    assert_eq!(dropped.key(), kept.key());

    dropped.unsubscribe().await.unwrap();
    assert_eq!(dropped.state(), SubscriptionState::Closed);
    assert!(timeout(QUIET, ws.next()).await.is_err());

    notify(&mut ws, "0xabc123", json!("0x1")).await;
    assert_eq!(next(&mut kept).await, "0x1");
    assert_eq!(client.subscription_count(), 1);

    // The last sink does reach the server.
    let (result, ()) = tokio::join!(kept.unsubscribe(), async {
        let req = recv_json(&mut ws).await;
        assert_eq!(req["method"], "unsubscribe");
        assert_eq!(req["params"], json!(["0xabc123"]));
        send_json(&mut ws, json!({"id": req["id"], "result": true})).await;
    });
    result.unwrap();
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn unsubscribe_during_replay_cancels_new_server_subscription() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        reconnecting(&server.url, 1).with_unsubscribe_method("unsubscribe"),
    )
    .unwrap();
    let (handle, mut ws) = subscribed(&client, &mut server, "0xold").await;

    ws.close(None).await.unwrap();
    drop(ws);

    let mut ws = server.accept().await;
    let replay = recv_json(&mut ws).await;
    assert_eq!(replay["method"], "subscribeForHeadBlockHash");

    // No server id yet, so this settles locally.
    handle.unsubscribe().await.unwrap();
    assert_eq!(handle.state(), SubscriptionState::Closed);

    send_json(&mut ws, json!({"id": replay["id"], "result": "0xnew"})).await;
    let req = recv_json(&mut ws).await;
    assert_eq!(req["method"], "unsubscribe");
    assert_eq!(req["params"], json!(["0xnew"]));
    assert_eq!(client.subscription_count(), 0);
}

#[tokio::test]
async fn repeated_unsubscribe_leaves_the_first_in_charge() {
    let mut server = MockServer::start().await;
    let client = SubscriptionClient::new(
        config(&server.url).with_unsubscribe_method("unsubscribe"),
    )
    .unwrap();
    let (handle, mut ws) = subscribed(&client, &mut server, "0xabc123").await;

    let (first, ()) = tokio::join!(handle.unsubscribe(), async {
        let req = recv_json(&mut ws).await;
        // The ack is still outstanding.
        handle.unsubscribe().await.unwrap();
        assert_eq!(handle.state(), SubscriptionState::Unsubscribing);
        assert_eq!(handle.close_reason(), None);
        send_json(
            &mut ws,
            json!({"id": req["id"], "error": {"code": -32000, "message": "not found"}}),
        )
        .await;
    });

    assert!(matches!(first, Err(EngineError::Subscription(_))));
    assert_eq!(handle.state(), SubscriptionState::Closed);
    let reason = handle.close_reason().unwrap();
    assert!(reason.contains("not found"), "{reason}");
    assert_eq!(client.subscription_count(), 0);
}
