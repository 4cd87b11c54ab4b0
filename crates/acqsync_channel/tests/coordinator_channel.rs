//! Channel behaviour against a local websocket server.

use acqsync_channel::{ChannelConfig, ChannelError, ChannelState, PersistentChannel, SharedState};
use acqsync_protocol::{ChannelMessage, MessageKind};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use url::Url;

const WAIT: Duration = Duration::from_secs(10);

type ServerWs = WebSocketStream<TcpStream>;

async fn listen() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{}/ws/test/1", addr)).unwrap();
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

/// Next text frame, skipping pings. `None` once the client goes away.
async fn next_text(ws: &mut ServerWs) -> Option<String> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

fn fast_config(url: Url) -> ChannelConfig {
    ChannelConfig {
        heartbeat_interval: Duration::from_secs(1),
        heartbeat_timeout: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(2),
        backoff_step: Duration::from_millis(50),
        ..ChannelConfig::new(url)
    }
}

async fn wait_for_key(state: &SharedState, key: &str) -> serde_json::Value {
    timeout(WAIT, async {
        loop {
            if let Some(value) = state.get(key) {
                return value;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state key never arrived")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_delivered_in_send_order() {
    let (listener, url) = listen().await;
    let channel = PersistentChannel::open(fast_config(url), SharedState::new()).unwrap();

    for i in 0..5 {
        channel
            .send(&ChannelMessage::update(format!("key{}", i), json!(i)))
            .unwrap();
    }

    let mut ws = accept(&listener).await;
    let mut attributes = Vec::new();
    for _ in 0..5 {
        let text = timeout(WAIT, next_text(&mut ws)).await.unwrap().unwrap();
        let message = ChannelMessage::decode(&text).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::StateUpdate);
        attributes.push(message.attribute);
    }
    assert_eq!(attributes, vec!["key0", "key1", "key2", "key3", "key4"]);

    timeout(WAIT, channel.close()).await.unwrap().unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(channel.queue_depth(), 0);
    assert!(matches!(
        channel.send(&ChannelMessage::update("late", json!(1))),
        Err(ChannelError::Closed)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_inbound_updates_applied_to_state() {
    let (listener, url) = listen().await;
    let state = SharedState::new();
    let channel = PersistentChannel::open(fast_config(url), state.clone()).unwrap();
    let mut ws = accept(&listener).await;

    for frame in [
        r#"{"type": "state-update", "attribute": "visit", "value": "cm12345-1"}"#,
        r#"{"type": "state-update", "attribute": "ids", "value": {"a": 1}}"#,
        r#"{"message": "state-update-partial", "attribute": "ids", "value": {"b": 2}}"#,
        r#"{"type": "refresh", "attribute": "ignored", "value": 0}"#,
        "this is not json",
        r#"{"type": "state-update", "attribute": "done", "value": true}"#,
    ] {
        ws.send(Message::Text(frame.to_string())).await.unwrap();
    }

    assert_eq!(wait_for_key(&state, "done").await, json!(true));
    assert_eq!(state.get("visit"), Some(json!("cm12345-1")));
    assert_eq!(state.get("ids"), Some(json!({"a": 1, "b": 2})));
    assert!(!state.contains_key("ignored"));

    timeout(WAIT, channel.close()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reconnects_after_peer_drops() {
    let (listener, url) = listen().await;
    let state = SharedState::new();
    let channel = PersistentChannel::open(fast_config(url), state.clone()).unwrap();

    let first = accept(&listener).await;
    drop(first);

    let mut second = accept(&listener).await;
    second
        .send(Message::Text(
            ChannelMessage::update("round", json!(2)).encode().unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(wait_for_key(&state, "round").await, json!(2));
    assert_eq!(channel.state(), ChannelState::Connected);
    timeout(WAIT, channel.close()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_peer_triggers_reconnect() {
    let (listener, url) = listen().await;
    let config = ChannelConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(100),
        ..fast_config(url)
    };
    let channel = PersistentChannel::open(config, SharedState::new()).unwrap();

    // Never read from the first socket, so pings go unanswered.
    let _silent = accept(&listener).await;
    let mut second = accept(&listener).await;

    channel.send(&ChannelMessage::update("after", json!(1))).unwrap();
    let text = timeout(WAIT, next_text(&mut second)).await.unwrap().unwrap();
    assert_eq!(ChannelMessage::decode(&text).unwrap().unwrap().attribute, "after");

    timeout(WAIT, channel.close()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bound_state_forwards_local_changes_only() {
    let (listener, url) = listen().await;
    let state = SharedState::new();
    let channel = PersistentChannel::open(fast_config(url), state.clone()).unwrap();
    channel.bind_state(&state);
    let mut ws = accept(&listener).await;

    state.set_async("visit", json!("cm1")).await.unwrap();
    state.update_async("counts", json!({"a": 1})).await.unwrap();
    state.update_async("counts", json!({"b": 1})).await.unwrap();

    let mut forwarded = Vec::new();
    for _ in 0..3 {
        let text = timeout(WAIT, next_text(&mut ws)).await.unwrap().unwrap();
        let message = ChannelMessage::decode(&text).unwrap().unwrap();
        forwarded.push((message.kind, message.attribute));
    }
    assert_eq!(
        forwarded,
        vec![
            (MessageKind::StateUpdate, "visit".to_string()),
            (MessageKind::StateUpdate, "counts".to_string()),
            (MessageKind::StateUpdatePartial, "counts".to_string()),
        ]
    );

    ws.send(Message::Text(
        ChannelMessage::update("from_coordinator", json!(7)).encode().unwrap(),
    ))
    .await
    .unwrap();
    assert_eq!(wait_for_key(&state, "from_coordinator").await, json!(7));

    // The remote change must not come back.
    assert!(timeout(Duration::from_millis(300), next_text(&mut ws)).await.is_err());

    timeout(WAIT, channel.close()).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_is_bounded_when_coordinator_unreachable() {
    let (listener, url) = listen().await;
    drop(listener);

    let config = ChannelConfig {
        drain_timeout: Duration::from_millis(200),
        ..fast_config(url)
    };
    let channel = PersistentChannel::open(config, SharedState::new()).unwrap();
    channel.send(&ChannelMessage::update("stuck", json!(1))).unwrap();
    assert_eq!(channel.queue_depth(), 1);

    timeout(Duration::from_secs(3), channel.close())
        .await
        .expect("close hung")
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test]
async fn test_state_watch_reports_transitions() {
    let (listener, url) = listen().await;
    let channel = PersistentChannel::open(fast_config(url), SharedState::new()).unwrap();
    let mut states = channel.watch_state();
    let _ws = accept(&listener).await;

    timeout(WAIT, states.wait_for(|s| *s == ChannelState::Connected))
        .await
        .unwrap()
        .unwrap();

    timeout(WAIT, channel.close()).await.unwrap().unwrap();
    assert_eq!(*states.borrow_and_update(), ChannelState::Closed);
}
