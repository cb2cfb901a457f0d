use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tether_engine::Relay;
use tether_engine::config::RelayConfig;
use tether_engine::protocol::{
    CommandRequest, ConsoleEntry, ObserverMessage, RelayMessage, SessionState, TargetHint, Verb,
};
use tether_r::server::{ObserverServer, ServerHandle};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (Arc<Relay>, ServerHandle) {
    let relay = Arc::new(Relay::new(RelayConfig::default()));
    let server = ObserverServer::new("127.0.0.1:0".parse().unwrap(), relay.clone());
    let handle = server.start().await.expect("Failed to start server");
    (relay, handle)
}

async fn connect(handle: &ServerHandle) -> Client {
    let url = format!("ws://{}", handle.local_addr);
    let (ws, _) = connect_async(&url).await.expect("Failed to connect");
    ws
}

async fn send(ws: &mut Client, message: &ObserverMessage) {
    let text = serde_json::to_string(message).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn next_message(ws: &mut Client) -> RelayMessage {
    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Timeout waiting for relay message")
        .expect("Stream ended")
        .expect("WS error");
    serde_json::from_str(frame.to_text().unwrap()).expect("Failed to deserialize")
}

async fn hello(ws: &mut Client, window_id: &str) -> String {
    send(
        ws,
        &ObserverMessage::Hello {
            window_id: window_id.into(),
            url: Some("https://example.test/".into()),
            title: None,
        },
    )
    .await;
    match next_message(ws).await {
        RelayMessage::Attached { session_id } => session_id,
        other => panic!("Expected attached, got {:?}", other),
    }
}

async fn expect_closed(ws: &mut Client) {
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed");
}

#[tokio::test]
async fn test_hello_attaches_and_commands_round_trip() {
    let (relay, handle) = start_server().await;
    let mut client = connect(&handle).await;
    let session_id = hello(&mut client, "tab-1").await;

    let info = relay.session(&session_id).unwrap();
    assert_eq!(info.state, SessionState::Connected);
    assert_eq!(info.url.as_deref(), Some("https://example.test/"));

    let dispatch = {
        let relay = relay.clone();
        tokio::spawn(async move {
            relay
                .dispatch(
                    None,
                    CommandRequest::new(Verb::Query, json!({"selector": "button"})),
                )
                .await
        })
    };

    let RelayMessage::Command(command) = next_message(&mut client).await else {
        panic!("Expected a command");
    };
    assert_eq!(command.verb, Verb::Query);
    assert_eq!(command.args["selector"], "button");

    send(
        &mut client,
        &ObserverMessage::Result {
            request_id: command.request_id,
            success: true,
            data: Some(json!({"count": 0, "matches": []})),
            error: None,
        },
    )
    .await;

    let response = dispatch.await.unwrap();
    assert!(response.success, "{:?}", response.error);
    assert_eq!(response.data.unwrap()["count"], 0);
    assert_eq!(response.session.as_deref(), Some(session_id.as_str()));

    handle.shutdown();
}

#[tokio::test]
async fn test_console_frames_reach_the_buffer() {
    let (relay, handle) = start_server().await;
    let mut client = connect(&handle).await;
    let session_id = hello(&mut client, "tab-1").await;

    send(
        &mut client,
        &ObserverMessage::Console(ConsoleEntry {
            level: "warn".into(),
            text: "deprecated api".into(),
            timestamp: 1,
        }),
    )
    .await;

    let mut items = Vec::new();
    for _ in 0..50 {
        items = relay
            .poll(None, &TargetHint::session(&session_id), 0, None)
            .unwrap()
            .items;
        if !items.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_same_window_displaces_previous_observer() {
    let (relay, handle) = start_server().await;
    let mut first = connect(&handle).await;
    let first_id = hello(&mut first, "tab-1").await;

    let mut second = connect(&handle).await;
    let second_id = hello(&mut second, "tab-1").await;
    assert_ne!(first_id, second_id);

    expect_closed(&mut first).await;
    // Displaced first, then removed once its connection is torn down.
    let first_state = relay.session(&first_id).map(|s| s.state);
    assert!(first_state.is_none_or(|s| s == SessionState::Disconnected));
    assert_eq!(
        relay.session(&second_id).unwrap().state,
        SessionState::Connected
    );
}

#[tokio::test]
async fn test_first_message_must_be_hello() {
    let (relay, handle) = start_server().await;
    let mut client = connect(&handle).await;

    send(
        &mut client,
        &ObserverMessage::Console(ConsoleEntry {
            level: "log".into(),
            text: "too early".into(),
            timestamp: 0,
        }),
    )
    .await;

    expect_closed(&mut client).await;
    assert!(relay.list_sessions().is_empty());
}

#[tokio::test]
async fn test_client_hangup_disconnects_session() {
    let (relay, handle) = start_server().await;
    let mut client = connect(&handle).await;
    let session_id = hello(&mut client, "tab-1").await;

    client.close(None).await.unwrap();

    let mut gone = false;
    for _ in 0..50 {
        if relay.session(&session_id).is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(gone, "session still registered after hangup");
    assert!(relay.list_sessions().is_empty());
}
