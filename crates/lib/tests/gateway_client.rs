//! Integration tests: run a mock gateway (axum WebSocket) on a free localhost port and
//! drive the real client against it. The server task is left running when a test ends.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use conductor::chat::{ChatWorkflow, SendOutcome};
use conductor::config::ClientConfig;
use conductor::files::FileAction;
use conductor::gateway::{
    ClientError, ConnectOptions, Frame, GatewayClient, ReconnectPolicy, WsRequest,
};
use conductor::message::Role;
use conductor::session::{SessionStatus, Store};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TOKEN: &str = "test-token";

#[derive(Default)]
struct MockGateway {
    sessions: Vec<Value>,
    connections: AtomicUsize,
    list_calls: AtomicUsize,
    first_methods: Mutex<Vec<String>>,
    seen_tokens: Mutex<Vec<Option<String>>>,
}

fn res(id: &str, result: Value) -> Value {
    json!({ "type": "res", "id": id, "ok": true, "payload": result })
}

fn event(name: &str, payload: Value) -> Value {
    json!({ "type": "event", "event": name, "payload": payload })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(gw): State<Arc<MockGateway>>,
) -> impl IntoResponse {
    gw.seen_tokens.lock().unwrap().push(query.get("token").cloned());
    ws.on_upgrade(move |socket| serve_socket(socket, gw))
}

async fn serve_socket(mut socket: WebSocket, gw: Arc<MockGateway>) {
    gw.connections.fetch_add(1, Ordering::SeqCst);
    let mut first = true;
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let req: Value = serde_json::from_str(&text).unwrap();
        let id = req["id"].as_str().unwrap_or_default().to_string();
        let method = req["method"].as_str().unwrap_or_default().to_string();
        let params = req.get("params").cloned().unwrap_or(Value::Null);
        if first {
            gw.first_methods.lock().unwrap().push(method.clone());
            first = false;
        }

        let mut out: Vec<String> = Vec::new();
        match method.as_str() {
            "connect" => {
                let frame = if params["auth"]["token"] == TOKEN {
                    res(&id, json!({ "protocol": 3, "policy": { "tickIntervalMs": 15000 } }))
                } else {
                    json!({ "type": "res", "id": id, "ok": false,
                            "error": { "code": "UNAUTHORIZED", "message": "invalid token" } })
                };
                out.push(frame.to_string());
            }
            "sessions.list" => {
                gw.list_calls.fetch_add(1, Ordering::SeqCst);
                out.push(res(&id, json!({ "sessions": gw.sessions })).to_string());
            }
            "echo" => out.push(res(&id, params).to_string()),
            "chat.send" => {
                let key = params["sessionKey"].clone();
                out.push(res(&id, json!({ "runId": "run-1" })).to_string());
                out.push("this is not a frame".to_string());
                out.push(
                    event(
                        "chat.message",
                        json!({ "sessionId": key, "message": {
                            "id": "echo-1", "role": "user", "content": params["message"]
                        }}),
                    )
                    .to_string(),
                );
                for fragment in ["Looking", " at it"] {
                    out.push(
                        event(
                            "chat",
                            json!({ "sessionKey": key, "state": "delta", "message": {
                                "role": "assistant",
                                "content": [{ "type": "text", "text": fragment }]
                            }}),
                        )
                        .to_string(),
                    );
                }
                out.push(
                    event(
                        "chat",
                        json!({ "sessionKey": key, "state": "final", "message": {
                            "id": "reply-1",
                            "role": "assistant",
                            "content": [
                                { "type": "text", "text": "Looking at it" },
                                { "type": "tool_use", "id": "t1", "name": "Edit",
                                  "input": { "file_path": "auth.go" } }
                            ]
                        }}),
                    )
                    .to_string(),
                );
            }
            // Drop the socket without a close frame.
            "test.hangup" => return,
            other => out.push(
                json!({ "type": "res", "id": id,
                        "error": { "code": "UNKNOWN_METHOD", "message": format!("unknown method {}", other) } })
                .to_string(),
            ),
        }
        for frame in out {
            if socket.send(Message::Text(frame)).await.is_err() {
                return;
            }
        }
    }
}

/// Returns a bare `ws://host:port` URL with no path, the same shape as the default
/// gateway URL.
async fn start_gateway(gw: MockGateway) -> (String, Arc<MockGateway>) {
    let gw = Arc::new(gw);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind free port");
    let addr = listener.local_addr().expect("local_addr");
    let app = Router::new()
        .route("/", get(ws_handler))
        .with_state(gw.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("ws://{}", addr), gw)
}

fn options(url: &str, token: &str) -> ConnectOptions {
    ConnectOptions {
        url: url.to_string(),
        token: Some(token.to_string()),
        client: ClientConfig::default(),
        reconnect: ReconnectPolicy::Fixed {
            delay: Duration::from_millis(50),
        },
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn two_sessions() -> Vec<Value> {
    vec![
        json!({ "key": "agent:main:1", "label": "First", "messageCount": 4 }),
        json!({ "id": "two" }),
    ]
}

#[tokio::test]
async fn handshake_then_sessions_are_hydrated() {
    let (url, gw) = start_gateway(MockGateway {
        sessions: two_sessions(),
        ..Default::default()
    })
    .await;
    let store = Store::new();
    let client = GatewayClient::connect(options(&url, TOKEN), store.clone()).await;

    eventually("hydration", || {
        let store = store.clone();
        async move { store.sessions().await.len() == 2 }
    })
    .await;

    let (connected, error) = store.connection().await;
    assert!(connected);
    assert_eq!(error, None);
    assert!(client.is_open().await);
    assert_eq!(gw.first_methods.lock().unwrap().as_slice(), ["connect"]);
    assert_eq!(
        gw.seen_tokens.lock().unwrap().as_slice(),
        [Some(TOKEN.to_string())]
    );
    let first = store.session("agent:main:1").await.unwrap();
    assert_eq!(first.label.as_deref(), Some("First"));
    assert_eq!(first.message_count, 4);
    assert_eq!(store.session("two").await.unwrap().key, "two");
    client.close().await;
}

#[tokio::test]
async fn rejected_handshake_records_error() {
    let (url, _gw) = start_gateway(MockGateway {
        sessions: two_sessions(),
        ..Default::default()
    })
    .await;
    let store = Store::new();
    let client = GatewayClient::connect(options(&url, "wrong"), store.clone()).await;

    eventually("handshake error", || {
        let store = store.clone();
        async move { store.connection().await.1.is_some() }
    })
    .await;

    let (connected, error) = store.connection().await;
    assert!(!connected);
    assert!(error.unwrap().contains("invalid token"));
    assert!(store.sessions().await.is_empty());

    // The gateway keeps the socket open, but the client no longer uses it.
    assert!(!client.is_open().await);
    assert_eq!(
        client.request("echo", json!({ "after": "rejected" })).await.unwrap_err(),
        ClientError::NotConnected
    );
    client.close().await;
}

#[tokio::test]
async fn concurrent_requests_are_correlated() {
    let (url, _gw) = start_gateway(MockGateway::default()).await;
    let store = Store::new();
    let client = GatewayClient::connect(options(&url, TOKEN), store.clone()).await;
    eventually("connection", || {
        let store = store.clone();
        async move { store.connection().await.0 }
    })
    .await;

    let calls = (0..8).map(|n| {
        let client = client.clone();
        async move { client.request("echo", json!({ "n": n })).await }
    });
    let results = futures_util::future::join_all(calls).await;
    for (n, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap(), json!({ "n": n }));
    }

    let err = client.request("no.such.method", Value::Null).await.unwrap_err();
    assert_eq!(
        err,
        ClientError::Gateway {
            code: "UNKNOWN_METHOD".to_string(),
            message: "unknown method no.such.method".to_string(),
        }
    );
    client.close().await;
}

#[tokio::test]
async fn sent_message_streams_into_one_reply() {
    let (url, _gw) = start_gateway(MockGateway::default()).await;
    let store = Store::new();
    let client = GatewayClient::connect(options(&url, TOKEN), store.clone()).await;
    eventually("connection", || {
        let store = store.clone();
        async move { store.connection().await.0 }
    })
    .await;

    let key = store.create_local_session().await;
    let chat = ChatWorkflow::new(client.clone(), store.clone(), 100);
    let outcome = chat
        .send_message(&key, "Please help me refactor auth.go", &[])
        .await;
    assert!(matches!(outcome, SendOutcome::Sent { .. }));

    eventually("final reply", || {
        let store = store.clone();
        let key = key.clone();
        async move { store.messages(&key).await.len() == 2 && store.streaming_content(&key).await.is_none() }
    })
    .await;

    let messages = store.messages(&key).await;
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].id, "reply-1");
    assert_eq!(messages[1].text(), "Looking at it");

    let session = store.session(&key).await.unwrap();
    assert_eq!(session.label.as_deref(), Some("Help me refactor auth.go"));
    assert_eq!(session.status, SessionStatus::Idle);

    let files = store.recent_files(&key).await;
    assert_eq!(files.len(), 1);
    assert_eq!((files[0].path.as_str(), files[0].action), ("auth.go", FileAction::Edit));
    assert!(store.connection().await.0, "malformed frame must not drop the connection");
    client.close().await;
}

#[tokio::test]
async fn reconnect_rehydrates_without_duplicates() {
    let (url, gw) = start_gateway(MockGateway {
        sessions: two_sessions(),
        ..Default::default()
    })
    .await;
    let store = Store::new();
    let pending = store.create_local_session().await;
    let client = GatewayClient::connect(options(&url, TOKEN), store.clone()).await;
    eventually("first hydration", || {
        let gw = gw.clone();
        let store = store.clone();
        async move { gw.list_calls.load(Ordering::SeqCst) == 1 && store.sessions().await.len() == 3 }
    })
    .await;
    let before: HashSet<String> = store.sessions().await.into_iter().map(|s| s.key).collect();

    let err = client.request("test.hangup", Value::Null).await.unwrap_err();
    assert_eq!(err, ClientError::TransportClosed);

    eventually("second hydration", || {
        let gw = gw.clone();
        let store = store.clone();
        async move { gw.list_calls.load(Ordering::SeqCst) == 2 && store.connection().await.0 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(gw.connections.load(Ordering::SeqCst), 2);
    assert_eq!(
        gw.first_methods.lock().unwrap().as_slice(),
        ["connect", "connect"]
    );
    let sessions = store.sessions().await;
    let after: HashSet<String> = sessions.iter().map(|s| s.key.clone()).collect();
    assert_eq!(sessions.len(), after.len(), "duplicate session records");
    assert_eq!(before, after);
    assert!(after.contains(&pending));
    client.close().await;
}

#[tokio::test]
async fn closed_client_fails_fast() {
    let (url, _gw) = start_gateway(MockGateway::default()).await;
    let store = Store::new();
    let client = GatewayClient::connect(options(&url, TOKEN), store.clone()).await;
    eventually("connection", || {
        let store = store.clone();
        async move { store.connection().await.0 }
    })
    .await;

    let frame = Frame::Request(WsRequest {
        id: "raw-1".to_string(),
        method: "echo".to_string(),
        params: Some(json!({ "raw": true })),
    });
    client.send_frame(&frame).await.unwrap();

    client.close().await;
    assert!(!store.connection().await.0);
    assert!(!client.is_open().await);
    assert_eq!(
        client.request("echo", Value::Null).await.unwrap_err(),
        ClientError::NotConnected
    );
    assert_eq!(
        client.send_frame(&frame).await.unwrap_err(),
        ClientError::NotConnected
    );
}
