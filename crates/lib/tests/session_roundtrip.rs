//! Integration test: run a fake chat server (WebSocket stream + HTTP API) on a free port and
//! drive the real transport, controller and API client against it.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use streamchat::api::ApiClient;
use streamchat::conversation::{ConversationId, Role};
use streamchat::error::ChatError;
use streamchat::session::{
    ControllerHandle, ImageAttachment, LinkState, Notice, ReconnectPolicy, SessionConfig,
    SessionController, SessionPolicy, Submission, WsTransport,
};

type Ctl = SessionController<WsTransport, ApiClient>;

#[derive(Default)]
struct ServerState {
    connections: AtomicUsize,
    requests: Mutex<Vec<Value>>,
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

fn delta(text: &str, done: bool) -> Value {
    json!({"model": "m1", "message": {"role": "assistant", "content": text}, "done": done})
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

/// Echo server: replies "echo: <last user message>" in two deltas, then a done frame.
async fn serve_socket(mut socket: WebSocket, state: Arc<ServerState>) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else { continue };
        let request: Value = serde_json::from_str(&text).expect("request json");
        state.requests.lock().unwrap().push(request.clone());
        let prompt = request["messages"]
            .as_array()
            .and_then(|m| m.last())
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string();
        let mut frames = Vec::new();
        if request["web_search"] == json!(true) {
            frames.push(json!({"status": "searching", "detail": prompt}));
        }
        if prompt == "fail" {
            frames.push(json!({"error": "boom"}));
        } else {
            let reply = format!("echo: {}", prompt);
            let (head, tail) = reply.split_at(reply.len() / 2);
            frames.push(delta(head, false));
            frames.push(delta(tail, false));
            frames.push(delta("", true));
        }
        for frame in frames {
            if socket.send(WsMessage::Text(frame.to_string())).await.is_err() {
                return;
            }
        }
    }
}

async fn chat_handler(Json(body): Json<Value>) -> Response {
    if body["stream"] != json!(false) {
        return (StatusCode::BAD_REQUEST, "stream must be false").into_response();
    }
    let has_image = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_array())
        .is_some_and(|parts| parts.iter().any(|p| p["type"] == "image_url"));
    if !has_image {
        return (StatusCode::BAD_REQUEST, "expected an image part").into_response();
    }
    Json(json!({"message": {"role": "assistant", "content": "A cat."}, "done": true}))
        .into_response()
}

async fn history_handler(Path(id): Path<String>) -> Response {
    if id != "srv-1" {
        return (StatusCode::NOT_FOUND, "Conversation not found").into_response();
    }
    Json(json!({"messages": [
        {"role": "user", "content": "Hi"},
        {"role": "tool", "content": "lookup"},
        {"role": "assistant", "content": "Hello"}
    ]}))
    .into_response()
}

async fn delete_handler(Path(id): Path<String>) -> Json<Value> {
    Json(json!({"status": "deleted", "id": id}))
}

async fn start_server() -> (u16, Arc<ServerState>) {
    let port = free_port();
    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/api/ws", get(ws_handler))
        .route("/api/chat", post(chat_handler))
        .route(
            "/api/models",
            get(|| async { Json(json!({"models": [{"name": "m1", "size": 42}, {"name": "m2"}]})) }),
        )
        .route(
            "/api/conversations",
            post(|| async { Json(json!({"conversation_id": "srv-1"})) }).get(|| async {
                Json(json!({"conversations": [
                    {"id": "srv-1", "title": "Hi", "timestamp": "2024-05-01T10:00:00"}
                ]}))
            }),
        )
        .route("/api/history/:id", get(history_handler).delete(delete_handler))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .expect("bind server");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (port, state)
}

fn api(port: u16) -> Arc<ApiClient> {
    let client = ApiClient::new(Some(format!("http://127.0.0.1:{}", port)), Duration::from_secs(5))
        .expect("api client");
    Arc::new(client)
}

fn ws_url(port: u16) -> String {
    format!("ws://127.0.0.1:{}/api/ws", port)
}

fn controller(
    port: u16,
    policy: SessionPolicy,
) -> (Ctl, ControllerHandle, tokio::sync::mpsc::UnboundedReceiver<Notice>) {
    SessionController::new(policy, WsTransport::new(), api(port), ConversationId::new("c1"))
}

async fn step_until(ctl: &mut Ctl, what: &str, done: impl Fn(&Ctl) -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !done(&*ctl) {
            ctl.step().await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

#[tokio::test]
async fn streamed_turn_over_websocket() {
    let (port, state) = start_server().await;
    let (mut ctl, _handle, mut rx) = controller(port, SessionPolicy::default());

    ctl.select_model(Some(SessionConfig::new("m1", ws_url(port))));
    step_until(&mut ctl, "open", |c| c.link_state() == LinkState::Open).await;

    ctl.submit(Submission::text("Hi")).unwrap();
    step_until(&mut ctl, "reply", |c| !c.is_pending()).await;

    let messages = &ctl.conversation().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "echo: Hi");

    let requests = state.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["model"], "m1");
    assert_eq!(requests[0]["conversation_id"], "c1");

    let notices = drain(&mut rx);
    assert!(notices.iter().all(|n| !matches!(n, Notice::Error(_))));
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::Finished(m) if m.content == "echo: Hi")));
}

#[tokio::test]
async fn search_status_and_backend_error_are_reported() {
    let (port, _state) = start_server().await;
    let (mut ctl, _handle, mut rx) = controller(port, SessionPolicy::default());
    ctl.select_model(Some(SessionConfig::new("m1", ws_url(port))));
    step_until(&mut ctl, "open", |c| c.link_state() == LinkState::Open).await;

    ctl.submit(Submission::text("fail").with_search(true)).unwrap();
    step_until(&mut ctl, "error frame", |c| !c.is_pending()).await;

    let notices = drain(&mut rx);
    assert!(notices.contains(&Notice::Status {
        phase: "searching".to_string(),
        detail: "fail".to_string()
    }));
    assert!(notices.contains(&Notice::Error(ChatError::Backend("boom".to_string()))));
    assert_eq!(ctl.link_state(), LinkState::Open);
}

#[tokio::test]
async fn model_switch_opens_a_new_connection() {
    let (port, state) = start_server().await;
    let (mut ctl, _handle, _rx) = controller(port, SessionPolicy::default());
    ctl.select_model(Some(SessionConfig::new("m1", ws_url(port))));
    step_until(&mut ctl, "first open", |c| c.link_state() == LinkState::Open).await;

    ctl.select_model(Some(SessionConfig::new("m2", ws_url(port))));
    step_until(&mut ctl, "second open", |c| c.link_state() == LinkState::Open).await;
    ctl.submit(Submission::text("Hi")).unwrap();
    step_until(&mut ctl, "reply", |c| !c.is_pending()).await;

    assert_eq!(state.connections.load(Ordering::SeqCst), 2);
    assert_eq!(state.requests.lock().unwrap()[0]["model"], "m2");
}

#[tokio::test]
async fn image_turn_goes_through_http() {
    let (port, state) = start_server().await;
    let (mut ctl, _handle, mut rx) = controller(port, SessionPolicy::default());
    ctl.select_model(Some(SessionConfig::new("m1", ws_url(port))));

    let sub = Submission::text("what is this?")
        .with_image(ImageAttachment::from_bytes(&[1, 2, 3], "image/png"));
    ctl.submit(sub).unwrap();
    step_until(&mut ctl, "one-shot reply", |c| !c.is_pending()).await;

    let messages = &ctl.conversation().messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, "A cat.");
    assert!(state.requests.lock().unwrap().is_empty());
    assert!(drain(&mut rx).iter().all(|n| !matches!(n, Notice::Error(_))));
}

#[tokio::test]
async fn unreachable_server_exhausts_reconnects() {
    let port = free_port();
    let policy = SessionPolicy {
        reconnect: ReconnectPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(10),
        },
        ..SessionPolicy::default()
    };
    let (mut ctl, _handle, mut rx) = controller(port, policy);
    ctl.select_model(Some(SessionConfig::new("m1", ws_url(port))));
    step_until(&mut ctl, "give up", |c| c.link_state() == LinkState::Failed).await;

    let notices = drain(&mut rx);
    assert!(notices.contains(&Notice::Error(ChatError::Transport { attempts: 2 })));
    let retries = notices
        .iter()
        .filter(|n| matches!(n, Notice::Reconnecting { .. }))
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn api_client_endpoints() {
    let (port, _state) = start_server().await;
    let client = api(port);

    let models = client.list_models().await.unwrap();
    let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["m1", "m2"]);
    assert_eq!(models[0].size, Some(42));

    let id = client.create_conversation().await.unwrap();
    assert_eq!(id.as_str(), "srv-1");

    let conversations = client.list_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].title, "Hi");

    let history = client.history(&id).await.unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
    assert_eq!(history[1].content, "Hello");

    client.delete_conversation(&id).await.unwrap();
    assert!(client.history(&ConversationId::new("missing")).await.is_err());
}
