#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use murmur_db::Database;
use murmur_server::config::Config;
use murmur_server::{build_router, build_state};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn app() -> Router {
    app_with(&[])
}

/// Test app with extra config entries, e.g. tighter rate limits.
pub fn app_with(overrides: &[(&str, &str)]) -> Router {
    let config = Config::from_lookup(|key| {
        if let Some((_, value)) = overrides.iter().find(|(k, _)| *k == key) {
            return Some(value.to_string());
        }
        match key {
            "MURMUR_JWT_SECRET" => Some("integration-test-secret-0123456789".into()),
            "MURMUR_HISTORY_MAX_LIMIT" => Some("20".into()),
            _ => None,
        }
    })
    .unwrap();
    let db = Arc::new(Database::open_in_memory().unwrap());
    build_router(build_state(&config, db))
}

pub async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

pub struct User {
    pub id: String,
    pub access: String,
    pub refresh: String,
}

pub async fn register(app: &Router, username: &str) -> User {
    let (status, body) = call(
        app,
        Method::POST,
        "/auth/register",
        None,
        Some(json!({ "username": username, "password": "hunter22-long" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    User {
        id: body["user_id"].as_str().unwrap().to_string(),
        access: body["access_token"].as_str().unwrap().to_string(),
        refresh: body["refresh_token"].as_str().unwrap().to_string(),
    }
}

/// Creates a room owned by `owner`; returns (room_id, invite_code).
pub async fn create_room(app: &Router, owner: &User, name: &str) -> (String, String) {
    let (status, body) = call(app, Method::POST, "/rooms", Some(&owner.access), Some(json!({ "name": name }))).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    (
        body["id"].as_str().unwrap().to_string(),
        body["invite_code"].as_str().unwrap().to_string(),
    )
}

pub async fn join(app: &Router, user: &User, invite_code: &str) -> StatusCode {
    call(
        app,
        Method::POST,
        "/rooms/join",
        Some(&user.access),
        Some(json!({ "invite_code": invite_code })),
    )
    .await
    .0
}

pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub async fn connect(addr: SocketAddr, room_id: &str, token: &str) -> Ws {
    let url = format!("ws://{}/ws?room_id={}&token={}", addr, room_id, token);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Next frame, with a timeout so a missing event fails instead of hanging.
pub async fn next_frame(ws: &mut Ws) -> WsMessage {
    tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("socket ended")
        .expect("socket error")
}

/// Skips frames until a text event of the given type arrives.
pub async fn wait_for(ws: &mut Ws, kind: &str) -> Value {
    loop {
        match next_frame(ws).await {
            WsMessage::Text(text) => {
                let event: Value = serde_json::from_str(text.as_str()).unwrap();
                if event["type"] == kind {
                    return event;
                }
            }
            WsMessage::Close(frame) => panic!("closed while waiting for {kind}: {frame:?}"),
            _ => {}
        }
    }
}

/// Skips frames until the close frame and returns its code.
pub async fn wait_for_close(ws: &mut Ws) -> u16 {
    loop {
        if let WsMessage::Close(frame) = next_frame(ws).await {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}
