//! Relay server tests against a mock realtime upstream.
//!
//! A real relay is served on an ephemeral port; clients speak the voice-agent
//! protocol to it while the mock upstream records what the relay forwards.

mod common;

use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tower::util::ServiceExt;

use common::{
    Direction, MockSocket, Recorder, client_next_of_type, next_of_type, relay_config,
    spawn_mock, start_relay,
};
use waav_agent_relay::config::AuthApiSecret;
use waav_agent_relay::core::bridge::UPSTREAM_CLOSED_BEFORE_READY;
use waav_agent_relay::{create_app, state::AppState};

/// Mock realtime upstream that applies settings after `settings_delay` and
/// acknowledges every created item after `item_delay`.
async fn run_mock_upstream(
    mut ws: MockSocket,
    recorder: Recorder,
    settings_delay: Duration,
    item_delay: Duration,
) {
    recorder
        .send(
            &mut ws,
            json!({"type": "session.created", "session": {"id": "sess_1"}}),
        )
        .await;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let body = recorder.received(text.as_str());
        match body["type"].as_str() {
            Some("session.update") => {
                tokio::time::sleep(settings_delay).await;
                recorder
                    .send(
                        &mut ws,
                        json!({"type": "session.updated", "session": {"id": "sess_1"}}),
                    )
                    .await;
            }
            Some("conversation.item.create") => {
                tokio::time::sleep(item_delay).await;
                let item = &body["item"];
                recorder
                    .send(
                        &mut ws,
                        json!({
                            "type": "conversation.item.created",
                            "item": {"id": item["id"], "type": "message"}
                        }),
                    )
                    .await;
            }
            _ => {}
        }
    }
}

/// Mock upstream that rejects the session as soon as settings arrive.
async fn run_rejecting_upstream(mut ws: MockSocket, recorder: Recorder) {
    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let body = recorder.received(text.as_str());
        if body["type"] == "session.update" {
            let _ = ws
                .close(Some(CloseFrame {
                    code: CloseCode::from(4001),
                    reason: "invalid api key".into(),
                }))
                .await;
            break;
        }
    }
}

async fn expect_close(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tungstenite::Error>> + Unpin),
) -> Option<(u16, String)> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| (u16::from(f.code), f.reason.as_str().to_string()));
                }
                Some(Ok(_)) => continue,
                _ => return None,
            }
        }
    })
    .await
    .expect("close frame")
}

// =============================================================================
// Ordering through the relay
// =============================================================================

#[tokio::test]
async fn test_relay_holds_user_message_until_settings_applied() {
    let (recorder, mut observed) = Recorder::channel();
    let (upstream_url, mut handshakes) = spawn_mock(move |ws| {
        run_mock_upstream(ws, recorder.clone(), Duration::from_millis(100), Duration::ZERO)
    })
    .await;
    let (addr, _state) = start_relay(relay_config(&upstream_url)).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/agent")).await.expect("connect");
    client
        .send(Message::Text(json!({"type": "Settings"}).to_string().into()))
        .await
        .unwrap();
    client
        .send(Message::Text(
            json!({"type": "InjectUserMessage", "content": "hello"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let welcome = client_next_of_type(&mut client, "Welcome").await;
    assert_eq!(welcome["request_id"], "sess_1");

    let update = next_of_type(&mut observed, "session.update").await;
    let updated = next_of_type(&mut observed, "session.updated").await;
    let create = next_of_type(&mut observed, "conversation.item.create").await;
    let created = next_of_type(&mut observed, "conversation.item.created").await;
    let response = next_of_type(&mut observed, "response.create").await;

    assert_eq!(update.direction, Direction::Received);
    assert!(create.at >= updated.at, "item sent before settings were applied");
    assert!(create.at.duration_since(update.at) >= Duration::from_millis(100));
    assert!(response.at >= created.at, "response requested before item ack");

    let item_id = create.body["item"]["id"].as_str().unwrap();
    assert!(item_id.starts_with("item_"));
    assert!(item_id.len() <= 32);
    assert_eq!(create.body["item"]["role"], "user");
    assert_eq!(create.body["item"]["content"][0]["text"], "hello");

    client_next_of_type(&mut client, "SettingsApplied").await;

    let handshake = handshakes.recv().await.expect("upstream handshake");
    assert_eq!(handshake.header("authorization"), Some("Bearer sk-test"));
    assert_eq!(handshake.header("openai-beta"), Some("realtime=v1"));
    assert!(handshake.uri.contains("model="));
}

#[tokio::test]
async fn test_relay_requests_response_only_after_item_ack() {
    let (recorder, mut observed) = Recorder::channel();
    let (upstream_url, _handshakes) = spawn_mock(move |ws| {
        run_mock_upstream(
            ws,
            recorder.clone(),
            Duration::ZERO,
            Duration::from_millis(100),
        )
    })
    .await;
    let (addr, _state) = start_relay(relay_config(&upstream_url)).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/agent")).await.expect("connect");
    client
        .send(Message::Text(json!({"type": "Settings"}).to_string().into()))
        .await
        .unwrap();
    client_next_of_type(&mut client, "SettingsApplied").await;
    client
        .send(Message::Text(
            json!({"type": "InjectUserMessage", "content": "slow ack"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    let create = next_of_type(&mut observed, "conversation.item.create").await;
    let created = next_of_type(&mut observed, "conversation.item.created").await;
    let response = next_of_type(&mut observed, "response.create").await;

    assert_eq!(create.body["item"]["id"], created.body["item"]["id"]);
    assert!(response.at >= created.at, "response requested before item ack");
    assert!(
        response.at.duration_since(create.at) >= Duration::from_millis(100),
        "response requested without waiting for the delayed ack"
    );
}

#[tokio::test]
async fn test_relay_explains_upstream_close_before_ready() {
    let (recorder, mut observed) = Recorder::channel();
    let (upstream_url, _handshakes) =
        spawn_mock(move |ws| run_rejecting_upstream(ws, recorder.clone())).await;
    let (addr, _state) = start_relay(relay_config(&upstream_url)).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/agent")).await.expect("connect");
    client
        .send(Message::Text(json!({"type": "Settings"}).to_string().into()))
        .await
        .unwrap();
    client
        .send(Message::Text(
            json!({"type": "InjectUserMessage", "content": "lost"})
                .to_string()
                .into(),
        ))
        .await
        .unwrap();

    next_of_type(&mut observed, "session.update").await;

    let error = client_next_of_type(&mut client, "Error").await;
    assert_eq!(error["code"], UPSTREAM_CLOSED_BEFORE_READY);
    assert!(error["description"].as_str().unwrap().contains("4001"));

    let close = expect_close(&mut client).await;
    assert_eq!(close.map(|(code, _)| code), Some(4001));
}

#[tokio::test]
async fn test_relay_reports_unreachable_upstream() {
    let port = common::unused_port();
    let (addr, state) = start_relay(relay_config(&format!("ws://127.0.0.1:{port}"))).await;

    let (mut client, _) = connect_async(format!("ws://{addr}/agent")).await.expect("connect");
    let error = client_next_of_type(&mut client, "Error").await;
    assert_eq!(error["code"], UPSTREAM_CLOSED_BEFORE_READY);

    let close = expect_close(&mut client).await;
    assert_eq!(close.map(|(code, _)| code), Some(1011));

    // Slot is released once the relay task ends.
    tokio::time::timeout(Duration::from_secs(5), async {
        while state.ws_connection_count() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("connection slot released");
}

// =============================================================================
// HTTP surface
// =============================================================================

fn test_app(state: std::sync::Arc<AppState>) -> axum::Router {
    create_app(state).layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9000))))
}

#[tokio::test]
async fn test_health_check() {
    let state = AppState::new(relay_config("ws://127.0.0.1:1"));
    let response = test_app(state)
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "OK");
    assert_eq!(json["connections"], 0);
}

#[tokio::test]
async fn test_relay_rejects_missing_token() {
    let mut config = relay_config("ws://127.0.0.1:1");
    config.auth_required = true;
    config.auth_api_secrets = vec![AuthApiSecret {
        id: "client-a".to_string(),
        secret: "s3cret".to_string(),
    }];
    let state = AppState::new(config);

    let request = Request::builder()
        .uri("/agent")
        .header("connection", "upgrade")
        .header("upgrade", "websocket")
        .header("sec-websocket-version", "13")
        .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
        .body(Body::empty())
        .unwrap();
    let response = test_app(state.clone()).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.ws_connection_count(), 0);
}

#[tokio::test]
async fn test_relay_accepts_bearer_and_query_tokens() {
    let (recorder, _observed) = Recorder::channel();
    let (upstream_url, _handshakes) = spawn_mock(move |ws| {
        run_mock_upstream(ws, recorder.clone(), Duration::ZERO, Duration::ZERO)
    })
    .await;
    let mut config = relay_config(&upstream_url);
    config.auth_required = true;
    config.auth_api_secrets = vec![AuthApiSecret {
        id: "client-a".to_string(),
        secret: "s3cret".to_string(),
    }];
    let (addr, _state) = start_relay(config).await;

    let mut request = format!("ws://{addr}/agent").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer s3cret".parse().unwrap());
    let (mut client, _) = connect_async(request).await.expect("bearer accepted");
    client_next_of_type(&mut client, "Welcome").await;

    let (mut client, _) = connect_async(format!("ws://{addr}/agent?token=s3cret"))
        .await
        .expect("query token accepted");
    client_next_of_type(&mut client, "Welcome").await;

    match connect_async(format!("ws://{addr}/agent?token=wrong")).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
        }
        other => panic!("expected 401, got {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_enforces_per_ip_limit() {
    let (recorder, _observed) = Recorder::channel();
    let (upstream_url, _handshakes) = spawn_mock(move |ws| {
        run_mock_upstream(ws, recorder.clone(), Duration::ZERO, Duration::ZERO)
    })
    .await;
    let mut config = relay_config(&upstream_url);
    config.max_connections_per_ip = 1;
    let (addr, state) = start_relay(config).await;

    let (mut first, _) = connect_async(format!("ws://{addr}/agent")).await.expect("first");
    client_next_of_type(&mut first, "Welcome").await;
    assert_eq!(state.ws_connection_count(), 1);

    match connect_async(format!("ws://{addr}/agent")).await {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS)
        }
        other => panic!("expected 429, got {other:?}"),
    }
    assert_eq!(state.ws_connection_count(), 1);
}
