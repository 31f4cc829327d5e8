//! Agent session tests against a mock voice-agent server.
//!
//! These verify the settings handshake gate: content messages must not reach
//! the agent before it has acknowledged the session settings.

mod common;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use common::{Direction, MockSocket, Recorder, next_of_type, spawn_mock};
use waav_agent_relay::core::agent::AgentClientMessage;
use waav_agent_relay::core::events::channel_callback;
use waav_agent_relay::{
    AgentError, AgentSession, AgentSessionConfig, ConnectionState, ReadyOutcome, SendOutcome,
    SessionEvent, Settings,
};

/// Mock agent: greets, then acknowledges `Settings` after `ack_delay` (never if `None`).
async fn run_mock_agent(mut ws: MockSocket, recorder: Recorder, ack_delay: Option<Duration>) {
    recorder
        .send(&mut ws, json!({"type": "Welcome", "request_id": "req-1"}))
        .await;

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let body = recorder.received(text.as_str());
        if body["type"] == "Settings"
            && let Some(delay) = ack_delay
        {
            tokio::time::sleep(delay).await;
            recorder
                .send(&mut ws, json!({"type": "SettingsApplied"}))
                .await;
        }
    }
}

fn session_config(endpoint: String) -> AgentSessionConfig {
    AgentSessionConfig {
        endpoint,
        connect_timeout: Duration::from_secs(2),
        readiness_timeout: Duration::from_secs(2),
        readiness_grace: Duration::from_millis(500),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_user_message_waits_for_settings_applied() {
    let (recorder, mut observed) = Recorder::channel();
    let (url, _handshakes) = spawn_mock(move |ws| {
        run_mock_agent(ws, recorder.clone(), Some(Duration::from_millis(100)))
    })
    .await;

    let session = AgentSession::new(session_config(url));
    session.connect().await.expect("connect");
    assert!(session.configure(&Settings::default()).expect("configure"));
    assert!(!session.is_ready());

    let outcome = session.inject_user_message("hello").await.expect("inject");
    assert_eq!(outcome, SendOutcome::Sent);
    assert!(session.is_ready());

    let settings = next_of_type(&mut observed, "Settings").await;
    let applied = next_of_type(&mut observed, "SettingsApplied").await;
    let inject = next_of_type(&mut observed, "InjectUserMessage").await;

    assert_eq!(settings.direction, Direction::Received);
    assert_eq!(applied.direction, Direction::Sent);
    assert_eq!(inject.body["content"], "hello");
    assert!(inject.at >= applied.at);
    assert!(inject.at.duration_since(settings.at) >= Duration::from_millis(100));

    session.close();
}

#[tokio::test]
async fn test_settings_sent_once_per_attempt() {
    let (recorder, mut observed) = Recorder::channel();
    let (url, _handshakes) = spawn_mock(move |ws| {
        run_mock_agent(ws, recorder.clone(), Some(Duration::from_millis(10)))
    })
    .await;

    let session = AgentSession::new(session_config(url));
    session.connect().await.expect("connect");
    assert!(session.configure(&Settings::default()).expect("first"));
    assert!(!session.configure(&Settings::default()).expect("second"));

    assert_eq!(
        session.wait_until_ready(Duration::from_secs(2)).await,
        ReadyOutcome::Ready
    );
    next_of_type(&mut observed, "Settings").await;
    next_of_type(&mut observed, "SettingsApplied").await;
    assert!(
        timeout(Duration::from_millis(200), next_of_type(&mut observed, "Settings"))
            .await
            .is_err(),
        "Settings must not be sent twice on one attempt"
    );

    session.close();
}

#[tokio::test]
async fn test_readiness_timeout_warns_then_sends() {
    let (recorder, mut observed) = Recorder::channel();
    let (url, _handshakes) =
        spawn_mock(move |ws| run_mock_agent(ws, recorder.clone(), None)).await;

    let session = AgentSession::new(AgentSessionConfig {
        readiness_timeout: Duration::from_millis(100),
        readiness_grace: Duration::from_millis(50),
        ..session_config(url)
    });
    let (tx, mut events) = mpsc::unbounded_channel();
    session.on_event(channel_callback(tx));

    session.connect().await.expect("connect");
    session.configure(&Settings::default()).expect("configure");

    let outcome = session.inject_user_message("anyone there?").await.expect("inject");
    assert_eq!(outcome, SendOutcome::Sent);

    let warning = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(SessionEvent::Warning(details)) => return details,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("settings warning");
    assert_eq!(warning.code, "settings_not_applied");
    assert!(warning.recoverable);

    let inject = next_of_type(&mut observed, "InjectUserMessage").await;
    assert_eq!(inject.body["content"], "anyone there?");

    session.close();
}

#[tokio::test]
async fn test_close_releases_waiting_sends() {
    let (recorder, _observed) = Recorder::channel();
    let (url, _handshakes) =
        spawn_mock(move |ws| run_mock_agent(ws, recorder.clone(), None)).await;

    let session = AgentSession::new(AgentSessionConfig {
        readiness_timeout: Duration::from_secs(10),
        ..session_config(url)
    });
    session.connect().await.expect("connect");
    session.configure(&Settings::default()).expect("configure");

    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.inject_user_message("late").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.close();

    let result = timeout(Duration::from_secs(1), waiting)
        .await
        .expect("send resolved after close")
        .expect("task");
    assert!(matches!(result, Err(AgentError::Closed)));
}

#[tokio::test]
async fn test_connect_failure_reports_error() {
    let port = common::unused_port();
    let session = AgentSession::new(session_config(format!("ws://127.0.0.1:{port}")));
    assert!(session.connect().await.is_err());
    assert!(matches!(
        session.inject_user_message("hi").await,
        Err(AgentError::NotConnected)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_configure_from_connected_callback_on_every_attempt() {
    let (recorder, mut observed) = Recorder::channel();
    let (url, _handshakes) = spawn_mock(move |ws| {
        run_mock_agent(ws, recorder.clone(), Some(Duration::from_millis(5)))
    })
    .await;

    let session = AgentSession::new(session_config(url));
    let (tx, mut configured) = mpsc::unbounded_channel();
    {
        let host = session.clone();
        session.on_event(Arc::new(move |event| -> BoxFuture<'static, ()> {
            if let SessionEvent::ConnectionStateChanged {
                state: ConnectionState::Connected,
                ..
            } = event
            {
                let _ = tx.send(host.configure(&Settings::default()));
            }
            Box::pin(async {})
        }));
    }

    for cycle in 0..5 {
        session.connect().await.expect("connect");
        let sent = timeout(Duration::from_secs(2), configured.recv())
            .await
            .expect("connected callback ran")
            .expect("callback channel open");
        assert!(
            matches!(sent, Ok(true)),
            "cycle {cycle}: configure from callback returned {sent:?}"
        );
        next_of_type(&mut observed, "Settings").await;
        assert_eq!(
            session.wait_until_ready(Duration::from_secs(2)).await,
            ReadyOutcome::Ready
        );
        session.close();
    }
}

/// Mock agent that answers `Settings` with a close frame carrying no status code.
async fn run_bare_closing_agent(mut ws: MockSocket) {
    while let Some(Ok(message)) = ws.next().await {
        if matches!(message, Message::Text(_)) {
            let _ = ws.close(None).await;
            break;
        }
    }
}

#[tokio::test]
async fn test_close_without_status_code_is_reported() {
    let (url, _handshakes) = spawn_mock(run_bare_closing_agent).await;
    let session = AgentSession::new(session_config(url));
    let (tx, mut events) = mpsc::unbounded_channel();
    session.on_event(channel_callback(tx));

    session.connect().await.expect("connect");
    session.configure(&Settings::default()).expect("configure");

    let details = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(SessionEvent::Error(details)) => return details,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("error for bare close");
    assert_eq!(details.code, "connection_closed");
    assert!(details.details.as_ref().unwrap()["code"].is_null());
    assert_eq!(session.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_send_routes_by_message_kind() {
    let (recorder, mut observed) = Recorder::channel();
    let (url, _handshakes) = spawn_mock(move |ws| {
        run_mock_agent(ws, recorder.clone(), Some(Duration::from_millis(100)))
    })
    .await;

    let session = AgentSession::new(session_config(url));
    session.connect().await.expect("connect");
    let outcome = session
        .send(AgentClientMessage::Settings(Settings::default()))
        .await
        .expect("settings");
    assert_eq!(outcome, SendOutcome::Sent);

    let inject = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .send(AgentClientMessage::InjectUserMessage {
                    content: "gated".into(),
                })
                .await
        })
    };
    let outcome = session
        .send(AgentClientMessage::KeepAlive)
        .await
        .expect("keep alive");
    assert_eq!(outcome, SendOutcome::Sent);
    assert!(!inject.is_finished(), "content sent before settings applied");

    // The socket preserves write order: KeepAlive went out ahead of the gated message.
    next_of_type(&mut observed, "Settings").await;
    next_of_type(&mut observed, "KeepAlive").await;
    next_of_type(&mut observed, "InjectUserMessage").await;
    assert_eq!(
        inject.await.expect("task").expect("inject"),
        SendOutcome::Sent
    );

    session.close();
}
