//! Session creation, idle sweep, expiry, hooks and keep-alive.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{Document, Model};
use docsync_server::{
    ClientError, ClientSession, ClientState, Handler, HookResult, ServerConfig, ServerContext,
    SessionContext,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value as JsonValue};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use common::{eventually, http_get, start};

fn sweeping_config() -> ServerConfig {
    ServerConfig {
        check_unused_sessions_ms: 50,
        unused_session_lifetime_ms: 100,
        ..ServerConfig::default()
    }
}

#[derive(Default)]
struct Recorder {
    loaded: AtomicUsize,
    unloaded: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    payload_user: Mutex<Option<JsonValue>>,
}

struct RecordingHandler(Arc<Recorder>);

#[async_trait]
impl Handler for RecordingHandler {
    async fn on_server_loaded(&self, _server: &ServerContext) -> HookResult {
        self.0.loaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_server_unloaded(&self, _server: &ServerContext) -> HookResult {
        self.0.unloaded.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_session_created(&self, session: &mut SessionContext<'_>) -> HookResult {
        self.0.created.fetch_add(1, Ordering::SeqCst);
        *self.0.payload_user.lock() = session.token_payload().get("user").cloned();
        Ok(())
    }

    async fn on_session_destroyed(&self, _session: &mut SessionContext<'_>) -> HookResult {
        self.0.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn modify_document(&self, doc: &mut Document) -> HookResult {
        doc.add_root(Model::with_id("r", "Plot"), None)?;
        Ok(())
    }
}

#[tokio::test]
async fn test_idle_session_discarded_and_retired() {
    let recorder = Arc::new(Recorder::default());
    let server = start(sweeping_config(), Arc::new(RecordingHandler(Arc::clone(&recorder)))).await;

    let client = ClientSession::connect(&server.ws_url(), &server.token("S1"))
        .await
        .unwrap();
    client.force_roundtrip().await.unwrap();
    client.close().await;

    let app = Arc::clone(&server.app);
    assert!(eventually(|| app.get_session("S1").is_err()).await);
    assert!(app.is_retired("S1"));
    assert_eq!(recorder.destroyed.load(Ordering::SeqCst), 1);

    // A discarded id is never reused.
    let again = ClientSession::connect(&server.ws_url(), &server.token("S1")).await;
    assert!(matches!(again, Err(ClientError::Closed)));
    assert_eq!(recorder.created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_connected_session_survives_sweep() {
    let server = start(sweeping_config(), common::empty_handler()).await;
    let client = ClientSession::connect(&server.ws_url(), &server.token("S1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(server.app.get_session("S1").is_ok());
    client.force_roundtrip().await.unwrap();
}

#[tokio::test]
async fn test_requested_expiration_ends_session_early() {
    let config = ServerConfig {
        check_unused_sessions_ms: 50,
        unused_session_lifetime_ms: 60_000,
        ..ServerConfig::default()
    };
    let server = start(config, common::empty_handler()).await;
    let (status, _) = http_get(server.port, "/?bokeh-session-id=early").await;
    assert_eq!(status, 200);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = server.app.get_session("early").unwrap();
    session.request_expiration();

    let app = Arc::clone(&server.app);
    assert!(eventually(|| app.get_session("early").is_err()).await);
    assert!(session.destroyed());
}

#[tokio::test]
async fn test_hooks_and_token_payload() {
    let recorder = Arc::new(Recorder::default());
    let server = start(ServerConfig::default(), Arc::new(RecordingHandler(Arc::clone(&recorder)))).await;

    let mut extra = Map::new();
    extra.insert("user".into(), json!("ada"));
    let token = server
        .server
        .signer()
        .generate_token("S1", extra, Duration::from_secs(300))
        .unwrap();
    let client = ClientSession::connect(&server.ws_url(), &token).await.unwrap();
    client.pull().await.unwrap();

    assert_eq!(recorder.loaded.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.created.load(Ordering::SeqCst), 1);
    assert_eq!(*recorder.payload_user.lock(), Some(json!("ada")));
    assert_eq!(client.snapshot().await.roots, vec!["r".into()]);
    let payload = server.app.get_session("S1").unwrap().token_payload().clone();
    assert!(!payload.contains_key("session_id"));

    drop(client);
    server.shutdown().await;
    assert_eq!(recorder.unloaded.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_keep_alive_holds_responsive_connection() {
    let config = ServerConfig {
        keep_alive_ms: 50,
        keep_alive_timeout_ms: 300,
        ..ServerConfig::default()
    };
    let server = start(config, common::empty_handler()).await;
    let client = ClientSession::connect(&server.ws_url(), &server.token("S1"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(client.state(), ClientState::Connected);
    client.force_roundtrip().await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_closes_silent_connection() {
    let config = ServerConfig {
        keep_alive_ms: 50,
        keep_alive_timeout_ms: 150,
        ..ServerConfig::default()
    };
    let server = start(config, common::empty_handler()).await;

    let mut request = server.ws_url().into_client_request().unwrap();
    let protocol = format!("bokeh, {}", server.token("S1"));
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(&protocol).unwrap());
    let (mut stream, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    // Not polling the stream means pings go unanswered.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut close_code = None;
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Close(Some(frame))) => {
                close_code = Some(u16::from(frame.code));
                break;
            }
            Ok(_) => continue,
            Err(_) => break,
        }
    }
    assert_eq!(close_code, Some(1001));
}
