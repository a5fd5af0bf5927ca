//! Websocket handshake: subprotocol token, signatures, expiry and origin.

mod common;

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use docsync_server::{ClientError, ClientSession, ServerConfig, TokenSigner};
use serde_json::{json, Map};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Error as WsError;

use common::{empty_handler, http_get, start, start_default};

fn signed_config(secret: &str) -> ServerConfig {
    ServerConfig {
        sign_sessions: true,
        secret_key: Some(secret.to_string()),
        ..ServerConfig::default()
    }
}

fn rejected_status(result: Result<ClientSession, ClientError>) -> u16 {
    match result {
        Err(ClientError::Rejected(status)) => status,
        Err(other) => panic!("expected an HTTP rejection, got {other}"),
        Ok(_) => panic!("expected an HTTP rejection, connection was accepted"),
    }
}

#[tokio::test]
async fn test_signed_token_accepted() {
    let server = start(signed_config("abc"), empty_handler()).await;
    let session_id = server.server.signer().generate_session_id().unwrap();
    let client = ClientSession::connect(&server.ws_url(), &server.token(&session_id))
        .await
        .unwrap();
    client.force_roundtrip().await.unwrap();
    assert!(server.app.get_session(&session_id).is_ok());
}

#[tokio::test]
async fn test_token_signed_with_other_secret_rejected() {
    let server = start(signed_config("abc"), empty_handler()).await;
    let foreign = TokenSigner::new(Some("qrs"), true).unwrap();
    let session_id = foreign.generate_session_id().unwrap();
    let token = foreign
        .generate_token(&session_id, Map::new(), Duration::from_secs(300))
        .unwrap();

    let status = rejected_status(ClientSession::connect(&server.ws_url(), &token).await);
    assert_eq!(status, 403);
    assert!(server.app.get_sessions().is_empty());
}

#[tokio::test]
async fn test_unsigned_token_rejected_by_signed_server() {
    let server = start(signed_config("abc"), empty_handler()).await;
    let token = TokenSigner::unsigned()
        .generate_token("S1", Map::new(), Duration::from_secs(300))
        .unwrap();
    let status = rejected_status(ClientSession::connect(&server.ws_url(), &token).await);
    assert_eq!(status, 403);
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let server = start_default().await;
    let payload = json!({ "session_id": "S1", "session_expiry": 1 });
    let token = URL_SAFE_NO_PAD.encode(payload.to_string());

    let status = rejected_status(ClientSession::connect(&server.ws_url(), &token).await);
    assert_eq!(status, 403);
    assert_eq!(server.app.session_count(), 0);
}

#[tokio::test]
async fn test_garbage_token_rejected() {
    let server = start_default().await;
    let status = rejected_status(ClientSession::connect(&server.ws_url(), "not-a-token").await);
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_missing_subprotocol_rejected() {
    let server = start_default().await;
    match tokio_tungstenite::connect_async(server.ws_url()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("handshake without a token was accepted"),
    }
}

async fn connect_from(server: &common::TestServer, origin: &str) -> Result<(), u16> {
    let mut request = server.ws_url().into_client_request().unwrap();
    let protocol = format!("bokeh, {}", server.token("S1"));
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_str(&protocol).unwrap());
    request
        .headers_mut()
        .insert(header::ORIGIN, HeaderValue::from_str(origin).unwrap());
    match tokio_tungstenite::connect_async(request).await {
        Ok(_) => Ok(()),
        Err(WsError::Http(response)) => Err(response.status().as_u16()),
        Err(other) => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn test_foreign_origin_rejected() {
    let server = start_default().await;
    assert_eq!(connect_from(&server, "http://evil.example").await, Err(403));

    let same_host = format!("http://127.0.0.1:{}", server.port);
    assert_eq!(connect_from(&server, &same_host).await, Ok(()));
}

#[tokio::test]
async fn test_origin_allowlist_with_wildcard_port() {
    let config = ServerConfig {
        allowed_origins: vec!["good.example:*".to_string()],
        ..ServerConfig::default()
    };
    let server = start(config, empty_handler()).await;
    assert_eq!(connect_from(&server, "http://good.example:8443").await, Ok(()));
    assert_eq!(connect_from(&server, "http://bad.example:8443").await, Err(403));
}

#[tokio::test]
async fn test_session_id_required_when_generation_disabled() {
    let config = ServerConfig {
        generate_session_ids: false,
        ..ServerConfig::default()
    };
    let server = start(config, empty_handler()).await;
    let (status, _) = http_get(server.port, "/").await;
    assert_eq!(status, 400);
    let (status, _) = http_get(server.port, "/?bokeh-session-id=chosen").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn test_page_rejects_unsigned_session_id() {
    let server = start(signed_config("abc"), empty_handler()).await;
    let (status, _) = http_get(server.port, "/?bokeh-session-id=forged").await;
    assert_eq!(status, 403);

    let (status, _) = http_get(server.port, "/").await;
    assert_eq!(status, 200);
    assert_eq!(server.app.session_count(), 1);
}
