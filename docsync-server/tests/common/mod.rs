//! Shared harness: a real server on an ephemeral port.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use docsync_core::Document;
use docsync_server::{ApplicationContext, DocumentServer, FunctionHandler, Handler, HookResult, ServerConfig};
use serde_json::Map;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub port: u16,
    pub app: Arc<ApplicationContext>,
    pub server: Arc<DocumentServer>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// A token for `session_id` issued by this server's signer.
    pub fn token(&self, session_id: &str) -> String {
        self.server
            .signer()
            .generate_token(session_id, Map::new(), Duration::from_secs(300))
            .unwrap()
    }

    /// Stop serving and wait for the unload hooks.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(5), &mut self.task)
            .await
            .expect("server did not shut down")
            .unwrap();
    }
}

pub fn empty_handler() -> Arc<dyn Handler> {
    Arc::new(FunctionHandler::new(|_: &mut Document| -> HookResult { Ok(()) }))
}

pub async fn start(config: ServerConfig, handler: Arc<dyn Handler>) -> TestServer {
    let mut server = DocumentServer::new(config).unwrap();
    let app = server.add_application("/", handler);
    let server = Arc::new(server);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = oneshot::channel::<()>();
    let running = Arc::clone(&server);
    let task = tokio::spawn(async move {
        running
            .serve_with_shutdown(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    TestServer {
        port,
        app,
        server,
        shutdown: Some(tx),
        task,
    }
}

pub async fn start_default() -> TestServer {
    start(ServerConfig::default(), empty_handler()).await
}

/// Plain HTTP/1.1 GET. Returns the status code and the raw response.
pub async fn http_get(port: u16, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8_lossy(&raw).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    (status, text)
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
