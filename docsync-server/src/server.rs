//! HTTP and websocket front end.
//!
//! Architecture:
//! ```text
//!  GET  P              ──► issue session id + token ──► HTML bootstrap page
//!  GET  P/autoload.js  ──► issue (or reuse token) ──► JS bootstrap
//!  GET  P/ws           ──► origin check ──► subprotocol token ──► verify
//!                                                      │
//!                                                      ▼
//!                                   connection::serve (one task per socket)
//!
//!  maintenance: idle sweep per application, stats log line
//! ```
//!
//! Each application path `P` has its own [`ApplicationContext`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde_json::{json, Map, Value as JsonValue};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, ServerConfig};
use crate::connection;
use crate::context::ApplicationContext;
use crate::handler::{Handler, RequestInfo};
use crate::session::{ServerSession, SessionError};
use crate::token::{self, AuthError, TokenSigner};

pub const SESSION_ID_ARG: &str = "bokeh-session-id";
pub const AUTOLOAD_ELEMENT_ARG: &str = "bokeh-autoload-element";
pub const TOKEN_ARG: &str = "bokeh-token";
pub const RESOURCES_ARG: &str = "resources";
pub const SUBPROTOCOL: &str = "bokeh";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Errors answered with an HTTP status instead of a page or an upgrade.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    BadRequest(String),
}

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            RequestError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RequestError::Auth(
                AuthError::MissingSubprotocol
                | AuthError::MalformedSubprotocol(_)
                | AuthError::MalformedToken(_)
                | AuthError::SessionIdRequired,
            ) => StatusCode::BAD_REQUEST,
            RequestError::Auth(AuthError::MissingSecret | AuthError::ReservedPayloadKey(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RequestError::Auth(_) => StatusCode::FORBIDDEN,
            RequestError::Session(SessionError::EmptyId) => StatusCode::BAD_REQUEST,
            RequestError::Session(SessionError::NotFound(_) | SessionError::Expired(_)) => {
                StatusCode::NOT_FOUND
            }
            RequestError::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

#[derive(Clone)]
struct RouteState {
    app: Arc<ApplicationContext>,
    config: Arc<ServerConfig>,
    signer: Arc<TokenSigner>,
    prefix: String,
}

/// Serves one or more applications.
pub struct DocumentServer {
    config: Arc<ServerConfig>,
    signer: Arc<TokenSigner>,
    applications: Vec<Arc<ApplicationContext>>,
}

impl DocumentServer {
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let signer = TokenSigner::new(config.secret_key.as_deref(), config.sign_sessions)?;
        Ok(Self {
            config: Arc::new(config),
            signer: Arc::new(signer),
            applications: Vec::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    /// Mount `handler` at `path` (e.g. `/` or `/sliders`).
    pub fn add_application(&mut self, path: &str, handler: Arc<dyn Handler>) -> Arc<ApplicationContext> {
        let path = normalize_path(path);
        let app = ApplicationContext::new(path, handler);
        self.applications.push(Arc::clone(&app));
        app
    }

    pub fn application(&self, path: &str) -> Option<Arc<ApplicationContext>> {
        let path = normalize_path(path);
        self.applications.iter().find(|a| a.url() == path).cloned()
    }

    pub fn applications(&self) -> &[Arc<ApplicationContext>] {
        &self.applications
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new();
        for app in &self.applications {
            let prefix = app.url().trim_end_matches('/').to_string();
            let state = RouteState {
                app: Arc::clone(app),
                config: Arc::clone(&self.config),
                signer: Arc::clone(&self.signer),
                prefix: prefix.clone(),
            };
            let page = if prefix.is_empty() { "/".to_string() } else { prefix.clone() };
            let routes = Router::new()
                .route(&page, get(document_handler))
                .route(&format!("{prefix}/autoload.js"), get(autoload_handler))
                .route(&format!("{prefix}/ws"), get(websocket_handler))
                .with_state(state);
            router = router.merge(routes);
        }
        router
    }

    /// Bind `bind_addr` and serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        self.serve_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {e}");
            }
        })
        .await
    }

    /// Serve on `listener` until `shutdown` resolves, then run unload hooks.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.config.websocket_compression_level.is_some()
            || self.config.websocket_compression_mem_level.is_some()
        {
            log::info!("Websocket compression settings accepted but not negotiated");
        }
        for app in &self.applications {
            app.run_load_hook().await;
        }

        let maintenance = CancellationToken::new();
        let tasks = self.spawn_maintenance(maintenance.clone());

        let addr = listener.local_addr()?;
        log::info!("Document server listening on {addr}");
        for app in &self.applications {
            log::info!("Serving application at http://{addr}{}", app.url());
        }
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        log::info!("Document server shutting down");
        maintenance.cancel();
        for task in tasks {
            let _ = task.await;
        }
        for app in &self.applications {
            app.run_unload_hook().await;
        }
        result.map_err(ServerError::from)
    }

    fn spawn_maintenance(&self, cancel: CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut tasks = Vec::new();
        for app in &self.applications {
            let app = Arc::clone(app);
            let cancel = cancel.clone();
            let every = self.config.check_unused_sessions();
            let lifetime = self.config.unused_session_lifetime();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let n = app.cleanup_sessions(lifetime).await;
                            if n > 0 {
                                log::debug!("Discarded {n} unused sessions for {}", app.url());
                            }
                        }
                    }
                }
            }));
        }

        let apps = self.applications.clone();
        let every = self.config.stats_log_frequency();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sessions: Vec<Arc<ServerSession>> =
                            apps.iter().flat_map(|a| a.get_sessions()).collect();
                        let connections: usize = sessions.iter().map(|s| s.connection_count()).sum();
                        log::debug!(
                            "[stats] {} applications, {} sessions, {connections} connections",
                            apps.len(),
                            sessions.len()
                        );
                    }
                }
            }
        }));
        tasks
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

// ── Handlers ─────────────────────────────────────────────────────

async fn document_handler(
    State(state): State<RouteState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Html<String>, RequestError> {
    let request = request_info(&params, &headers);
    let issued = issue_session(&state, request, &headers).await?;
    let title = issued.session.pull().await?.title;
    let bootstrap = json!({
        "session_id": issued.session_id,
        "token": issued.token,
        "websocket_url": issued.websocket_url,
    });
    Ok(Html(format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n<script type=\"application/json\" id=\"docsync-bootstrap\">{}</script>\n</body>\n</html>\n",
        escape_html(if title.is_empty() { "Document" } else { &title }),
        script_safe(&bootstrap.to_string()),
    )))
}

async fn autoload_handler(
    State(state): State<RouteState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
) -> Result<Response, RequestError> {
    let request = request_info(&params, &headers);
    let element = request
        .argument(AUTOLOAD_ELEMENT_ARG)
        .map(str::to_string)
        .ok_or_else(|| RequestError::BadRequest(format!("missing {AUTOLOAD_ELEMENT_ARG}")))?;
    let with_resources = request.argument(RESOURCES_ARG) != Some("none");

    let issued = match request.argument(TOKEN_ARG).map(str::to_string) {
        Some(token) => {
            let session_id = verify_token(&state.signer, &token)?;
            let session = state
                .app
                .create_session_if_needed(&session_id, Some(request), Some(token.clone()))
                .await?;
            Issued {
                websocket_url: websocket_url(&state, &headers),
                session_id,
                token,
                session,
            }
        }
        None => issue_session(&state, request, &headers).await?,
    };

    let bootstrap = json!({
        "element_id": element,
        "session_id": issued.session_id,
        "token": issued.token,
        "websocket_url": issued.websocket_url,
        "load_resources": with_resources,
    });
    let body = format!(
        "(function() {{\n  var bootstrap = {};\n  (window.docsync_autoload = window.docsync_autoload || []).push(bootstrap);\n}})();\n",
        script_safe(&bootstrap.to_string())
    );
    Ok(([(header::CONTENT_TYPE, "application/javascript")], body).into_response())
}

async fn websocket_handler(
    State(state): State<RouteState>,
    Query(params): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, RequestError> {
    if let Err(e) = check_origin(&headers, &state.config.allowed_origins) {
        log::error!("Refusing websocket connection: {e}");
        return Err(e.into());
    }
    let token = match subprotocol_token(&headers).and_then(|t| verify_token(&state.signer, &t).map(|id| (t, id))) {
        Ok(pair) => pair,
        Err(e) => {
            log::warn!("Rejecting websocket handshake: {e}");
            return Err(e.into());
        }
    };
    let (token, session_id) = token;
    let request = request_info(&params, &headers);
    let app = Arc::clone(&state.app);
    let config = Arc::clone(&state.config);
    Ok(ws
        .protocols([SUBPROTOCOL])
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| connection::serve(socket, app, session_id, token, request, config)))
}

// ── Session issuance ─────────────────────────────────────────────

struct Issued {
    session_id: String,
    token: String,
    websocket_url: String,
    session: Arc<ServerSession>,
}

async fn issue_session(
    state: &RouteState,
    request: RequestInfo,
    headers: &HeaderMap,
) -> Result<Issued, RequestError> {
    let session_id = match request.argument(SESSION_ID_ARG) {
        Some(id) => {
            if !state.signer.check_session_id_signature(id) {
                log::error!("Session id had invalid signature: {id}");
                return Err(AuthError::InvalidSessionId.into());
            }
            id.to_string()
        }
        None if state.config.generate_session_ids => state.signer.generate_session_id()?,
        None => return Err(AuthError::SessionIdRequired.into()),
    };

    let mut extra = state.app.handler().process_request(&request);
    extra.insert("headers".into(), filtered(&request.headers, |h| state.config.header_allowed(h)));
    extra.insert("cookies".into(), filtered(&request.cookies, |c| state.config.cookie_allowed(c)));
    let token = state
        .signer
        .generate_token(&session_id, extra, state.config.session_token_expiration())?;

    let session = state
        .app
        .create_session_if_needed(&session_id, Some(request), Some(token.clone()))
        .await?;
    Ok(Issued {
        websocket_url: websocket_url(state, headers),
        session_id,
        token,
        session,
    })
}

fn filtered(map: &BTreeMap<String, String>, allowed: impl Fn(&str) -> bool) -> JsonValue {
    let out: Map<String, JsonValue> = map
        .iter()
        .filter(|(k, _)| allowed(k))
        .map(|(k, v)| (k.clone(), JsonValue::from(v.as_str())))
        .collect();
    JsonValue::Object(out)
}

/// Signature, session id signature and expiry. Returns the session id.
fn verify_token(signer: &TokenSigner, token: &str) -> Result<String, AuthError> {
    if !signer.check_token_signature(token) {
        return Err(AuthError::InvalidSignature);
    }
    token::check_token_expiry(token)?;
    let session_id = token::get_session_id(token)?;
    if session_id.is_empty() {
        return Err(AuthError::InvalidSessionId);
    }
    Ok(session_id)
}

fn websocket_url(state: &RouteState, headers: &HeaderMap) -> String {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(state.config.bind_addr.as_str());
    format!("ws://{host}{}/ws", state.prefix)
}

// ── Request parsing ──────────────────────────────────────────────

fn request_info(params: &[(String, String)], headers: &HeaderMap) -> RequestInfo {
    let mut info = RequestInfo::default();
    for (k, v) in params {
        info.arguments.entry(k.clone()).or_default().push(v.clone());
    }
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            if name == header::COOKIE {
                for pair in value.split(';') {
                    if let Some((k, v)) = pair.split_once('=') {
                        info.cookies.insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            } else {
                info.headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
    }
    info
}

/// Token carried as the second entry of `Sec-WebSocket-Protocol: bokeh, <token>`.
fn subprotocol_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let value = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .ok_or(AuthError::MissingSubprotocol)?
        .to_str()
        .map_err(|_| AuthError::MalformedSubprotocol("not ASCII".into()))?;
    let parts: Vec<&str> = value.split(',').map(str::trim).collect();
    match parts.as_slice() {
        [SUBPROTOCOL, token] if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AuthError::MalformedSubprotocol(format!(
            "expected '{SUBPROTOCOL}, <token>', got {} entries",
            parts.len()
        ))),
    }
}

/// Missing Origin passes (non-browser clients); a present one must be allowed.
fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), AuthError> {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|o| o.to_str().ok()) else {
        return Ok(());
    };
    let authority = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest)
        .trim_end_matches('/')
        .to_ascii_lowercase();

    if allowed.is_empty() {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_ascii_lowercase);
        return match host {
            Some(host) if host == authority => Ok(()),
            _ => Err(AuthError::OriginNotAllowed(origin.to_string())),
        };
    }

    let (origin_host, _) = authority.split_once(':').unwrap_or((authority.as_str(), ""));
    let ok = allowed.iter().any(|entry| {
        let entry = entry.to_ascii_lowercase();
        match entry.strip_suffix(":*") {
            Some(host) => host == origin_host,
            None => entry == authority || (!entry.contains(':') && entry == origin_host),
        }
    });
    if ok {
        Ok(())
    } else {
        Err(AuthError::OriginNotAllowed(origin.to_string()))
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn script_safe(json: &str) -> String {
    json.replace("</", "<\\/")
}
