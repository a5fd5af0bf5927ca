//! Application and server contexts.
//!
//! An [`ApplicationContext`] owns every session of one application path:
//! it creates them on demand (running the handler's hooks under the new
//! session's lock), hands them out to connections, and discards the ones
//! that have been idle for too long.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use docsync_core::{CallbackError, CallbackHandle, CallbackKind, Document};
use parking_lot::Mutex;
use serde_json::Map;
use tokio::sync::OnceCell;

use crate::callbacks::{CallbackGroup, Runner};
use crate::handler::{guard_hook, Handler, RequestInfo, SessionContext};
use crate::session::{ServerSession, SessionError};
use crate::token;

/// Server-level view handed to load/unload hooks.
///
/// Callbacks scheduled here run without any document lock.
#[derive(Debug, Clone)]
pub struct ServerContext {
    app: Weak<ApplicationContext>,
    callbacks: CallbackGroup,
}

impl ServerContext {
    /// Live sessions of this application.
    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.app.upgrade().map(|app| app.get_sessions()).unwrap_or_default()
    }

    pub fn add_next_tick_callback<F, Fut>(&self, f: F) -> CallbackHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(CallbackKind::NextTick, f)
    }

    pub fn add_timeout_callback<F, Fut>(&self, f: F, delay: Duration) -> CallbackHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(CallbackKind::Timeout(delay), f)
    }

    pub fn add_periodic_callback<F, Fut>(&self, f: F, period: Duration) -> CallbackHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add(CallbackKind::Periodic(period), f)
    }

    pub fn remove_next_tick_callback(&self, handle: CallbackHandle) -> Result<(), CallbackError> {
        self.callbacks.remove(handle, CallbackKind::NextTick)
    }

    pub fn remove_timeout_callback(&self, handle: CallbackHandle) -> Result<(), CallbackError> {
        self.callbacks.remove(handle, CallbackKind::Timeout(Duration::ZERO))
    }

    pub fn remove_periodic_callback(&self, handle: CallbackHandle) -> Result<(), CallbackError> {
        self.callbacks.remove(handle, CallbackKind::Periodic(Duration::ZERO))
    }

    pub fn remove_all_callbacks(&self) {
        self.callbacks.cancel_all();
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    fn add<F, Fut>(&self, kind: CallbackKind, f: F) -> CallbackHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = CallbackHandle::next();
        let f = Arc::new(f);
        let runner: Runner = Arc::new(move || {
            let fut = f();
            Box::pin(async move {
                fut.await;
                true
            })
        });
        self.callbacks.schedule(handle, kind, runner);
        handle
    }
}

type SessionCell = Arc<OnceCell<Arc<ServerSession>>>;

/// All sessions for one application.
pub struct ApplicationContext {
    url: String,
    handler: Arc<dyn Handler>,
    server_context: ServerContext,
    /// Session id → session, created at most once per id
    sessions: Mutex<HashMap<String, SessionCell>>,
    /// Ids of discarded sessions, each kept until the last token for it
    /// expires (unix seconds)
    retired: Mutex<HashMap<String, u64>>,
    loaded: AtomicBool,
    unloaded: AtomicBool,
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("url", &self.url)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

impl ApplicationContext {
    pub fn new(url: impl Into<String>, handler: Arc<dyn Handler>) -> Arc<Self> {
        let url = url.into();
        Arc::new_cyclic(|weak| Self {
            url,
            handler,
            server_context: ServerContext {
                app: weak.clone(),
                callbacks: CallbackGroup::new(),
            },
            sessions: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
            loaded: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn server_context(&self) -> &ServerContext {
        &self.server_context
    }

    /// Return the live session for `session_id`, creating it if needed.
    ///
    /// Concurrent calls for one id wait for a single creation. The token's
    /// payload (minus `session_id`) is kept on the session for hooks.
    pub async fn create_session_if_needed(
        &self,
        session_id: &str,
        request: Option<RequestInfo>,
        token: Option<String>,
    ) -> Result<Arc<ServerSession>, SessionError> {
        if session_id.is_empty() {
            return Err(SessionError::EmptyId);
        }
        let expiry = token.as_deref().and_then(|t| token::get_session_expiry(t).ok());
        let cell = {
            let mut sessions = self.sessions.lock();
            if self.retired.lock().contains_key(session_id) {
                return Err(SessionError::Expired(session_id.to_string()));
            }
            Arc::clone(sessions.entry(session_id.to_string()).or_default())
        };
        let session = cell
            .get_or_try_init(|| self.build_session(session_id, request.unwrap_or_default(), token))
            .await?;
        if let Some(expiry) = expiry {
            session.extend_token_expiry(expiry);
        }
        Ok(Arc::clone(session))
    }

    async fn build_session(
        &self,
        session_id: &str,
        request: RequestInfo,
        token: Option<String>,
    ) -> Result<Arc<ServerSession>, SessionError> {
        let token_payload = match token.as_deref().map(token::get_token_payload) {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                log::warn!("Session {session_id}: unreadable token payload: {e}");
                Map::new()
            }
            None => Map::new(),
        };
        let session = ServerSession::new(session_id, Document::new(), request, token, token_payload);

        let handler = Arc::clone(&self.handler);
        let hooked = Arc::clone(&session);
        session
            .with_document_locked_async(move |doc| {
                Box::pin(async move {
                    let mut ctx = SessionContext {
                        id: hooked.id(),
                        request: hooked.request(),
                        token_payload: hooked.token_payload(),
                        document: doc,
                    };
                    guard_hook("on_session_created", handler.on_session_created(&mut ctx)).await;
                    guard_hook("modify_document", handler.modify_document(ctx.document)).await;
                })
            })
            .await?;

        log::info!("Session {session_id} created for {}", self.url);
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Result<Arc<ServerSession>, SessionError> {
        self.sessions
            .lock()
            .get(session_id)
            .and_then(|cell| cell.get().cloned())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn get_sessions(&self) -> Vec<Arc<ServerSession>> {
        self.sessions
            .lock()
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_retired(&self, session_id: &str) -> bool {
        self.retired.lock().contains_key(session_id)
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }

    /// Run `on_server_loaded` the first time only.
    pub async fn run_load_hook(&self) {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return;
        }
        guard_hook("on_server_loaded", self.handler.on_server_loaded(&self.server_context)).await;
    }

    /// Run `on_server_unloaded` the first time only, then stop server callbacks.
    pub async fn run_unload_hook(&self) {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return;
        }
        guard_hook("on_server_unloaded", self.handler.on_server_unloaded(&self.server_context)).await;
        self.server_context.remove_all_callbacks();
    }

    /// Discard sessions with no connections that have been idle for at
    /// least `lifetime` (or asked to expire). Returns how many went away.
    ///
    /// Retired ids whose tokens have all expired are forgotten first: the
    /// handshake refuses those tokens, so the ids cannot come back.
    pub async fn cleanup_sessions(&self, lifetime: Duration) -> usize {
        let now = token::unix_now();
        self.retired.lock().retain(|_, expiry| *expiry >= now);

        let candidates: Vec<Arc<ServerSession>> = self
            .get_sessions()
            .into_iter()
            .filter(|s| {
                s.connection_count() == 0
                    && (s.idle_for() >= lifetime || s.expiration_requested())
                    && !s.expiration_blocked()
            })
            .collect();

        let mut discarded = 0;
        for session in candidates {
            if self.discard_session(&session).await {
                discarded += 1;
            }
        }
        discarded
    }

    /// Run `on_session_destroyed` and tear the session down, unless
    /// someone attached or queued for its lock meanwhile.
    pub async fn discard_session(&self, session: &Arc<ServerSession>) -> bool {
        let Ok(mut doc) = session.lock_document().await else {
            return false;
        };
        if session.connection_count() > 0 || session.expiration_blocked_count() > 1 {
            log::debug!("Session {} became busy, not discarding", session.id());
            return false;
        }
        {
            let mut ctx = SessionContext {
                id: session.id(),
                request: session.request(),
                token_payload: session.token_payload(),
                document: &mut *doc,
            };
            guard_hook("on_session_destroyed", self.handler.on_session_destroyed(&mut ctx)).await;
        }
        session.destroy_locked(&mut *doc);
        drop(doc);

        let id = session.id().to_string();
        let keep_until = match session.token_expiry() {
            0 => token::unix_now(),
            expiry => expiry,
        };
        {
            let mut sessions = self.sessions.lock();
            self.retired.lock().insert(id.clone(), keep_until);
            sessions.remove(&id);
        }
        log::info!("Session {id} discarded ({} remaining)", self.session_count());
        true
    }
}
