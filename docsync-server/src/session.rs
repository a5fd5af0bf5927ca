//! Server-side sessions.
//!
//! A session owns one [`Document`] behind a single async lock. Everything
//! that touches the document (incoming patches, scheduled callbacks, hooks)
//! goes through that lock, and changes made while holding it are encoded and
//! sent to every attached connection when the lock is released.
//!
//! ```text
//!  patch from conn A ─┐
//!  scheduled callback ├─► lock ─► Document ─► pending events ─► unlock ─► flush
//!  lifecycle hook    ─┘                                                  │
//!                                                       ┌────────────────┤
//!                                                       ▼                ▼
//!                                                 conn B (all)     conn A (not
//!                                                                  its own echo)
//! ```

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use docsync_core::{
    CallbackHandle, ChangeEvent, Document, DocumentCallback, DocumentError, DocumentListener,
    DocumentSnapshot, SessionCallback, SetterId,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::MutexGuard;
use tokio::time::Instant;

use crate::callbacks::{CallbackGroup, Runner};
use crate::connection::ServerConnection;
use crate::handler::{panic_message, RequestInfo};
use crate::patch::encode_event;
use crate::protocol::{Message, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No such session {0}")]
    NotFound(String),
    #[error("session id must not be empty")]
    EmptyId,
    #[error("session {0} has been destroyed")]
    Destroyed(String),
    #[error("session {0} has expired and cannot be reused")]
    Expired(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// One document plus the connections viewing it.
pub struct ServerSession {
    id: String,
    token: Option<String>,
    request: RequestInfo,
    token_payload: Map<String, JsonValue>,
    /// Latest expiry (unix seconds) of any token presented for this session
    token_expiry: AtomicU64,
    /// The single per-session lock
    document: tokio::sync::Mutex<Document>,
    /// Attached connections keyed by their setter id
    connections: RwLock<HashMap<SetterId, Arc<ServerConnection>>>,
    /// Events recorded under the lock, flushed on release
    pending: Mutex<Vec<ChangeEvent>>,
    callbacks: CallbackGroup,
    last_unsubscribe: Mutex<Instant>,
    ever_attached: AtomicBool,
    destroyed: AtomicBool,
    expiration_requested: AtomicBool,
    /// Lock holders and waiters; a blocked session is never discarded
    expiration_blocked: AtomicUsize,
    self_ref: Weak<ServerSession>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("connections", &self.connection_count())
            .field("destroyed", &self.destroyed())
            .finish()
    }
}

impl ServerSession {
    /// Wrap `document`. Callbacks already registered on it start running.
    pub fn new(
        id: impl Into<String>,
        mut document: Document,
        request: RequestInfo,
        token: Option<String>,
        token_payload: Map<String, JsonValue>,
    ) -> Arc<Self> {
        let id = id.into();
        let existing = document.session_callbacks();
        let session = Arc::new_cyclic(|weak: &Weak<ServerSession>| {
            let listener: Weak<dyn DocumentListener> = weak.clone();
            document.subscribe(listener);
            Self {
                id,
                token,
                request,
                token_payload,
                token_expiry: AtomicU64::new(0),
                document: tokio::sync::Mutex::new(document),
                connections: RwLock::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
                callbacks: CallbackGroup::new(),
                last_unsubscribe: Mutex::new(Instant::now()),
                ever_attached: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                expiration_requested: AtomicBool::new(false),
                expiration_blocked: AtomicUsize::new(0),
                self_ref: weak.clone(),
            }
        });
        // Runners upgrade the weak handle, which only works once constructed.
        for callback in existing {
            session
                .callbacks
                .schedule(callback.handle, callback.kind, runner(Arc::downgrade(&session), callback.handle));
        }
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn token_payload(&self) -> &Map<String, JsonValue> {
        &self.token_payload
    }

    /// Unix seconds after which no token for this session is accepted.
    pub fn token_expiry(&self) -> u64 {
        self.token_expiry.load(Ordering::SeqCst)
    }

    pub(crate) fn extend_token_expiry(&self, expiry: u64) {
        self.token_expiry.fetch_max(expiry, Ordering::SeqCst);
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ── Locking ──────────────────────────────────────────────────

    /// Acquire the document lock. Changes are flushed when the guard drops.
    pub async fn lock_document(&self) -> Result<LockedDocument<'_>, SessionError> {
        if self.destroyed() {
            return Err(SessionError::Destroyed(self.id.clone()));
        }
        let block = ExpirationBlock::new(&self.expiration_blocked);
        let guard = self.document.lock().await;
        if self.destroyed() {
            return Err(SessionError::Destroyed(self.id.clone()));
        }
        Ok(LockedDocument {
            session: self,
            guard,
            _block: block,
        })
    }

    /// Run `f` with the document locked.
    pub async fn with_document_locked<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        F: FnOnce(&mut Document) -> R,
    {
        let mut doc = self.lock_document().await?;
        Ok(f(&mut *doc))
    }

    /// Run a suspending body with the document locked for its whole duration.
    pub async fn with_document_locked_async<R, F>(&self, f: F) -> Result<R, SessionError>
    where
        F: for<'a> FnOnce(&'a mut Document) -> BoxFuture<'a, R>,
    {
        let mut doc = self.lock_document().await?;
        Ok(f(&mut *doc).await)
    }

    fn flush(&self, doc: &Document) {
        let events = std::mem::take(&mut *self.pending.lock());
        if events.is_empty() {
            return;
        }
        let connections: Vec<Arc<ServerConnection>> = self.connections.read().values().cloned().collect();
        if connections.is_empty() {
            return;
        }
        for event in &events {
            let origin = event.setter();
            let targets: Vec<&Arc<ServerConnection>> =
                connections.iter().filter(|c| Some(c.id()) != origin).collect();
            if targets.is_empty() {
                continue;
            }
            match encode_event(doc, event).and_then(|m| m.to_shared_fragments()) {
                Ok(frames) => {
                    for conn in targets {
                        conn.send(Arc::clone(&frames));
                    }
                }
                Err(e) => log::error!("Session {}: failed to encode change: {e}", self.id),
            }
        }
    }

    // ── Document access ──────────────────────────────────────────

    pub async fn pull(&self) -> Result<DocumentSnapshot, SessionError> {
        self.with_document_locked(|doc| doc.to_snapshot()).await
    }

    /// Replace the document's contents, attributing the change to `setter`.
    pub async fn push(&self, snapshot: DocumentSnapshot, setter: Option<SetterId>) -> Result<(), SessionError> {
        self.with_document_locked(|doc| doc.replace_with_snapshot(snapshot, setter))
            .await?
            .map_err(SessionError::from)
    }

    /// Apply an incoming PATCH-DOC / PUSH-DOC from `setter`.
    pub async fn apply_message(&self, message: &Message, setter: SetterId) -> Result<(), SessionError> {
        self.with_document_locked(|doc| message.apply_to(doc, Some(setter)))
            .await?
            .map_err(SessionError::from)
    }

    // ── Connections ──────────────────────────────────────────────

    /// Attach `connection` and queue its greeting under the document lock:
    /// an ACK, then on the session's first attachment a snapshot of any
    /// content. Changes flushed by other lock holders queue behind both.
    pub async fn attach(&self, connection: &Arc<ServerConnection>) -> Result<bool, SessionError> {
        let doc = self.lock_document().await?;
        let first = self.subscribe(Arc::clone(connection));
        connection.send_message(&Message::ack());
        if first && !doc.roots().is_empty() {
            connection.send_message(&Message::push_doc(doc.to_snapshot()));
        }
        Ok(first)
    }

    /// Attach a connection. Returns true on the session's first attachment.
    pub fn subscribe(&self, connection: Arc<ServerConnection>) -> bool {
        self.connections.write().insert(connection.id(), connection);
        !self.ever_attached.swap(true, Ordering::SeqCst)
    }

    pub fn unsubscribe(&self, id: SetterId) {
        let removed = self.connections.write().remove(&id).is_some();
        if removed {
            *self.last_unsubscribe.lock() = Instant::now();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    pub fn connections(&self) -> Vec<Arc<ServerConnection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Time since the last connection left (or since creation).
    pub fn idle_for(&self) -> Duration {
        self.last_unsubscribe.lock().elapsed()
    }

    // ── Expiration ───────────────────────────────────────────────

    /// Mark for discard at the next sweep, regardless of idle time.
    pub fn request_expiration(&self) {
        self.expiration_requested.store(true, Ordering::SeqCst);
    }

    pub fn expiration_requested(&self) -> bool {
        self.expiration_requested.load(Ordering::SeqCst)
    }

    pub fn expiration_blocked(&self) -> bool {
        self.expiration_blocked_count() > 0
    }

    pub fn expiration_blocked_count(&self) -> usize {
        self.expiration_blocked.load(Ordering::SeqCst)
    }

    /// Tear down with the lock already held.
    pub(crate) fn destroy_locked(&self, doc: &mut Document) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pending.lock().clear();
        doc.destroy();
        self.callbacks.cancel_all();
        log::debug!("Session {} destroyed", self.id);
    }

    /// Tear down. Later lock attempts fail with [`SessionError::Destroyed`].
    pub async fn destroy(&self) {
        if let Ok(mut doc) = self.lock_document().await {
            self.destroy_locked(&mut *doc);
        }
    }

    // ── Callbacks ────────────────────────────────────────────────

    pub fn scheduled_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    /// Run one document callback under the lock. Returns whether it is
    /// still registered afterwards.
    async fn run_callback(&self, handle: CallbackHandle) -> bool {
        let Ok(mut doc) = self.lock_document().await else {
            return false;
        };
        let Some(callback) = doc.claim_callback(handle) else {
            return false;
        };
        let outcome = match callback {
            DocumentCallback::Plain(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(&mut *doc))),
            DocumentCallback::Suspending(f) => AssertUnwindSafe(f(&mut *doc)).catch_unwind().await,
        };
        if let Err(panic) = outcome {
            log::error!("Session {}: callback {handle:?} panicked: {}", self.id, panic_message(&*panic));
        }
        doc.has_callback(handle)
    }
}

impl DocumentListener for ServerSession {
    fn document_changed(&self, event: &ChangeEvent) {
        self.pending.lock().push(event.clone());
    }

    fn callback_added(&self, callback: &SessionCallback) {
        self.callbacks
            .schedule(callback.handle, callback.kind, runner(self.self_ref.clone(), callback.handle));
    }

    fn callback_removed(&self, handle: CallbackHandle) {
        self.callbacks.cancel(handle);
    }
}

fn runner(session: Weak<ServerSession>, handle: CallbackHandle) -> Runner {
    Arc::new(move || {
        let session = session.clone();
        Box::pin(async move {
            match session.upgrade() {
                Some(session) => session.run_callback(handle).await,
                None => false,
            }
        })
    })
}

/// Counts lock holders and waiters while alive.
struct ExpirationBlock<'a>(&'a AtomicUsize);

impl<'a> ExpirationBlock<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ExpirationBlock<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive access to a session's document.
pub struct LockedDocument<'a> {
    session: &'a ServerSession,
    guard: MutexGuard<'a, Document>,
    _block: ExpirationBlock<'a>,
}

impl Deref for LockedDocument<'_> {
    type Target = Document;

    fn deref(&self) -> &Document {
        &self.guard
    }
}

impl DerefMut for LockedDocument<'_> {
    fn deref_mut(&mut self) -> &mut Document {
        &mut self.guard
    }
}

impl Drop for LockedDocument<'_> {
    fn drop(&mut self) {
        self.session.flush(&self.guard);
    }
}
