//! Document callback registry.
//!
//! The document only records which callbacks exist. Running them belongs to
//! the session's scheduler, which is told about additions and removals through
//! [`DocumentListener`](crate::DocumentListener).

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::document::Document;

static NEXT_CALLBACK: AtomicU64 = AtomicU64::new(1);

pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

pub type PlainCallback = Arc<dyn Fn(&mut Document) + Send + Sync>;
pub type SuspendingCallback = Arc<dyn for<'a> Fn(&'a mut Document) -> BoxFuture<'a> + Send + Sync>;

/// Callback body. Suspending bodies keep the document borrowed across awaits.
#[derive(Clone)]
pub enum DocumentCallback {
    Plain(PlainCallback),
    Suspending(SuspendingCallback),
}

impl DocumentCallback {
    pub fn plain<F>(f: F) -> Self
    where
        F: Fn(&mut Document) + Send + Sync + 'static,
    {
        DocumentCallback::Plain(Arc::new(f))
    }

    pub fn suspending<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut Document) -> BoxFuture<'a> + Send + Sync + 'static,
    {
        DocumentCallback::Suspending(Arc::new(f))
    }
}

impl fmt::Debug for DocumentCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentCallback::Plain(_) => f.write_str("DocumentCallback::Plain"),
            DocumentCallback::Suspending(_) => f.write_str("DocumentCallback::Suspending"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    NextTick,
    Timeout(Duration),
    Periodic(Duration),
}

impl CallbackKind {
    pub fn is_one_shot(&self) -> bool {
        !matches!(self, CallbackKind::Periodic(_))
    }

    fn label(&self) -> &'static str {
        match self {
            CallbackKind::NextTick => "next tick",
            CallbackKind::Timeout(_) => "timeout",
            CallbackKind::Periodic(_) => "periodic",
        }
    }
}

/// Opaque handle returned when a callback is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

impl CallbackHandle {
    pub fn next() -> Self {
        Self(NEXT_CALLBACK.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
pub struct SessionCallback {
    pub handle: CallbackHandle,
    pub kind: CallbackKind,
    pub callback: DocumentCallback,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error("callback already ran or was already removed, cannot be removed again")]
    AlreadyRemoved,
    #[error("handle refers to a {actual} callback, not a {expected} callback")]
    WrongKind {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("document has been destroyed")]
    Destroyed,
}

#[derive(Debug, Default)]
pub(crate) struct CallbackRegistry {
    entries: HashMap<CallbackHandle, SessionCallback>,
}

impl CallbackRegistry {
    pub(crate) fn insert(&mut self, kind: CallbackKind, callback: DocumentCallback) -> SessionCallback {
        let entry = SessionCallback {
            handle: CallbackHandle::next(),
            kind,
            callback,
        };
        self.entries.insert(entry.handle, entry.clone());
        entry
    }

    pub(crate) fn remove(
        &mut self,
        handle: CallbackHandle,
        expected: CallbackKind,
    ) -> Result<SessionCallback, CallbackError> {
        let entry = self.entries.get(&handle).ok_or(CallbackError::AlreadyRemoved)?;
        if std::mem::discriminant(&entry.kind) != std::mem::discriminant(&expected) {
            return Err(CallbackError::WrongKind {
                expected: expected.label(),
                actual: entry.kind.label(),
            });
        }
        self.entries.remove(&handle).ok_or(CallbackError::AlreadyRemoved)
    }

    /// Fetch a callback for execution. One-shot entries are consumed so a
    /// later removal reports them as already run.
    pub(crate) fn claim(&mut self, handle: CallbackHandle) -> Option<DocumentCallback> {
        let one_shot = self.entries.get(&handle)?.kind.is_one_shot();
        if one_shot {
            self.entries.remove(&handle).map(|e| e.callback)
        } else {
            self.entries.get(&handle).map(|e| e.callback.clone())
        }
    }

    pub(crate) fn contains(&self, handle: CallbackHandle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub(crate) fn all(&self) -> Vec<SessionCallback> {
        self.entries.values().cloned().collect()
    }

    pub(crate) fn clear(&mut self) -> Vec<CallbackHandle> {
        self.entries.drain().map(|(h, _)| h).collect()
    }
}
