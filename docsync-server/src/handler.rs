//! Application hooks.
//!
//! A [`Handler`] builds each session's document and observes the server and
//! session lifecycles. Every hook is optional. Hook failures (errors and
//! panics) are logged and otherwise ignored.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use docsync_core::Document;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

use crate::context::ServerContext;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;
pub type HookResult = Result<(), HookError>;

/// Request data that led to a session: query arguments, headers, cookies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestInfo {
    pub arguments: BTreeMap<String, Vec<String>>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
}

impl RequestInfo {
    /// First value of a query argument.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(|v| v.first()).map(String::as_str)
    }
}

/// What hooks see of a session.
pub struct SessionContext<'a> {
    pub(crate) id: &'a str,
    pub(crate) request: &'a RequestInfo,
    pub(crate) token_payload: &'a Map<String, JsonValue>,
    pub(crate) document: &'a mut Document,
}

impl<'a> SessionContext<'a> {
    pub fn id(&self) -> &str {
        self.id
    }

    pub fn request(&self) -> &RequestInfo {
        self.request
    }

    pub fn token_payload(&self) -> &Map<String, JsonValue> {
        self.token_payload
    }

    pub fn document(&mut self) -> &mut Document {
        self.document
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    /// Server started. Runs once per application.
    async fn on_server_loaded(&self, _server: &ServerContext) -> HookResult {
        Ok(())
    }

    /// Server stopping. Runs once per application.
    async fn on_server_unloaded(&self, _server: &ServerContext) -> HookResult {
        Ok(())
    }

    /// A session was created; runs before `modify_document`.
    async fn on_session_created(&self, _session: &mut SessionContext<'_>) -> HookResult {
        Ok(())
    }

    /// A session is being discarded; the document is still intact.
    async fn on_session_destroyed(&self, _session: &mut SessionContext<'_>) -> HookResult {
        Ok(())
    }

    /// Populate a fresh session document.
    async fn modify_document(&self, _doc: &mut Document) -> HookResult {
        Ok(())
    }

    /// Extra values stored in the session token for this request.
    fn process_request(&self, _request: &RequestInfo) -> Map<String, JsonValue> {
        Map::new()
    }
}

/// A handler that only builds documents.
pub struct FunctionHandler<F> {
    func: F,
}

impl<F> FunctionHandler<F>
where
    F: Fn(&mut Document) -> HookResult + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> Handler for FunctionHandler<F>
where
    F: Fn(&mut Document) -> HookResult + Send + Sync,
{
    async fn modify_document(&self, doc: &mut Document) -> HookResult {
        (self.func)(doc)
    }
}

/// Await a hook, logging its error or panic.
pub(crate) async fn guard_hook<F>(name: &str, hook: F) -> bool
where
    F: Future<Output = HookResult> + Send,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::error!("Error running {name} hook: {e}");
            false
        }
        Err(panic) => {
            log::error!("Panic in {name} hook: {}", panic_message(&*panic));
            false
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
