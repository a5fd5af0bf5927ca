//! The synchronized document and its change tracker.
//!
//! ```text
//!            roots ──► model table (reachable, id → Model)
//!              │             │
//!   set_property / stream    │  recompute on structural change
//!              ▼             ▼
//!        ChangeEvent ──► hold queue? ──► listeners (weak) ──► property handlers
//! ```
//!
//! Every mutation of a reachable model goes through a `Document` method and
//! emits exactly one [`ChangeEvent`]. Models that stop being reachable move
//! to a detached pool and their ids are remembered as former ids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use uuid::Uuid;

use crate::callbacks::{
    CallbackError, CallbackHandle, CallbackKind, CallbackRegistry, DocumentCallback,
    SessionCallback,
};
use crate::events::{ChangeEvent, HoldPolicy, SetterId};
use crate::model::Model;
use crate::value::{ModelId, Value};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DocumentError {
    #[error("model {0} is already a root of this document")]
    DuplicateRoot(ModelId),
    #[error("model {0} is not a root of this document")]
    MissingRoot(ModelId),
    #[error("unknown model id: {0}")]
    UnknownModel(ModelId),
    #[error("model {0} is already part of this document")]
    DuplicateModel(ModelId),
    #[error("invalid column data: {0}")]
    InvalidColumnData(String),
    #[error("invalid document snapshot: {0}")]
    InvalidSnapshot(String),
    #[error("document has been destroyed")]
    Destroyed,
}

/// Receives change notifications. Held weakly by the document.
pub trait DocumentListener: Send + Sync {
    fn document_changed(&self, event: &ChangeEvent);

    fn callback_added(&self, _callback: &SessionCallback) {}

    fn callback_removed(&self, _handle: CallbackHandle) {}
}

/// Identity of a [`Document`] instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId(Uuid);

/// Old and new value of one property, handed to property handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyChange {
    pub model: ModelId,
    pub attr: String,
    pub old: Value,
    pub new: Value,
}

pub type PropertyHandler = Arc<dyn Fn(&mut Document, &PropertyChange) + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(&mut Document, &Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

pub struct Document {
    id: DocumentId,
    title: String,
    roots: Vec<ModelId>,
    /// Reachable models: each registered exactly once.
    models: HashMap<ModelId, Model>,
    /// Known but unreachable models.
    detached: HashMap<ModelId, Model>,
    former_ids: HashSet<ModelId>,
    listeners: Vec<Weak<dyn DocumentListener>>,
    hold: Option<HoldPolicy>,
    held: Vec<ChangeEvent>,
    property_handlers: HashMap<(ModelId, String), Vec<(HandlerId, PropertyHandler)>>,
    message_handlers: HashMap<String, Vec<(HandlerId, MessageHandler)>>,
    pending_handlers: VecDeque<(PropertyHandler, PropertyChange)>,
    running_handlers: bool,
    next_handler: u64,
    callbacks: CallbackRegistry,
    destroyed: bool,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("roots", &self.roots)
            .field("models", &self.models.len())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            id: DocumentId(Uuid::new_v4()),
            title: String::new(),
            roots: Vec::new(),
            models: HashMap::new(),
            detached: HashMap::new(),
            former_ids: HashSet::new(),
            listeners: Vec::new(),
            hold: None,
            held: Vec::new(),
            property_handlers: HashMap::new(),
            message_handlers: HashMap::new(),
            pending_handlers: VecDeque::new(),
            running_handlers: false,
            next_handler: 1,
            callbacks: CallbackRegistry::default(),
            destroyed: false,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn roots(&self) -> &[ModelId] {
        &self.roots
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    // ── Model table ──────────────────────────────────────────────

    /// Reachable model by id.
    pub fn get_model(&self, id: &ModelId) -> Option<&Model> {
        self.models.get(id)
    }

    /// Reachable or detached model by id.
    pub fn find_model(&self, id: &ModelId) -> Option<&Model> {
        self.models.get(id).or_else(|| self.detached.get(id))
    }

    pub fn contains_model(&self, id: &ModelId) -> bool {
        self.models.contains_key(id)
    }

    /// True if `id` was reachable at some point and no longer is.
    pub fn is_former_model(&self, id: &ModelId) -> bool {
        self.former_ids.contains(id) && !self.models.contains_key(id)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn get_property(&self, id: &ModelId, attr: &str) -> Option<&Value> {
        self.models.get(id).and_then(|m| m.get(attr))
    }

    /// Register a model without making it reachable. No event is emitted;
    /// it joins the document once a root or a reachable property points at it.
    pub fn add_model(&mut self, model: Model) -> Result<ModelId, DocumentError> {
        if self.destroyed {
            return Err(DocumentError::Destroyed);
        }
        if self.models.contains_key(&model.id) || self.detached.contains_key(&model.id) {
            return Err(DocumentError::DuplicateModel(model.id));
        }
        let id = model.id.clone();
        self.detached.insert(id.clone(), model);
        Ok(id)
    }

    /// Every model reachable from `start`, each once, breadth first.
    pub fn subtree(&self, start: &[ModelId]) -> Vec<&Model> {
        let mut visited = HashSet::new();
        let mut queue: VecDeque<&ModelId> = start.iter().collect();
        let mut out = Vec::new();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(model) = self.find_model(id) {
                for value in model.properties.values() {
                    push_refs(value, &mut queue);
                }
                out.push(model);
            }
        }
        out
    }

    // ── Roots and title ──────────────────────────────────────────

    /// Register `model` and make it a root.
    pub fn add_root(&mut self, model: Model, setter: Option<SetterId>) -> Result<ModelId, DocumentError> {
        if self.roots.contains(&model.id) {
            return Err(DocumentError::DuplicateRoot(model.id));
        }
        let id = self.add_model(model)?;
        self.attach_root(&id, setter)?;
        Ok(id)
    }

    /// Make an already registered model a root.
    pub fn attach_root(&mut self, id: &ModelId, setter: Option<SetterId>) -> Result<(), DocumentError> {
        if self.destroyed {
            return Err(DocumentError::Destroyed);
        }
        if self.roots.contains(id) {
            return Err(DocumentError::DuplicateRoot(id.clone()));
        }
        if self.find_model(id).is_none() {
            return Err(DocumentError::UnknownModel(id.clone()));
        }
        self.roots.push(id.clone());
        self.recompute_models();
        self.emit(ChangeEvent::RootAdded { model: id.clone(), setter });
        Ok(())
    }

    pub fn remove_root(&mut self, id: &ModelId, setter: Option<SetterId>) -> Result<(), DocumentError> {
        let pos = self
            .roots
            .iter()
            .position(|r| r == id)
            .ok_or_else(|| DocumentError::MissingRoot(id.clone()))?;
        self.roots.remove(pos);
        self.recompute_models();
        self.emit(ChangeEvent::RootRemoved { model: id.clone(), setter });
        Ok(())
    }

    pub fn set_title(&mut self, title: impl Into<String>, setter: Option<SetterId>) {
        let title = title.into();
        if self.title == title {
            return;
        }
        self.title = title.clone();
        self.emit(ChangeEvent::TitleChanged { title, setter });
    }

    // ── Properties ───────────────────────────────────────────────

    /// Set one property. Returns `Ok(false)` when the value is unchanged.
    ///
    /// Detached models are updated silently.
    pub fn set_property(
        &mut self,
        id: &ModelId,
        attr: &str,
        value: impl Into<Value>,
        setter: Option<SetterId>,
    ) -> Result<bool, DocumentError> {
        let value = value.into();
        if let Some(model) = self.detached.get_mut(id) {
            model.properties.insert(attr.to_string(), value);
            return Ok(true);
        }
        let model = self
            .models
            .get_mut(id)
            .ok_or_else(|| DocumentError::UnknownModel(id.clone()))?;
        let old = model.properties.get(attr).cloned().unwrap_or(Value::Null);
        if old == value {
            return Ok(false);
        }
        let structural = old.has_references() || value.has_references();
        model.properties.insert(attr.to_string(), value.clone());
        if structural {
            self.recompute_models();
        }
        self.emit(ChangeEvent::ModelChanged {
            model: id.clone(),
            attr: attr.to_string(),
            old,
            new: value,
            setter,
        });
        Ok(true)
    }

    /// Direct mutable access for column operations. Callers emit the event.
    pub(crate) fn model_mut(&mut self, id: &ModelId) -> Result<&mut Model, DocumentError> {
        self.models
            .get_mut(id)
            .ok_or_else(|| DocumentError::UnknownModel(id.clone()))
    }

    // ── Messages ─────────────────────────────────────────────────

    /// Emit a custom message for the other side.
    pub fn send_message(&mut self, msg_type: impl Into<String>, msg_data: Value, setter: Option<SetterId>) {
        self.emit(ChangeEvent::MessageSent {
            msg_type: msg_type.into(),
            msg_data,
            setter,
        });
    }

    /// Hand a message received from the other side to its handlers.
    pub fn deliver_message(&mut self, msg_type: &str, msg_data: &Value) {
        let handlers: Vec<MessageHandler> = self
            .message_handlers
            .get(msg_type)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        if handlers.is_empty() {
            log::debug!("No handler for message type {msg_type}");
        }
        for handler in handlers {
            handler(self, msg_data);
        }
    }

    pub fn on_message<F>(&mut self, msg_type: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&mut Document, &Value) + Send + Sync + 'static,
    {
        let id = self.next_handler_id();
        self.message_handlers
            .entry(msg_type.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    // ── Property handlers ────────────────────────────────────────

    /// Run `handler` after every change of `model.attr`, local or remote.
    pub fn on_property_change<F>(&mut self, model: &ModelId, attr: &str, handler: F) -> HandlerId
    where
        F: Fn(&mut Document, &PropertyChange) + Send + Sync + 'static,
    {
        let id = self.next_handler_id();
        self.property_handlers
            .entry((model.clone(), attr.to_string()))
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a property or message handler. Returns false if unknown.
    pub fn remove_handler(&mut self, id: HandlerId) -> bool {
        let mut found = false;
        for handlers in self.property_handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            found |= handlers.len() != before;
        }
        for handlers in self.message_handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            found |= handlers.len() != before;
        }
        found
    }

    fn next_handler_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        id
    }

    // ── Listeners ────────────────────────────────────────────────

    pub fn subscribe(&mut self, listener: Weak<dyn DocumentListener>) {
        self.listeners.push(listener);
    }

    pub fn unsubscribe(&mut self, listener: &Weak<dyn DocumentListener>) {
        self.listeners.retain(|l| !Weak::ptr_eq(l, listener));
    }

    /// Live listeners; dead weak entries are pruned.
    pub fn listener_count(&mut self) -> usize {
        self.listeners.retain(|l| l.strong_count() > 0);
        self.listeners.len()
    }

    fn live_listeners(&mut self) -> Vec<Arc<dyn DocumentListener>> {
        self.listeners.retain(|l| l.strong_count() > 0);
        self.listeners.iter().filter_map(Weak::upgrade).collect()
    }

    // ── Hold ─────────────────────────────────────────────────────

    /// Start holding events. A second hold keeps the first policy.
    pub fn hold(&mut self, policy: HoldPolicy) {
        if self.hold.is_none() {
            self.hold = Some(policy);
        }
    }

    pub fn hold_policy(&self) -> Option<HoldPolicy> {
        self.hold
    }

    /// Stop holding and release whatever was queued.
    pub fn unhold(&mut self) {
        let Some(policy) = self.hold.take() else {
            return;
        };
        let held = std::mem::take(&mut self.held);
        if held.is_empty() {
            return;
        }
        match policy {
            HoldPolicy::Snapshot => {
                let replaced = ChangeEvent::DocumentReplaced { setter: None };
                for listener in self.live_listeners() {
                    listener.document_changed(&replaced);
                }
                for event in &held {
                    self.queue_handlers(event);
                }
                self.run_handlers();
            }
            HoldPolicy::Collect | HoldPolicy::Combine => {
                for event in held {
                    self.dispatch(event);
                }
            }
        }
    }

    // ── Emission ─────────────────────────────────────────────────

    pub(crate) fn emit(&mut self, event: ChangeEvent) {
        match self.hold {
            Some(HoldPolicy::Combine) => {
                if let Some(last) = self.held.last_mut() {
                    if last.combine(&event) {
                        return;
                    }
                }
                self.held.push(event);
            }
            Some(_) => self.held.push(event),
            None => self.dispatch(event),
        }
    }

    fn dispatch(&mut self, event: ChangeEvent) {
        for listener in self.live_listeners() {
            listener.document_changed(&event);
        }
        self.queue_handlers(&event);
        self.run_handlers();
    }

    fn queue_handlers(&mut self, event: &ChangeEvent) {
        let ChangeEvent::ModelChanged { model, attr, old, new, .. } = event else {
            return;
        };
        let Some(handlers) = self.property_handlers.get(&(model.clone(), attr.clone())) else {
            return;
        };
        let change = PropertyChange {
            model: model.clone(),
            attr: attr.clone(),
            old: old.clone(),
            new: new.clone(),
        };
        for (_, handler) in handlers {
            self.pending_handlers.push_back((handler.clone(), change.clone()));
        }
    }

    /// Drain queued handlers. Nested mutations queue more work here instead
    /// of reentering.
    fn run_handlers(&mut self) {
        if self.running_handlers {
            return;
        }
        self.running_handlers = true;
        while let Some((handler, change)) = self.pending_handlers.pop_front() {
            handler(self, &change);
        }
        self.running_handlers = false;
    }

    // ── Reachability ─────────────────────────────────────────────

    /// Rebuild the reachable index from the roots. Cycle safe.
    fn recompute_models(&mut self) {
        let before: HashSet<ModelId> = self.models.keys().cloned().collect();
        let mut pool = std::mem::take(&mut self.models);
        pool.extend(self.detached.drain());

        let mut attached = HashMap::with_capacity(pool.len());
        let mut visited = HashSet::new();
        let mut queue: VecDeque<ModelId> = self.roots.iter().cloned().collect();
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            match pool.remove(&id) {
                Some(model) => {
                    for child in model.references() {
                        if !visited.contains(&child) {
                            queue.push_back(child);
                        }
                    }
                    attached.insert(id, model);
                }
                None => log::debug!("Dangling reference to model {id}"),
            }
        }

        for id in before {
            if !attached.contains_key(&id) {
                self.former_ids.insert(id);
            }
        }
        self.models = attached;
        self.detached = pool;
    }

    // ── Callbacks ────────────────────────────────────────────────

    pub fn add_next_tick_callback(&mut self, callback: DocumentCallback) -> Result<CallbackHandle, CallbackError> {
        self.add_callback(CallbackKind::NextTick, callback)
    }

    pub fn add_timeout_callback(
        &mut self,
        callback: DocumentCallback,
        delay: Duration,
    ) -> Result<CallbackHandle, CallbackError> {
        self.add_callback(CallbackKind::Timeout(delay), callback)
    }

    pub fn add_periodic_callback(
        &mut self,
        callback: DocumentCallback,
        period: Duration,
    ) -> Result<CallbackHandle, CallbackError> {
        self.add_callback(CallbackKind::Periodic(period), callback)
    }

    pub fn remove_next_tick_callback(&mut self, handle: CallbackHandle) -> Result<(), CallbackError> {
        self.remove_callback(handle, CallbackKind::NextTick)
    }

    pub fn remove_timeout_callback(&mut self, handle: CallbackHandle) -> Result<(), CallbackError> {
        self.remove_callback(handle, CallbackKind::Timeout(Duration::ZERO))
    }

    pub fn remove_periodic_callback(&mut self, handle: CallbackHandle) -> Result<(), CallbackError> {
        self.remove_callback(handle, CallbackKind::Periodic(Duration::ZERO))
    }

    /// Take a callback for execution. `None` once removed or (one-shot) fired.
    pub fn claim_callback(&mut self, handle: CallbackHandle) -> Option<DocumentCallback> {
        self.callbacks.claim(handle)
    }

    pub fn has_callback(&self, handle: CallbackHandle) -> bool {
        self.callbacks.contains(handle)
    }

    pub fn session_callbacks(&self) -> Vec<SessionCallback> {
        self.callbacks.all()
    }

    fn add_callback(&mut self, kind: CallbackKind, callback: DocumentCallback) -> Result<CallbackHandle, CallbackError> {
        if self.destroyed {
            return Err(CallbackError::Destroyed);
        }
        let entry = self.callbacks.insert(kind, callback);
        for listener in self.live_listeners() {
            listener.callback_added(&entry);
        }
        Ok(entry.handle)
    }

    fn remove_callback(&mut self, handle: CallbackHandle, kind: CallbackKind) -> Result<(), CallbackError> {
        self.callbacks.remove(handle, kind)?;
        for listener in self.live_listeners() {
            listener.callback_removed(handle);
        }
        Ok(())
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Drop all content, listeners and callbacks. Terminal.
    pub fn destroy(&mut self) {
        let cancelled = self.callbacks.clear();
        for listener in self.live_listeners() {
            for handle in &cancelled {
                listener.callback_removed(*handle);
            }
        }
        self.roots.clear();
        self.models.clear();
        self.detached.clear();
        self.listeners.clear();
        self.held.clear();
        self.hold = None;
        self.property_handlers.clear();
        self.message_handlers.clear();
        self.pending_handlers.clear();
        self.destroyed = true;
    }

    // ── Snapshot support ─────────────────────────────────────────

    /// Copy of the content alone, detached pool included. The copy has no
    /// listeners, handlers or callbacks, so changes to it go nowhere.
    pub fn content_copy(&self) -> Document {
        let mut copy = Document::new();
        copy.title = self.title.clone();
        copy.roots = self.roots.clone();
        copy.models = self.models.clone();
        copy.detached = self.detached.clone();
        copy.former_ids = self.former_ids.clone();
        copy.destroyed = self.destroyed;
        copy
    }

    pub(crate) fn reset_contents(&mut self, title: String, roots: Vec<ModelId>, models: Vec<Model>) {
        self.former_ids.extend(self.models.keys().cloned());
        self.models.clear();
        self.detached = models.into_iter().map(|m| (m.id.clone(), m)).collect();
        self.roots = roots;
        self.title = title;
        self.recompute_models();
    }
}

fn push_refs<'a>(value: &'a Value, queue: &mut VecDeque<&'a ModelId>) {
    match value {
        Value::Ref(r) => queue.push_back(&r.id),
        Value::List(items) => items.iter().for_each(|v| push_refs(v, queue)),
        Value::Map(entries) => entries.values().for_each(|v| push_refs(v, queue)),
        _ => {}
    }
}
