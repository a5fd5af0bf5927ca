//! Whole-document JSON snapshots, used for PULL/PUSH.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::document::{Document, DocumentError};
use crate::events::{ChangeEvent, SetterId};
use crate::model::Model;
use crate::value::ModelId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    #[serde(default)]
    pub title: String,
    pub roots: Vec<ModelId>,
    /// Reachable models, sorted by id.
    pub models: Vec<Model>,
}

impl DocumentSnapshot {
    fn validate(&self) -> Result<(), DocumentError> {
        let mut ids = HashSet::with_capacity(self.models.len());
        for model in &self.models {
            if !ids.insert(&model.id) {
                return Err(DocumentError::InvalidSnapshot(format!("model {} listed twice", model.id)));
            }
        }
        let mut roots = HashSet::with_capacity(self.roots.len());
        for root in &self.roots {
            if !ids.contains(root) {
                return Err(DocumentError::InvalidSnapshot(format!("root {root} has no model")));
            }
            if !roots.insert(root) {
                return Err(DocumentError::DuplicateRoot(root.clone()));
            }
        }
        Ok(())
    }
}

impl Document {
    pub fn to_snapshot(&self) -> DocumentSnapshot {
        let mut models: Vec<Model> = self.models().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        DocumentSnapshot {
            title: self.title().to_string(),
            roots: self.roots().to_vec(),
            models,
        }
    }

    pub fn from_snapshot(snapshot: DocumentSnapshot) -> Result<Document, DocumentError> {
        snapshot.validate()?;
        let mut doc = Document::new();
        doc.reset_contents(snapshot.title, snapshot.roots, snapshot.models);
        Ok(doc)
    }

    /// Swap in the snapshot's contents. Listeners, handlers and callbacks are
    /// kept; listeners see one `DocumentReplaced` event.
    pub fn replace_with_snapshot(
        &mut self,
        snapshot: DocumentSnapshot,
        setter: Option<SetterId>,
    ) -> Result<(), DocumentError> {
        if self.is_destroyed() {
            return Err(DocumentError::Destroyed);
        }
        snapshot.validate()?;
        self.reset_contents(snapshot.title, snapshot.roots, snapshot.models);
        self.emit(ChangeEvent::DocumentReplaced { setter });
        Ok(())
    }
}
