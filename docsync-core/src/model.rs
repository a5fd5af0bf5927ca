//! Models: addressable nodes of a document.
//!
//! A model is plain data. Once handed to a [`Document`](crate::Document) it is
//! owned by the document's model table and mutated only through document
//! methods, so every change passes through the change tracker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::{ModelId, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(rename = "attributes", default)]
    pub properties: BTreeMap<String, Value>,
}

impl Model {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self::with_id(ModelId::new(), type_name)
    }

    /// Create with an explicit id (for testing and for wire decoding)
    pub fn with_id(id: impl Into<ModelId>, type_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            type_name: type_name.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property initialiser. Emits nothing.
    pub fn with(mut self, attr: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(attr.into(), value.into());
        self
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        self.properties.get(attr)
    }

    /// Ids of every model this one points at through its properties.
    pub fn references(&self) -> Vec<ModelId> {
        let mut out = Vec::new();
        for value in self.properties.values() {
            value.collect_references(&mut out);
        }
        out
    }
}
