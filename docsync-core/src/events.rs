//! Change events emitted by the document's change tracker.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::value::{ModelId, Value};

static NEXT_SETTER: AtomicU64 = AtomicU64::new(1);

/// Identity of whoever originated a mutation (a connection, a client session).
///
/// Events carrying a setter are never echoed back to that setter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetterId(u64);

impl SetterId {
    pub fn next() -> Self {
        Self(NEXT_SETTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SetterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "setter-{}", self.0)
    }
}

/// Column name → column values.
pub type ColumnData = BTreeMap<String, Vec<Value>>;

/// Target of a single column patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchIndex {
    Index(usize),
    Slice(SliceSpec),
}

/// Half-open stepped slice. Missing bounds default to the column ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    #[serde(default)]
    pub start: Option<usize>,
    #[serde(default)]
    pub stop: Option<usize>,
    #[serde(default)]
    pub step: Option<usize>,
}

impl SliceSpec {
    /// Resolve against a column length. `None` if out of bounds or step is 0.
    pub fn indices(&self, len: usize) -> Option<Vec<usize>> {
        let start = self.start.unwrap_or(0);
        let stop = self.stop.unwrap_or(len);
        let step = self.step.unwrap_or(1);
        if step == 0 || start > stop || stop > len {
            return None;
        }
        Some((start..stop).step_by(step).collect())
    }
}

/// One sparse replacement: `(index, value)` or `(slice, list of values)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPatch(pub PatchIndex, pub Value);

pub type ColumnPatches = BTreeMap<String, Vec<ColumnPatch>>;

/// A single logical mutation of a document.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    RootAdded {
        model: ModelId,
        setter: Option<SetterId>,
    },
    RootRemoved {
        model: ModelId,
        setter: Option<SetterId>,
    },
    ModelChanged {
        model: ModelId,
        attr: String,
        old: Value,
        new: Value,
        setter: Option<SetterId>,
    },
    TitleChanged {
        title: String,
        setter: Option<SetterId>,
    },
    /// Whole columns replaced. `cols` names the replaced columns.
    ColumnDataChanged {
        source: ModelId,
        new: ColumnData,
        cols: Option<Vec<String>>,
        setter: Option<SetterId>,
    },
    ColumnsStreamed {
        source: ModelId,
        data: ColumnData,
        rollover: Option<usize>,
        setter: Option<SetterId>,
    },
    ColumnsPatched {
        source: ModelId,
        patches: ColumnPatches,
        setter: Option<SetterId>,
    },
    MessageSent {
        msg_type: String,
        msg_data: Value,
        setter: Option<SetterId>,
    },
    /// The whole document was rebuilt (snapshot replace or release of a
    /// snapshot hold). Receivers resend the full document.
    DocumentReplaced {
        setter: Option<SetterId>,
    },
}

impl ChangeEvent {
    pub fn setter(&self) -> Option<SetterId> {
        match self {
            ChangeEvent::RootAdded { setter, .. }
            | ChangeEvent::RootRemoved { setter, .. }
            | ChangeEvent::ModelChanged { setter, .. }
            | ChangeEvent::TitleChanged { setter, .. }
            | ChangeEvent::ColumnDataChanged { setter, .. }
            | ChangeEvent::ColumnsStreamed { setter, .. }
            | ChangeEvent::ColumnsPatched { setter, .. }
            | ChangeEvent::MessageSent { setter, .. }
            | ChangeEvent::DocumentReplaced { setter } => *setter,
        }
    }

    /// The model this event is about, if any.
    pub fn model(&self) -> Option<&ModelId> {
        match self {
            ChangeEvent::RootAdded { model, .. }
            | ChangeEvent::RootRemoved { model, .. }
            | ChangeEvent::ModelChanged { model, .. } => Some(model),
            ChangeEvent::ColumnDataChanged { source, .. }
            | ChangeEvent::ColumnsStreamed { source, .. }
            | ChangeEvent::ColumnsPatched { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Merge `other` into `self` when both set the same attribute of the same
    /// model from the same setter. Returns false when they cannot merge.
    pub fn combine(&mut self, other: &ChangeEvent) -> bool {
        match (self, other) {
            (
                ChangeEvent::ModelChanged { model, attr, new, setter, .. },
                ChangeEvent::ModelChanged {
                    model: other_model,
                    attr: other_attr,
                    new: other_new,
                    setter: other_setter,
                    ..
                },
            ) if model == other_model && attr == other_attr && setter == other_setter => {
                *new = other_new.clone();
                true
            }
            (
                ChangeEvent::TitleChanged { title, setter },
                ChangeEvent::TitleChanged { title: other_title, setter: other_setter },
            ) if setter == other_setter => {
                *title = other_title.clone();
                true
            }
            _ => false,
        }
    }
}

/// How mutations behave while a document is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldPolicy {
    /// Suppress every event; release emits a single `DocumentReplaced`.
    Snapshot,
    /// Queue every event and replay all of them on release.
    Collect,
    /// Queue events, merging repeated sets of the same attribute.
    Combine,
}
