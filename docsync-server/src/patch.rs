//! Patch codec: change events to PATCH-DOC messages and back.
//!
//! Encoding turns one [`ChangeEvent`] into one message. Models that the
//! receiver may not know yet (a new root's subtree, models newly referenced
//! by a property) travel alongside as `references`. Float columns are moved
//! out of the JSON into binary buffers.
//!
//! Applying a patch checks every event first, so a message that cannot
//! apply in full (unknown id, bad column index, duplicate root) fails before
//! the document is touched.

use std::collections::{BTreeMap, HashSet};

use bincode::config;
use docsync_core::{
    ChangeEvent, ColumnData, ColumnPatches, Document, DocumentError, Model, ModelId, ModelRef, SetterId,
    Value,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{Buffer, Message, ProtocolError};

pub const FLOAT64: &str = "float64";

/// Content of a PATCH-DOC message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDoc {
    pub events: Vec<PatchEvent>,
    #[serde(default)]
    pub references: Vec<Model>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PatchEvent {
    ModelChanged {
        model: ModelRef,
        attr: String,
        new: Value,
    },
    RootAdded {
        model: ModelRef,
    },
    RootRemoved {
        model: ModelRef,
    },
    TitleChanged {
        title: String,
    },
    ColumnDataChanged {
        column_source: ModelRef,
        new: WireColumns,
        #[serde(default)]
        cols: Option<Vec<String>>,
    },
    ColumnsStreamed {
        column_source: ModelRef,
        data: WireColumns,
        #[serde(default)]
        rollover: Option<usize>,
    },
    ColumnsPatched {
        column_source: ModelRef,
        patches: ColumnPatches,
    },
    MessageSent {
        msg_type: String,
        msg_data: Value,
    },
}

impl PatchEvent {
    fn target(&self) -> Option<&ModelId> {
        match self {
            PatchEvent::ModelChanged { model, .. }
            | PatchEvent::RootAdded { model }
            | PatchEvent::RootRemoved { model } => Some(&model.id),
            PatchEvent::ColumnDataChanged { column_source, .. }
            | PatchEvent::ColumnsStreamed { column_source, .. }
            | PatchEvent::ColumnsPatched { column_source, .. } => Some(&column_source.id),
            _ => None,
        }
    }
}

pub type WireColumns = BTreeMap<String, ColumnPayload>;

/// A column either inline or as a reference to a binary buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnPayload {
    Buffer(BufferRef),
    Values(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BufferRef {
    #[serde(rename = "__buffer__")]
    pub id: String,
    pub dtype: String,
    pub shape: Vec<usize>,
}

// ── Encoding ─────────────────────────────────────────────────────

/// Encode one event. `DocumentReplaced` becomes a whole-document PUSH-DOC.
pub fn encode_event(doc: &Document, event: &ChangeEvent) -> Result<Message, ProtocolError> {
    let mut buffers = Vec::new();
    let (patch_event, needs) = match event {
        ChangeEvent::DocumentReplaced { .. } => return Ok(Message::push_doc(doc.to_snapshot())),
        ChangeEvent::RootAdded { model, .. } => (
            PatchEvent::RootAdded { model: model_ref(model) },
            vec![model.clone()],
        ),
        ChangeEvent::RootRemoved { model, .. } => {
            (PatchEvent::RootRemoved { model: model_ref(model) }, Vec::new())
        }
        ChangeEvent::ModelChanged { model, attr, new, .. } => {
            let mut refs = Vec::new();
            new.collect_references(&mut refs);
            (
                PatchEvent::ModelChanged {
                    model: model_ref(model),
                    attr: attr.clone(),
                    new: new.clone(),
                },
                refs,
            )
        }
        ChangeEvent::TitleChanged { title, .. } => {
            (PatchEvent::TitleChanged { title: title.clone() }, Vec::new())
        }
        ChangeEvent::ColumnDataChanged { source, new, cols, .. } => (
            PatchEvent::ColumnDataChanged {
                column_source: model_ref(source),
                new: encode_columns(new, &mut buffers)?,
                cols: cols.clone(),
            },
            Vec::new(),
        ),
        ChangeEvent::ColumnsStreamed { source, data, rollover, .. } => (
            PatchEvent::ColumnsStreamed {
                column_source: model_ref(source),
                data: encode_columns(data, &mut buffers)?,
                rollover: *rollover,
            },
            Vec::new(),
        ),
        ChangeEvent::ColumnsPatched { source, patches, .. } => (
            PatchEvent::ColumnsPatched {
                column_source: model_ref(source),
                patches: patches.clone(),
            },
            Vec::new(),
        ),
        ChangeEvent::MessageSent { msg_type, msg_data, .. } => (
            PatchEvent::MessageSent {
                msg_type: msg_type.clone(),
                msg_data: msg_data.clone(),
            },
            Vec::new(),
        ),
    };

    let references = doc.subtree(&needs).into_iter().cloned().collect();
    Ok(Message::patch_doc(
        PatchDoc {
            events: vec![patch_event],
            references,
        },
        buffers,
    ))
}

fn model_ref(id: &ModelId) -> ModelRef {
    ModelRef { id: id.clone() }
}

fn encode_columns(data: &ColumnData, buffers: &mut Vec<Buffer>) -> Result<WireColumns, ProtocolError> {
    let mut out = WireColumns::new();
    for (name, values) in data {
        let floats: Option<Vec<f64>> = values
            .iter()
            .map(|v| match v {
                Value::Float(f) => Some(*f),
                _ => None,
            })
            .collect();
        let payload = match floats {
            Some(floats) if !floats.is_empty() => {
                let id = Uuid::new_v4().simple().to_string();
                let data = bincode::serde::encode_to_vec(&floats, config::standard())
                    .map_err(|e| ProtocolError::BadBuffer(e.to_string()))?;
                buffers.push(Buffer { id: id.clone(), data });
                ColumnPayload::Buffer(BufferRef {
                    id,
                    dtype: FLOAT64.to_string(),
                    shape: vec![floats.len()],
                })
            }
            _ => ColumnPayload::Values(values.clone()),
        };
        out.insert(name.clone(), payload);
    }
    Ok(out)
}

// ── Decoding ─────────────────────────────────────────────────────

fn decode_columns(columns: &WireColumns, message: &Message) -> Result<ColumnData, ProtocolError> {
    let mut out = ColumnData::new();
    for (name, payload) in columns {
        let values = match payload {
            ColumnPayload::Values(values) => values.clone(),
            ColumnPayload::Buffer(buffer) => {
                if buffer.dtype != FLOAT64 {
                    return Err(ProtocolError::BadBuffer(format!("unsupported dtype {}", buffer.dtype)));
                }
                let bytes = message
                    .buffer(&buffer.id)
                    .ok_or_else(|| ProtocolError::MissingBuffer(buffer.id.clone()))?;
                let (floats, _): (Vec<f64>, usize) =
                    bincode::serde::decode_from_slice(bytes, config::standard())
                        .map_err(|e| ProtocolError::BadBuffer(e.to_string()))?;
                if buffer.shape.iter().product::<usize>() != floats.len() {
                    return Err(ProtocolError::BadBuffer(format!(
                        "buffer {} does not match shape {:?}",
                        buffer.id, buffer.shape
                    )));
                }
                floats.into_iter().map(Value::Float).collect()
            }
        };
        out.insert(name.clone(), values);
    }
    Ok(out)
}

/// A patch event with its column payloads resolved.
#[derive(Clone)]
enum Resolved<'a> {
    Plain(&'a PatchEvent),
    Columns(&'a PatchEvent, ColumnData),
}

impl Message {
    /// Replay this message onto `doc`, stamping resulting events with `setter`.
    ///
    /// PATCH-DOC applies its events; PUSH-DOC and PULL-DOC-REPLY replace the
    /// whole document. Other message types are rejected.
    pub fn apply_to(&self, doc: &mut Document, setter: Option<SetterId>) -> Result<(), ProtocolError> {
        match &self.content {
            crate::protocol::Content::PatchDoc(patch) => patch.apply_to(doc, self, setter),
            crate::protocol::Content::PushDoc(snapshot)
            | crate::protocol::Content::PullDocReply(snapshot) => {
                doc.replace_with_snapshot(snapshot.clone(), setter)?;
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedMessage(self.msgtype())),
        }
    }
}

impl PatchDoc {
    fn apply_to(&self, doc: &mut Document, message: &Message, setter: Option<SetterId>) -> Result<(), ProtocolError> {
        if doc.is_destroyed() {
            return Err(DocumentError::Destroyed.into());
        }
        let resolved = self.resolve(doc, message)?;

        // Nothing changes unless every event applies. One event is checked in
        // place; a sequence is rehearsed on a silent copy, since earlier
        // events change what later ones may do.
        match resolved.as_slice() {
            [] => {}
            [single] => check(doc, single)?,
            _ => self.apply_resolved(&mut doc.content_copy(), resolved.clone(), None)?,
        }
        self.apply_resolved(doc, resolved, setter)
    }

    /// Check model ids and decode column payloads.
    fn resolve<'a>(&'a self, doc: &Document, message: &Message) -> Result<Vec<Resolved<'a>>, ProtocolError> {
        let referenced: HashSet<&ModelId> = self.references.iter().map(|m| &m.id).collect();
        let mut resolved = Vec::with_capacity(self.events.len());
        for event in &self.events {
            if let Some(id) = event.target() {
                let known = doc.contains_model(id) || referenced.contains(id);
                if !known {
                    if doc.is_former_model(id) {
                        log::debug!("Skipping patch event for former model {id}");
                        continue;
                    }
                    return Err(ProtocolError::UnknownModel(id.clone()));
                }
            }
            resolved.push(match event {
                PatchEvent::ColumnDataChanged { new, .. } => {
                    Resolved::Columns(event, decode_columns(new, message)?)
                }
                PatchEvent::ColumnsStreamed { data, .. } => {
                    Resolved::Columns(event, decode_columns(data, message)?)
                }
                _ => Resolved::Plain(event),
            });
        }
        Ok(resolved)
    }

    fn apply_resolved(
        &self,
        doc: &mut Document,
        resolved: Vec<Resolved<'_>>,
        setter: Option<SetterId>,
    ) -> Result<(), ProtocolError> {
        for model in &self.references {
            if doc.find_model(&model.id).is_none() {
                doc.add_model(model.clone())?;
            }
        }

        for item in resolved {
            match item {
                Resolved::Plain(PatchEvent::ModelChanged { model, attr, new }) => {
                    doc.set_property(&model.id, attr, new.clone(), setter)?;
                }
                Resolved::Plain(PatchEvent::RootAdded { model }) => {
                    doc.attach_root(&model.id, setter)?;
                }
                Resolved::Plain(PatchEvent::RootRemoved { model }) => {
                    doc.remove_root(&model.id, setter)?;
                }
                Resolved::Plain(PatchEvent::TitleChanged { title }) => {
                    doc.set_title(title.clone(), setter);
                }
                Resolved::Plain(PatchEvent::ColumnsPatched { column_source, patches }) => {
                    doc.patch(&column_source.id, patches.clone(), setter)?;
                }
                Resolved::Plain(PatchEvent::MessageSent { msg_type, msg_data }) => {
                    doc.deliver_message(msg_type, msg_data);
                }
                Resolved::Columns(PatchEvent::ColumnDataChanged { column_source, .. }, data) => {
                    doc.set_columns(&column_source.id, data, setter)?;
                }
                Resolved::Columns(PatchEvent::ColumnsStreamed { column_source, rollover, .. }, data) => {
                    doc.stream(&column_source.id, data, *rollover, setter)?;
                }
                Resolved::Plain(_) | Resolved::Columns(..) => {}
            }
        }
        Ok(())
    }
}

/// Would this event apply to `doc` once the patch references are added?
fn check(doc: &Document, item: &Resolved<'_>) -> Result<(), DocumentError> {
    match item {
        Resolved::Plain(PatchEvent::RootAdded { model }) if doc.roots().contains(&model.id) => {
            Err(DocumentError::DuplicateRoot(model.id.clone()))
        }
        Resolved::Plain(PatchEvent::RootRemoved { model }) if !doc.roots().contains(&model.id) => {
            Err(DocumentError::MissingRoot(model.id.clone()))
        }
        Resolved::Plain(PatchEvent::ColumnsPatched { column_source, patches }) => {
            doc.check_patch(&column_source.id, patches)
        }
        Resolved::Columns(PatchEvent::ColumnDataChanged { column_source, .. }, _) => {
            doc.check_columns(&column_source.id)
        }
        Resolved::Columns(PatchEvent::ColumnsStreamed { column_source, .. }, data) => {
            doc.check_stream(&column_source.id, data)
        }
        _ => Ok(()),
    }
}
