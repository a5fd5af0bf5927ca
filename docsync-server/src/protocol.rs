//! Wire protocol: typed messages and their websocket framing.
//!
//! One message is a run of websocket frames:
//! ```text
//! ┌────────────┬────────────┬────────────┬─────────────────────────────┐
//! │ header     │ metadata   │ content    │ buffer header │ payload │ … │
//! │ text/JSON  │ text/JSON  │ text/JSON  │ text/JSON     │ binary  │   │
//! └────────────┴────────────┴────────────┴─────────────────────────────┘
//! ```
//! The header carries `msgid`, `msgtype`, an optional `reqid` naming the
//! request being answered, and `num_buffers` when binary buffers follow.
//! Reassembly lives in [`receiver`](crate::receiver).

use std::fmt;
use std::sync::Arc;

use docsync_core::{DocumentError, DocumentSnapshot, ModelId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::patch::PatchDoc;

/// Upper bound on binary buffers announced by one header.
pub const MAX_BUFFERS: usize = 1024;

/// Message types of the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    /// Connection accepted, session attached
    #[serde(rename = "ACK")]
    Ack,
    /// Request handled
    #[serde(rename = "OK")]
    Ok,
    /// Request failed
    #[serde(rename = "ERROR")]
    Error,
    /// Incremental document delta
    #[serde(rename = "PATCH-DOC")]
    PatchDoc,
    /// Ask for the whole document
    #[serde(rename = "PULL-DOC-REQ")]
    PullDocReq,
    /// Whole document, answering a pull
    #[serde(rename = "PULL-DOC-REPLY")]
    PullDocReply,
    /// Whole document, replacing the receiver's
    #[serde(rename = "PUSH-DOC")]
    PushDoc,
    #[serde(rename = "SERVER-INFO-REQ")]
    ServerInfoReq,
    #[serde(rename = "SERVER-INFO-REPLY")]
    ServerInfoReply,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Ack => "ACK",
            MsgType::Ok => "OK",
            MsgType::Error => "ERROR",
            MsgType::PatchDoc => "PATCH-DOC",
            MsgType::PullDocReq => "PULL-DOC-REQ",
            MsgType::PullDocReply => "PULL-DOC-REPLY",
            MsgType::PushDoc => "PUSH-DOC",
            MsgType::ServerInfoReq => "SERVER-INFO-REQ",
            MsgType::ServerInfoReply => "SERVER-INFO-REPLY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "ACK" => MsgType::Ack,
            "OK" => MsgType::Ok,
            "ERROR" => MsgType::Error,
            "PATCH-DOC" => MsgType::PatchDoc,
            "PULL-DOC-REQ" => MsgType::PullDocReq,
            "PULL-DOC-REPLY" => MsgType::PullDocReply,
            "PUSH-DOC" => MsgType::PushDoc,
            "SERVER-INFO-REQ" => MsgType::ServerInfoReq,
            "SERVER-INFO-REPLY" => MsgType::ServerInfoReply,
            _ => return None,
        })
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub msgid: String,
    pub msgtype: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_buffers: Option<usize>,
}

impl Header {
    fn new(msgtype: MsgType, reqid: Option<String>) -> Self {
        Self {
            msgid: Uuid::new_v4().simple().to_string(),
            msgtype,
            reqid,
            num_buffers: None,
        }
    }

    /// Parse a header fragment, reporting unknown message types distinctly.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: JsonValue = serde_json::from_str(text).map_err(ProtocolError::json)?;
        let msgtype = raw
            .get("msgtype")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ProtocolError::MalformedHeader("missing msgtype".into()))?;
        if MsgType::parse(msgtype).is_none() {
            return Err(ProtocolError::UnknownMessageType(msgtype.to_string()));
        }
        serde_json::from_value(raw).map_err(|e| ProtocolError::MalformedHeader(e.to_string()))
    }
}

/// A binary attachment referenced from the content by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    pub id: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferHeader {
    pub id: String,
}

/// A single websocket frame of a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version_info: VersionInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub server: String,
    pub protocol: String,
}

impl ServerInfo {
    pub fn current() -> Self {
        Self {
            version_info: VersionInfo {
                server: env!("CARGO_PKG_VERSION").to_string(),
                protocol: "1".to_string(),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
struct DocContent {
    doc: DocumentSnapshot,
}

#[derive(Serialize, Deserialize)]
struct ErrorContent {
    text: String,
}

/// Typed message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Ack,
    Ok,
    Error { text: String },
    PatchDoc(PatchDoc),
    PullDocReq,
    PullDocReply(DocumentSnapshot),
    PushDoc(DocumentSnapshot),
    ServerInfoReq,
    ServerInfoReply(ServerInfo),
}

impl Content {
    pub fn msgtype(&self) -> MsgType {
        match self {
            Content::Ack => MsgType::Ack,
            Content::Ok => MsgType::Ok,
            Content::Error { .. } => MsgType::Error,
            Content::PatchDoc(_) => MsgType::PatchDoc,
            Content::PullDocReq => MsgType::PullDocReq,
            Content::PullDocReply(_) => MsgType::PullDocReply,
            Content::PushDoc(_) => MsgType::PushDoc,
            Content::ServerInfoReq => MsgType::ServerInfoReq,
            Content::ServerInfoReply(_) => MsgType::ServerInfoReply,
        }
    }

    fn to_json(&self) -> Result<String, ProtocolError> {
        let result = match self {
            Content::Ack | Content::Ok | Content::PullDocReq | Content::ServerInfoReq => {
                Ok("{}".to_string())
            }
            Content::Error { text } => serde_json::to_string(&ErrorContent { text: text.clone() }),
            Content::PatchDoc(patch) => serde_json::to_string(patch),
            Content::PullDocReply(doc) | Content::PushDoc(doc) => {
                serde_json::to_string(&DocContent { doc: doc.clone() })
            }
            Content::ServerInfoReply(info) => serde_json::to_string(info),
        };
        result.map_err(ProtocolError::json)
    }

    fn from_json(msgtype: MsgType, text: &str) -> Result<Self, ProtocolError> {
        fn parse<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
            serde_json::from_str(text).map_err(ProtocolError::json)
        }
        Ok(match msgtype {
            MsgType::Ack => Content::Ack,
            MsgType::Ok => Content::Ok,
            MsgType::PullDocReq => Content::PullDocReq,
            MsgType::ServerInfoReq => Content::ServerInfoReq,
            MsgType::Error => Content::Error { text: parse::<ErrorContent>(text)?.text },
            MsgType::PatchDoc => Content::PatchDoc(parse(text)?),
            MsgType::PullDocReply => Content::PullDocReply(parse::<DocContent>(text)?.doc),
            MsgType::PushDoc => Content::PushDoc(parse::<DocContent>(text)?.doc),
            MsgType::ServerInfoReply => Content::ServerInfoReply(parse(text)?),
        })
    }
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: Header,
    pub metadata: JsonValue,
    pub content: Content,
    pub buffers: Vec<Buffer>,
}

impl Message {
    fn build(content: Content, reqid: Option<String>) -> Self {
        Self {
            header: Header::new(content.msgtype(), reqid),
            metadata: JsonValue::Object(Default::default()),
            content,
            buffers: Vec::new(),
        }
    }

    pub fn ack() -> Self {
        Self::build(Content::Ack, None)
    }

    pub fn ok(reqid: &str) -> Self {
        Self::build(Content::Ok, Some(reqid.to_string()))
    }

    pub fn error(reqid: &str, text: impl Into<String>) -> Self {
        Self::build(Content::Error { text: text.into() }, Some(reqid.to_string()))
    }

    pub fn patch_doc(patch: PatchDoc, buffers: Vec<Buffer>) -> Self {
        let mut msg = Self::build(Content::PatchDoc(patch), None);
        msg.buffers = buffers;
        msg
    }

    pub fn pull_doc_req() -> Self {
        Self::build(Content::PullDocReq, None)
    }

    pub fn pull_doc_reply(reqid: &str, doc: DocumentSnapshot) -> Self {
        Self::build(Content::PullDocReply(doc), Some(reqid.to_string()))
    }

    pub fn push_doc(doc: DocumentSnapshot) -> Self {
        Self::build(Content::PushDoc(doc), None)
    }

    pub fn server_info_req() -> Self {
        Self::build(Content::ServerInfoReq, None)
    }

    pub fn server_info_reply(reqid: &str) -> Self {
        Self::build(Content::ServerInfoReply(ServerInfo::current()), Some(reqid.to_string()))
    }

    pub fn msgid(&self) -> &str {
        &self.header.msgid
    }

    pub fn msgtype(&self) -> MsgType {
        self.header.msgtype
    }

    pub fn reqid(&self) -> Option<&str> {
        self.header.reqid.as_deref()
    }

    /// Split into websocket frames.
    pub fn to_fragments(&self) -> Result<Vec<Fragment>, ProtocolError> {
        let mut header = self.header.clone();
        header.num_buffers = (!self.buffers.is_empty()).then_some(self.buffers.len());

        let mut fragments = Vec::with_capacity(3 + 2 * self.buffers.len());
        fragments.push(Fragment::Text(serde_json::to_string(&header).map_err(ProtocolError::json)?));
        fragments.push(Fragment::Text(serde_json::to_string(&self.metadata).map_err(ProtocolError::json)?));
        fragments.push(Fragment::Text(self.content.to_json()?));
        for buffer in &self.buffers {
            let buffer_header = BufferHeader { id: buffer.id.clone() };
            fragments.push(Fragment::Text(
                serde_json::to_string(&buffer_header).map_err(ProtocolError::json)?,
            ));
            fragments.push(Fragment::Binary(buffer.data.clone()));
        }
        Ok(fragments)
    }

    /// Frames ready to be shared between several connections.
    pub fn to_shared_fragments(&self) -> Result<Arc<Vec<Fragment>>, ProtocolError> {
        self.to_fragments().map(Arc::new)
    }

    /// Build from already reassembled parts.
    pub fn assemble(
        header: Header,
        metadata: &str,
        content: &str,
        buffers: Vec<Buffer>,
    ) -> Result<Self, ProtocolError> {
        let metadata: JsonValue = serde_json::from_str(metadata).map_err(ProtocolError::json)?;
        let content = Content::from_json(header.msgtype, content)?;
        Ok(Self {
            header,
            metadata,
            content,
            buffers,
        })
    }

    pub fn buffer(&self, id: &str) -> Option<&[u8]> {
        self.buffers.iter().find(|b| b.id == id).map(|b| b.data.as_slice())
    }
}

/// Protocol errors. Any of these closes the offending connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("expected a {expected} frame")]
    UnexpectedFragment { expected: &'static str },
    #[error("too many buffers: {0}")]
    TooManyBuffers(usize),
    #[error("duplicate buffer id: {0}")]
    DuplicateBuffer(String),
    #[error("missing buffer: {0}")]
    MissingBuffer(String),
    #[error("bad buffer: {0}")]
    BadBuffer(String),
    #[error("unknown model id: {0}")]
    UnknownModel(ModelId),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(MsgType),
    #[error("document error: {0}")]
    Document(#[from] DocumentError),
}

impl ProtocolError {
    pub(crate) fn json(e: serde_json::Error) -> Self {
        ProtocolError::InvalidJson(e.to_string())
    }
}
