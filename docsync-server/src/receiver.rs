//! Reassembles websocket frames into [`Message`]s.

use std::collections::HashSet;

use crate::protocol::{Buffer, BufferHeader, Fragment, Header, Message, ProtocolError, MAX_BUFFERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Header,
    Metadata,
    Content,
    BufferHeader,
    BufferPayload,
}

/// Frame-by-frame message assembler for one connection.
///
/// After an error the receiver resets, but callers are expected to close the
/// connection anyway.
#[derive(Debug)]
pub struct Receiver {
    stage: Stage,
    header: Option<Header>,
    metadata: String,
    content: String,
    buffers: Vec<Buffer>,
    buffer_ids: HashSet<String>,
    pending_buffer: Option<String>,
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            stage: Stage::Header,
            header: None,
            metadata: String::new(),
            content: String::new(),
            buffers: Vec::new(),
            buffer_ids: HashSet::new(),
            pending_buffer: None,
        }
    }

    /// Feed one frame. Returns the message once its last frame arrives.
    pub fn consume(&mut self, fragment: Fragment) -> Result<Option<Message>, ProtocolError> {
        let result = self.step(fragment);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn step(&mut self, fragment: Fragment) -> Result<Option<Message>, ProtocolError> {
        match (self.stage, fragment) {
            (Stage::Header, Fragment::Text(text)) => {
                let header = Header::parse(&text)?;
                if let Some(n) = header.num_buffers {
                    if n > MAX_BUFFERS {
                        return Err(ProtocolError::TooManyBuffers(n));
                    }
                }
                self.header = Some(header);
                self.stage = Stage::Metadata;
                Ok(None)
            }
            (Stage::Metadata, Fragment::Text(text)) => {
                self.metadata = text;
                self.stage = Stage::Content;
                Ok(None)
            }
            (Stage::Content, Fragment::Text(text)) => {
                self.content = text;
                self.finish_or_wait()
            }
            (Stage::BufferHeader, Fragment::Text(text)) => {
                let header: BufferHeader = serde_json::from_str(&text).map_err(ProtocolError::json)?;
                if !self.buffer_ids.insert(header.id.clone()) {
                    return Err(ProtocolError::DuplicateBuffer(header.id));
                }
                self.pending_buffer = Some(header.id);
                self.stage = Stage::BufferPayload;
                Ok(None)
            }
            (Stage::BufferPayload, Fragment::Binary(data)) => {
                let id = self
                    .pending_buffer
                    .take()
                    .ok_or(ProtocolError::UnexpectedFragment { expected: "buffer header" })?;
                self.buffers.push(Buffer { id, data });
                self.finish_or_wait()
            }
            (Stage::BufferPayload, Fragment::Text(_)) => {
                Err(ProtocolError::UnexpectedFragment { expected: "binary" })
            }
            (_, Fragment::Binary(_)) => Err(ProtocolError::UnexpectedFragment { expected: "text" }),
        }
    }

    fn finish_or_wait(&mut self) -> Result<Option<Message>, ProtocolError> {
        let expected = self
            .header
            .as_ref()
            .and_then(|h| h.num_buffers)
            .unwrap_or(0);
        if self.buffers.len() < expected {
            self.stage = Stage::BufferHeader;
            return Ok(None);
        }
        let header = self
            .header
            .take()
            .ok_or(ProtocolError::UnexpectedFragment { expected: "header" })?;
        let metadata = std::mem::take(&mut self.metadata);
        let content = std::mem::take(&mut self.content);
        let buffers = std::mem::take(&mut self.buffers);
        self.reset();
        Message::assemble(header, &metadata, &content, buffers).map(Some)
    }

    fn reset(&mut self) {
        self.stage = Stage::Header;
        self.header = None;
        self.metadata.clear();
        self.content.clear();
        self.buffers.clear();
        self.buffer_ids.clear();
        self.pending_buffer = None;
    }
}
