//! Websocket client session.
//!
//! Keeps a local replica of a server session's document. Local changes made
//! through [`ClientSession::with_document`] are sent as PATCH-DOC messages;
//! patches from the server are applied stamped with this client's setter so
//! they are never sent back.
//!
//! ```text
//!  with_document(f) ──► local Document ──► collector ──► PATCH-DOC ──► writer task
//!                              ▲
//!  reader task ◄── Receiver ◄──┴── PATCH-DOC / PUSH-DOC / replies ◄── socket
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use docsync_core::{
    ChangeEvent, Document, DocumentError, DocumentId, DocumentListener, DocumentSnapshot, SetterId,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};

use crate::patch::encode_event;
use crate::protocol::{Content, Fragment, Message, MsgType, ProtocolError, ServerInfo};
use crate::receiver::Receiver;
use crate::server::SUBPROTOCOL;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("handshake rejected with HTTP status {0}")]
    Rejected(u16),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
    #[error("a different document was already pushed or pulled")]
    AlreadyPushedDocument,
    #[error("server replied with error: {0}")]
    Server(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("unexpected reply {0}")]
    UnexpectedReply(MsgType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Closed,
}

pub type PatchHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Records local change events until they are sent.
#[derive(Default)]
struct EventCollector {
    events: Mutex<Vec<ChangeEvent>>,
}

impl DocumentListener for EventCollector {
    fn document_changed(&self, event: &ChangeEvent) {
        self.events.lock().push(event.clone());
    }
}

struct Shared {
    setter: SetterId,
    document: tokio::sync::Mutex<Document>,
    collector: Arc<EventCollector>,
    outgoing: mpsc::UnboundedSender<WsMessage>,
    replies: Mutex<HashMap<String, oneshot::Sender<Message>>>,
    ack: Mutex<Option<oneshot::Sender<()>>>,
    attached: Mutex<Option<DocumentId>>,
    patch_hooks: Mutex<Vec<PatchHook>>,
    received_patches: AtomicUsize,
    state: Mutex<ClientState>,
}

impl Shared {
    fn send(&self, message: &Message) -> Result<(), ClientError> {
        for fragment in message.to_fragments()? {
            let frame = match fragment {
                Fragment::Text(text) => WsMessage::text(text),
                Fragment::Binary(data) => WsMessage::binary(data),
            };
            self.outgoing.send(frame).map_err(|_| ClientError::Closed)?;
        }
        Ok(())
    }

    /// Send every collected event not caused by the server.
    fn flush(&self, doc: &Document) -> Result<(), ClientError> {
        let events = std::mem::take(&mut *self.collector.events.lock());
        for event in events.iter().filter(|e| e.setter() != Some(self.setter)) {
            self.send(&encode_event(doc, event)?)?;
        }
        Ok(())
    }

    async fn dispatch(&self, message: Message) {
        if let Some(reqid) = message.reqid() {
            if let Some(waiter) = self.replies.lock().remove(reqid) {
                let _ = waiter.send(message);
                return;
            }
        }
        match &message.content {
            Content::Ack => {
                if let Some(ack) = self.ack.lock().take() {
                    let _ = ack.send(());
                }
            }
            Content::PatchDoc(_) => {
                self.received_patches.fetch_add(1, Ordering::SeqCst);
                let hooks = self.patch_hooks.lock().clone();
                for hook in hooks {
                    hook(&message);
                }
                let mut doc = self.document.lock().await;
                if let Err(e) = message.apply_to(&mut *doc, Some(self.setter)) {
                    log::warn!("Could not apply server patch: {e}");
                }
                if let Err(e) = self.flush(&doc) {
                    log::warn!("Could not send derived changes: {e}");
                }
            }
            Content::PushDoc(snapshot) => {
                let mut doc = self.document.lock().await;
                if let Err(e) = doc.replace_with_snapshot(snapshot.clone(), Some(self.setter)) {
                    log::warn!("Could not apply server document: {e}");
                }
                self.collector.events.lock().clear();
            }
            Content::Error { text } => log::warn!("Server error: {text}"),
            other => log::debug!("Ignoring unsolicited {}", other.msgtype()),
        }
    }

    fn shut(&self) {
        *self.state.lock() = ClientState::Closed;
        self.replies.lock().clear();
        self.ack.lock().take();
    }
}

/// A connection to one server session with a local document replica.
pub struct ClientSession {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ClientSession {
    /// Connect to a `.../ws` URL with a session token and wait for ACK.
    pub async fn connect(url: &str, token: &str) -> Result<Self, ClientError> {
        let mut request = url.into_client_request().map_err(ClientError::Connect)?;
        let protocol = HeaderValue::from_str(&format!("{SUBPROTOCOL}, {token}"))
            .map_err(|e| ClientError::InvalidHeader(e.to_string()))?;
        request
            .headers_mut()
            .insert(tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL, protocol);

        let (stream, _) = match tokio_tungstenite::connect_async(request).await {
            Ok(ok) => ok,
            Err(tungstenite::Error::Http(response)) => {
                return Err(ClientError::Rejected(response.status().as_u16()))
            }
            Err(e) => return Err(ClientError::Connect(e)),
        };
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (ack_tx, ack_rx) = oneshot::channel();

        let collector = Arc::new(EventCollector::default());
        let mut document = Document::new();
        let listener: Arc<dyn DocumentListener> = collector.clone();
        let weak: Weak<dyn DocumentListener> = Arc::downgrade(&listener);
        document.subscribe(weak);

        let shared = Arc::new(Shared {
            setter: SetterId::next(),
            document: tokio::sync::Mutex::new(document),
            collector,
            outgoing: out_tx,
            replies: Mutex::new(HashMap::new()),
            ack: Mutex::new(Some(ack_tx)),
            attached: Mutex::new(None),
            patch_hooks: Mutex::new(Vec::new()),
            received_patches: AtomicUsize::new(0),
            state: Mutex::new(ClientState::Connecting),
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if ws_tx.send(frame).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let mut receiver = Receiver::new();
            while let Some(frame) = ws_rx.next().await {
                let fragment = match frame {
                    Ok(WsMessage::Text(text)) => Fragment::Text(text.as_str().to_string()),
                    Ok(WsMessage::Binary(data)) => Fragment::Binary(data.to_vec()),
                    Ok(WsMessage::Close(frame)) => {
                        log::debug!("Server closed the connection: {frame:?}");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        log::debug!("Websocket read failed: {e}");
                        break;
                    }
                };
                match receiver.consume(fragment) {
                    Ok(Some(message)) => reader_shared.dispatch(message).await,
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("Protocol error from server: {e}");
                        break;
                    }
                }
            }
            reader_shared.shut();
        });

        let session = Self { shared, reader, writer };
        match tokio::time::timeout(REQUEST_TIMEOUT, ack_rx).await {
            Ok(Ok(())) => {
                *session.shared.state.lock() = ClientState::Connected;
                Ok(session)
            }
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::Timeout("ACK")),
        }
    }

    pub fn state(&self) -> ClientState {
        *self.shared.state.lock()
    }

    /// Setter stamped on changes applied from the server.
    pub fn setter(&self) -> SetterId {
        self.shared.setter
    }

    /// Send `message` and wait for the reply naming it.
    pub async fn request(&self, message: Message) -> Result<Message, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.shared.replies.lock().insert(message.msgid().to_string(), tx);
        if let Err(e) = self.shared.send(&message) {
            self.shared.replies.lock().remove(message.msgid());
            return Err(e);
        }
        let reply = match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(ClientError::Closed),
            Err(_) => {
                self.shared.replies.lock().remove(message.msgid());
                return Err(ClientError::Timeout("reply"));
            }
        };
        match reply.content {
            Content::Error { text } => Err(ClientError::Server(text)),
            _ => Ok(reply),
        }
    }

    /// Replace the local document with the server's.
    pub async fn pull(&self) -> Result<(), ClientError> {
        let reply = self.request(Message::pull_doc_req()).await?;
        let Content::PullDocReply(snapshot) = reply.content else {
            return Err(ClientError::UnexpectedReply(reply.header.msgtype));
        };
        let mut doc = self.shared.document.lock().await;
        {
            let mut attached = self.shared.attached.lock();
            match *attached {
                Some(id) if id != doc.id() => return Err(ClientError::AlreadyPushedDocument),
                _ => *attached = Some(doc.id()),
            }
        }
        doc.replace_with_snapshot(snapshot, Some(self.shared.setter))?;
        self.shared.collector.events.lock().clear();
        Ok(())
    }

    /// Replace the server's document with `document`. Only one document
    /// may ever be pushed through a session.
    pub async fn push(&self, document: &Document) -> Result<(), ClientError> {
        {
            let mut attached = self.shared.attached.lock();
            match *attached {
                Some(id) if id != document.id() => return Err(ClientError::AlreadyPushedDocument),
                _ => *attached = Some(document.id()),
            }
        }
        let snapshot = document.to_snapshot();
        let reply = self.request(Message::push_doc(snapshot.clone())).await?;
        if reply.msgtype() != MsgType::Ok {
            return Err(ClientError::UnexpectedReply(reply.msgtype()));
        }
        let mut doc = self.shared.document.lock().await;
        doc.replace_with_snapshot(snapshot, Some(self.shared.setter))?;
        self.shared.collector.events.lock().clear();
        Ok(())
    }

    /// Mutate the local document; resulting changes go to the server.
    pub async fn with_document<R>(&self, f: impl FnOnce(&mut Document) -> R) -> Result<R, ClientError> {
        let mut doc = self.shared.document.lock().await;
        let result = f(&mut *doc);
        self.shared.flush(&doc)?;
        Ok(result)
    }

    pub async fn snapshot(&self) -> DocumentSnapshot {
        self.shared.document.lock().await.to_snapshot()
    }

    /// Returns once every message sent before it has been handled.
    pub async fn force_roundtrip(&self) -> Result<(), ClientError> {
        self.request_server_info().await.map(|_| ())
    }

    pub async fn request_server_info(&self) -> Result<ServerInfo, ClientError> {
        let reply = self.request(Message::server_info_req()).await?;
        match reply.content {
            Content::ServerInfoReply(info) => Ok(info),
            other => Err(ClientError::UnexpectedReply(other.msgtype())),
        }
    }

    /// Observe every PATCH-DOC from the server before it is applied.
    pub fn on_patch_received<F>(&self, hook: F)
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.patch_hooks.lock().push(Arc::new(hook));
    }

    pub fn received_patch_count(&self) -> usize {
        self.shared.received_patches.load(Ordering::SeqCst)
    }

    /// Send a raw frame, bypassing message framing.
    pub fn send_raw(&self, frame: WsMessage) -> Result<(), ClientError> {
        self.shared.outgoing.send(frame).map_err(|_| ClientError::Closed)
    }

    /// Wait until the server closes the connection.
    pub async fn closed(&mut self) {
        let _ = (&mut self.reader).await;
    }

    pub async fn close(mut self) {
        let _ = self.shared.outgoing.send(WsMessage::Close(None));
        let _ = (&mut self.writer).await;
        self.shared.shut();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
