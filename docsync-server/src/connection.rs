//! One websocket attached to a session.
//!
//! Architecture:
//! ```text
//!  socket ──► reader loop ──► Receiver ──► handle_message ──► Session (lock)
//!    ▲                                                            │
//!    └──── writer task ◄── mpsc<Outgoing> ◄── flush / replies ◄───┘
//!                ▲
//!          keep-alive pings
//! ```
//!
//! Any protocol error closes only this connection; other connections to the
//! session are unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use docsync_core::SetterId;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::context::ApplicationContext;
use crate::handler::RequestInfo;
use crate::protocol::{Content, Fragment, Message, ProtocolError};
use crate::receiver::Receiver;
use crate::session::{ServerSession, SessionError};

pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Used as the ping period when keep-alive is off; the tick is never polled.
const IDLE_PERIOD: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingHandshake,
    Open,
    Closed,
}

/// Work queued for the socket writer.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Fragments(Arc<Vec<Fragment>>),
    Ping(Vec<u8>),
    Close(u16, String),
}

/// Server side of one websocket.
#[derive(Debug)]
pub struct ServerConnection {
    id: SetterId,
    session_id: String,
    tx: mpsc::UnboundedSender<Outgoing>,
    state: Mutex<ConnectionState>,
    last_pong: Mutex<Instant>,
    pings_sent: AtomicU64,
}

impl ServerConnection {
    pub fn new(session_id: impl Into<String>, tx: mpsc::UnboundedSender<Outgoing>) -> Arc<Self> {
        Arc::new(Self {
            id: SetterId::next(),
            session_id: session_id.into(),
            tx,
            state: Mutex::new(ConnectionState::AwaitingHandshake),
            last_pong: Mutex::new(Instant::now()),
            pings_sent: AtomicU64::new(0),
        })
    }

    /// Setter id stamped on changes this connection makes.
    pub fn id(&self) -> SetterId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub(crate) fn open(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::AwaitingHandshake {
            *state = ConnectionState::Open;
        }
    }

    /// Queue frames. Returns false once the connection is closed.
    pub fn send(&self, frames: Arc<Vec<Fragment>>) -> bool {
        if self.state() == ConnectionState::Closed {
            return false;
        }
        self.tx.send(Outgoing::Fragments(frames)).is_ok()
    }

    pub fn send_message(&self, message: &Message) -> bool {
        match message.to_shared_fragments() {
            Ok(frames) => self.send(frames),
            Err(e) => {
                log::error!("Failed to encode {} message: {e}", message.msgtype());
                false
            }
        }
    }

    /// Close with `code`. Idempotent.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Closed {
            return;
        }
        *state = ConnectionState::Closed;
        let _ = self.tx.send(Outgoing::Close(code, reason.into()));
    }

    pub fn ping(&self) -> bool {
        let n = self.pings_sent.fetch_add(1, Ordering::Relaxed);
        self.tx.send(Outgoing::Ping(n.to_be_bytes().to_vec())).is_ok()
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock() = Instant::now();
    }

    pub fn pong_overdue(&self, timeout: Duration) -> bool {
        self.last_pong.lock().elapsed() > timeout
    }
}

/// Drive an upgraded websocket until either side closes it.
pub async fn serve(
    socket: WebSocket,
    app: Arc<ApplicationContext>,
    session_id: String,
    token: String,
    request: RequestInfo,
    config: Arc<ServerConfig>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let connection = ServerConnection::new(session_id.clone(), tx);

    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            let result = match out {
                Outgoing::Fragments(frames) => {
                    let mut result = Ok(());
                    for frame in frames.iter() {
                        let msg = match frame {
                            Fragment::Text(text) => WsMessage::Text(text.clone().into()),
                            Fragment::Binary(data) => WsMessage::Binary(data.clone().into()),
                        };
                        result = ws_tx.send(msg).await;
                        if result.is_err() {
                            break;
                        }
                    }
                    result
                }
                Outgoing::Ping(payload) => ws_tx.send(WsMessage::Ping(payload.into())).await,
                Outgoing::Close(code, reason) => {
                    let frame = CloseFrame {
                        code,
                        reason: reason.into(),
                    };
                    let _ = ws_tx.send(WsMessage::Close(Some(frame))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let session = match app
        .create_session_if_needed(&session_id, Some(request), Some(token))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            log::error!("Could not attach connection to session {session_id}: {e}");
            connection.close(CLOSE_INTERNAL_ERROR, "session unavailable");
            let _ = writer.await;
            return;
        }
    };

    connection.open();
    if let Err(e) = session.attach(&connection).await {
        log::warn!("Session {session_id} was discarded while connecting: {e}");
        connection.close(CLOSE_INTERNAL_ERROR, "session discarded");
        let _ = writer.await;
        return;
    }
    log::info!(
        "Connection {} opened for session {session_id} ({} attached)",
        connection.id(),
        session.connection_count()
    );

    let keep_alive = config.keep_alive();
    let period = keep_alive.unwrap_or(IDLE_PERIOD);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut receiver = Receiver::new();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let fragment = match frame {
                    Some(Ok(WsMessage::Text(text))) => Fragment::Text(text.to_string()),
                    Some(Ok(WsMessage::Binary(data))) => Fragment::Binary(data.to_vec()),
                    Some(Ok(WsMessage::Pong(_))) => {
                        connection.record_pong();
                        continue;
                    }
                    Some(Ok(WsMessage::Ping(_))) => continue,
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("Connection {} read error: {e}", connection.id());
                        break;
                    }
                };
                match receiver.consume(fragment) {
                    Ok(Some(message)) => {
                        if let Err(e) = handle_message(&session, &connection, message).await {
                            close_on_error(&connection, &e);
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        close_on_error(&connection, &SessionError::Protocol(e));
                        break;
                    }
                }
            }
            _ = ticker.tick(), if keep_alive.is_some() => {
                if connection.pong_overdue(config.keep_alive_timeout()) {
                    log::warn!("Connection {} missed keep-alive, closing", connection.id());
                    connection.close(CLOSE_GOING_AWAY, "keep-alive timeout");
                    break;
                }
                connection.ping();
            }
        }
    }

    connection.close(1000, "");
    session.unsubscribe(connection.id());
    log::info!(
        "Connection {} closed for session {session_id} ({} attached)",
        connection.id(),
        session.connection_count()
    );
    let _ = writer.await;
}

/// Handle one complete message and queue its reply.
pub(crate) async fn handle_message(
    session: &ServerSession,
    connection: &ServerConnection,
    message: Message,
) -> Result<(), SessionError> {
    let reqid = message.msgid().to_string();
    let reply = match &message.content {
        Content::PullDocReq => session.pull().await.map(|snap| Message::pull_doc_reply(&reqid, snap)),
        Content::PushDoc(snapshot) => session
            .push(snapshot.clone(), Some(connection.id()))
            .await
            .map(|()| Message::ok(&reqid)),
        Content::PatchDoc(_) => session
            .apply_message(&message, connection.id())
            .await
            .map(|()| Message::ok(&reqid)),
        Content::ServerInfoReq => Ok(Message::server_info_reply(&reqid)),
        _ => Err(ProtocolError::UnexpectedMessage(message.msgtype()).into()),
    };
    match reply {
        Ok(reply) => {
            connection.send_message(&reply);
            Ok(())
        }
        Err(e) => {
            connection.send_message(&Message::error(&reqid, e.to_string()));
            Err(e)
        }
    }
}

fn close_on_error(connection: &ServerConnection, error: &SessionError) {
    let code = match error {
        SessionError::Protocol(_) | SessionError::Document(_) => CLOSE_PROTOCOL_ERROR,
        _ => CLOSE_INTERNAL_ERROR,
    };
    log::warn!("Closing connection {} ({code}): {error}", connection.id());
    connection.close(code, error.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgType;
    use docsync_core::{Document, DocumentCallback, Model, Value};
    use serde_json::Map;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outgoing::Fragments(frames) = item {
                let mut receiver = Receiver::new();
                for frame in frames.iter() {
                    if let Some(msg) = receiver.consume(frame.clone()).unwrap() {
                        out.push(msg);
                    }
                }
            }
        }
        out
    }

    fn session() -> Arc<ServerSession> {
        let mut doc = Document::new();
        doc.add_root(Model::with_id("r", "Slider").with("value", 1i64), None).unwrap();
        ServerSession::new("S1", doc, RequestInfo::default(), None, Map::new())
    }

    #[tokio::test]
    async fn test_pull_reply_carries_reqid() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ServerConnection::new("S1", tx);
        let req = Message::pull_doc_req();
        handle_message(&session(), &conn, req.clone()).await.unwrap();
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msgtype(), MsgType::PullDocReply);
        assert_eq!(replies[0].reqid(), Some(req.msgid()));
    }

    #[tokio::test]
    async fn test_unexpected_message_gets_error_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ServerConnection::new("S1", tx);
        let err = handle_message(&session(), &conn, Message::ack()).await.unwrap_err();
        assert!(matches!(err, SessionError::Protocol(ProtocolError::UnexpectedMessage(MsgType::Ack))));
        let replies = drain(&mut rx);
        assert_eq!(replies[0].msgtype(), MsgType::Error);
    }

    #[tokio::test]
    async fn test_patch_not_echoed_to_origin() {
        let s = session();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let a = ServerConnection::new("S1", tx_a);
        let b = ServerConnection::new("S1", tx_b);
        s.subscribe(Arc::clone(&a));
        s.subscribe(Arc::clone(&b));

        let mut remote = Document::from_snapshot(s.pull().await.unwrap()).unwrap();
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Capture(std::sync::Arc<std::sync::Mutex<Vec<docsync_core::ChangeEvent>>>);
        impl docsync_core::DocumentListener for Capture {
            fn document_changed(&self, event: &docsync_core::ChangeEvent) {
                self.0.lock().unwrap().push(event.clone());
            }
        }
        let capture: Arc<dyn docsync_core::DocumentListener> = Arc::new(Capture(events.clone()));
        remote.subscribe(Arc::downgrade(&capture));
        remote.set_property(&"r".into(), "value", 57i64, None).unwrap();
        let event = events.lock().unwrap().pop().unwrap();
        let patch = crate::patch::encode_event(&remote, &event).unwrap();

        handle_message(&s, &a, patch).await.unwrap();
        let to_a = drain(&mut rx_a);
        let to_b = drain(&mut rx_b);
        assert_eq!(to_a.iter().map(Message::msgtype).collect::<Vec<_>>(), vec![MsgType::Ok]);
        assert_eq!(to_b.iter().map(Message::msgtype).collect::<Vec<_>>(), vec![MsgType::PatchDoc]);
    }

    #[tokio::test]
    async fn test_greeting_precedes_changes() {
        let s = session();
        s.with_document_locked(|doc| {
            doc.add_periodic_callback(
                DocumentCallback::plain(|doc| {
                    let next = match doc.get_property(&"r".into(), "value") {
                        Some(Value::Int(n)) => n + 1,
                        _ => 0,
                    };
                    doc.set_property(&"r".into(), "value", next, None).unwrap();
                }),
                Duration::from_millis(1),
            )
            .unwrap();
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ServerConnection::new("S1", tx);
        assert!(s.attach(&conn).await.unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let types: Vec<MsgType> = drain(&mut rx).iter().map(Message::msgtype).collect();
        assert_eq!(&types[..2], &[MsgType::Ack, MsgType::PushDoc]);
        assert!(types.len() > 2);
        assert!(types[2..].iter().all(|t| *t == MsgType::PatchDoc));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let second = ServerConnection::new("S1", tx);
        assert!(!s.attach(&second).await.unwrap());
        assert_eq!(drain(&mut rx).first().map(Message::msgtype), Some(MsgType::Ack));
        s.destroy().await;
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = ServerConnection::new("S1", tx);
        conn.open();
        assert_eq!(conn.state(), ConnectionState::Open);
        conn.close(CLOSE_PROTOCOL_ERROR, "bad");
        conn.close(CLOSE_INTERNAL_ERROR, "worse");
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(rx.try_recv(), Ok(Outgoing::Close(CLOSE_PROTOCOL_ERROR, _))));
        assert!(rx.try_recv().is_err());
        assert!(!conn.send(Arc::new(Vec::new())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_overdue() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = ServerConnection::new("S1", tx);
        assert!(!conn.pong_overdue(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(conn.pong_overdue(Duration::from_secs(5)));
        conn.record_pong();
        assert!(!conn.pong_overdue(Duration::from_secs(5)));
    }
}
