//! # docsync-server: Session synchronization over websockets
//!
//! Holds one document per browser session and keeps it in sync with the
//! connected clients by exchanging incremental patches.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐   bokeh, <token>   ┌──────────────────────────────────┐
//! │ ClientSession │ ◄────────────────► │ DocumentServer (axum)            │
//! │ local replica │   PATCH-DOC / ...  │  └─ ApplicationContext per path  │
//! └───────────────┘                    │      └─ ServerSession per id     │
//!                                      │          ├─ Document (locked)    │
//!                                      │          ├─ callback tasks       │
//!                                      │          └─ ServerConnection × N │
//!                                      └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: message types and websocket framing
//! - [`receiver`]: frame reassembly
//! - [`patch`]: change events ↔ PATCH-DOC messages
//! - [`token`]: session ids and signed session tokens
//! - [`callbacks`]: timer tasks behind scheduled callbacks
//! - [`session`]: per-session document lock and change fan-out
//! - [`handler`]: application hooks
//! - [`context`]: session registry, idle sweep, server context
//! - [`connection`]: one websocket attached to a session
//! - [`server`]: HTTP routes, handshake checks, maintenance tasks
//! - [`client`]: websocket client with a local document replica
//! - [`config`]: server configuration

pub mod protocol;
pub mod receiver;
pub mod patch;
pub mod token;
pub mod callbacks;
pub mod session;
pub mod handler;
pub mod context;
pub mod connection;
pub mod server;
pub mod client;
pub mod config;

// Re-exports for convenience
pub use protocol::{Content, Fragment, Message, MsgType, ProtocolError, ServerInfo};
pub use receiver::Receiver;
pub use patch::{encode_event, PatchDoc, PatchEvent};
pub use token::{AuthError, TokenSigner};
pub use callbacks::CallbackGroup;
pub use session::{LockedDocument, ServerSession, SessionError};
pub use handler::{FunctionHandler, Handler, HookResult, RequestInfo, SessionContext};
pub use context::{ApplicationContext, ServerContext};
pub use connection::{ConnectionState, ServerConnection};
pub use server::{DocumentServer, RequestError, ServerError};
pub use client::{ClientError, ClientSession, ClientState};
pub use config::{ConfigError, ServerConfig};
