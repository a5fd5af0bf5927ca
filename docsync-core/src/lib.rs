//! # docsync-core: Document model and change tracking
//!
//! The synchronized object graph shared between a server session and its
//! clients. Pure data plus bookkeeping: no I/O and no async runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  set_property / stream / patch   ┌──────────────────┐
//! │ Document     │ ───────────────────────────────► │ ChangeEvent      │
//! │ roots, title │                                  │ (tagged union,   │
//! │ model table  │ ◄── apply (remote side) ──────── │  setter stamped) │
//! └──────┬───────┘                                  └────────┬─────────┘
//!        │ callback registry                                 │
//!        ▼                                                   ▼
//! ┌──────────────┐                                  ┌──────────────────┐
//! │ Scheduler    │  (lives in docsync-server)       │ DocumentListener │
//! └──────────────┘                                  └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`value`]: property values and model ids
//! - [`model`]: models (addressable nodes)
//! - [`events`]: change events, setters, column deltas, hold policies
//! - [`document`]: the document, reachability index and listeners
//! - [`columns`]: streaming and patching of tabular data sources
//! - [`callbacks`]: next-tick / timeout / periodic callback registry
//! - [`snapshot`]: whole-document JSON snapshots

pub mod value;
pub mod model;
pub mod events;
pub mod document;
pub mod columns;
pub mod callbacks;
pub mod snapshot;

// Re-exports for convenience
pub use value::{ModelId, ModelRef, Value};
pub use model::Model;
pub use events::{
    ChangeEvent, ColumnData, ColumnPatch, ColumnPatches, HoldPolicy, PatchIndex, SetterId,
    SliceSpec,
};
pub use document::{
    Document, DocumentError, DocumentId, DocumentListener, HandlerId, PropertyChange,
};
pub use columns::DATA_ATTR;
pub use callbacks::{
    BoxFuture, CallbackError, CallbackHandle, CallbackKind, DocumentCallback, SessionCallback,
};
pub use snapshot::DocumentSnapshot;
