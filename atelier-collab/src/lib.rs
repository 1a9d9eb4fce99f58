//! # atelier-collab — collaborative editing session layer for Atelier
//!
//! The session layer between a web IDE's editor widget and its CRDT sync
//! server: a bounded pool of per-file shared documents, a session registry
//! binding documents to editor tabs, an active-file reconciler, and a
//! presence renderer for remote cursors.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  set_active_file   ┌──────────────────┐
//! │ UI (tabs,    │ ─────────────────► │ EditorSession    │
//! │ one widget)  │                    │ Manager          │
//! └──────┬───────┘                    └────────┬─────────┘
//!        │ open/close                          │ attach/detach
//!        ▼                                     ▼
//! ┌──────────────┐   one per tab      ┌──────────────────┐
//! │ Session      │ ─────────────────► │ EditorBinding    │
//! │ Registry     │                    │ (doc ⇄ model)    │
//! └──────┬───────┘                    └──────────────────┘
//!        │ checkout (LRU, soft-close)
//!        ▼
//! ┌──────────────┐   one per file     ┌──────────────────┐
//! │ DocPool      │ ─────────────────► │ SharedDocument + │
//! │ (MAX_TABS)   │                    │ TransportConn    │──► sync server
//! └──────────────┘                    └────────┬─────────┘
//!                                              │ awareness
//!                                              ▼
//!                                     ┌──────────────────┐
//!                                     │ PresenceRenderer │──► style sink
//!                                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — binary wire protocol (bincode + LZ4 above 1 KiB)
//! - [`awareness`] — validated ephemeral per-client presence state
//! - [`document`] — per-file CRDT document plumbing over yrs
//! - [`transport`] — WebSocket connection with offline queue
//! - [`pool`] — bounded LRU pool of (document, connection) pairs
//! - [`editor`] — text models and the editor-widget seam
//! - [`binding`] — live two-way document/model sync
//! - [`session`] — one-session-per-open-file registry
//! - [`manager`] — active-file/widget reconciliation
//! - [`presence`] — remote-cursor stylesheet synthesis
//! - [`storage`] — durable per-(project, file) view state
//!
//! ## Lifecycle guarantees
//!
//! - At most `max_tabs` simultaneously connected transports, ever.
//! - Exactly one session and one text model per open file.
//! - Soft-closed documents keep their content for instant reopen; only a
//!   hard close (project switch, unload) destroys them.
//! - Presence never shows the local user or peers on other files.

pub mod awareness;
pub mod binding;
pub mod document;
pub mod editor;
pub mod manager;
pub mod pool;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use awareness::{Awareness, AwarenessEvent, CursorPosition, PeerState, UserInfo};
pub use binding::{BindingError, EditorBinding};
pub use document::{DocumentError, SharedDocument};
pub use editor::{
    language_for_path, EditorViewState, EditorWidget, HeadlessWidget, ListenerHandle,
    ModelRegistry, Selection, TextModel,
};
pub use manager::EditorSessionManager;
pub use pool::{DocPool, PoolCheckout, PoolConfig, PoolError, PoolStats};
pub use presence::{build_stylesheet, MemoryStyleSink, PresenceRenderer, StyleSink};
pub use protocol::{MessageKind, ProtocolError, SyncMessage};
pub use session::{SessionError, SessionMetadata, SessionRecord, SessionRegistry};
pub use storage::{StorageError, ViewState, ViewStateConfig, ViewStateStore};
pub use transport::{ConnectionState, OfflineQueue, TransportConnection, TransportError};
