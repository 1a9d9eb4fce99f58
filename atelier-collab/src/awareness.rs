//! Ephemeral per-client awareness channel.
//!
//! Each transport connection owns one [`Awareness`] instance: the local
//! client's presence state plus the last-seen state of every remote client
//! in the same room. Awareness entries are not persisted — they vanish when
//! the owning connection disconnects.
//!
//! Remote payloads are validated at the boundary ([`PeerState::validate`])
//! before they are trusted by anything downstream; client version skew means
//! arbitrarily malformed states can arrive over the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::editor::ListenerHandle;

/// Identity and display metadata for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// Six hex digits, no leading `#`.
    pub color: String,
    pub email: String,
}

/// A cursor position in a text buffer (zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// Ephemeral state one client broadcasts to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub user: UserInfo,
    /// File the client currently has focused, if any.
    pub active_file: Option<String>,
    pub cursor: Option<CursorPosition>,
}

impl PeerState {
    /// Boundary validation: non-empty name and a six-hex-digit color.
    ///
    /// Email is allowed to be empty (anonymous clients); the presence
    /// renderer separately excludes the local user by email.
    pub fn validate(&self) -> Result<(), AwarenessError> {
        if self.user.name.trim().is_empty() {
            return Err(AwarenessError::InvalidName);
        }
        if !is_hex_color(&self.user.color) {
            return Err(AwarenessError::InvalidColor(self.user.color.clone()));
        }
        Ok(())
    }
}

/// Whether `s` is exactly six hex digits.
pub fn is_hex_color(s: &str) -> bool {
    s.len() == 6 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Validation errors for remote awareness payloads.
#[derive(Debug, Clone)]
pub enum AwarenessError {
    InvalidName,
    InvalidColor(String),
}

impl std::fmt::Display for AwarenessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidName => write!(f, "Peer state has an empty name"),
            Self::InvalidColor(c) => write!(f, "Peer state has an invalid color {c:?}"),
        }
    }
}

impl std::error::Error for AwarenessError {}

/// Change notification: which client ids were added, updated, removed.
#[derive(Debug, Clone, Default)]
pub struct AwarenessEvent {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

type ChangeCallback = Arc<dyn Fn(&AwarenessEvent) + Send + Sync>;

struct AwarenessInner {
    local: Option<PeerState>,
    remotes: HashMap<u64, PeerState>,
}

/// The awareness channel for one room.
pub struct Awareness {
    client_id: u64,
    inner: Mutex<AwarenessInner>,
    listeners: Arc<Mutex<HashMap<u64, ChangeCallback>>>,
    next_listener: AtomicU64,
}

impl Awareness {
    pub fn new(client_id: u64) -> Self {
        Self {
            client_id,
            inner: Mutex::new(AwarenessInner {
                local: None,
                remotes: HashMap::new(),
            }),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// The local client id (the CRDT client id of the owning replica).
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The local client's current state, if one was written.
    pub fn local_state(&self) -> Option<PeerState> {
        self.inner.lock().unwrap().local.clone()
    }

    /// Replace the local user identity, firing a change event.
    pub fn set_user(&self, user: UserInfo) {
        self.mutate_local(|state| state.user = user);
    }

    /// Record which file the local client is viewing.
    pub fn set_active_file(&self, file: Option<String>) {
        self.mutate_local(|state| state.active_file = file);
    }

    /// Record the local cursor position.
    pub fn set_cursor(&self, cursor: Option<CursorPosition>) {
        self.mutate_local(|state| state.cursor = cursor);
    }

    fn mutate_local(&self, f: impl FnOnce(&mut PeerState)) {
        let added;
        {
            let mut inner = self.inner.lock().unwrap();
            added = inner.local.is_none();
            let state = inner.local.get_or_insert_with(|| PeerState {
                user: UserInfo {
                    name: String::new(),
                    color: String::new(),
                    email: String::new(),
                },
                active_file: None,
                cursor: None,
            });
            f(state);
        }
        let mut event = AwarenessEvent::default();
        if added {
            event.added.push(self.client_id);
        } else {
            event.updated.push(self.client_id);
        }
        self.emit(&event);
    }

    /// Ingest a remote client's state from the wire.
    ///
    /// The local client id and invalid payloads are ignored; the latter are
    /// dropped with a warning rather than trusted downstream.
    pub fn apply_remote(&self, client_id: u64, state: PeerState) {
        if client_id == self.client_id {
            return;
        }
        if let Err(e) = state.validate() {
            log::warn!("dropping malformed awareness state from client {client_id}: {e}");
            return;
        }
        let added = {
            let mut inner = self.inner.lock().unwrap();
            inner.remotes.insert(client_id, state).is_none()
        };
        let mut event = AwarenessEvent::default();
        if added {
            event.added.push(client_id);
        } else {
            event.updated.push(client_id);
        }
        self.emit(&event);
    }

    /// Remove a departed remote client.
    pub fn remove_remote(&self, client_id: u64) {
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner.remotes.remove(&client_id).is_some()
        };
        if removed {
            self.emit(&AwarenessEvent {
                removed: vec![client_id],
                ..Default::default()
            });
        }
    }

    /// Drop all remote entries (connection lost or closed).
    pub fn clear_remotes(&self) {
        let removed: Vec<u64> = {
            let mut inner = self.inner.lock().unwrap();
            inner.remotes.drain().map(|(id, _)| id).collect()
        };
        if !removed.is_empty() {
            self.emit(&AwarenessEvent {
                removed,
                ..Default::default()
            });
        }
    }

    /// Snapshot of all current states, local included, keyed by client id.
    pub fn states(&self) -> HashMap<u64, PeerState> {
        let inner = self.inner.lock().unwrap();
        let mut states = inner.remotes.clone();
        if let Some(local) = &inner.local {
            states.insert(self.client_id, local.clone());
        }
        states
    }

    /// Number of known remote clients.
    pub fn remote_count(&self) -> usize {
        self.inner.lock().unwrap().remotes.len()
    }

    /// Register a change callback. Dropping the handle unregisters it.
    pub fn on_change(&self, cb: impl Fn(&AwarenessEvent) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().unwrap().insert(id, Arc::new(cb));
        let listeners = Arc::clone(&self.listeners);
        ListenerHandle::new(move || {
            listeners.lock().unwrap().remove(&id);
        })
    }

    fn emit(&self, event: &AwarenessEvent) {
        // Snapshot outside the listener map lock so a callback may register
        // or drop other listeners without deadlocking.
        let callbacks: Vec<ChangeCallback> =
            self.listeners.lock().unwrap().values().cloned().collect();
        for cb in callbacks {
            cb(event);
        }
    }
}
