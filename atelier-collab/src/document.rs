//! Shared CRDT document for one file.
//!
//! [`SharedDocument`] wraps a yrs [`Doc`] and its `"content"` text. The CRDT
//! itself is a consumed primitive — this module only provides the plumbing
//! the session layer needs: minimal-diff writes (so concurrent edits merge
//! instead of clobbering), update encode/apply for the transport, and
//! observer hooks that distinguish local edits from applied remote updates.
//!
//! Local/remote separation uses an `applying_remote` flag: the yrs update
//! observer is suppressed while a remote update is being applied, so local
//! subscribers (the transport's broadcast path) never echo a remote update
//! back to the server. Remote subscribers (the editor binding) are invoked
//! directly from [`SharedDocument::apply_remote_update`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::editor::ListenerHandle;

/// Name of the text shared type holding the file contents.
const CONTENT_TEXT_NAME: &str = "content";

type UpdateCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One file's replicated text content.
///
/// Identity equals the file id and is stable across reopen; the instance is
/// exclusively owned by its connection-pool entry and never duplicated.
pub struct SharedDocument {
    file_id: String,
    doc: Doc,
    text: TextRef,
    applying_remote: Arc<AtomicBool>,
    remote_subs: Arc<Mutex<HashMap<u64, UpdateCallback>>>,
    local_subs: Arc<Mutex<HashMap<u64, UpdateCallback>>>,
    next_sub: AtomicU64,
    /// Keeps the yrs update observer alive for the document's lifetime.
    _update_subscription: yrs::Subscription,
}

impl SharedDocument {
    pub fn new(file_id: &str) -> Result<Arc<Self>, DocumentError> {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_TEXT_NAME);

        let applying_remote = Arc::new(AtomicBool::new(false));
        let local_subs: Arc<Mutex<HashMap<u64, UpdateCallback>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let flag = Arc::clone(&applying_remote);
        let subs = Arc::clone(&local_subs);
        let subscription = doc
            .observe_update_v1(move |_txn, event| {
                if flag.load(Ordering::SeqCst) {
                    return;
                }
                let callbacks: Vec<UpdateCallback> = subs.lock().unwrap().values().cloned().collect();
                for cb in callbacks {
                    cb(&event.update);
                }
            })
            .map_err(|e| DocumentError::Observe(e.to_string()))?;

        Ok(Arc::new(Self {
            file_id: file_id.to_string(),
            doc,
            text,
            applying_remote,
            remote_subs: Arc::new(Mutex::new(HashMap::new())),
            local_subs,
            next_sub: AtomicU64::new(0),
            _update_subscription: subscription,
        }))
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    /// The CRDT client id of this replica.
    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Replace the content with `content`, applying a minimal diff.
    ///
    /// A common-prefix/suffix diff keeps the untouched regions' CRDT ids
    /// intact so concurrent remote edits still merge. Returns whether the
    /// content changed.
    pub fn set_text(&self, content: &str) -> bool {
        let current = self.text();
        if current == content {
            return false;
        }

        let prefix = common_prefix_bytes(&current, content);
        let suffix = common_suffix_bytes(&current[prefix..], &content[prefix..]);
        let delete_len = current.len() - prefix - suffix;
        let insert = &content[prefix..content.len() - suffix];

        let mut txn = self.doc.transact_mut();
        if delete_len > 0 {
            self.text
                .remove_range(&mut txn, prefix as u32, delete_len as u32);
        }
        if !insert.is_empty() {
            self.text.insert(&mut txn, prefix as u32, insert);
        }
        true
    }

    /// Insert `chunk` at byte offset `index`.
    pub fn insert(&self, index: u32, chunk: &str) {
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, index, chunk);
    }

    /// Remove `len` bytes starting at byte offset `index`.
    pub fn remove(&self, index: u32, len: u32) {
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, index, len);
    }

    /// This replica's state vector, encoded.
    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Encode the updates a peer at `remote_state_vector` is missing.
    ///
    /// An unparseable remote state vector falls back to the full state.
    pub fn encode_state(&self, remote_state_vector: &[u8]) -> Vec<u8> {
        let sv = StateVector::decode_v1(remote_state_vector).unwrap_or_default();
        self.doc.transact().encode_state_as_update_v1(&sv)
    }

    /// Full document state as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    /// Apply an update received from the remote authority.
    ///
    /// Local-update subscribers are suppressed for the duration (no echo);
    /// remote-update subscribers fire after a successful apply.
    pub fn apply_remote_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| DocumentError::Decode(e.to_string()))?;

        self.applying_remote.store(true, Ordering::SeqCst);
        let result = {
            let mut txn = self.doc.transact_mut();
            txn.apply_update(decoded)
        };
        self.applying_remote.store(false, Ordering::SeqCst);
        result.map_err(|e| DocumentError::Apply(e.to_string()))?;

        let callbacks: Vec<UpdateCallback> =
            self.remote_subs.lock().unwrap().values().cloned().collect();
        for cb in callbacks {
            cb(update);
        }
        Ok(())
    }

    /// Subscribe to updates produced by local edits (transport broadcast path).
    pub fn on_local_update(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.local_subs.lock().unwrap().insert(id, Arc::new(cb));
        let subs = Arc::clone(&self.local_subs);
        ListenerHandle::new(move || {
            subs.lock().unwrap().remove(&id);
        })
    }

    /// Subscribe to successfully applied remote updates (binding path).
    pub fn on_remote_update(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        self.remote_subs.lock().unwrap().insert(id, Arc::new(cb));
        let subs = Arc::clone(&self.remote_subs);
        ListenerHandle::new(move || {
            subs.lock().unwrap().remove(&id);
        })
    }
}

/// Byte length of the common prefix of `a` and `b`, at a char boundary.
fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

/// Byte length of the common suffix of `a` and `b`, at a char boundary.
fn common_suffix_bytes(a: &str, b: &str) -> usize {
    let mut len = 0;
    for (ca, cb) in a.chars().rev().zip(b.chars().rev()) {
        if ca != cb {
            break;
        }
        len += ca.len_utf8();
    }
    len
}

/// Document plumbing errors.
#[derive(Debug, Clone)]
pub enum DocumentError {
    Decode(String),
    Apply(String),
    Observe(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "Failed to decode update: {e}"),
            Self::Apply(e) => write!(f, "Failed to apply update: {e}"),
            Self::Observe(e) => write!(f, "Failed to observe document: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}
