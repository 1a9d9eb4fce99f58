//! Session registry: one session per open file tab.
//!
//! A session binds together everything a tab needs: the pooled shared
//! document and connection, the text model backing the editor, and (once a
//! widget attaches) the two-way binding. The registry enforces the
//! one-session-per-file invariant and serializes concurrent open attempts.
//!
//! Each file id moves through an explicit lifecycle:
//!
//! ```text
//! Idle ──► Opening ──► Open ──► Closing ──► Idle
//! ```
//!
//! Transitions that don't match are no-ops. The `Opening` mark is written
//! synchronously before the first await in [`SessionRegistry::open_session`],
//! which closes the window where two rapid opens of the same file could
//! race to create two text models. A close that arrives while the open is
//! still in flight cancels the open's token; the completing open then
//! inserts nothing and soft-closes the pool entry it acquired.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::awareness::UserInfo;
use crate::binding::EditorBinding;
use crate::document::SharedDocument;
use crate::editor::{language_for_path, EditorWidget, ModelRegistry, TextModel};
use crate::pool::{DocPool, OnSynced, PoolError};
use crate::transport::TransportConnection;

/// What the UI knows about a file it wants opened.
#[derive(Debug, Clone)]
pub struct SessionMetadata {
    pub id: String,
    pub filepath: String,
}

/// One open tab's session.
#[derive(Clone)]
pub struct SessionRecord {
    pub file_id: String,
    pub file_path: String,
    pub document: Arc<SharedDocument>,
    pub connection: Arc<TransportConnection>,
    pub model: Arc<TextModel>,
    pub binding: Option<Arc<EditorBinding>>,
}

/// Per-file lifecycle phase. Absent means idle.
enum Phase {
    Opening { token: Uuid, cancelled: bool },
    Open,
    Closing,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, SessionRecord>,
    phases: HashMap<String, Phase>,
}

/// The session registry. One per project session, sharing the pool and the
/// widget host's model registry.
pub struct SessionRegistry {
    pool: Arc<DocPool>,
    models: Arc<ModelRegistry>,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(pool: Arc<DocPool>, models: Arc<ModelRegistry>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            models,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn pool(&self) -> Arc<DocPool> {
        Arc::clone(&self.pool)
    }

    pub fn models(&self) -> Arc<ModelRegistry> {
        Arc::clone(&self.models)
    }

    /// Open a session for `metadata`.
    ///
    /// No-op when a session already exists or an open is in flight for the
    /// same file. Document retrieval failures propagate after clearing the
    /// in-flight mark, so the caller can retry.
    pub async fn open_session(
        &self,
        project_id: &str,
        metadata: &SessionMetadata,
        user: &UserInfo,
    ) -> Result<(), SessionError> {
        if metadata.id.is_empty() || metadata.filepath.is_empty() {
            return Err(SessionError::InvalidMetadata);
        }
        let file_id = metadata.id.clone();

        // Synchronous mark, before any suspension point.
        let token = match self.begin_open(&file_id) {
            Some(token) => token,
            None => return Ok(()),
        };

        // Once the authority's content is reconciled, the model is forced to
        // the converged text — the editor never keeps a stale pre-sync
        // snapshot.
        let models = Arc::clone(&self.models);
        let synced_file = file_id.clone();
        let on_synced: OnSynced = Box::new(move |document| {
            if let Some(model) = models.get(&synced_file) {
                let text = document.text();
                if model.get_value() != text {
                    log::trace!("post-sync overwrite of model {synced_file}");
                    model.set_value(&text);
                }
            }
        });

        let checkout = match self
            .pool
            .get_file_document(project_id, &file_id, user, Some(on_synced))
            .await
        {
            Ok(checkout) => checkout,
            Err(e) => {
                self.abort_open(&file_id, token);
                return Err(SessionError::Pool(e));
            }
        };

        // The pool never auto-reconnects a revived soft-closed pair; that
        // responsibility lands here.
        if checkout.needs_reconnect {
            let connection = Arc::clone(&checkout.connection);
            tokio::spawn(async move {
                if let Err(e) = connection.connect().await {
                    log::warn!("reconnect failed for {}: {e}", connection.room());
                }
            });
        }

        // Reuse the registry's live model (force-synced: the remote document
        // may have changed while the tab was closed) or seed a fresh one.
        let model = self.models.get_or_create(
            &file_id,
            &checkout.document.text(),
            language_for_path(&metadata.filepath),
        );
        let text = checkout.document.text();
        if model.get_value() != text {
            model.set_value(&text);
        }

        let record = SessionRecord {
            file_id: file_id.clone(),
            file_path: metadata.filepath.clone(),
            document: checkout.document,
            connection: checkout.connection,
            model,
            binding: None,
        };

        if !self.complete_open(record, token) {
            // Cancelled while in flight: leave nothing behind.
            log::trace!("open of {file_id} was cancelled, rolling back");
            self.models.remove(&file_id);
            self.pool.close_file_document(&file_id).await;
        }
        Ok(())
    }

    /// Transition `file_id` to `Opening` if it is idle. Returns the open
    /// attempt's token, or `None` when the open must no-op.
    fn begin_open(&self, file_id: &str) -> Option<Uuid> {
        let mut state = self.state.lock().unwrap();
        if state.phases.contains_key(file_id) {
            return None;
        }
        let token = Uuid::new_v4();
        state.phases.insert(
            file_id.to_string(),
            Phase::Opening {
                token,
                cancelled: false,
            },
        );
        Some(token)
    }

    /// Clear a failed open attempt's mark.
    fn abort_open(&self, file_id: &str, token: Uuid) {
        let mut state = self.state.lock().unwrap();
        if matches!(
            state.phases.get(file_id),
            Some(Phase::Opening { token: t, .. }) if *t == token
        ) {
            state.phases.remove(file_id);
        }
    }

    /// Land a completed open. Returns false when the attempt was cancelled
    /// (or superseded), in which case nothing was inserted.
    fn complete_open(&self, record: SessionRecord, token: Uuid) -> bool {
        let mut state = self.state.lock().unwrap();
        let file_id = record.file_id.clone();
        let cancelled = match state.phases.get(&file_id) {
            Some(Phase::Opening {
                token: t,
                cancelled,
            }) if *t == token => *cancelled,
            _ => return false,
        };
        if cancelled {
            state.phases.remove(&file_id);
            false
        } else {
            state.sessions.insert(file_id.clone(), record);
            state.phases.insert(file_id, Phase::Open);
            true
        }
    }

    /// Close the session for `file_id`.
    ///
    /// Destroys the binding, disposes the model and soft-closes the pool
    /// entry — the shared document survives for a fast reopen. Closing a
    /// file whose open is still in flight cancels that open instead.
    pub async fn close_session(&self, file_id: &str) {
        let record = {
            let mut state = self.state.lock().unwrap();
            let closing = match state.phases.get_mut(file_id) {
                Some(Phase::Opening { cancelled, .. }) => {
                    // The in-flight open observes the cancellation and rolls
                    // itself back; nothing to tear down yet.
                    *cancelled = true;
                    log::trace!("close of {file_id} cancelled an in-flight open");
                    return;
                }
                Some(Phase::Open) => true,
                Some(Phase::Closing) | None => false,
            };
            if !closing {
                return;
            }
            state.phases.insert(file_id.to_string(), Phase::Closing);
            state.sessions.remove(file_id)
        };

        if let Some(record) = &record {
            if let Some(binding) = &record.binding {
                binding.destroy();
            }
        }
        self.models.remove(file_id);
        self.pool.close_file_document(file_id).await;
        self.state.lock().unwrap().phases.remove(file_id);
    }

    /// Attach a widget to the session for `file_id`, constructing the
    /// binding lazily on first attach. No-op when no session exists.
    ///
    /// Binding construction failures are recovered locally: the session
    /// stays usable without a binding and the next attach retries.
    pub fn connect_editor_to_session(&self, file_id: &str, widget: Arc<dyn EditorWidget>) {
        let parts = {
            let state = self.state.lock().unwrap();
            match state.sessions.get(file_id) {
                Some(record) => (
                    Arc::clone(&record.document),
                    Arc::clone(&record.model),
                    record.connection.awareness(),
                    record.binding.clone(),
                ),
                None => return,
            }
        };
        let (document, model, awareness, existing) = parts;

        if let Some(binding) = existing {
            binding.add_editor(widget);
            return;
        }

        match EditorBinding::new(document, model, vec![Arc::clone(&widget)], awareness) {
            Ok(binding) => {
                let mut state = self.state.lock().unwrap();
                if let Some(record) = state.sessions.get_mut(file_id) {
                    match &record.binding {
                        // Another attach landed first: keep that binding and
                        // fold our widget into it.
                        Some(existing) => {
                            binding.destroy();
                            existing.add_editor(widget);
                        }
                        None => record.binding = Some(binding),
                    }
                } else {
                    binding.destroy();
                }
            }
            Err(e) => {
                log::warn!("binding construction for {file_id} failed: {e}");
            }
        }
    }

    /// Detach a widget from the session's binding. The binding survives an
    /// empty widget set; only [`close_session`](Self::close_session)
    /// destroys it.
    pub fn disconnect_editor_from_session(&self, file_id: &str, widget_id: Uuid) {
        let binding = {
            let state = self.state.lock().unwrap();
            state
                .sessions
                .get(file_id)
                .and_then(|record| record.binding.clone())
        };
        if let Some(binding) = binding {
            binding.remove_editor(widget_id);
        }
    }

    /// Read-only view of the session for `file_id`.
    pub fn session(&self, file_id: &str) -> Option<SessionRecord> {
        self.state.lock().unwrap().sessions.get(file_id).cloned()
    }

    pub fn has_session(&self, file_id: &str) -> bool {
        self.state.lock().unwrap().sessions.contains_key(file_id)
    }

    /// Currently open file ids.
    pub fn open_files(&self) -> Vec<String> {
        self.state.lock().unwrap().sessions.keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    /// Whether an open is currently in flight for `file_id`.
    pub fn is_opening(&self, file_id: &str) -> bool {
        matches!(
            self.state.lock().unwrap().phases.get(file_id),
            Some(Phase::Opening { .. })
        )
    }
}

/// Session registry errors.
#[derive(Debug)]
pub enum SessionError {
    /// Empty file id or path in the open request.
    InvalidMetadata,
    /// Document retrieval failed; the in-flight mark was cleared.
    Pool(PoolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMetadata => write!(f, "Session metadata needs an id and a path"),
            Self::Pool(e) => write!(f, "Document retrieval failed: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<PoolError> for SessionError {
    fn from(e: PoolError) -> Self {
        Self::Pool(e)
    }
}
