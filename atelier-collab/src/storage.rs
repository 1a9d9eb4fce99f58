//! Durable per-(project, file) editor view state.
//!
//! Where the user was in a file — cursor, selection, scroll offsets, opaque
//! widget-internal state — is persisted client-side so it survives reloads.
//! Records are bincode-encoded in a RocksDB column family, keyed
//! `"{project_id}/{file_id}"`. Save is last-write-wins; loading a missing
//! key is `Ok(None)`, not an error. Nothing here syncs across devices.

use std::path::PathBuf;
use std::time::SystemTime;

use rocksdb::{ColumnFamilyDescriptor, Options, WriteOptions, DB};
use serde::{Deserialize, Serialize};

use crate::editor::EditorViewState;

/// Column family holding view-state records.
const CF_VIEW_STATES: &str = "view_states";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct ViewStateConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Enable fsync on every write (default: false).
    pub sync_writes: bool,
}

impl Default for ViewStateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atelier_data/view_state"),
            sync_writes: false,
        }
    }
}

impl ViewStateConfig {
    /// Config for testing (temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
        }
    }
}

/// A persisted view-state record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub view: EditorViewState,
    /// Milliseconds since the Unix epoch at save time.
    pub last_updated: i64,
}

impl ViewState {
    fn encode(&self) -> Result<Vec<u8>, StorageError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StorageError::Deserialization(e.to_string()))?;
        Ok(state)
    }
}

/// RocksDB-backed view-state store.
pub struct ViewStateStore {
    db: DB,
    config: ViewStateConfig,
}

impl ViewStateStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: ViewStateConfig) -> Result<Self, StorageError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf = ColumnFamilyDescriptor::new(CF_VIEW_STATES, Options::default());
        let db = DB::open_cf_descriptors(&db_opts, &config.path, vec![cf])
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(Self { db, config })
    }

    fn key(project_id: &str, file_id: &str) -> String {
        format!("{project_id}/{file_id}")
    }

    /// Persist the view state for `(project_id, file_id)`, stamping the
    /// update time. Last write wins.
    pub fn save(
        &self,
        project_id: &str,
        file_id: &str,
        view: &EditorViewState,
    ) -> Result<(), StorageError> {
        let record = ViewState {
            view: view.clone(),
            last_updated: now_millis(),
        };
        let cf = self
            .db
            .cf_handle(CF_VIEW_STATES)
            .ok_or_else(|| StorageError::Database("missing column family".into()))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, Self::key(project_id, file_id), record.encode()?, &write_opts)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    /// Load the view state for `(project_id, file_id)`, if any was saved.
    pub fn load(
        &self,
        project_id: &str,
        file_id: &str,
    ) -> Result<Option<ViewState>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_VIEW_STATES)
            .ok_or_else(|| StorageError::Database("missing column family".into()))?;
        let bytes = self
            .db
            .get_cf(cf, Self::key(project_id, file_id))
            .map_err(|e| StorageError::Database(e.to_string()))?;
        match bytes {
            Some(bytes) => Ok(Some(ViewState::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete the view state for `(project_id, file_id)`.
    pub fn delete(&self, project_id: &str, file_id: &str) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(CF_VIEW_STATES)
            .ok_or_else(|| StorageError::Database("missing column family".into()))?;
        self.db
            .delete_cf(cf, Self::key(project_id, file_id))
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StorageError {
    Database(String),
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database(e) => write!(f, "Database error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for StorageError {}
