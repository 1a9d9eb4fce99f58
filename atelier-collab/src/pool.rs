//! Bounded pool of (document, connection) pairs, one per file.
//!
//! The pool caps the number of live network connections no matter how many
//! files a user opens over a session, guarantees at most one connection per
//! file, and keeps soft-closed pairs allocated for fast reopen.
//!
//! ```text
//! get_file_document ──► hit?  ──► touch LRU, return existing pair
//!        │
//!        ▼ miss
//!  at capacity? ──► evict least-recently-used (destroy doc + connection)
//!        │
//!        ▼
//!  build document + connection, write awareness identity, spawn connect
//! ```
//!
//! Soft-closed entries leave LRU accounting (they no longer compete for
//! eviction) but their document and connection stay allocated. This trades
//! memory for reopen latency: typical usage reopens recently closed tabs
//! within the same session, and a retained document needs no network round
//! trip to show its content again. Retention is bounded separately by
//! `max_retained` so a long session visiting many files cannot grow without
//! limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Mutex;

use crate::awareness::UserInfo;
use crate::document::{DocumentError, SharedDocument};
use crate::transport::TransportConnection;

/// One-shot callback invoked after a pair's initial sync settles.
pub type OnSynced = Box<dyn FnOnce(Arc<SharedDocument>) + Send + 'static>;

/// A checked-out (document, connection) pair.
///
/// `needs_reconnect` is set when the checkout revived a soft-closed entry:
/// the pool does not auto-reconnect on a hit, the caller owns that.
pub struct PoolCheckout {
    pub document: Arc<SharedDocument>,
    pub connection: Arc<TransportConnection>,
    pub reused: bool,
    pub needs_reconnect: bool,
}

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum simultaneously connected entries.
    pub max_tabs: usize,
    /// Maximum soft-closed entries retained for reopen.
    pub max_retained: usize,
    /// Sync server base URL; the room name is appended per connection.
    pub server_url: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_tabs: 5,
            max_retained: 32,
            server_url: "ws://127.0.0.1:4010".to_string(),
        }
    }
}

impl PoolConfig {
    /// Config for tests: tiny limits, unroutable server.
    pub fn for_testing(max_tabs: usize, max_retained: usize) -> Self {
        Self {
            max_tabs,
            max_retained,
            server_url: "ws://127.0.0.1:1".to_string(),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct AtomicPoolStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

struct PoolEntry {
    document: Arc<SharedDocument>,
    connection: Arc<TransportConnection>,
    last_access: Instant,
    connected: bool,
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, PoolEntry>,
    /// Connected entries, least-recently-used first.
    lru: VecDeque<String>,
    /// Soft-closed entries, longest-closed first.
    soft_closed: VecDeque<String>,
}

/// The connection pool. One per project session; hard-closed on project
/// switch and page unload.
pub struct DocPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    stats: AtomicPoolStats,
}

impl DocPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(PoolState::default()),
            stats: AtomicPoolStats::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }

    /// Get or create the (document, connection) pair for `file_id`.
    ///
    /// A hit — including a soft-closed entry whose document was retained —
    /// is touched to most-recently-used and returned as-is; reconnecting a
    /// disconnected pair is the caller's responsibility. A miss evicts the
    /// least-recently-used connected entry when the pool is at capacity,
    /// then constructs the pair, writes `{user, active_file}` into local
    /// awareness before any handshake, and spawns the connection attempt.
    ///
    /// Eviction check and insertion happen inside one critical section, so
    /// a concurrent pool call can never invalidate the eviction decision.
    pub async fn get_file_document(
        &self,
        project_id: &str,
        file_id: &str,
        user: &UserInfo,
        on_synced: Option<OnSynced>,
    ) -> Result<PoolCheckout, PoolError> {
        if project_id.is_empty() || file_id.is_empty() {
            return Err(PoolError::InvalidKey);
        }

        let mut state = self.state.lock().await;

        let hit = if let Some(entry) = state.entries.get_mut(file_id) {
            entry.last_access = Instant::now();
            let was_connected = std::mem::replace(&mut entry.connected, true);
            Some((
                Arc::clone(&entry.document),
                Arc::clone(&entry.connection),
                was_connected,
            ))
        } else {
            None
        };

        if let Some((document, connection, was_connected)) = hit {
            if was_connected {
                state.lru.retain(|id| id != file_id);
            } else {
                state.soft_closed.retain(|id| id != file_id);
            }
            state.lru.push_back(file_id.to_string());
            if let Some(cb) = on_synced {
                connection.on_synced(cb);
            }
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(PoolCheckout {
                document,
                connection,
                reused: true,
                needs_reconnect: !was_connected,
            });
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        if state.lru.len() >= self.config.max_tabs {
            if let Some(victim) = state.lru.pop_front() {
                if let Some(entry) = state.entries.remove(&victim) {
                    entry.connection.destroy();
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "pool at capacity, evicted {victim} (idle {:?})",
                        entry.last_access.elapsed()
                    );
                }
            }
        }

        let document = SharedDocument::new(file_id).map_err(PoolError::Document)?;
        let room = format!("project-{project_id}-{file_id}");
        let connection = TransportConnection::new(
            &self.config.server_url,
            &room,
            Arc::clone(&document),
            user.clone(),
        );
        connection
            .awareness()
            .set_active_file(Some(file_id.to_string()));
        if let Some(cb) = on_synced {
            connection.on_synced(cb);
        }

        state.entries.insert(
            file_id.to_string(),
            PoolEntry {
                document: Arc::clone(&document),
                connection: Arc::clone(&connection),
                last_access: Instant::now(),
                connected: true,
            },
        );
        state.lru.push_back(file_id.to_string());
        drop(state);

        let task_connection = Arc::clone(&connection);
        tokio::spawn(async move {
            if let Err(e) = task_connection.connect().await {
                log::warn!("connect failed for {}: {e}", task_connection.room());
            }
        });

        Ok(PoolCheckout {
            document,
            connection,
            reused: false,
            needs_reconnect: false,
        })
    }

    /// Soft-close: tear down the network link only, keeping the document
    /// and connection allocated for a fast reopen. No-op for unknown ids.
    pub async fn close_file_document(&self, file_id: &str) {
        let mut state = self.state.lock().await;

        let closed = if let Some(entry) = state.entries.get_mut(file_id) {
            if entry.connected {
                entry.connected = false;
                entry.connection.disconnect();
                true
            } else {
                false
            }
        } else {
            false
        };
        if !closed {
            return;
        }

        state.lru.retain(|id| id != file_id);
        state.soft_closed.push_back(file_id.to_string());

        while state.soft_closed.len() > self.config.max_retained {
            if let Some(victim) = state.soft_closed.pop_front() {
                if let Some(entry) = state.entries.remove(&victim) {
                    entry.connection.destroy();
                    log::info!("retention cap reached, destroyed soft-closed {victim}");
                }
            }
        }
    }

    /// Hard-close everything: destroy every connection and document and
    /// clear the pool. Project switch / page unload path.
    pub async fn close_all_connections(&self) {
        let mut state = self.state.lock().await;
        for (_, entry) in state.entries.drain() {
            entry.connection.destroy();
        }
        state.lru.clear();
        state.soft_closed.clear();
    }

    /// Number of entries with an active connection.
    pub async fn connected_count(&self) -> usize {
        self.state.lock().await.lru.len()
    }

    /// Number of soft-closed entries retained for reopen.
    pub async fn retained_count(&self) -> usize {
        self.state.lock().await.soft_closed.len()
    }

    pub async fn contains(&self, file_id: &str) -> bool {
        self.state.lock().await.entries.contains_key(file_id)
    }

    pub async fn is_connected(&self, file_id: &str) -> bool {
        self.state
            .lock()
            .await
            .entries
            .get(file_id)
            .map(|e| e.connected)
            .unwrap_or(false)
    }

    /// The retained document for `file_id`, if any.
    pub async fn document(&self, file_id: &str) -> Option<Arc<SharedDocument>> {
        self.state
            .lock()
            .await
            .entries
            .get(file_id)
            .map(|e| Arc::clone(&e.document))
    }
}

/// Pool errors.
#[derive(Debug)]
pub enum PoolError {
    /// Empty project or file id.
    InvalidKey,
    /// Document construction failed.
    Document(DocumentError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "Project and file ids must be non-empty"),
            Self::Document(e) => write!(f, "Failed to construct document: {e}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<DocumentError> for PoolError {
    fn from(e: DocumentError) -> Self {
        Self::Document(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_user() -> UserInfo {
        UserInfo {
            name: "Alice".into(),
            color: "ff8800".into(),
            email: "alice@example.com".into(),
        }
    }

    async fn open(pool: &DocPool, file: &str) -> Arc<SharedDocument> {
        pool.get_file_document("p1", file, &test_user(), None)
            .await
            .unwrap()
            .document
    }

    #[tokio::test]
    async fn test_invalid_keys_rejected() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        assert!(matches!(
            pool.get_file_document("", "f1", &test_user(), None).await,
            Err(PoolError::InvalidKey)
        ));
        assert!(matches!(
            pool.get_file_document("p1", "", &test_user(), None).await,
            Err(PoolError::InvalidKey)
        ));
    }

    #[tokio::test]
    async fn test_connected_count_never_exceeds_max_tabs() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        for i in 0..9 {
            open(&pool, &format!("f{i}")).await;
            assert!(pool.connected_count().await <= 5);
        }
        assert_eq!(pool.connected_count().await, 5);
        assert_eq!(pool.stats().evictions, 4);
    }

    #[tokio::test]
    async fn test_lru_eviction_order() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        for file in ["a", "b", "c", "d", "e"] {
            open(&pool, file).await;
        }
        // Touch A so B becomes least-recently-used.
        open(&pool, "a").await;
        open(&pool, "f").await;

        assert!(!pool.contains("b").await);
        assert!(pool.contains("a").await);
        for file in ["c", "d", "e", "f"] {
            assert!(pool.contains(file).await, "{file} should survive");
        }
    }

    #[tokio::test]
    async fn test_soft_close_retains_document_and_content() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        let document = open(&pool, "f1").await;
        document.set_text("hello");

        pool.close_file_document("f1").await;
        assert!(!pool.is_connected("f1").await);
        assert!(pool.contains("f1").await);
        assert_eq!(pool.connected_count().await, 0);
        assert_eq!(pool.retained_count().await, 1);

        // Reopen: same instance, content intact, no network needed.
        let checkout = pool
            .get_file_document("p1", "f1", &test_user(), None)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&document, &checkout.document));
        assert_eq!(checkout.document.text(), "hello");
        assert!(checkout.reused);
        assert!(checkout.needs_reconnect); // reconnect is the caller's job
        assert_eq!(pool.retained_count().await, 0);
        assert_eq!(pool.connected_count().await, 1);
    }

    #[tokio::test]
    async fn test_soft_closed_entries_leave_lru_accounting() {
        let pool = DocPool::new(PoolConfig::for_testing(3, 8));
        for file in ["a", "b", "c"] {
            open(&pool, file).await;
        }
        pool.close_file_document("a").await;
        pool.close_file_document("b").await;
        assert_eq!(pool.connected_count().await, 1);

        // Two fresh opens fit without evicting anything.
        open(&pool, "d").await;
        open(&pool, "e").await;
        assert_eq!(pool.stats().evictions, 0);
        assert!(pool.contains("a").await);

        // The next open evicts the connected LRU entry (c), not a retained one.
        open(&pool, "f").await;
        assert!(!pool.contains("c").await);
        assert!(pool.contains("a").await);
        assert!(pool.contains("b").await);
    }

    #[tokio::test]
    async fn test_hard_close_destroys_everything() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        let before = open(&pool, "f1").await;
        before.set_text("state");

        pool.close_all_connections().await;
        assert_eq!(pool.connected_count().await, 0);
        assert!(!pool.contains("f1").await);

        let after = open(&pool, "f1").await;
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.text(), "");
    }

    #[tokio::test]
    async fn test_retention_cap_destroys_oldest_soft_closed() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 2));
        for file in ["a", "b", "c"] {
            open(&pool, file).await;
        }
        pool.close_file_document("a").await;
        pool.close_file_document("b").await;
        pool.close_file_document("c").await;

        // Cap is 2: "a" (longest soft-closed) was destroyed.
        assert_eq!(pool.retained_count().await, 2);
        assert!(!pool.contains("a").await);
        assert!(pool.contains("b").await);
        assert!(pool.contains("c").await);
    }

    #[tokio::test]
    async fn test_close_unknown_file_is_noop() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        pool.close_file_document("missing").await;
        assert_eq!(pool.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_double_soft_close_is_noop() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        open(&pool, "f1").await;
        pool.close_file_document("f1").await;
        pool.close_file_document("f1").await;
        assert_eq!(pool.retained_count().await, 1);
    }

    #[tokio::test]
    async fn test_awareness_identity_set_before_connect() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        let checkout = pool
            .get_file_document("p1", "f1", &test_user(), None)
            .await
            .unwrap();
        let connection = checkout.connection;
        assert!(!checkout.reused);
        let local = connection.awareness().local_state().unwrap();
        assert_eq!(local.user.name, "Alice");
        assert_eq!(local.active_file.as_deref(), Some("f1"));
        assert_eq!(connection.room(), "project-p1-f1");
    }

    #[tokio::test]
    async fn test_hit_and_miss_stats() {
        let pool = DocPool::new(PoolConfig::for_testing(5, 8));
        open(&pool, "f1").await;
        open(&pool, "f1").await;
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }
}
