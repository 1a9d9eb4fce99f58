//! WebSocket sync connection for one document room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, destroy)
//! - Update send/receive wired straight into the shared document
//! - Awareness broadcast for presence state
//! - Offline queue for edits made while disconnected
//!
//! One connection carries exactly one document's replication traffic; the
//! room name is derived from the (project, file) pair by the pool. The
//! state machine is `Disconnected -> Connecting -> Connected ->
//! Disconnected`, with a one-shot `synced` notification fired after the
//! initial full-state reconciliation. No timeouts are enforced here — a
//! stalled connection stays `Connecting`, and surfacing that is the
//! embedding UI's concern.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::awareness::{Awareness, UserInfo};
use crate::document::SharedDocument;
use crate::editor::ListenerHandle;
use crate::protocol::{MessageKind, SyncMessage};

/// Delay between receiving the initial sync and firing `synced` callbacks,
/// letting the applied update settle through observers first.
pub const SYNC_SETTLE: Duration = Duration::from_millis(50);

/// Maximum number of updates queued while disconnected.
const OFFLINE_QUEUE_MAX: usize = 10_000;

/// Outgoing channel depth before sends start dropping.
const OUTGOING_CAPACITY: usize = 256;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Offline queue for updates produced while disconnected.
///
/// Queued updates are replayed in order on the next successful connect.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns false when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    /// Drain all queued updates for replay.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|p| p.len()).sum()
    }
}

/// Snapshot of transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub bytes_sent: u64,
}

#[derive(Default)]
struct AtomicTransportStats {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    bytes_sent: AtomicU64,
}

impl AtomicTransportStats {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

type SyncedCallback = Box<dyn FnOnce(Arc<SharedDocument>) + Send>;

/// A persistent connection synchronizing one shared document with the
/// remote authority for its room.
pub struct TransportConnection {
    room: String,
    server_url: String,
    document: Arc<SharedDocument>,
    awareness: Arc<Awareness>,
    state: RwLock<ConnectionState>,
    /// Bumped on every connect/disconnect; tasks from an older generation
    /// stop touching shared state.
    generation: AtomicU64,
    synced: AtomicBool,
    destroyed: AtomicBool,
    synced_callbacks: Mutex<Vec<SyncedCallback>>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    offline: Mutex<OfflineQueue>,
    stats: AtomicTransportStats,
    /// Document/awareness subscriptions, dropped on destroy.
    hooks: Mutex<Vec<ListenerHandle>>,
}

impl TransportConnection {
    /// Create a connection for `room`, serving `document`.
    ///
    /// The local awareness identity is written immediately so a peer never
    /// observes a connected-but-unidentified client.
    pub fn new(
        server_url: &str,
        room: &str,
        document: Arc<SharedDocument>,
        user: UserInfo,
    ) -> Arc<Self> {
        let awareness = Arc::new(Awareness::new(document.client_id()));
        awareness.set_user(user);

        let connection = Arc::new(Self {
            room: room.to_string(),
            server_url: server_url.to_string(),
            document,
            awareness,
            state: RwLock::new(ConnectionState::Disconnected),
            generation: AtomicU64::new(0),
            synced: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            synced_callbacks: Mutex::new(Vec::new()),
            outgoing: Mutex::new(None),
            offline: Mutex::new(OfflineQueue::new(OFFLINE_QUEUE_MAX)),
            stats: AtomicTransportStats::default(),
            hooks: Mutex::new(Vec::new()),
        });
        connection.install_hooks();
        connection
    }

    fn install_hooks(self: &Arc<Self>) {
        let mut hooks = self.hooks.lock().unwrap();

        let weak = Arc::downgrade(self);
        hooks.push(self.document.on_local_update(move |update| {
            if let Some(connection) = weak.upgrade() {
                connection.send_or_queue_update(update.to_vec());
            }
        }));

        let weak: Weak<Self> = Arc::downgrade(self);
        let local_id = self.awareness.client_id();
        hooks.push(self.awareness.on_change(move |event| {
            let touches_local =
                event.added.contains(&local_id) || event.updated.contains(&local_id);
            if !touches_local {
                return;
            }
            if let Some(connection) = weak.upgrade() {
                connection.send_awareness_snapshot();
            }
        }));
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn document(&self) -> Arc<SharedDocument> {
        Arc::clone(&self.document)
    }

    pub fn awareness(&self) -> Arc<Awareness> {
        Arc::clone(&self.awareness)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }

    pub fn offline_queue_len(&self) -> usize {
        self.offline.lock().unwrap().len()
    }

    /// Register a one-shot callback fired (after a settle delay) once the
    /// initial sync with the remote authority completes. If the connection
    /// is already synced the callback fires on the next scheduler tick.
    pub fn on_synced(&self, cb: impl FnOnce(Arc<SharedDocument>) + Send + 'static) {
        if self.synced.load(Ordering::SeqCst) {
            let document = Arc::clone(&self.document);
            tokio::spawn(async move {
                cb(document);
            });
            return;
        }
        self.synced_callbacks.lock().unwrap().push(Box::new(cb));
    }

    /// Establish the WebSocket connection and spawn reader/writer tasks.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(TransportError::Destroyed);
        }
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        *self.state.write().unwrap() = ConnectionState::Connecting;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let url = format!("{}/{}", self.server_url, self.room);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    *self.state.write().unwrap() = ConnectionState::Disconnected;
                }
                return Err(TransportError::ConnectFailed(e.to_string()));
            }
        };

        // The pool may have destroyed or reconnected us while the handshake
        // was in flight; a stale attempt must not resurrect the connection.
        if self.destroyed.load(Ordering::SeqCst)
            || self.generation.load(Ordering::SeqCst) != generation
        {
            return Err(TransportError::Destroyed);
        }

        let (mut ws_writer, mut ws_reader) = futures_util::StreamExt::split(ws_stream);

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);
        *self.outgoing.lock().unwrap() = Some(out_tx);

        // Writer task: forward the outgoing channel to the socket. Ends when
        // the sender side is dropped (disconnect) or the socket errors.
        tokio::spawn(async move {
            use futures_util::SinkExt;
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.state.write().unwrap() = ConnectionState::Connected;

        // Identity first, then the sync handshake, then any queued edits.
        self.send_awareness_snapshot();
        self.send_message(SyncMessage::sync_request(
            self.awareness.client_id(),
            &self.room,
            self.document.state_vector(),
        ));
        let queued = self.offline.lock().unwrap().drain();
        if !queued.is_empty() {
            log::info!(
                "replaying {} queued updates for room {}",
                queued.len(),
                self.room
            );
            for payload in queued {
                self.send_message(SyncMessage::update(
                    self.awareness.client_id(),
                    &self.room,
                    payload,
                ));
            }
        }

        // Reader task: decode and ingest until the socket closes.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let Some(connection) = weak.upgrade() else {
                    return;
                };
                if connection.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match SyncMessage::decode(&bytes) {
                            Ok(message) => connection.process_incoming(message),
                            Err(e) => log::warn!("undecodable message on {}: {e}", connection.room),
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            if let Some(connection) = weak.upgrade() {
                if connection.generation.load(Ordering::SeqCst) == generation {
                    connection.finish_disconnect();
                }
            }
        });

        Ok(())
    }

    /// Ingest one protocol message. Single ingestion path — used by the
    /// reader task and directly by tests.
    pub fn process_incoming(&self, message: SyncMessage) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        match message.kind {
            MessageKind::SyncRequest => match message.payload() {
                Ok(remote_sv) => {
                    let diff = self.document.encode_state(&remote_sv);
                    self.send_message(SyncMessage::sync_response(
                        self.awareness.client_id(),
                        &self.room,
                        diff,
                    ));
                }
                Err(e) => log::warn!("bad sync request on {}: {e}", self.room),
            },
            MessageKind::SyncResponse => {
                match message.payload() {
                    Ok(update) => {
                        if let Err(e) = self.document.apply_remote_update(&update) {
                            log::warn!("failed to apply sync response on {}: {e}", self.room);
                        }
                    }
                    Err(e) => log::warn!("bad sync response on {}: {e}", self.room),
                }
                self.mark_synced();
            }
            MessageKind::Update => match message.payload() {
                Ok(update) => {
                    if let Err(e) = self.document.apply_remote_update(&update) {
                        log::warn!("failed to apply update on {}: {e}", self.room);
                    }
                }
                Err(e) => log::warn!("bad update on {}: {e}", self.room),
            },
            MessageKind::Awareness => match message.awareness_state() {
                Ok(Some(state)) => self.awareness.apply_remote(message.client_id, state),
                Ok(None) => self.awareness.remove_remote(message.client_id),
                Err(e) => log::warn!("bad awareness payload on {}: {e}", self.room),
            },
            MessageKind::Ping => {
                self.send_message(SyncMessage::pong(self.awareness.client_id(), &self.room));
            }
            MessageKind::Pong => {}
        }
    }

    fn mark_synced(&self) {
        if self.synced.swap(true, Ordering::SeqCst) {
            return;
        }
        let callbacks: Vec<SyncedCallback> =
            std::mem::take(&mut *self.synced_callbacks.lock().unwrap());
        if callbacks.is_empty() {
            return;
        }
        let document = Arc::clone(&self.document);
        tokio::spawn(async move {
            tokio::time::sleep(SYNC_SETTLE).await;
            for cb in callbacks {
                cb(Arc::clone(&document));
            }
        });
    }

    fn send_or_queue_update(&self, update: Vec<u8>) {
        if self.state() == ConnectionState::Connected {
            self.send_message(SyncMessage::update(
                self.awareness.client_id(),
                &self.room,
                update,
            ));
            return;
        }
        if !self.offline.lock().unwrap().enqueue(update) {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            log::warn!("offline queue full on {}, dropping update", self.room);
        }
    }

    fn send_awareness_snapshot(&self) {
        // Awareness is ephemeral — silently dropped while offline.
        if self.state() != ConnectionState::Connected {
            return;
        }
        let state = self.awareness.local_state();
        self.send_message(SyncMessage::awareness(
            self.awareness.client_id(),
            &self.room,
            state.as_ref(),
        ));
    }

    fn send_message(&self, message: SyncMessage) {
        let encoded = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("failed to encode message on {}: {e}", self.room);
                return;
            }
        };
        let sender = self.outgoing.lock().unwrap().clone();
        match sender {
            Some(tx) => match tx.try_send(encoded) {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_sent
                        .fetch_add(message.wire_payload_len() as u64, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                }
            },
            None => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn finish_disconnect(&self) {
        *self.state.write().unwrap() = ConnectionState::Disconnected;
        self.outgoing.lock().unwrap().take();
        self.awareness.clear_remotes();
    }

    /// Tear down the network link only. The connection object, its document
    /// and the local awareness state remain reusable for a later reconnect.
    pub fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.finish_disconnect();
    }

    /// Disconnect and render the connection permanently unusable.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.disconnect();
        self.hooks.lock().unwrap().clear();
        self.synced_callbacks.lock().unwrap().clear();
    }
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// `connect()` after `destroy()`.
    Destroyed,
    /// The WebSocket handshake failed.
    ConnectFailed(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destroyed => write!(f, "Connection was destroyed"),
            Self::ConnectFailed(e) => write!(f, "Connection failed: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::PeerState;

    fn test_user(name: &str) -> UserInfo {
        UserInfo {
            name: name.into(),
            color: "ff8800".into(),
            email: format!("{}@example.com", name.to_lowercase()),
        }
    }

    fn new_connection(room: &str) -> (Arc<SharedDocument>, Arc<TransportConnection>) {
        let document = SharedDocument::new("f1").unwrap();
        let connection = TransportConnection::new(
            "ws://127.0.0.1:1",
            room,
            Arc::clone(&document),
            test_user("Alice"),
        );
        (document, connection)
    }

    #[tokio::test]
    async fn test_initial_state() {
        let (_doc, connection) = new_connection("project-p1-f1");
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!connection.is_synced());
        assert_eq!(connection.offline_queue_len(), 0);
        // Identity was written before any connect.
        assert_eq!(connection.awareness().local_state().unwrap().user.name, "Alice");
    }

    #[tokio::test]
    async fn test_local_edits_queue_while_disconnected() {
        let (document, connection) = new_connection("project-p1-f1");

        document.set_text("hello");
        document.set_text("hello world");
        assert_eq!(connection.offline_queue_len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_returns_to_disconnected() {
        let (_doc, connection) = new_connection("project-p1-f1");
        let result = connection.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectFailed(_))));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_after_destroy_fails() {
        let (_doc, connection) = new_connection("project-p1-f1");
        connection.destroy();
        assert!(matches!(
            connection.connect().await,
            Err(TransportError::Destroyed)
        ));
    }

    #[tokio::test]
    async fn test_incoming_update_applies_to_document() {
        let (document, connection) = new_connection("project-p1-f1");

        let remote = SharedDocument::new("f1").unwrap();
        remote.set_text("from afar");

        connection.process_incoming(SyncMessage::update(
            99,
            "project-p1-f1",
            remote.encode_full_state(),
        ));
        assert_eq!(document.text(), "from afar");
    }

    #[tokio::test]
    async fn test_incoming_awareness_tracked_and_removed() {
        let (_doc, connection) = new_connection("project-p1-f1");
        let peer = PeerState {
            user: test_user("Bob"),
            active_file: Some("f1".into()),
            cursor: None,
        };

        connection.process_incoming(SyncMessage::awareness(99, "project-p1-f1", Some(&peer)));
        assert_eq!(connection.awareness().remote_count(), 1);

        connection.process_incoming(SyncMessage::awareness(99, "project-p1-f1", None));
        assert_eq!(connection.awareness().remote_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_response_fires_on_synced_after_settle() {
        let (_doc, connection) = new_connection("project-p1-f1");
        let fired = Arc::new(AtomicBool::new(false));

        let f = Arc::clone(&fired);
        connection.on_synced(move |document| {
            assert_eq!(document.text(), "authority");
            f.store(true, Ordering::SeqCst);
        });

        let remote = SharedDocument::new("f1").unwrap();
        remote.set_text("authority");
        connection.process_incoming(SyncMessage::sync_response(
            99,
            "project-p1-f1",
            remote.encode_full_state(),
        ));

        assert!(connection.is_synced());
        assert!(!fired.load(Ordering::SeqCst)); // settle delay still pending
        tokio::time::sleep(SYNC_SETTLE * 3).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_on_synced_after_sync_fires_immediately() {
        let (_doc, connection) = new_connection("project-p1-f1");
        connection.process_incoming(SyncMessage::sync_response(99, "project-p1-f1", Vec::new()));

        let fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&fired);
        connection.on_synced(move |_| {
            f.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_clears_remote_awareness() {
        let (_doc, connection) = new_connection("project-p1-f1");
        let peer = PeerState {
            user: test_user("Bob"),
            active_file: None,
            cursor: None,
        };
        connection.process_incoming(SyncMessage::awareness(99, "project-p1-f1", Some(&peer)));
        assert_eq!(connection.awareness().remote_count(), 1);

        connection.disconnect();
        assert_eq!(connection.awareness().remote_count(), 0);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        // Local identity survives a soft disconnect.
        assert!(connection.awareness().local_state().is_some());
    }

    #[test]
    fn test_offline_queue_basics() {
        let mut queue = OfflineQueue::new(3);
        assert!(queue.is_empty());
        assert!(queue.enqueue(vec![1, 2, 3]));
        assert!(queue.enqueue(vec![4]));
        assert_eq!(queue.total_bytes(), 4);
        assert!(queue.enqueue(vec![5]));
        assert!(!queue.enqueue(vec![6])); // full

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sync_request_answered_with_diff() {
        let (document, connection) = new_connection("project-p1-f1");
        document.set_text("local content");

        // No outgoing channel while disconnected: the reply is dropped and
        // counted, not panicked on.
        connection.process_incoming(SyncMessage::sync_request(99, "project-p1-f1", Vec::new()));
        assert_eq!(connection.stats().messages_dropped, 1);
    }
}
