//! Binary protocol for document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────────┬────────────┬──────────┐
//! │ kind     │ client_id │ room         │ compressed │ payload  │
//! │ 1 byte   │ 8 bytes   │ len-prefixed │ 1 byte     │ variable │
//! └──────────┴───────────┴──────────────┴────────────┴──────────┘
//! ```
//!
//! Payloads at or above [`COMPRESS_MIN_BYTES`] are LZ4-compressed; smaller
//! payloads are carried plain since the length-prefix overhead would inflate
//! them.

use serde::{Deserialize, Serialize};

use crate::awareness::PeerState;

/// Payloads at or above this size are LZ4-compressed on the wire.
pub const COMPRESS_MIN_BYTES: usize = 1024;

/// Message kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// State vector, requesting the updates the sender is missing
    SyncRequest = 1,
    /// Update set answering a `SyncRequest`
    SyncResponse = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Ephemeral per-client presence state
    Awareness = 4,
    /// Heartbeat ping
    Ping = 5,
    /// Heartbeat pong
    Pong = 6,
}

/// Top-level protocol message, routed by room name.
///
/// `client_id` is the sender's awareness client id (the CRDT client id of
/// the document replica that produced the message).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    pub client_id: u64,
    pub room: String,
    compressed: bool,
    payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload(kind: MessageKind, client_id: u64, room: &str, payload: Vec<u8>) -> Self {
        let (compressed, payload) = if payload.len() >= COMPRESS_MIN_BYTES {
            (true, lz4_flex::compress_prepend_size(&payload))
        } else {
            (false, payload)
        };
        Self {
            kind,
            client_id,
            room: room.to_string(),
            compressed,
            payload,
        }
    }

    /// Create a sync request carrying the sender's state vector.
    pub fn sync_request(client_id: u64, room: &str, state_vector: Vec<u8>) -> Self {
        Self::with_payload(MessageKind::SyncRequest, client_id, room, state_vector)
    }

    /// Create a sync response carrying the update set the peer was missing.
    pub fn sync_response(client_id: u64, room: &str, update: Vec<u8>) -> Self {
        Self::with_payload(MessageKind::SyncResponse, client_id, room, update)
    }

    /// Create an incremental update message.
    pub fn update(client_id: u64, room: &str, update: Vec<u8>) -> Self {
        Self::with_payload(MessageKind::Update, client_id, room, update)
    }

    /// Create an awareness message. `None` announces departure.
    pub fn awareness(client_id: u64, room: &str, state: Option<&PeerState>) -> Self {
        let payload = bincode::serde::encode_to_vec(&state, bincode::config::standard())
            .unwrap_or_default();
        Self::with_payload(MessageKind::Awareness, client_id, room, payload)
    }

    /// Create a heartbeat ping.
    pub fn ping(client_id: u64, room: &str) -> Self {
        Self::with_payload(MessageKind::Ping, client_id, room, Vec::new())
    }

    /// Create a heartbeat pong.
    pub fn pong(client_id: u64, room: &str) -> Self {
        Self::with_payload(MessageKind::Pong, client_id, room, Vec::new())
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// The decompressed payload bytes.
    pub fn payload(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.compressed {
            lz4_flex::decompress_size_prepended(&self.payload)
                .map_err(|e| ProtocolError::Compression(e.to_string()))
        } else {
            Ok(self.payload.clone())
        }
    }

    /// Whether the payload is carried LZ4-compressed.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Size of the payload as carried on the wire.
    pub fn wire_payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Parse an awareness payload. `Ok(None)` means the peer departed.
    pub fn awareness_state(&self) -> Result<Option<PeerState>, ProtocolError> {
        if self.kind != MessageKind::Awareness {
            return Err(ProtocolError::InvalidKind);
        }
        let bytes = self.payload()?;
        let (state, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(state)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    Compression(String),
    InvalidKind,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Compression(e) => write!(f, "Compression error: {e}"),
            Self::InvalidKind => write!(f, "Invalid message kind"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}
