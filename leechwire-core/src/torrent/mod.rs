//! BitTorrent peer wire protocol, peer management and piece scheduling

pub mod bitset;
pub mod engine;
pub mod orchestrator;
pub mod parsing;
pub mod peer_manager;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod tracker;

use std::fmt;

pub use bitset::PieceBitset;
pub use engine::{DownloadContext, EngineHandle, EngineOutcome, start};
pub use orchestrator::{
    BlockRequest, DownloadProgress, PieceOrchestrator, ReceivedBlock, TickOutcome,
};
pub use parsing::{BencodeParser, TorrentMetadata};
pub use peer_manager::{PeerManager, PeerManagerHandle, PeerManagerStats};
pub use protocol::{HandshakeError, MessageCodec, PeerId, PeerMessage, PeerState};
pub use session::{PeerSession, SessionClosed, SessionContext};
pub use stats::{DropCounters, DropSnapshot};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, Announcer, HttpTrackerClient, TrackerClient,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the bencoded info dictionary. The protocol-level
/// identity of the torrent, checked during every handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Connection-level variants (`ProtocolViolation`, `Handshake`, `Timeout`,
/// `Io`) end the affected peer session only. `Storage` is fatal to the
/// download. `TrackerUnavailable` is retried on the next announce cycle.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    #[error("Tracker {url} unavailable: {reason}")]
    TrackerUnavailable { url: String, reason: String },

    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Returns true when the error only concerns one peer connection.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            TorrentError::ProtocolViolation { .. }
                | TorrentError::Handshake(_)
                | TorrentError::Timeout { .. }
                | TorrentError::Io(_)
        )
    }
}
