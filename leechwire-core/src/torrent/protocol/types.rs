//! Core types and enumerations for BitTorrent wire protocol

use std::fmt;

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// BitTorrent peer identifier.
///
/// 20-byte identifier exchanged in handshakes and sent to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generates a peer ID with the given client prefix followed by random bytes.
    ///
    /// Prefixes longer than 20 bytes are truncated.
    pub fn generate(client_id: &str) -> Self {
        let mut id: [u8; 20] = rand::random();
        let prefix = &client_id.as_bytes()[..client_id.len().min(20)];
        id[..prefix.len()].copy_from_slice(prefix);
        Self(id)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0[..8]))?;
        f.write_str(&hex::encode(&self.0[8..]))
    }
}

/// BitTorrent wire protocol messages.
///
/// The closed set of BEP 3 messages this client speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Zero-length message that keeps an idle connection open
    KeepAlive,
    /// Sender will not serve requests
    Choke,
    /// Sender will serve requests again
    Unchoke,
    /// Sender wants pieces from the receiver
    Interested,
    /// Sender no longer wants pieces
    NotInterested,
    /// Sender completed a piece
    Have {
        /// Index of the completed piece
        piece_index: PieceIndex,
    },
    /// Complete piece availability of the sender
    Bitfield {
        /// Raw bitfield bytes, high bit of the first byte is piece 0
        bitfield: Bytes,
    },
    /// Ask for a block of a piece
    Request {
        /// Piece the block belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes requested
        length: u32,
    },
    /// Block of piece data
    Piece {
        /// Piece the block belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Block contents
        data: Bytes,
    },
    /// Withdraw an earlier request
    Cancel {
        /// Piece the block belongs to
        piece_index: PieceIndex,
        /// Byte offset within the piece
        offset: u32,
        /// Number of bytes that were requested
        length: u32,
    },
}

impl PeerMessage {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::KeepAlive => "keep-alive",
            PeerMessage::Choke => "choke",
            PeerMessage::Unchoke => "unchoke",
            PeerMessage::Interested => "interested",
            PeerMessage::NotInterested => "not-interested",
            PeerMessage::Have { .. } => "have",
            PeerMessage::Bitfield { .. } => "bitfield",
            PeerMessage::Request { .. } => "request",
            PeerMessage::Piece { .. } => "piece",
            PeerMessage::Cancel { .. } => "cancel",
        }
    }
}

/// Peer handshake frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerHandshake {
    /// Protocol identifier ("BitTorrent protocol")
    pub protocol: Bytes,
    /// Reserved extension bits, always zero on send
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Identifier of the sending peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: Bytes::from_static(super::handshake::PROTOCOL_NAME),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }
}

/// Peer session lifecycle.
///
/// `Connecting -> Handshaking -> Active -> Closed`; any failure moves
/// straight to `Closed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Dial or accept in progress
    #[default]
    Connecting,
    /// Exchanging handshake frames
    Handshaking,
    /// Exchanging wire messages
    Active,
    /// Connection closed
    Closed,
}
