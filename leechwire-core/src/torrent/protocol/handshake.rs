//! BitTorrent handshake exchange and validation

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::{PeerHandshake, PeerId};
use crate::torrent::InfoHash;

/// Protocol identifier sent in every handshake.
pub const PROTOCOL_NAME: &[u8] = b"BitTorrent protocol";

/// Size of a handshake frame carrying `PROTOCOL_NAME`.
pub const HANDSHAKE_LEN: usize = 49 + PROTOCOL_NAME.len();

const INFO_HASH_RANGE: std::ops::Range<usize> = 28..48;
const PEER_ID_RANGE: std::ops::Range<usize> = 48..68;

/// Reasons a handshake is rejected.
///
/// Checks run in declaration order; the first failing one is reported.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("protocol name length {actual}, expected {}", PROTOCOL_NAME.len())]
    ProtocolLength { actual: u8 },

    #[error("protocol name mismatch: {actual:?}")]
    ProtocolName { actual: String },

    #[error("info hash mismatch: expected {expected}, got {actual}")]
    InfoHashMismatch {
        expected: InfoHash,
        actual: InfoHash,
    },

    #[error("handshake timed out")]
    Timeout,

    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Serializes handshake frame following BEP 3
    pub fn serialize(handshake: &PeerHandshake) -> Bytes {
        let mut buf = BytesMut::with_capacity(49 + handshake.protocol.len());
        buf.put_u8(handshake.protocol.len() as u8);
        buf.extend_from_slice(&handshake.protocol);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(handshake.info_hash.as_bytes());
        buf.extend_from_slice(handshake.peer_id.as_bytes());
        buf.freeze()
    }

    /// Validates a received frame against the expected info hash.
    ///
    /// Returns the remote peer ID on success.
    ///
    /// # Errors
    /// - `HandshakeError::ProtocolLength` - First byte is not 19
    /// - `HandshakeError::ProtocolName` - Protocol string differs
    /// - `HandshakeError::InfoHashMismatch` - Info hash field differs
    pub fn validate(
        reply: &[u8; HANDSHAKE_LEN],
        expected: InfoHash,
    ) -> Result<PeerId, HandshakeError> {
        if reply[0] as usize != PROTOCOL_NAME.len() {
            return Err(HandshakeError::ProtocolLength { actual: reply[0] });
        }

        let name = &reply[1..1 + PROTOCOL_NAME.len()];
        if name != PROTOCOL_NAME {
            return Err(HandshakeError::ProtocolName {
                actual: String::from_utf8_lossy(name).into_owned(),
            });
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&reply[INFO_HASH_RANGE]);
        let actual = InfoHash::new(info_hash);
        if actual != expected {
            return Err(HandshakeError::InfoHashMismatch { expected, actual });
        }

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&reply[PEER_ID_RANGE]);
        Ok(PeerId::new(peer_id))
    }
}

/// Performs the handshake on a freshly opened connection.
///
/// Sends our frame, then reads exactly one frame back and validates it. The
/// whole exchange shares one deadline. On error the caller must close the
/// connection without sending any wire message.
///
/// # Errors
/// - `HandshakeError::Timeout` - Exchange did not finish within `timeout`
/// - `HandshakeError::Io` - Connection failed
/// - Validation failures from `HandshakeCodec::validate`
pub async fn handshake<S>(
    stream: &mut S,
    info_hash: InfoHash,
    peer_id: PeerId,
    timeout: Duration,
) -> Result<PeerId, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let exchange = async {
        let frame = HandshakeCodec::serialize(&PeerHandshake::new(info_hash, peer_id));
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut reply).await?;
        HandshakeCodec::validate(&reply, info_hash)
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HandshakeError::Timeout)?
}
