//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::types::PeerMessage;
use crate::torrent::{PieceIndex, TorrentError};

/// Largest frame body we accept. Covers a 16 KiB block with generous room for
/// bitfields of very large torrents.
pub const MAX_MESSAGE_LENGTH: u32 = 1 << 21;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3, length prefix included.
    pub fn encode(message: &PeerMessage) -> Bytes {
        let mut buf = BytesMut::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0);
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(ID_CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(ID_UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(ID_INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(ID_NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // 1 + 4
                buf.put_u8(ID_HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(ID_BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // 1 + 4 + 4 + 4
                buf.put_u8(ID_REQUEST);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // 1 + 4 + 4 + block
                buf.put_u8(ID_PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(ID_CANCEL);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
        }

        buf.freeze()
    }

    /// Deserializes one complete frame, length prefix included.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Buffer size disagrees with the
    ///   declared length, unknown message ID, or payload size wrong for the ID
    pub fn decode(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(violation("frame shorter than length prefix"));
        }

        let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let body = &data[4..];
        if body.len() != length {
            return Err(violation(format!(
                "declared length {length} but frame carries {} bytes",
                body.len()
            )));
        }

        Self::decode_body(Bytes::copy_from_slice(body))
    }

    /// Interprets a frame body (everything after the length prefix).
    ///
    /// An empty body is a keep-alive.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Unknown ID or payload size mismatch
    pub fn decode_body(mut body: Bytes) -> Result<PeerMessage, TorrentError> {
        if body.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = body.get_u8();
        let payload_len = body.len();

        let expect = |expected: usize, name: &str| {
            if payload_len == expected {
                Ok(())
            } else {
                Err(violation(format!(
                    "{name} payload must be {expected} bytes, got {payload_len}"
                )))
            }
        };

        match message_id {
            ID_CHOKE => expect(0, "choke").map(|()| PeerMessage::Choke),
            ID_UNCHOKE => expect(0, "unchoke").map(|()| PeerMessage::Unchoke),
            ID_INTERESTED => expect(0, "interested").map(|()| PeerMessage::Interested),
            ID_NOT_INTERESTED => expect(0, "not-interested").map(|()| PeerMessage::NotInterested),
            ID_HAVE => {
                expect(4, "have")?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(body.get_u32()),
                })
            }
            ID_BITFIELD => Ok(PeerMessage::Bitfield { bitfield: body }),
            ID_REQUEST | ID_CANCEL => {
                expect(12, if message_id == ID_REQUEST { "request" } else { "cancel" })?;
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                let length = body.get_u32();
                if message_id == ID_REQUEST {
                    Ok(PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    })
                } else {
                    Ok(PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    })
                }
            }
            ID_PIECE => {
                if payload_len < 8 {
                    return Err(violation(format!(
                        "piece payload must be at least 8 bytes, got {payload_len}"
                    )));
                }
                let piece_index = PieceIndex::new(body.get_u32());
                let offset = body.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: body,
                })
            }
            _ => Err(violation(format!("unknown message ID: {message_id}"))),
        }
    }
}

/// Reads exactly one length-prefixed message.
///
/// Consumes the full advertised length before interpreting it, so a
/// malformed payload never desynchronizes the stream position.
///
/// # Errors
/// - `TorrentError::Io` - Stream closed or read failed
/// - `TorrentError::ProtocolViolation` - Oversized or malformed frame
pub async fn read_message<R>(reader: &mut R) -> Result<PeerMessage, TorrentError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await?;
    if length > MAX_MESSAGE_LENGTH {
        return Err(violation(format!(
            "frame length {length} exceeds limit {MAX_MESSAGE_LENGTH}"
        )));
    }

    let mut body = BytesMut::zeroed(length as usize);
    reader.read_exact(&mut body).await?;

    MessageCodec::decode_body(body.freeze())
}

/// Writes one message and flushes it.
///
/// # Errors
/// - `TorrentError::Io` - Write failed
pub async fn write_message<W>(writer: &mut W, message: &PeerMessage) -> Result<(), TorrentError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&MessageCodec::encode(message)).await?;
    writer.flush().await?;
    Ok(())
}

fn violation(message: impl Into<String>) -> TorrentError {
    TorrentError::ProtocolViolation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_have_encoding() {
        let message = PeerMessage::Have {
            piece_index: PieceIndex::new(123_456),
        };
        assert_eq!(
            MessageCodec::encode(&message).as_ref(),
            &[0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x01, 0xE2, 0x40]
        );
    }

    #[test]
    fn test_piece_encoding() {
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(1),
            offset: 2,
            data: Bytes::from_static(&[3, 4, 5]),
        };
        assert_eq!(
            MessageCodec::encode(&message).as_ref(),
            &[
                0x00, 0x00, 0x00, 0x0C, 0x07, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x02,
                0x03, 0x04, 0x05
            ]
        );
    }

    #[test]
    fn test_fixed_encodings() {
        let cases: Vec<(PeerMessage, Vec<u8>)> = vec![
            (PeerMessage::KeepAlive, vec![0, 0, 0, 0]),
            (PeerMessage::Choke, vec![0, 0, 0, 1, 0]),
            (PeerMessage::Unchoke, vec![0, 0, 0, 1, 1]),
            (PeerMessage::Interested, vec![0, 0, 0, 1, 2]),
            (PeerMessage::NotInterested, vec![0, 0, 0, 1, 3]),
            (
                PeerMessage::Bitfield {
                    bitfield: Bytes::from_static(&[1, 2, 3, 4]),
                },
                vec![0, 0, 0, 5, 5, 1, 2, 3, 4],
            ),
            (
                PeerMessage::Request {
                    piece_index: PieceIndex::new(1),
                    offset: 2,
                    length: 3,
                },
                vec![0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3],
            ),
            (
                PeerMessage::Cancel {
                    piece_index: PieceIndex::new(1),
                    offset: 2,
                    length: 3,
                },
                vec![0, 0, 0, 13, 8, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3],
            ),
        ];

        for (message, expected) in cases {
            let encoded = MessageCodec::encode(&message);
            assert_eq!(encoded.as_ref(), expected.as_slice(), "{}", message.kind());
            assert_eq!(MessageCodec::decode(&expected).unwrap(), message);
        }
    }

    #[test]
    fn test_length_mismatch_is_violation() {
        // Declares 5 bytes, carries 4.
        let short = [0, 0, 0, 5, 4, 0, 1, 0xE2];
        assert!(matches!(
            MessageCodec::decode(&short),
            Err(TorrentError::ProtocolViolation { .. })
        ));

        // Declares 1 byte, carries 2.
        let long = [0, 0, 0, 1, 0, 9];
        assert!(matches!(
            MessageCodec::decode(&long),
            Err(TorrentError::ProtocolViolation { .. })
        ));

        assert!(matches!(
            MessageCodec::decode(&[0, 0]),
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_payload_size_wrong_for_id() {
        let cases: [&[u8]; 4] = [
            &[0, 0, 0, 2, 0, 0],                   // choke with payload
            &[0, 0, 0, 3, 4, 0, 0],                // have with 2-byte index
            &[0, 0, 0, 5, 6, 0, 0, 0, 1],          // truncated request
            &[0, 0, 0, 5, 7, 0, 0, 0, 1],          // piece without begin
        ];
        for frame in cases {
            assert!(matches!(
                MessageCodec::decode(frame),
                Err(TorrentError::ProtocolViolation { .. })
            ));
        }
    }

    #[test]
    fn test_unknown_id_is_violation() {
        let result = MessageCodec::decode(&[0, 0, 0, 3, 9, 0x1A, 0xE1]);
        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { message }) if message.contains("unknown message ID")
        ));
    }

    #[tokio::test]
    async fn test_read_message_consumes_exact_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&MessageCodec::encode(&PeerMessage::Unchoke));
        stream.extend_from_slice(&MessageCodec::encode(&PeerMessage::KeepAlive));
        stream.extend_from_slice(&MessageCodec::encode(&PeerMessage::Piece {
            piece_index: PieceIndex::new(7),
            offset: 16_384,
            data: Bytes::from(vec![0xAB; 64]),
        }));

        let mut reader = stream.as_slice();
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            PeerMessage::Unchoke
        );
        assert_eq!(
            read_message(&mut reader).await.unwrap(),
            PeerMessage::KeepAlive
        );
        match read_message(&mut reader).await.unwrap() {
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                assert_eq!(piece_index, PieceIndex::new(7));
                assert_eq!(offset, 16_384);
                assert_eq!(data.len(), 64);
            }
            other => panic!("expected piece, got {other:?}"),
        }
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_read_message_truncated_stream_is_io_error() {
        let frame = [0, 0, 0, 5, 4, 0, 1];
        let mut reader = &frame[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(TorrentError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_read_message_rejects_oversized_frame() {
        let frame = (MAX_MESSAGE_LENGTH + 1).to_be_bytes();
        let mut reader = &frame[..];
        assert!(matches!(
            read_message(&mut reader).await,
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_message() {
        let mut sink = Vec::new();
        write_message(&mut sink, &PeerMessage::Interested)
            .await
            .unwrap();
        assert_eq!(sink, vec![0, 0, 0, 1, 2]);
    }

    fn arb_message() -> impl Strategy<Value = PeerMessage> {
        let bytes = proptest::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from);
        prop_oneof![
            Just(PeerMessage::KeepAlive),
            Just(PeerMessage::Choke),
            Just(PeerMessage::Unchoke),
            Just(PeerMessage::Interested),
            Just(PeerMessage::NotInterested),
            any::<u32>().prop_map(|i| PeerMessage::Have {
                piece_index: PieceIndex::new(i)
            }),
            bytes
                .clone()
                .prop_map(|bitfield| PeerMessage::Bitfield { bitfield }),
            (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(i, offset, length)| {
                PeerMessage::Request {
                    piece_index: PieceIndex::new(i),
                    offset,
                    length,
                }
            }),
            (any::<u32>(), any::<u32>(), bytes).prop_map(|(i, offset, data)| {
                PeerMessage::Piece {
                    piece_index: PieceIndex::new(i),
                    offset,
                    data,
                }
            }),
            (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(|(i, offset, length)| {
                PeerMessage::Cancel {
                    piece_index: PieceIndex::new(i),
                    offset,
                    length,
                }
            }),
        ]
    }

    proptest! {
        #[test]
        fn encoded_messages_decode_to_themselves(message in arb_message()) {
            let encoded = MessageCodec::encode(&message);
            prop_assert_eq!(MessageCodec::decode(&encoded).unwrap(), message);
        }

        #[test]
        fn truncated_frames_never_decode(message in arb_message(), cut in 1usize..8) {
            let encoded = MessageCodec::encode(&message);
            let keep = encoded.len().saturating_sub(cut);
            prop_assert!(MessageCodec::decode(&encoded[..keep]).is_err());
        }
    }
}
