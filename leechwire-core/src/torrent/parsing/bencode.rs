//! Bencode parsing logic and info hash calculation

use std::path::Path;

use sha1::{Digest, Sha1};

use super::types::TorrentMetadata;
use crate::torrent::{InfoHash, TorrentError};

type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
type ParseResult<T> = Result<T, TorrentError>;

/// Bencode parsing utilities for torrent metadata extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Reads and parses a `.torrent` file.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the file could not be read
    /// - `TorrentError::InvalidTorrentFile` - If the contents are not a valid single-file torrent
    pub async fn parse_file(path: &Path) -> Result<TorrentMetadata, TorrentError> {
        let torrent_bytes = tokio::fs::read(path).await?;
        tracing::debug!(
            "Read {} bytes of metainfo from {}",
            torrent_bytes.len(),
            path.display()
        );
        Self::parse(&torrent_bytes)
    }

    /// Parses bencoded metainfo.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If bencode parsing failed, a
    ///   required field is missing, the geometry is inconsistent, or the
    ///   torrent describes multiple files
    pub fn parse(torrent_bytes: &[u8]) -> Result<TorrentMetadata, TorrentError> {
        let parsed = bencode_rs::Value::parse(torrent_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;

        let Some(root) = parsed.first() else {
            return Err(invalid("Empty bencode data"));
        };

        let bencode_rs::Value::Dictionary(dict) = root else {
            return Err(invalid("Root element must be dictionary"));
        };

        let Some(bencode_rs::Value::Dictionary(info)) = dict.get(b"info".as_slice()) else {
            return Err(invalid("Missing 'info' dictionary"));
        };

        if info.contains_key(b"files".as_slice()) {
            return Err(invalid("Multi-file torrents are not supported"));
        }

        let info_hash = Self::calculate_info_hash(torrent_bytes)?;
        let name = Self::extract_string(info, b"name")?;
        let piece_length = Self::extract_positive(info, b"piece length")?;
        let total_length = Self::extract_positive(info, b"length")?;
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| invalid(format!("Piece length {piece_length} too large")))?;

        let pieces = Self::extract_bytes(info, b"pieces")?;
        if !pieces.len().is_multiple_of(20) {
            return Err(invalid("Invalid pieces length"));
        }

        let piece_hashes: Vec<[u8; 20]> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let expected_pieces = total_length.div_ceil(u64::from(piece_length));
        if piece_hashes.len() as u64 != expected_pieces {
            return Err(invalid(format!(
                "{} piece hashes for {expected_pieces} pieces",
                piece_hashes.len()
            )));
        }

        let announce_url = Self::extract_announce_url(dict)?;

        Ok(TorrentMetadata {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length,
            announce_url,
        })
    }

    /// SHA-1 over the exact bytes of the top-level `info` value.
    fn calculate_info_hash(torrent_bytes: &[u8]) -> ParseResult<InfoHash> {
        let (start, end) = Self::locate_info_value(torrent_bytes)?;
        let digest = Sha1::digest(&torrent_bytes[start..end]);
        Ok(InfoHash::new(digest.into()))
    }

    /// Walks the keys of the root dictionary and returns the byte range of
    /// the value stored under `info`.
    fn locate_info_value(data: &[u8]) -> ParseResult<(usize, usize)> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }

        let mut pos = 1;
        while pos < data.len() && data[pos] != b'e' {
            let key_end = Self::value_end(data, pos)?;
            let is_info = &data[pos..key_end] == b"4:info";
            let value_end = Self::value_end(data, key_end)?;
            if is_info {
                return Ok((key_end, value_end));
            }
            pos = value_end;
        }

        Err(invalid("Could not find info dictionary in data"))
    }

    /// Returns the position just past the bencode value starting at `start`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - If the value is malformed or truncated
    pub fn value_end(data: &[u8], start: usize) -> ParseResult<usize> {
        let mut pos = start;
        let mut depth = 0usize;

        loop {
            let Some(&byte) = data.get(pos) else {
                return Err(invalid("Truncated bencode value"));
            };

            match byte {
                b'd' | b'l' => {
                    depth += 1;
                    pos += 1;
                }
                b'e' if depth > 0 => {
                    depth -= 1;
                    pos += 1;
                }
                b'i' => {
                    let terminator = data[pos..]
                        .iter()
                        .position(|&b| b == b'e')
                        .ok_or_else(|| invalid("Unterminated integer"))?;
                    pos += terminator + 1;
                }
                b'0'..=b'9' => {
                    let colon = data[pos..]
                        .iter()
                        .position(|&b| b == b':')
                        .ok_or_else(|| invalid("Invalid string format"))?;
                    let length: usize = std::str::from_utf8(&data[pos..pos + colon])
                        .ok()
                        .and_then(|digits| digits.parse().ok())
                        .ok_or_else(|| invalid("Invalid string length"))?;
                    pos += colon + 1 + length;
                    if pos > data.len() {
                        return Err(invalid("Truncated string"));
                    }
                }
                _ => return Err(invalid("Invalid bencode character")),
            }

            if depth == 0 {
                return Ok(pos);
            }
        }
    }

    /// `announce`, falling back to the first entry of `announce-list`.
    fn extract_announce_url(dict: &BencodeDict<'_>) -> ParseResult<String> {
        if let Ok(announce) = Self::extract_string(dict, b"announce") {
            return Ok(announce);
        }

        if let Some(bencode_rs::Value::List(tiers)) = dict.get(b"announce-list".as_slice()) {
            for tier in tiers {
                let bencode_rs::Value::List(urls) = tier else {
                    continue;
                };
                for url in urls {
                    if let bencode_rs::Value::Bytes(url) = url {
                        if let Ok(url) = std::str::from_utf8(url) {
                            return Ok(url.to_string());
                        }
                    }
                }
            }
        }

        Err(invalid("No announce URL found"))
    }

    fn extract_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_positive(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<u64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) if *value > 0 => Ok(*value as u64),
            _ => Err(invalid(format!(
                "Missing or non-positive integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }
}

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}
