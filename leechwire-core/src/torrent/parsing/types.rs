//! Core types for parsed torrent metainfo

use crate::torrent::InfoHash;

/// Description of a single-file torrent.
///
/// Everything the engine needs to download the file: identity, geometry,
/// expected piece hashes and where to find peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    pub info_hash: InfoHash,
    /// Suggested output file name
    pub name: String,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub total_length: u64,
    pub announce_url: String,
}

impl TorrentMetadata {
    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }
}
