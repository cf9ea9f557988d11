//! Torrent metainfo parsing.
//!
//! Extracts the single-file download description from a bencoded `.torrent`
//! file using bencode-rs, and computes the info hash over the raw bytes of
//! the `info` dictionary.

pub mod bencode;
pub mod types;

// Re-export public API
pub use bencode::BencodeParser;
pub use types::TorrentMetadata;
