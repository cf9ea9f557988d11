//! Storage layer for downloaded piece data.
//!
//! The orchestrator is the only writer. It hands each completed piece to a
//! `Storage` implementation exactly once, at the piece's absolute offset.

pub mod file_storage;
#[cfg(test)]
pub mod test_fixtures;

use async_trait::async_trait;
pub use file_storage::FileStorage;

use crate::torrent::PieceIndex;

/// Persistence for assembled pieces.
#[async_trait]
pub trait Storage: Send {
    /// Writes a complete piece at `offset` bytes into the output.
    ///
    /// # Errors
    ///
    /// - `StorageError::OutOfBounds` - If the write would extend past the output length
    /// - `StorageError::Io` - If the file system operation failed
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        offset: u64,
        piece_bytes: &[u8],
    ) -> Result<(), StorageError>;
}

/// Errors that occur while persisting piece data.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Write would land outside the pre-sized output file
    #[error("Piece {index} at offset {offset} (+{length}) exceeds output length {total_length}")]
    OutOfBounds {
        /// Index of the rejected piece
        index: PieceIndex,
        /// Absolute byte offset of the write
        offset: u64,
        /// Number of bytes in the write
        length: usize,
        /// Size of the output file
        total_length: u64,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
