//! Single output file storage

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{Storage, StorageError};
use crate::torrent::PieceIndex;

/// Writes pieces into one pre-sized output file.
pub struct FileStorage {
    path: PathBuf,
    file: File,
    total_length: u64,
}

impl FileStorage {
    /// Creates (or reopens) the output file and sizes it to `total_length`.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If the file cannot be created or resized
    pub async fn create(path: &Path, total_length: u64) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        file.set_len(total_length).await?;

        tracing::debug!(
            "Output file {} sized to {total_length} bytes",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            total_length,
        })
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        offset: u64,
        piece_bytes: &[u8],
    ) -> Result<(), StorageError> {
        if offset + piece_bytes.len() as u64 > self.total_length {
            return Err(StorageError::OutOfBounds {
                index,
                offset,
                length: piece_bytes.len(),
                total_length: self.total_length,
            });
        }

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(piece_bytes).await?;
        self.file.flush().await?;
        Ok(())
    }
}
