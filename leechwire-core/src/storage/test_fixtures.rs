//! In-memory storage that records every write, for orchestrator tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Storage, StorageError};
use crate::torrent::PieceIndex;

/// One recorded `write_piece` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub index: PieceIndex,
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Storage double; clones share the same write log.
#[derive(Debug, Clone, Default)]
pub struct RecordingStorage {
    writes: Arc<Mutex<Vec<RecordedWrite>>>,
    fail_writes: bool,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage whose every write fails with an I/O error.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// Copy of every write so far, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        offset: u64,
        piece_bytes: &[u8],
    ) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io(std::io::Error::other("disk full")));
        }

        self.writes.lock().unwrap().push(RecordedWrite {
            index,
            offset,
            bytes: piece_bytes.to_vec(),
        });
        Ok(())
    }
}
