//! Leechwire Core - BitTorrent peer wire protocol and download orchestration
//!
//! This crate provides the building blocks for a single-file BitTorrent leecher:
//! the wire protocol codec and handshake, per-peer sessions, the admission
//! controlled peer manager, the piece orchestrator that schedules block requests
//! and assembles pieces, plus the tracker and metainfo collaborators.

pub mod config;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::LeechwireConfig;
pub use storage::{FileStorage, StorageError};
pub use torrent::{EngineHandle, TorrentError, TorrentMetadata};

/// Core errors that can bubble up from any Leechwire subsystem.
#[derive(Debug, thiserror::Error)]
pub enum LeechwireError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LeechwireError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            LeechwireError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerUnavailable { url, .. } => {
                    format!("Could not reach tracker: {url}")
                }
                TorrentError::Storage(_) => "Failed to write downloaded data".to_string(),
                _ => "Download error occurred".to_string(),
            },
            LeechwireError::Storage(_) => "Failed to write downloaded data".to_string(),
            LeechwireError::Configuration { reason } => format!("Configuration error: {reason}"),
            LeechwireError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            LeechwireError::Configuration { .. }
                | LeechwireError::Torrent(TorrentError::InvalidTorrentFile { .. })
        )
    }
}
