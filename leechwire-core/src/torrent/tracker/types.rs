//! Core types and enumerations for BitTorrent tracker communication

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerId, TorrentError};

/// Tracker announce request.
///
/// Contains client statistics and torrent information sent to tracker
/// during announce operations to report progress and request peer list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    /// Unique identifier for the torrent being announced
    pub info_hash: InfoHash,
    /// Client's unique 20-byte identifier
    pub peer_id: PeerId,
    /// TCP port client is listening on for peer connections
    pub port: u16,
    /// Total bytes uploaded to other peers
    pub uploaded: u64,
    /// Total bytes downloaded from other peers
    pub downloaded: u64,
    /// Bytes remaining to download
    pub left: u64,
    /// State change to report, `None` for regular announces
    pub event: Option<AnnounceEvent>,
    /// Identifier handed out by the tracker on an earlier announce
    pub tracker_id: Option<String>,
}

/// BitTorrent announce events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// Client started downloading this torrent
    Started,
    /// Client stopped downloading this torrent
    Stopped,
    /// Client completed downloading this torrent
    Completed,
}

impl AnnounceEvent {
    /// Tracker protocol spelling of the event.
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

/// Tracker announce response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Seconds until next announce request should be sent
    pub interval: u32,
    /// Minimum allowed interval between announces
    pub min_interval: Option<u32>,
    /// Tracker-specific identifier for subsequent requests
    pub tracker_id: Option<String>,
    /// Number of seeders in the swarm
    pub complete: u32,
    /// Number of leechers in the swarm
    pub incomplete: u32,
    /// Non-fatal message from the tracker
    pub warning: Option<String>,
    /// List of peer addresses for connection attempts
    pub peers: Vec<SocketAddr>,
}

/// Abstract tracker communication interface.
///
/// Implementations handle transport details while keeping error handling
/// consistent, so the announcer can be tested without a network.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announces client presence to tracker and retrieves peer list.
    ///
    /// # Errors
    ///
    /// - `TorrentError::TrackerUnavailable` - If the tracker could not be
    ///   reached, answered with an error status, or sent a failure reason
    /// - `TorrentError::ProtocolViolation` - If the response is malformed
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError>;

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str;
}
