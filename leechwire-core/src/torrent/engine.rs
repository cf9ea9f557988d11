//! Download engine: wires the orchestrator, peer manager and announcer for
//! one torrent and hands back a handle to observe and stop them.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time;

use super::orchestrator::{DownloadProgress, PieceOrchestrator};
use super::parsing::TorrentMetadata;
use super::peer_manager::{PeerManager, PeerManagerHandle, PeerManagerStats};
use super::session::SessionContext;
use super::stats::{DropCounters, DropSnapshot};
use super::tracker::{Announcer, HttpTrackerClient};
use super::{InfoHash, PeerId, PieceIndex, TorrentError};
use crate::config::LeechwireConfig;
use crate::storage::FileStorage;

/// Read-mostly facts about the download, shared by every task.
///
/// Counters and bitsets are not here; they belong to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadContext {
    pub peer_id: PeerId,
    pub info_hash: InfoHash,
    pub announce_url: String,
    pub name: String,
    pub piece_length: u32,
    pub total_length: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    /// Port announced to the tracker
    pub listen_port: u16,
}

impl DownloadContext {
    pub fn new(metadata: &TorrentMetadata, peer_id: PeerId, listen_port: u16) -> Self {
        Self {
            peer_id,
            info_hash: metadata.info_hash,
            announce_url: metadata.announce_url.clone(),
            name: metadata.name.clone(),
            piece_length: metadata.piece_length,
            total_length: metadata.total_length,
            piece_hashes: metadata.piece_hashes.clone(),
            listen_port,
        }
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Length of piece `index`; only the final piece may be shorter.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let start = self.piece_offset(index);
        self.total_length
            .saturating_sub(start)
            .min(u64::from(self.piece_length)) as u32
    }

    /// Absolute byte offset of piece `index` in the output file.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        u64::from(index.as_u32()) * u64::from(self.piece_length)
    }
}

/// How a download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Every piece was written to `path`
    Completed {
        path: PathBuf,
        progress: DownloadProgress,
    },
    /// The orchestrator stopped before the last piece arrived
    Incomplete { progress: DownloadProgress },
}

/// Handle to a running download. Dropping it stops every task without
/// telling the tracker; use [`EngineHandle::shutdown`] for an orderly stop.
pub struct EngineHandle {
    listen_addr: SocketAddr,
    output_path: PathBuf,
    progress: watch::Receiver<DownloadProgress>,
    peers: PeerManagerHandle,
    counters: DropCounters,
    addresses: mpsc::Sender<SocketAddr>,
    /// `None` once `wait` has observed the orchestrator's result
    orchestrator: Option<JoinHandle<Result<DownloadProgress, TorrentError>>>,
    manager: JoinHandle<()>,
    announcer: JoinHandle<()>,
    stop_announcer: Option<oneshot::Sender<()>>,
    stop_grace: Duration,
}

/// Starts downloading `metadata` into `output_dir`.
///
/// Binds the peer listener on `listen_port` (0 picks a free port), pre-sizes
/// the output file and spawns the orchestrator, peer manager and announcer.
///
/// # Errors
///
/// - `TorrentError::Io` - If the listener could not be bound
/// - `TorrentError::Storage` - If the output file could not be created
/// - `TorrentError::UrlParsing` - If the announce URL is invalid
pub async fn start(
    listen_port: u16,
    metadata: TorrentMetadata,
    config: LeechwireConfig,
    output_dir: &Path,
) -> Result<EngineHandle, TorrentError> {
    let config = Arc::new(config);
    let tracker = HttpTrackerClient::new(metadata.announce_url.clone(), &config.network)?;

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, listen_port)).await?;
    let listen_addr = listener.local_addr()?;

    let output_path = output_dir.join(output_file_name(&metadata.name));
    let storage = FileStorage::create(&output_path, metadata.total_length).await?;

    let peer_id = PeerId::generate(config.torrent.client_id);
    let context = Arc::new(DownloadContext::new(&metadata, peer_id, listen_addr.port()));
    let counters = DropCounters::new();

    let (blocks_tx, blocks_rx) = mpsc::channel(config.torrent.incoming_piece_capacity);
    let (requests_tx, requests_rx) = mpsc::channel(config.torrent.outgoing_request_capacity);
    let (addresses_tx, addresses_rx) = mpsc::channel(config.network.address_queue_capacity);

    let orchestrator = PieceOrchestrator::new(
        Arc::clone(&context),
        storage,
        blocks_rx,
        requests_tx,
        counters.clone(),
        &config.torrent,
    );
    let progress = orchestrator.subscribe();

    let session_context = SessionContext {
        download: Arc::clone(&context),
        config: Arc::clone(&config),
        blocks: blocks_tx,
        requests: Arc::new(Mutex::new(requests_rx)),
        counters: counters.clone(),
    };
    let (manager, peers) =
        PeerManager::new(listener, addresses_rx, session_context, &config.network)?;

    let announcer = Announcer::new(
        tracker,
        Arc::clone(&context),
        progress.clone(),
        addresses_tx.clone(),
        counters.clone(),
        &config.network,
    );

    let (stop_announcer, stop_rx) = oneshot::channel();

    tracing::info!(
        "Starting download of {} ({} bytes, info hash {}) into {}",
        context.name,
        context.total_length,
        context.info_hash,
        output_path.display()
    );

    Ok(EngineHandle {
        listen_addr,
        output_path,
        progress,
        peers,
        counters,
        addresses: addresses_tx,
        orchestrator: Some(tokio::spawn(orchestrator.run())),
        manager: tokio::spawn(manager.run()),
        announcer: tokio::spawn(announcer.run(stop_rx)),
        stop_announcer: Some(stop_announcer),
        stop_grace: config.network.tracker_timeout,
    })
}

/// Final path component of the torrent's suggested name.
fn output_file_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|file_name| file_name.to_str())
        .unwrap_or("download")
}

impl EngineHandle {
    /// Address peers can connect to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Subscribes to download progress.
    pub fn progress(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.clone()
    }

    pub fn peer_stats(&self) -> PeerManagerStats {
        self.peers.stats()
    }

    pub fn drop_counters(&self) -> DropSnapshot {
        self.counters.snapshot()
    }

    /// Offers a peer address to the manager, as if a tracker had sent it.
    ///
    /// Returns false if the address queue is full or the engine stopped.
    pub fn add_peer(&self, address: SocketAddr) -> bool {
        self.addresses.try_send(address).is_ok()
    }

    /// Waits until the orchestrator stops.
    ///
    /// After a completed download the peer manager and announcer keep
    /// running, so the tracker hears `completed` and the swarm can still
    /// reach us, until [`EngineHandle::shutdown`] is called. A fatal storage
    /// error stops every task. Calling `wait` again returns the final
    /// progress immediately.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If writing a piece failed
    pub async fn wait(&mut self) -> Result<EngineOutcome, TorrentError> {
        let Some(orchestrator) = self.orchestrator.as_mut() else {
            return Ok(self.outcome(*self.progress.borrow()));
        };
        let result = orchestrator.await;
        self.orchestrator = None;

        match result {
            Ok(Ok(progress)) => Ok(self.outcome(progress)),
            Ok(Err(e)) => {
                self.stop_tasks();
                Err(e)
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Ok(self.outcome(*self.progress.borrow())),
        }
    }

    /// Stops the download: closes every peer connection and announces
    /// `stopped` to the tracker, waiting at most the tracker timeout for it.
    pub async fn shutdown(mut self) {
        tracing::info!("Shutting down download engine");
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.abort();
        }

        // The manager outlives the stop announce; the announcer exits early
        // once the address channel closes.
        if let Some(stop) = self.stop_announcer.take() {
            if stop.send(()).is_ok()
                && time::timeout(self.stop_grace, &mut self.announcer)
                    .await
                    .is_err()
            {
                tracing::warn!("Tracker did not answer the stop announce in time");
            }
        }
        self.manager.abort();
    }

    fn outcome(&self, progress: DownloadProgress) -> EngineOutcome {
        if progress.is_complete() {
            EngineOutcome::Completed {
                path: self.output_path.clone(),
                progress,
            }
        } else {
            EngineOutcome::Incomplete { progress }
        }
    }

    fn stop_tasks(&self) {
        if let Some(orchestrator) = &self.orchestrator {
            orchestrator.abort();
        }
        self.manager.abort();
        self.announcer.abort();
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(announce_url: &str) -> TorrentMetadata {
        TorrentMetadata {
            info_hash: InfoHash::new([3u8; 20]),
            name: "../escape/test.bin".to_string(),
            piece_length: 16,
            piece_hashes: vec![[0u8; 20]; 3],
            total_length: 40,
            announce_url: announce_url.to_string(),
        }
    }

    #[test]
    fn test_piece_geometry() {
        let context = DownloadContext::new(
            &metadata("http://t/announce"),
            PeerId::new([1u8; 20]),
            6881,
        );

        assert_eq!(context.piece_count(), 3);
        assert_eq!(context.piece_offset(PieceIndex::new(2)), 32);
        assert_eq!(context.piece_size(PieceIndex::new(1)), 16);
        assert_eq!(context.piece_size(PieceIndex::new(2)), 8);
    }

    #[tokio::test]
    async fn test_start_presizes_output_and_binds() {
        let temp_dir = tempfile::tempdir().unwrap();

        let handle = start(
            0,
            metadata("http://127.0.0.1:1/announce"),
            LeechwireConfig::for_testing(),
            temp_dir.path(),
        )
        .await
        .unwrap();

        assert_ne!(handle.listen_addr().port(), 0);
        assert_eq!(handle.output_path(), temp_dir.path().join("test.bin"));
        let size = tokio::fs::metadata(handle.output_path()).await.unwrap().len();
        assert_eq!(size, 40);
        assert_eq!(handle.progress().borrow().left, 40);
        assert_eq!(handle.peer_stats().active, 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_rejects_bad_announce_url() {
        let temp_dir = tempfile::tempdir().unwrap();

        let result = start(
            0,
            metadata("not a url"),
            LeechwireConfig::for_testing(),
            temp_dir.path(),
        )
        .await;

        assert!(matches!(result, Err(TorrentError::UrlParsing(_))));
    }
}
