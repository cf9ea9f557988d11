//! Piece orchestrator: block scheduling and piece assembly.
//!
//! The orchestrator is the single writer of download state. Peer sessions
//! hand it received blocks through a bounded channel and take block requests
//! from a bounded queue it fills; nothing else touches the piece buffer, the
//! bitsets or the byte counters. Pieces are assembled strictly in index order
//! and written to storage one whole piece at a time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::engine::DownloadContext;
use super::{PeerMessage, PieceBitset, PieceIndex, TorrentError};
use crate::config::TorrentConfig;
use crate::storage::Storage;
use crate::torrent::stats::DropCounters;

/// Block of piece data received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedBlock {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub data: Bytes,
}

/// Block the orchestrator wants some peer to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece_index: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

impl From<BlockRequest> for PeerMessage {
    fn from(request: BlockRequest) -> Self {
        PeerMessage::Request {
            piece_index: request.piece_index,
            offset: request.offset,
            length: request.length,
        }
    }
}

/// Download counters published after every completed piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    /// Bytes of verified pieces written to storage
    pub downloaded: u64,
    /// Bytes served to peers; always zero for a pure leecher
    pub uploaded: u64,
    /// Bytes still missing
    pub left: u64,
    pub completed_pieces: u32,
    pub total_pieces: u32,
}

impl DownloadProgress {
    /// Returns true once every piece has been written.
    pub fn is_complete(&self) -> bool {
        self.completed_pieces == self.total_pieces
    }
}

/// Result of one scheduling step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Work remains on the current piece
    InProgress,
    /// The given piece was written and the next one is now current
    PieceCompleted(PieceIndex),
    /// Every piece has been written
    Finished,
    /// Every sender of the incoming block channel is gone
    SourcesClosed,
}

/// Assembly state of the piece currently being downloaded.
struct CurrentPiece {
    index: PieceIndex,
    buffer: Vec<u8>,
    blocks: PieceBitset,
    requested_at: Vec<Option<Instant>>,
}

/// Schedules block requests and assembles pieces in index order.
pub struct PieceOrchestrator<S> {
    context: Arc<DownloadContext>,
    storage: S,
    incoming: mpsc::Receiver<ReceivedBlock>,
    requests: mpsc::Sender<BlockRequest>,
    progress: watch::Sender<DownloadProgress>,
    counters: DropCounters,
    block_size: u32,
    retry_interval: Duration,
    tick_interval: Duration,
    pieces: PieceBitset,
    current: CurrentPiece,
    downloaded: u64,
}

impl<S: Storage> PieceOrchestrator<S> {
    /// Creates an orchestrator positioned on piece 0.
    pub fn new(
        context: Arc<DownloadContext>,
        storage: S,
        incoming: mpsc::Receiver<ReceivedBlock>,
        requests: mpsc::Sender<BlockRequest>,
        counters: DropCounters,
        config: &TorrentConfig,
    ) -> Self {
        let total_pieces = context.piece_count();
        let (progress, _) = watch::channel(DownloadProgress {
            downloaded: 0,
            uploaded: 0,
            left: context.total_length,
            completed_pieces: 0,
            total_pieces,
        });

        let current = CurrentPiece::new(&context, PieceIndex::new(0), config.block_size);

        Self {
            storage,
            incoming,
            requests,
            progress,
            counters,
            block_size: config.block_size,
            retry_interval: config.block_retry_interval,
            tick_interval: config.scheduler_tick,
            pieces: PieceBitset::new(total_pieces as usize),
            current,
            downloaded: 0,
            context,
        }
    }

    /// Subscribes to progress updates.
    pub fn subscribe(&self) -> watch::Receiver<DownloadProgress> {
        self.progress.subscribe()
    }

    /// Latest published progress.
    pub fn progress(&self) -> DownloadProgress {
        *self.progress.borrow()
    }

    /// Index of the piece being assembled, `None` once the download is done.
    pub fn current_piece(&self) -> Option<PieceIndex> {
        if self.pieces.is_complete() {
            None
        } else {
            Some(self.current.index)
        }
    }

    /// Block completion state of the current piece.
    pub fn current_blocks(&self) -> &PieceBitset {
        &self.current.blocks
    }

    /// Torrent-level piece completion state.
    pub fn completed_pieces(&self) -> &PieceBitset {
        &self.pieces
    }

    /// Runs one scheduling step at `now`.
    ///
    /// Drains received blocks into the current piece, writes the piece once
    /// every block is present, and otherwise issues requests for blocks that
    /// were never requested or whose last request is older than the retry
    /// interval.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If the completed piece could not be written
    pub async fn tick(&mut self, now: Instant) -> Result<TickOutcome, TorrentError> {
        if self.pieces.is_complete() {
            return Ok(TickOutcome::Finished);
        }

        let sources_closed = self.drain_incoming();

        if self.current.blocks.first_unset().is_none() {
            return self.complete_current_piece().await;
        }

        if sources_closed {
            return Ok(TickOutcome::SourcesClosed);
        }

        self.request_missing_blocks(now);
        Ok(TickOutcome::InProgress)
    }

    /// Drives `tick` on a fixed cadence until the download ends.
    ///
    /// Returns the final progress when every piece is written or when no
    /// peer session can deliver blocks anymore.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Storage` - If a piece write failed; the download is over
    pub async fn run(mut self) -> Result<DownloadProgress, TorrentError> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Downloading {} pieces ({} bytes)",
            self.context.piece_count(),
            self.context.total_length
        );

        loop {
            ticker.tick().await;
            match self.tick(Instant::now()).await {
                Ok(TickOutcome::Finished) => {
                    tracing::info!("Download complete: {} bytes", self.downloaded);
                    return Ok(self.progress());
                }
                Ok(TickOutcome::SourcesClosed) => {
                    tracing::warn!("Block channel closed before the download finished");
                    return Ok(self.progress());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Piece orchestrator stopped: {e}");
                    return Err(e);
                }
            }
        }
    }

    /// Returns true when every sender of the incoming channel is gone.
    fn drain_incoming(&mut self) -> bool {
        loop {
            match self.incoming.try_recv() {
                Ok(block) => self.accept_block(block),
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return true,
            }
        }
    }

    fn accept_block(&mut self, block: ReceivedBlock) {
        if block.piece_index != self.current.index {
            tracing::trace!(
                "Dropping stale block for piece {} (assembling {})",
                block.piece_index,
                self.current.index
            );
            self.counters.record_stale_block();
            return;
        }

        let Some(block_number) = self.block_number(block.offset, block.data.len()) else {
            tracing::debug!(
                "Dropping block offset={} len={} that does not fit piece {}",
                block.offset,
                block.data.len(),
                block.piece_index
            );
            self.counters.record_invalid_block();
            return;
        };

        let start = block.offset as usize;
        self.current.buffer[start..start + block.data.len()].copy_from_slice(&block.data);
        self.current.blocks.set(block_number);
    }

    /// Maps a block's offset and size to its block number in the current
    /// piece, or `None` if the block is misaligned or has the wrong length.
    fn block_number(&self, offset: u32, length: usize) -> Option<usize> {
        if offset % self.block_size != 0 {
            return None;
        }

        let block_number = (offset / self.block_size) as usize;
        if block_number >= self.current.blocks.len() {
            return None;
        }

        let expected = self.current.block_length(block_number, self.block_size);
        (length == expected as usize).then_some(block_number)
    }

    async fn complete_current_piece(&mut self) -> Result<TickOutcome, TorrentError> {
        let index = self.current.index;
        let digest: [u8; 20] = Sha1::digest(&self.current.buffer).into();
        if digest != self.context.piece_hashes[index.as_u32() as usize] {
            tracing::warn!("Piece {index} failed hash verification, downloading again");
            self.counters.record_corrupt_piece();
            self.current.restart();
            return Ok(TickOutcome::InProgress);
        }

        let offset = self.context.piece_offset(index);
        self.storage
            .write_piece(index, offset, &self.current.buffer)
            .await?;

        self.pieces.set(index.as_u32() as usize);
        self.downloaded += self.current.buffer.len() as u64;
        self.publish_progress();
        tracing::debug!(
            "Piece {index} written at offset {offset} ({}/{})",
            self.pieces.count_set(),
            self.pieces.len()
        );

        if self.pieces.is_complete() {
            return Ok(TickOutcome::Finished);
        }

        let next = PieceIndex::new(index.as_u32() + 1);
        self.current.advance(&self.context, next, self.block_size);
        Ok(TickOutcome::PieceCompleted(index))
    }

    fn request_missing_blocks(&mut self, now: Instant) {
        let index = self.current.index;

        for block_number in 0..self.current.blocks.len() {
            if self.current.blocks.test(block_number) {
                continue;
            }

            let due = match self.current.requested_at[block_number] {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= self.retry_interval,
            };
            if !due {
                continue;
            }

            let request = BlockRequest {
                piece_index: index,
                offset: block_number as u32 * self.block_size,
                length: self.current.block_length(block_number, self.block_size),
            };

            match self.requests.try_send(request) {
                Ok(()) => self.current.requested_at[block_number] = Some(now),
                Err(TrySendError::Full(_)) => {
                    // Left unstamped so the next tick tries again.
                    self.counters.record_request_dropped();
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
    }

    fn publish_progress(&self) {
        let completed_pieces = self.pieces.count_set() as u32;
        self.progress.send_replace(DownloadProgress {
            downloaded: self.downloaded,
            uploaded: 0,
            left: self.context.total_length - self.downloaded,
            completed_pieces,
            total_pieces: self.pieces.len() as u32,
        });
    }
}

impl CurrentPiece {
    fn new(context: &DownloadContext, index: PieceIndex, block_size: u32) -> Self {
        let length = context.piece_size(index) as usize;
        let block_count = length.div_ceil(block_size as usize);
        Self {
            index,
            buffer: vec![0; length],
            blocks: PieceBitset::new(block_count),
            requested_at: vec![None; block_count],
        }
    }

    /// Moves to `index`, reusing allocations where the geometry allows.
    fn advance(&mut self, context: &DownloadContext, index: PieceIndex, block_size: u32) {
        let length = context.piece_size(index) as usize;
        let block_count = length.div_ceil(block_size as usize);

        self.index = index;
        self.buffer.clear();
        self.buffer.resize(length, 0);
        if self.blocks.len() == block_count {
            self.blocks.reset();
        } else {
            self.blocks = PieceBitset::new(block_count);
        }
        self.requested_at.clear();
        self.requested_at.resize(block_count, None);
    }

    /// Forgets every received block of the current piece.
    fn restart(&mut self) {
        self.blocks.reset();
        self.requested_at.fill(None);
    }

    fn block_length(&self, block_number: usize, block_size: u32) -> u32 {
        let start = block_number * block_size as usize;
        (self.buffer.len() - start).min(block_size as usize) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageError;
    use crate::storage::test_fixtures::RecordingStorage;
    use crate::torrent::{InfoHash, PeerId};

    const BLOCK: u32 = 4;
    const PIECE: u32 = 8;

    fn file_bytes(total_length: usize) -> Vec<u8> {
        (0..total_length).map(|i| i as u8).collect()
    }

    fn context_for(data: &[u8]) -> Arc<DownloadContext> {
        let piece_hashes = data
            .chunks(PIECE as usize)
            .map(|piece| -> [u8; 20] { Sha1::digest(piece).into() })
            .collect();
        Arc::new(DownloadContext {
            peer_id: PeerId::new([1u8; 20]),
            info_hash: InfoHash::new([2u8; 20]),
            announce_url: "http://tracker.test/announce".to_string(),
            name: "test.bin".to_string(),
            piece_length: PIECE,
            total_length: data.len() as u64,
            piece_hashes,
            listen_port: 6881,
        })
    }

    struct Harness {
        orchestrator: PieceOrchestrator<RecordingStorage>,
        storage: RecordingStorage,
        blocks: mpsc::Sender<ReceivedBlock>,
        requests: mpsc::Receiver<BlockRequest>,
        counters: DropCounters,
    }

    fn harness(data: &[u8], request_capacity: usize) -> Harness {
        harness_with_storage(data, request_capacity, RecordingStorage::new())
    }

    fn harness_with_storage(
        data: &[u8],
        request_capacity: usize,
        storage: RecordingStorage,
    ) -> Harness {
        let mut config = TorrentConfig::default();
        config.block_size = BLOCK;
        config.block_retry_interval = Duration::from_secs(10);

        let (blocks_tx, blocks_rx) = mpsc::channel(64);
        let (requests_tx, requests_rx) = mpsc::channel(request_capacity);
        let counters = DropCounters::new();
        let orchestrator = PieceOrchestrator::new(
            context_for(data),
            storage.clone(),
            blocks_rx,
            requests_tx,
            counters.clone(),
            &config,
        );

        Harness {
            orchestrator,
            storage,
            blocks: blocks_tx,
            requests: requests_rx,
            counters,
        }
    }

    fn block(data: &[u8], piece: u32, offset: u32, length: u32) -> ReceivedBlock {
        let start = (piece * PIECE + offset) as usize;
        ReceivedBlock {
            piece_index: PieceIndex::new(piece),
            offset,
            data: Bytes::copy_from_slice(&data[start..start + length as usize]),
        }
    }

    fn drain(requests: &mut mpsc::Receiver<BlockRequest>) -> Vec<BlockRequest> {
        let mut drained = Vec::new();
        while let Ok(request) = requests.try_recv() {
            drained.push(request);
        }
        drained
    }

    #[tokio::test]
    async fn test_out_of_order_blocks_with_duplicate_write_piece_once() {
        let data = file_bytes(20);
        let mut h = harness(&data, 16);

        h.blocks.send(block(&data, 0, 4, 4)).await.unwrap();
        h.blocks.send(block(&data, 0, 0, 4)).await.unwrap();
        h.blocks.send(block(&data, 0, 4, 4)).await.unwrap();

        let outcome = h.orchestrator.tick(Instant::now()).await.unwrap();

        assert_eq!(outcome, TickOutcome::PieceCompleted(PieceIndex::new(0)));
        let writes = h.storage.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].offset, 0);
        assert_eq!(writes[0].bytes, data[..8]);
        assert_eq!(h.orchestrator.current_piece(), Some(PieceIndex::new(1)));
        assert_eq!(h.orchestrator.current_blocks().count_set(), 0);
        assert!(h.orchestrator.completed_pieces().test(0));
        assert_eq!(h.orchestrator.progress().downloaded, 8);
        assert_eq!(h.orchestrator.progress().left, 12);
    }

    #[tokio::test]
    async fn test_second_piece_written_at_its_offset() {
        let data = file_bytes(20);
        let mut h = harness(&data, 16);

        for (piece, offset) in [(0, 0), (0, 4)] {
            h.blocks.send(block(&data, piece, offset, 4)).await.unwrap();
        }
        h.orchestrator.tick(Instant::now()).await.unwrap();

        for (piece, offset) in [(1, 4), (1, 0)] {
            h.blocks.send(block(&data, piece, offset, 4)).await.unwrap();
        }
        h.orchestrator.tick(Instant::now()).await.unwrap();

        let writes = h.storage.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].index, PieceIndex::new(1));
        assert_eq!(writes[1].offset, 8);
        assert_eq!(writes[1].bytes, data[8..16]);
    }

    #[tokio::test]
    async fn test_short_final_piece_finishes_download() {
        let data = file_bytes(19);
        let mut h = harness(&data, 16);
        let mut progress = h.orchestrator.subscribe();

        for piece in 0..2 {
            for offset in [0, 4] {
                h.blocks.send(block(&data, piece, offset, 4)).await.unwrap();
            }
            h.orchestrator.tick(Instant::now()).await.unwrap();
        }

        // Final piece is 3 bytes: one short block.
        h.orchestrator.tick(Instant::now()).await.unwrap();
        assert_eq!(h.orchestrator.current_blocks().len(), 1);
        let requests = drain(&mut h.requests);
        assert!(requests.contains(&BlockRequest {
            piece_index: PieceIndex::new(2),
            offset: 0,
            length: 3,
        }));

        h.blocks.send(block(&data, 2, 0, 3)).await.unwrap();
        let outcome = h.orchestrator.tick(Instant::now()).await.unwrap();

        assert_eq!(outcome, TickOutcome::Finished);
        assert_eq!(h.orchestrator.current_piece(), None);
        assert_eq!(h.storage.writes()[2].offset, 16);
        assert_eq!(h.storage.writes()[2].bytes, data[16..19]);

        let latest = *progress.borrow_and_update();
        assert!(latest.is_complete());
        assert_eq!(latest.downloaded, 19);
        assert_eq!(latest.left, 0);

        let outcome = h.orchestrator.tick(Instant::now()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Finished);
        assert_eq!(h.storage.writes().len(), 3);
    }

    #[tokio::test]
    async fn test_stale_and_misfit_blocks_are_dropped() {
        let data = file_bytes(20);
        let mut h = harness(&data, 16);

        h.blocks.send(block(&data, 1, 0, 4)).await.unwrap();
        h.blocks
            .send(ReceivedBlock {
                piece_index: PieceIndex::new(0),
                offset: 2,
                data: Bytes::from_static(&[0; 4]),
            })
            .await
            .unwrap();
        h.blocks
            .send(ReceivedBlock {
                piece_index: PieceIndex::new(0),
                offset: 4,
                data: Bytes::from_static(&[0; 3]),
            })
            .await
            .unwrap();
        h.blocks
            .send(ReceivedBlock {
                piece_index: PieceIndex::new(0),
                offset: 8,
                data: Bytes::from_static(&[0; 4]),
            })
            .await
            .unwrap();

        let outcome = h.orchestrator.tick(Instant::now()).await.unwrap();

        assert_eq!(outcome, TickOutcome::InProgress);
        assert_eq!(h.orchestrator.current_blocks().count_set(), 0);
        let snapshot = h.counters.snapshot();
        assert_eq!(snapshot.stale_blocks, 1);
        assert_eq!(snapshot.invalid_blocks, 3);
        assert!(h.storage.writes().is_empty());
    }

    #[tokio::test]
    async fn test_block_rerequested_once_per_retry_interval() {
        let data = file_bytes(20);
        let mut h = harness(&data, 16);
        let start = Instant::now();

        h.orchestrator.tick(start).await.unwrap();
        assert_eq!(drain(&mut h.requests).len(), 2);

        // Many ticks inside the window issue nothing.
        for ms in (100..10_000).step_by(100) {
            h.orchestrator
                .tick(start + Duration::from_millis(ms))
                .await
                .unwrap();
        }
        assert!(drain(&mut h.requests).is_empty());

        h.orchestrator
            .tick(start + Duration::from_secs(10))
            .await
            .unwrap();
        h.orchestrator
            .tick(start + Duration::from_millis(10_050))
            .await
            .unwrap();
        assert_eq!(drain(&mut h.requests).len(), 2);

        // Received blocks are never requested again.
        h.blocks.send(block(&data, 0, 0, 4)).await.unwrap();
        h.orchestrator
            .tick(start + Duration::from_secs(20))
            .await
            .unwrap();
        let retried = drain(&mut h.requests);
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].offset, 4);
    }

    #[tokio::test]
    async fn test_full_request_queue_leaves_block_unstamped() {
        let data = file_bytes(20);
        let mut h = harness(&data, 1);
        let start = Instant::now();

        h.orchestrator.tick(start).await.unwrap();
        assert_eq!(h.counters.snapshot().requests_dropped, 1);
        assert_eq!(drain(&mut h.requests).len(), 1);

        // The dropped block goes out on the very next tick.
        h.orchestrator
            .tick(start + Duration::from_millis(100))
            .await
            .unwrap();
        let next = drain(&mut h.requests);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].offset, 4);
    }

    #[tokio::test]
    async fn test_corrupt_piece_is_downloaded_again() {
        let data = file_bytes(20);
        let mut h = harness(&data, 16);

        h.blocks.send(block(&data, 0, 0, 4)).await.unwrap();
        h.blocks
            .send(ReceivedBlock {
                piece_index: PieceIndex::new(0),
                offset: 4,
                data: Bytes::from_static(&[0xAA; 4]),
            })
            .await
            .unwrap();

        let outcome = h.orchestrator.tick(Instant::now()).await.unwrap();

        assert_eq!(outcome, TickOutcome::InProgress);
        assert!(h.storage.writes().is_empty());
        assert_eq!(h.counters.snapshot().corrupt_pieces, 1);
        assert_eq!(h.orchestrator.current_piece(), Some(PieceIndex::new(0)));
        assert_eq!(h.orchestrator.current_blocks().count_set(), 0);
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let data = file_bytes(20);
        let mut h = harness_with_storage(&data, 16, RecordingStorage::failing());

        h.blocks.send(block(&data, 0, 0, 4)).await.unwrap();
        h.blocks.send(block(&data, 0, 4, 4)).await.unwrap();

        let result = h.orchestrator.tick(Instant::now()).await;

        assert!(matches!(
            result,
            Err(TorrentError::Storage(StorageError::Io(_)))
        ));
        assert!(!h.orchestrator.completed_pieces().test(0));
    }

    #[tokio::test]
    async fn test_run_stops_when_sources_close() {
        let data = file_bytes(20);
        let h = harness(&data, 16);
        drop(h.blocks);

        let progress = h.orchestrator.run().await.unwrap();

        assert_eq!(progress.completed_pieces, 0);
        assert!(!progress.is_complete());
    }
}
