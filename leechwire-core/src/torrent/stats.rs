//! Counters for best-effort hand-offs that dropped work.
//!
//! Every inter-task queue uses `try_send` and drops on saturation; the
//! orchestrator's retry timer and the tracker's next announce recover the
//! lost work. These counters make the drops visible.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared drop counters. Cloning shares the same counters.
#[derive(Debug, Clone, Default)]
pub struct DropCounters {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    pieces_dropped: AtomicU64,
    requests_dropped: AtomicU64,
    addresses_dropped: AtomicU64,
    stale_blocks: AtomicU64,
    invalid_blocks: AtomicU64,
    corrupt_pieces: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropSnapshot {
    /// Piece messages lost because the orchestrator inbox was full
    pub pieces_dropped: u64,
    /// Block requests lost because the request queue was full
    pub requests_dropped: u64,
    /// Tracker addresses lost because the manager inbox was full
    pub addresses_dropped: u64,
    /// Blocks for a piece other than the one being assembled
    pub stale_blocks: u64,
    /// Blocks whose offset or length does not fit the current piece
    pub invalid_blocks: u64,
    /// Assembled pieces discarded because their SHA-1 did not match
    pub corrupt_pieces: u64,
}

impl DropCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_piece_dropped(&self) {
        self.inner.pieces_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_dropped(&self) {
        self.inner.requests_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_address_dropped(&self) {
        self.inner.addresses_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_block(&self) {
        self.inner.stale_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_block(&self) {
        self.inner.invalid_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupt_piece(&self) {
        self.inner.corrupt_pieces.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot {
            pieces_dropped: self.inner.pieces_dropped.load(Ordering::Relaxed),
            requests_dropped: self.inner.requests_dropped.load(Ordering::Relaxed),
            addresses_dropped: self.inner.addresses_dropped.load(Ordering::Relaxed),
            stale_blocks: self.inner.stale_blocks.load(Ordering::Relaxed),
            invalid_blocks: self.inner.invalid_blocks.load(Ordering::Relaxed),
            corrupt_pieces: self.inner.corrupt_pieces.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let counters = DropCounters::new();
        let clone = counters.clone();

        clone.record_piece_dropped();
        clone.record_piece_dropped();
        counters.record_stale_block();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.pieces_dropped, 2);
        assert_eq!(snapshot.stale_blocks, 1);
        assert_eq!(snapshot.requests_dropped, 0);
    }
}
