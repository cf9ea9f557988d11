//! BitTorrent tracker communication.
//!
//! HTTP announce following BEP 3 with compact peer lists (BEP 23), and the
//! announcer task that keeps the peer manager supplied with addresses.

pub mod announcer;
pub mod client;
pub mod types;

// Re-export public API
pub use announcer::Announcer;
pub use client::{HttpTrackerClient, parse_announce_response, parse_compact_peers};
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
