//! Centralized configuration for Leechwire.
//!
//! All tunable parameters are defined here and passed explicitly into the
//! engine, peer manager, sessions and orchestrator. Nothing reads process-wide
//! mutable state.

use std::time::Duration;

/// Central configuration for all Leechwire components.
#[derive(Debug, Clone, Default)]
pub struct LeechwireConfig {
    pub torrent: TorrentConfig,
    pub network: NetworkConfig,
}

/// Piece scheduling and download configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Azureus-style client prefix for generated peer IDs
    pub client_id: &'static str,
    /// Size of a single requested block
    pub block_size: u32,
    /// Age after which an unanswered block request is issued again
    pub block_retry_interval: Duration,
    /// Cadence of the orchestrator scheduling loop and session request pumps
    pub scheduler_tick: Duration,
    /// Capacity of the peer sessions -> orchestrator piece channel
    pub incoming_piece_capacity: usize,
    /// Capacity of the orchestrator -> peer sessions request queue
    pub outgoing_request_capacity: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: "-LW0001-",
            block_size: 16_384, // 16 KiB
            block_retry_interval: Duration::from_secs(10),
            scheduler_tick: Duration::from_millis(100),
            incoming_piece_capacity: 256,
            outgoing_request_capacity: 64,
        }
    }
}

/// Peer connection, admission control and tracker configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Maximum concurrent peer sessions, inbound and outbound combined
    pub max_peer_connections: usize,
    /// Maximum outbound dials in flight at once
    pub max_outbound_dials: usize,
    /// TCP connect timeout for outbound dials
    pub connect_timeout: Duration,
    /// Deadline for the complete handshake exchange
    pub handshake_timeout: Duration,
    /// Silence from a peer beyond this window closes the session
    pub keep_alive_timeout: Duration,
    /// Idle time after which we send a keep-alive
    pub keep_alive_interval: Duration,
    /// Deadline for a single message write
    pub write_timeout: Duration,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Upper bound on the wait between two announces
    pub announce_interval: Duration,
    /// Wait before retrying a failed announce
    pub announce_retry_interval: Duration,
    /// Number of peers requested per announce
    pub numwant: u32,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
    /// Capacity of the tracker -> peer manager address channel
    pub address_queue_capacity: usize,
    /// Capacity of each session's outgoing message queue
    pub session_queue_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_peer_connections: 55,
            max_outbound_dials: 1,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            keep_alive_timeout: Duration::from_secs(110),
            keep_alive_interval: Duration::from_secs(100),
            write_timeout: Duration::from_secs(1),
            tracker_timeout: Duration::from_secs(30),
            announce_interval: Duration::from_secs(200),
            announce_retry_interval: Duration::from_secs(30),
            numwant: 5,
            user_agent: "leechwire/0.1.0",
            address_queue_capacity: 64,
            session_queue_capacity: 32,
        }
    }
}

impl LeechwireConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(count) = env_parse::<usize>("LEECHWIRE_MAX_PEERS") {
            config.network.max_peer_connections = count;
        }

        if let Some(count) = env_parse::<usize>("LEECHWIRE_MAX_OUTBOUND") {
            config.network.max_outbound_dials = count;
        }

        if let Some(seconds) = env_parse::<u64>("LEECHWIRE_TRACKER_TIMEOUT") {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("LEECHWIRE_ANNOUNCE_INTERVAL") {
            config.network.announce_interval = Duration::from_secs(seconds);
        }

        if let Some(seconds) = env_parse::<u64>("LEECHWIRE_BLOCK_RETRY_SECS") {
            config.torrent.block_retry_interval = Duration::from_secs(seconds);
        }

        config
    }

    /// Creates a configuration with short timers for tests.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.torrent.scheduler_tick = Duration::from_millis(10);
        config.torrent.block_retry_interval = Duration::from_secs(2);
        config.network.connect_timeout = Duration::from_secs(2);
        config.network.handshake_timeout = Duration::from_secs(2);
        config.network.announce_retry_interval = Duration::from_millis(200);
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}
