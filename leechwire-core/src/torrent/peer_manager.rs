//! Peer admission control and session supervision.
//!
//! One task owns every connection decision: it accepts inbound peers, dials
//! addresses from the tracker, and counts sessions down when their death
//! notices arrive. Two ceilings apply: total live sessions and outbound dials
//! in flight. Nothing else in the engine tracks connections.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};

use super::TorrentError;
use super::session::{PeerSession, SessionClosed, SessionContext};
use crate::config::NetworkConfig;

/// Connection counts published after every manager event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerManagerStats {
    /// Live sessions, inbound and outbound
    pub active: usize,
    /// Outbound connects in flight
    pub dialing: usize,
    /// Inbound connections closed because the session ceiling was reached
    pub rejected: u64,
}

/// Read-only view of a running peer manager.
#[derive(Debug, Clone)]
pub struct PeerManagerHandle {
    local_addr: SocketAddr,
    stats: watch::Receiver<PeerManagerStats>,
}

impl PeerManagerHandle {
    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Latest published counts.
    pub fn stats(&self) -> PeerManagerStats {
        *self.stats.borrow()
    }

    /// Subscribes to count changes.
    pub fn subscribe(&self) -> watch::Receiver<PeerManagerStats> {
        self.stats.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug)]
struct LivePeer {
    address: SocketAddr,
    direction: Direction,
    connected_at: Instant,
}

type DialResult = (SocketAddr, Result<TcpStream, TorrentError>);

/// Supervises every peer session of one download.
pub struct PeerManager {
    listener: TcpListener,
    addresses: mpsc::Receiver<SocketAddr>,
    context: SessionContext,
    max_peer_connections: usize,
    max_outbound_dials: usize,
    connect_timeout: Duration,
    deaths_tx: mpsc::UnboundedSender<SessionClosed>,
    deaths: mpsc::UnboundedReceiver<SessionClosed>,
    dials: JoinSet<DialResult>,
    sessions: JoinSet<()>,
    live: HashMap<u64, LivePeer>,
    pending: HashSet<SocketAddr>,
    next_session_id: u64,
    rejected: u64,
    stats: watch::Sender<PeerManagerStats>,
}

impl PeerManager {
    /// Creates a manager for `listener`, fed by `addresses`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::Io` - If the listener address cannot be read
    pub fn new(
        listener: TcpListener,
        addresses: mpsc::Receiver<SocketAddr>,
        context: SessionContext,
        config: &NetworkConfig,
    ) -> Result<(Self, PeerManagerHandle), TorrentError> {
        let local_addr = listener.local_addr()?;
        let (stats, stats_rx) = watch::channel(PeerManagerStats::default());
        let (deaths_tx, deaths) = mpsc::unbounded_channel();

        let manager = Self {
            listener,
            addresses,
            context,
            max_peer_connections: config.max_peer_connections,
            max_outbound_dials: config.max_outbound_dials,
            connect_timeout: config.connect_timeout,
            deaths_tx,
            deaths,
            dials: JoinSet::new(),
            sessions: JoinSet::new(),
            live: HashMap::new(),
            pending: HashSet::new(),
            next_session_id: 0,
            rejected: 0,
            stats,
        };
        let handle = PeerManagerHandle {
            local_addr,
            stats: stats_rx,
        };
        Ok((manager, handle))
    }

    /// Runs until the task is aborted. Dropping the manager aborts every
    /// session it spawned.
    pub async fn run(mut self) {
        tracing::info!(
            "Peer manager listening on {} (max {} peers, {} concurrent dials)",
            self.listener.local_addr().map_or_else(|e| e.to_string(), |a| a.to_string()),
            self.max_peer_connections,
            self.max_outbound_dials
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, address)) => self.admit_inbound(stream, address),
                    Err(e) => tracing::warn!("Accept failed: {e}"),
                },
                Some(address) = self.addresses.recv() => self.consider_dial(address),
                Some(closed) = self.deaths.recv() => self.on_session_closed(closed),
                Some(joined) = self.dials.join_next(), if !self.dials.is_empty() => {
                    self.on_dial_finished(joined);
                }
                Some(_) = self.sessions.join_next(), if !self.sessions.is_empty() => {}
            }
            self.publish_stats();
        }
    }

    fn admit_inbound(&mut self, stream: TcpStream, address: SocketAddr) {
        if self.live.len() >= self.max_peer_connections {
            tracing::debug!(peer = %address, "Rejecting inbound peer: at session ceiling");
            self.rejected += 1;
            drop(stream);
            return;
        }

        tracing::debug!(peer = %address, "Accepted inbound peer");
        self.spawn_session(stream, address, Direction::Inbound);
    }

    fn consider_dial(&mut self, address: SocketAddr) {
        if self.pending.contains(&address) || self.live.values().any(|p| p.address == address) {
            tracing::trace!(peer = %address, "Skipping address: already connected");
            return;
        }

        let dialing = self.dials.len();
        if dialing >= self.max_outbound_dials
            || self.live.len() + dialing >= self.max_peer_connections
        {
            tracing::trace!(peer = %address, "Dropping address: no dial capacity");
            self.context.counters.record_address_dropped();
            return;
        }

        self.pending.insert(address);
        let connect_timeout = self.connect_timeout;
        self.dials.spawn(async move {
            let result = match tokio::time::timeout(connect_timeout, TcpStream::connect(address))
                .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(TorrentError::Io(e)),
                Err(_) => Err(TorrentError::Timeout {
                    operation: "connect",
                }),
            };
            (address, result)
        });
    }

    fn on_dial_finished(&mut self, joined: Result<DialResult, JoinError>) {
        let (address, result) = match joined {
            Ok(finished) => finished,
            Err(e) => {
                tracing::warn!("Dial task failed: {e}");
                return;
            }
        };
        self.pending.remove(&address);

        match result {
            Ok(stream) if self.live.len() < self.max_peer_connections => {
                tracing::debug!(peer = %address, "Connected to peer");
                self.spawn_session(stream, address, Direction::Outbound);
            }
            Ok(_) => tracing::debug!(peer = %address, "Closing dial: session ceiling reached"),
            Err(e) => tracing::debug!(peer = %address, "Dial failed: {e}"),
        }
    }

    fn spawn_session(&mut self, stream: TcpStream, address: SocketAddr, direction: Direction) {
        let session_id = self.next_session_id;
        self.next_session_id += 1;

        let session = PeerSession::new(
            session_id,
            address,
            stream,
            self.context.clone(),
            self.deaths_tx.clone(),
        );
        self.sessions.spawn(session.run());
        self.live.insert(
            session_id,
            LivePeer {
                address,
                direction,
                connected_at: Instant::now(),
            },
        );
    }

    fn on_session_closed(&mut self, closed: SessionClosed) {
        if let Some(peer) = self.live.remove(&closed.session_id) {
            tracing::debug!(
                peer = %closed.address,
                "{:?} session {} ended after {:?}: {}",
                peer.direction,
                closed.session_id,
                peer.connected_at.elapsed(),
                closed.reason
            );
        }
    }

    fn publish_stats(&self) {
        self.stats.send_if_modified(|stats| {
            let next = PeerManagerStats {
                active: self.live.len(),
                dialing: self.dials.len(),
                rejected: self.rejected,
            };
            let changed = *stats != next;
            *stats = next;
            changed
        });
    }
}
