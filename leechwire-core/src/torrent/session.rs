//! Per-peer session: handshake, then three cooperating loops.
//!
//! After a successful handshake a session runs a receive loop, a send loop
//! and a request pump concurrently inside its own task. The first one to
//! finish ends the session: the others are dropped, the connection closes and
//! the peer manager receives exactly one [`SessionClosed`] notice.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::engine::DownloadContext;
use super::orchestrator::{BlockRequest, ReceivedBlock};
use super::protocol::{PeerId, PeerMessage, PeerState, handshake, read_message, write_message};
use super::stats::DropCounters;
use super::{PieceBitset, TorrentError};
use crate::config::LeechwireConfig;

/// Shared handles every session needs. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub download: Arc<DownloadContext>,
    pub config: Arc<LeechwireConfig>,
    /// Sessions -> orchestrator block channel
    pub blocks: mpsc::Sender<ReceivedBlock>,
    /// Orchestrator -> sessions request queue, shared by every session
    pub requests: Arc<Mutex<mpsc::Receiver<BlockRequest>>>,
    pub counters: DropCounters,
}

/// Death notice sent to the peer manager when a session ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionClosed {
    pub session_id: u64,
    pub address: SocketAddr,
    pub reason: String,
}

/// Sends the death notice when dropped, so every exit path reports once.
struct DeathNotice {
    session_id: u64,
    address: SocketAddr,
    reason: Option<String>,
    deaths: mpsc::UnboundedSender<SessionClosed>,
}

impl DeathNotice {
    fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }
}

impl Drop for DeathNotice {
    fn drop(&mut self) {
        let reason = self
            .reason
            .take()
            .unwrap_or_else(|| "session aborted".to_string());
        // Manager already gone during shutdown; nothing left to tell.
        let _ = self.deaths.send(SessionClosed {
            session_id: self.session_id,
            address: self.address,
            reason,
        });
    }
}

/// One connection to a remote peer.
pub struct PeerSession<S> {
    address: SocketAddr,
    stream: S,
    context: SessionContext,
    state: PeerState,
    /// Whether we have told the peer we want its pieces
    interested: bool,
    notice: DeathNotice,
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an already connected stream.
    pub fn new(
        session_id: u64,
        address: SocketAddr,
        stream: S,
        context: SessionContext,
        deaths: mpsc::UnboundedSender<SessionClosed>,
    ) -> Self {
        Self {
            address,
            stream,
            context,
            state: PeerState::Connecting,
            interested: false,
            notice: DeathNotice {
                session_id,
                address,
                reason: None,
                deaths,
            },
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Whether `Interested` has been queued for the peer.
    pub fn is_interested(&self) -> bool {
        self.interested
    }

    /// Runs the session to completion. Errors never escape; they become the
    /// close reason carried by the death notice.
    pub async fn run(mut self) {
        let reason = match self.drive().await {
            Ok(reason) => {
                tracing::debug!(peer = %self.address, "Session closed: {reason}");
                reason.to_string()
            }
            Err(e) if e.is_connection_fatal() => {
                tracing::debug!(peer = %self.address, "Session closed: {e}");
                e.to_string()
            }
            Err(e) => {
                tracing::warn!(peer = %self.address, "Session failed: {e}");
                e.to_string()
            }
        };

        self.transition(PeerState::Closed);
        self.notice.set_reason(reason);
    }

    async fn drive(&mut self) -> Result<&'static str, TorrentError> {
        self.transition(PeerState::Handshaking);
        let download = Arc::clone(&self.context.download);
        let remote_id = handshake(
            &mut self.stream,
            download.info_hash,
            download.peer_id,
            self.context.config.network.handshake_timeout,
        )
        .await?;

        self.transition(PeerState::Active);
        tracing::debug!(peer = %self.address, "Handshake complete with {remote_id}");
        self.exchange(remote_id).await
    }

    async fn exchange(&mut self, remote_id: PeerId) -> Result<&'static str, TorrentError> {
        let network = &self.context.config.network;
        let (outgoing_tx, outgoing_rx) = mpsc::channel(network.session_queue_capacity.max(2));
        let (choked_tx, choked_rx) = watch::channel(true);

        let bitfield = PieceBitset::new(self.context.download.piece_count() as usize).to_bytes();
        let opening = [PeerMessage::Bitfield { bitfield }, PeerMessage::Interested];
        for message in opening {
            if outgoing_tx.send(message).await.is_err() {
                return Ok("outgoing queue closed");
            }
        }
        self.interested = true;

        let (reader, writer) = tokio::io::split(&mut self.stream);
        let receive = receive_loop(reader, &self.context, choked_tx);
        let send = send_loop(writer, outgoing_rx, &self.context.config);
        let pump = request_pump(&self.context, choked_rx, outgoing_tx);

        tracing::trace!(peer = %self.address, "Exchanging messages with {remote_id}");
        tokio::select! {
            result = receive => result,
            result = send => result,
            result = pump => result,
        }
    }

    fn transition(&mut self, next: PeerState) {
        tracing::trace!(peer = %self.address, "{:?} -> {next:?}", self.state);
        self.state = next;
    }
}

/// Reads messages until the peer goes silent, misbehaves or disconnects.
async fn receive_loop<R>(
    mut reader: ReadHalf<R>,
    context: &SessionContext,
    choked: watch::Sender<bool>,
) -> Result<&'static str, TorrentError>
where
    R: AsyncRead,
{
    let keep_alive_timeout = context.config.network.keep_alive_timeout;

    loop {
        let message = time::timeout(keep_alive_timeout, read_message(&mut reader))
            .await
            .map_err(|_| TorrentError::Timeout { operation: "read" })??;

        match message {
            PeerMessage::Choke => {
                choked.send_replace(true);
            }
            PeerMessage::Unchoke => {
                choked.send_replace(false);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                let block = ReceivedBlock {
                    piece_index,
                    offset,
                    data,
                };
                match context.blocks.try_send(block) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => context.counters.record_piece_dropped(),
                    Err(TrySendError::Closed(_)) => return Ok("download finished"),
                }
            }
            other => tracing::trace!("Ignoring {} message", other.kind()),
        }
    }
}

/// Writes queued messages in order, sending keep-alives when idle.
async fn send_loop<W>(
    mut writer: WriteHalf<W>,
    mut outgoing: mpsc::Receiver<PeerMessage>,
    config: &LeechwireConfig,
) -> Result<&'static str, TorrentError>
where
    W: AsyncWrite,
{
    let period = config.network.keep_alive_interval;
    let write_timeout = config.network.write_timeout;
    let mut keep_alive = time::interval_at(Instant::now() + period, period);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let message = tokio::select! {
            queued = outgoing.recv() => match queued {
                Some(message) => message,
                None => return Ok("outgoing queue closed"),
            },
            _ = keep_alive.tick() => PeerMessage::KeepAlive,
        };

        time::timeout(write_timeout, write_message(&mut writer, &message))
            .await
            .map_err(|_| TorrentError::Timeout { operation: "write" })??;
        keep_alive.reset();
    }
}

/// Moves at most one request per tick from the shared queue to this peer,
/// and only while the peer has us unchoked.
async fn request_pump(
    context: &SessionContext,
    choked: watch::Receiver<bool>,
    outgoing: mpsc::Sender<PeerMessage>,
) -> Result<&'static str, TorrentError> {
    let mut ticker = time::interval(context.config.torrent.scheduler_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if *choked.borrow() {
            continue;
        }

        let next = match context.requests.try_lock() {
            Ok(mut queue) => queue.try_recv(),
            Err(_) => continue,
        };

        match next {
            Ok(request) => {
                if outgoing.send(PeerMessage::from(request)).await.is_err() {
                    return Ok("send loop stopped");
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => return Ok("download finished"),
        }
    }
}
