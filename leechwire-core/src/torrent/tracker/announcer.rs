//! Periodic announce loop feeding discovered peers to the peer manager.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use super::types::{AnnounceEvent, AnnounceRequest, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::engine::DownloadContext;
use crate::torrent::orchestrator::DownloadProgress;
use crate::torrent::stats::DropCounters;
use crate::torrent::TorrentError;

/// Announces to one tracker for the lifetime of a download.
///
/// Tracker failures are never fatal: they are logged and retried after
/// `announce_retry_interval`.
pub struct Announcer<C> {
    client: C,
    context: Arc<DownloadContext>,
    progress: watch::Receiver<DownloadProgress>,
    addresses: mpsc::Sender<SocketAddr>,
    counters: DropCounters,
    max_interval: Duration,
    retry_interval: Duration,
    started_sent: bool,
    completed_sent: bool,
    tracker_id: Option<String>,
}

impl<C: TrackerClient> Announcer<C> {
    pub fn new(
        client: C,
        context: Arc<DownloadContext>,
        progress: watch::Receiver<DownloadProgress>,
        addresses: mpsc::Sender<SocketAddr>,
        counters: DropCounters,
        config: &NetworkConfig,
    ) -> Self {
        Self {
            client,
            context,
            progress,
            addresses,
            counters,
            max_interval: config.announce_interval,
            retry_interval: config.announce_retry_interval,
            started_sent: false,
            completed_sent: false,
            tracker_id: None,
        }
    }

    /// Announces until `stop` fires or the peer manager stops accepting
    /// addresses.
    ///
    /// The last piece being written triggers an immediate `completed`
    /// announce instead of waiting out the interval. When `stop` fires a
    /// `stopped` announce is sent before returning.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        while !self.addresses.is_closed() {
            let (wait, announced) = match self.announce_once().await {
                Ok(wait) => (wait, true),
                Err(e) => {
                    tracing::warn!("Announce to {} failed: {e}", self.client.tracker_url());
                    (self.retry_interval, false)
                }
            };

            let watch_completion = announced && !self.completed_sent;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = completion(&mut self.progress), if watch_completion => {
                    tracing::debug!("Last piece written, announcing completion");
                }
                _ = &mut stop => {
                    self.announce_stopped().await;
                    return;
                }
            }
        }

        tracing::debug!("Announcer stopped: peer manager is gone");
    }

    /// Tells the tracker we are leaving. Skipped if it never saw us.
    async fn announce_stopped(&mut self) {
        if !self.started_sent {
            return;
        }

        let progress = *self.progress.borrow();
        let request = self.request(&progress, Some(AnnounceEvent::Stopped));
        match self.client.announce(request).await {
            Ok(_) => tracing::info!("Announced stop to {}", self.client.tracker_url()),
            Err(e) => tracing::warn!("Stop announce to {} failed: {e}", self.client.tracker_url()),
        }
    }

    /// Performs one announce and forwards the returned peers.
    ///
    /// Returns how long to wait before the next announce.
    ///
    /// # Errors
    ///
    /// - Any error from the tracker client
    pub async fn announce_once(&mut self) -> Result<Duration, TorrentError> {
        let progress = *self.progress.borrow();
        let event = self.next_event(&progress);
        let request = self.request(&progress, event);

        let response = self.client.announce(request).await?;
        match event {
            Some(AnnounceEvent::Started) => self.started_sent = true,
            Some(AnnounceEvent::Completed) => self.completed_sent = true,
            _ => {}
        }
        if response.tracker_id.is_some() {
            self.tracker_id = response.tracker_id.clone();
        }

        tracing::info!(
            "Tracker returned {} peers ({} seeders, {} leechers)",
            response.peers.len(),
            response.complete,
            response.incomplete
        );
        self.forward_peers(&response.peers);

        let requested = response.interval.max(response.min_interval.unwrap_or(0));
        let wait = Duration::from_secs(u64::from(requested)).min(self.max_interval);
        Ok(if wait.is_zero() { self.max_interval } else { wait })
    }

    fn request(
        &self,
        progress: &DownloadProgress,
        event: Option<AnnounceEvent>,
    ) -> AnnounceRequest {
        AnnounceRequest {
            info_hash: self.context.info_hash,
            peer_id: self.context.peer_id,
            port: self.context.listen_port,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
            tracker_id: self.tracker_id.clone(),
        }
    }

    fn next_event(&self, progress: &DownloadProgress) -> Option<AnnounceEvent> {
        if !self.started_sent {
            Some(AnnounceEvent::Started)
        } else if progress.is_complete() && !self.completed_sent {
            Some(AnnounceEvent::Completed)
        } else {
            None
        }
    }

    fn forward_peers(&self, peers: &[SocketAddr]) {
        for &peer in peers {
            match self.addresses.try_send(peer) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.counters.record_address_dropped(),
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
}

/// Resolves once the download is complete; never if the orchestrator went
/// away before finishing.
async fn completion(progress: &mut watch::Receiver<DownloadProgress>) {
    if progress.wait_for(DownloadProgress::is_complete).await.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::torrent::tracker::AnnounceResponse;
    use crate::torrent::{InfoHash, PeerId};

    /// Tracker double replaying scripted results and recording requests.
    #[derive(Default)]
    struct ScriptedTracker {
        responses: Mutex<VecDeque<Result<AnnounceResponse, TorrentError>>>,
        requests: Arc<Mutex<Vec<AnnounceRequest>>>,
    }

    impl ScriptedTracker {
        fn with(responses: Vec<Result<AnnounceResponse, TorrentError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl TrackerClient for ScriptedTracker {
        async fn announce(
            &self,
            request: AnnounceRequest,
        ) -> Result<AnnounceResponse, TorrentError> {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(response(1800, &[])))
        }

        fn tracker_url(&self) -> &str {
            "http://tracker.test/announce"
        }
    }

    fn response(interval: u32, peers: &[&str]) -> AnnounceResponse {
        AnnounceResponse {
            interval,
            min_interval: None,
            tracker_id: None,
            complete: 1,
            incomplete: 0,
            warning: None,
            peers: peers.iter().map(|p| p.parse().unwrap()).collect(),
        }
    }

    fn unavailable() -> TorrentError {
        TorrentError::TrackerUnavailable {
            url: "http://tracker.test/announce".to_string(),
            reason: "connection refused".to_string(),
        }
    }

    fn context() -> Arc<DownloadContext> {
        Arc::new(DownloadContext {
            peer_id: PeerId::new([1u8; 20]),
            info_hash: InfoHash::new([2u8; 20]),
            announce_url: "http://tracker.test/announce".to_string(),
            name: "test.bin".to_string(),
            piece_length: 16,
            total_length: 32,
            piece_hashes: vec![[0u8; 20]; 2],
            listen_port: 6881,
        })
    }

    fn progress(completed_pieces: u32) -> DownloadProgress {
        DownloadProgress {
            downloaded: u64::from(completed_pieces) * 16,
            uploaded: 0,
            left: 32 - u64::from(completed_pieces) * 16,
            completed_pieces,
            total_pieces: 2,
        }
    }

    #[tokio::test]
    async fn test_started_event_only_on_first_announce() {
        let tracker = ScriptedTracker::with(vec![
            Ok(response(100, &["10.0.0.1:6881"])),
            Ok(response(100, &[])),
        ]);
        let requests = Arc::clone(&tracker.requests);
        let (_progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, mut addresses_rx) = mpsc::channel(8);
        let mut announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );

        announcer.announce_once().await.unwrap();
        announcer.announce_once().await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests[0].event, Some(AnnounceEvent::Started));
        assert_eq!(requests[0].left, 32);
        assert_eq!(requests[0].port, 6881);
        assert_eq!(requests[1].event, None);
        assert_eq!(
            addresses_rx.try_recv().unwrap(),
            "10.0.0.1:6881".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_failed_first_announce_resends_started() {
        let tracker = ScriptedTracker::with(vec![Err(unavailable()), Ok(response(100, &[]))]);
        let requests = Arc::clone(&tracker.requests);
        let (_progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, _addresses_rx) = mpsc::channel(8);
        let mut announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );

        assert!(announcer.announce_once().await.is_err());
        announcer.announce_once().await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests[1].event, Some(AnnounceEvent::Started));
    }

    #[tokio::test]
    async fn test_completed_event_reported_once() {
        let tracker = ScriptedTracker::default();
        let requests = Arc::clone(&tracker.requests);
        let (progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, _addresses_rx) = mpsc::channel(8);
        let mut announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );

        announcer.announce_once().await.unwrap();
        progress_tx.send_replace(progress(2));
        announcer.announce_once().await.unwrap();
        announcer.announce_once().await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests[1].event, Some(AnnounceEvent::Completed));
        assert_eq!(requests[1].left, 0);
        assert_eq!(requests[2].event, None);
    }

    #[tokio::test]
    async fn test_wait_respects_min_interval_and_ceiling() {
        let mut slow = response(60, &[]);
        slow.min_interval = Some(120);
        let tracker = ScriptedTracker::with(vec![Ok(slow), Ok(response(3600, &[]))]);
        let (_progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, _addresses_rx) = mpsc::channel(8);
        let mut announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );

        assert_eq!(
            announcer.announce_once().await.unwrap(),
            Duration::from_secs(120)
        );
        assert_eq!(
            announcer.announce_once().await.unwrap(),
            Duration::from_secs(200)
        );
    }

    #[tokio::test]
    async fn test_full_address_queue_drops_and_counts() {
        let tracker = ScriptedTracker::with(vec![Ok(response(
            100,
            &["10.0.0.1:1", "10.0.0.2:2", "10.0.0.3:3"],
        ))]);
        let counters = DropCounters::new();
        let (_progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, _addresses_rx) = mpsc::channel(1);
        let mut announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            counters.clone(),
            &NetworkConfig::default(),
        );

        announcer.announce_once().await.unwrap();

        assert_eq!(counters.snapshot().addresses_dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_after_failure() {
        let tracker = ScriptedTracker::with(vec![
            Err(unavailable()),
            Ok(response(100, &["10.0.0.9:6881"])),
        ]);
        let requests = Arc::clone(&tracker.requests);
        let (_progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, mut addresses_rx) = mpsc::channel(8);
        let announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );
        let (_stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(announcer.run(stop_rx));

        let peer = addresses_rx.recv().await.unwrap();

        assert_eq!(peer, "10.0.0.9:6881".parse::<SocketAddr>().unwrap());
        assert_eq!(requests.lock().unwrap().len(), 2);
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_announces_completion_without_waiting_interval() {
        let tracker = ScriptedTracker::with(vec![Ok(response(1800, &[]))]);
        let requests = Arc::clone(&tracker.requests);
        let (progress_tx, progress_rx) = watch::channel(progress(0));
        let (addresses_tx, _addresses_rx) = mpsc::channel(8);
        let announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );
        let (_stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(announcer.run(stop_rx));

        while requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        progress_tx.send_replace(progress(2));
        tokio::time::sleep(Duration::from_secs(1)).await;

        {
            let requests = requests.lock().unwrap();
            assert_eq!(requests.len(), 2);
            assert_eq!(requests[1].event, Some(AnnounceEvent::Completed));
        }
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_sends_stopped_event_and_returns() {
        let tracker = ScriptedTracker::default();
        let requests = Arc::clone(&tracker.requests);
        let (_progress_tx, progress_rx) = watch::channel(progress(1));
        let (addresses_tx, _addresses_rx) = mpsc::channel(8);
        let announcer = Announcer::new(
            tracker,
            context(),
            progress_rx,
            addresses_tx,
            DropCounters::new(),
            &NetworkConfig::default(),
        );
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(announcer.run(stop_rx));

        while requests.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }
        stop_tx.send(()).unwrap();
        task.await.unwrap();

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].event, Some(AnnounceEvent::Stopped));
        assert_eq!(requests[1].left, 16);
    }
}
