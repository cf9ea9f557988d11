//! HTTP tracker client implementation with URL building and response parsing

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: String,
    numwant: u32,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates HTTP tracker client for `announce_url`.
    ///
    /// Uses network configuration for timeout, user agent and peer count.
    ///
    /// # Errors
    ///
    /// - `TorrentError::UrlParsing` - If the announce URL is not a valid URL
    /// - `TorrentError::Http` - If the HTTP client could not be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        url::Url::parse(&announce_url)?;

        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            numwant: config.numwant,
            client,
        })
    }

    /// Build announce URL with query parameters.
    ///
    /// Binary fields are percent-encoded byte by byte; reqwest's own query
    /// encoding would treat them as UTF-8 text.
    pub fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            url_encode_bytes(request.info_hash.as_bytes()),
            url_encode_bytes(request.peer_id.as_bytes()),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            self.numwant,
        );

        if let Some(event) = request.event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }

        if let Some(tracker_id) = &request.tracker_id {
            query.push_str("&trackerid=");
            query.push_str(&url_encode_bytes(tracker_id.as_bytes()));
        }

        let separator = if self.announce_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{separator}{query}", self.announce_url)
    }

    fn unavailable(&self, reason: impl Into<String>) -> TorrentError {
        TorrentError::TrackerUnavailable {
            url: self.announce_url.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!("Announcing to tracker: {}", self.announce_url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.unavailable(format!("HTTP status {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.unavailable(format!("failed to read response body: {e}")))?;

        let announce = parse_announce_response(&body).map_err(|e| match e {
            TorrentError::TrackerUnavailable { reason, .. } => self.unavailable(reason),
            other => other,
        })?;

        if let Some(warning) = &announce.warning {
            tracing::warn!("Tracker {} warning: {warning}", self.announce_url);
        }

        tracing::debug!(
            "Tracker {} returned {} peers ({} seeders, {} leechers)",
            self.announce_url,
            announce.peers.len(),
            announce.complete,
            announce.incomplete
        );
        Ok(announce)
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}

/// URL encode every byte as `%XX`.
fn url_encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| format!("%{b:02X}")).collect()
}

/// Parse compact peer list: 4 bytes IPv4 then 2 bytes big-endian port.
///
/// # Errors
///
/// - `TorrentError::ProtocolViolation` - If the length is not a multiple of 6
pub fn parse_compact_peers(peer_bytes: &[u8]) -> Result<Vec<SocketAddr>, TorrentError> {
    if !peer_bytes.len().is_multiple_of(6) {
        return Err(TorrentError::ProtocolViolation {
            message: format!(
                "compact peer list of {} bytes is not a multiple of 6",
                peer_bytes.len()
            ),
        });
    }

    Ok(peer_bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Parse a bencoded announce response.
///
/// # Errors
///
/// - `TorrentError::TrackerUnavailable` - If the tracker sent a failure reason
/// - `TorrentError::ProtocolViolation` - If the body is not a valid response
pub fn parse_announce_response(response_bytes: &[u8]) -> Result<AnnounceResponse, TorrentError> {
    let parsed = bencode_rs::Value::parse(response_bytes).map_err(|e| {
        TorrentError::ProtocolViolation {
            message: format!("Failed to parse tracker response: {e:?}"),
        }
    })?;

    let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
        return Err(TorrentError::ProtocolViolation {
            message: "Tracker response is not a dictionary".to_string(),
        });
    };

    let text = |key: &[u8]| match dict.get(key) {
        Some(bencode_rs::Value::Bytes(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
        _ => None,
    };
    let integer = |key: &[u8]| match dict.get(key) {
        Some(bencode_rs::Value::Integer(value)) => u32::try_from(*value).ok(),
        _ => None,
    };

    if let Some(reason) = text(b"failure reason") {
        return Err(TorrentError::TrackerUnavailable {
            url: String::new(),
            reason,
        });
    }

    let interval = integer(b"interval").ok_or_else(|| TorrentError::ProtocolViolation {
        message: "Missing interval in tracker response".to_string(),
    })?;

    let peers = match dict.get(b"peers".as_slice()) {
        Some(bencode_rs::Value::Bytes(peer_data)) => parse_compact_peers(peer_data)?,
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        min_interval: integer(b"min interval"),
        tracker_id: text(b"tracker id"),
        complete: integer(b"complete").unwrap_or(0),
        incomplete: integer(b"incomplete").unwrap_or(0),
        warning: text(b"warning message"),
        peers,
    })
}
