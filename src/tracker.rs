//! HTTP tracker client
//!
//! Announces our state to a tracker over HTTP GET and turns the bencoded
//! response into peer endpoints. Each tracker is owned by a single task;
//! the announce cadence honors the tracker-supplied interval, with a
//! backoff window for failed attempts.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Deserialize;
use serde_bencode::de;
use serde_bencode::value::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::TorrentError;
use crate::event::{Event, EventSender};
use crate::storage::PieceStore;

/// Announce interval until the tracker tells us otherwise
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Retry window after a failed announce
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(15);

/// HTTP request budget
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle event reported with an announce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Paused,
    Stopped,
}

impl AnnounceEvent {
    fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Paused => "paused",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// What became of one announce attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// The rate rule held the request back
    Suppressed,
    /// A request went out and the response was ingested
    Announced,
    /// A request went out but failed or could not be parsed
    Failed,
}

/// Transfer totals reported to the tracker
#[derive(Debug, Clone, Copy)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Bencoded announce response
#[derive(Debug, Deserialize)]
struct AnnounceResponse {
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

impl AnnounceResponse {
    /// Decode the peer list, compact or dictionary form
    fn peers(&self) -> Vec<SocketAddr> {
        let mut result = Vec::new();
        match &self.peers {
            Some(Value::Bytes(data)) => {
                // compact form, 6 bytes per peer: IPv4 then big-endian port
                for chunk in data.chunks_exact(6) {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    result.push(SocketAddr::new(IpAddr::V4(ip), port));
                }
            }
            Some(Value::List(list)) => {
                for item in list {
                    let Value::Dict(dict) = item else { continue };
                    let ip = dict
                        .get(b"ip".as_ref())
                        .and_then(|v| match v {
                            Value::Bytes(b) => String::from_utf8(b.clone()).ok(),
                            _ => None,
                        })
                        .and_then(|s| s.parse::<Ipv4Addr>().ok());
                    let port = dict.get(b"port".as_ref()).and_then(|v| match v {
                        Value::Int(n) if (0..=i64::from(u16::MAX)).contains(n) => Some(*n as u16),
                        _ => None,
                    });
                    if let (Some(ip), Some(port)) = (ip, port) {
                        result.push(SocketAddr::new(IpAddr::V4(ip), port));
                    }
                }
            }
            _ => {}
        }
        result
    }
}

/// One tracker and its announce state
pub struct Tracker {
    url: String,
    http: reqwest::Client,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    interval: Duration,
    backoff: Duration,
    last_request_at: Option<Instant>,
    last_success_at: Option<Instant>,
    events: EventSender,
}

impl Tracker {
    /// Create a tracker client for one announce URL
    pub fn new(
        url: impl Into<String>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        port: u16,
        events: EventSender,
    ) -> Result<Self> {
        let url = url.into();
        Url::parse(&url).map_err(|e| {
            TorrentError::malformed_with_source(
                format!("Invalid tracker URL '{}'", url),
                e.to_string(),
            )
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(TorrentError::from)?;
        Ok(Self {
            url,
            http,
            info_hash,
            peer_id,
            port,
            interval: DEFAULT_ANNOUNCE_INTERVAL,
            backoff: DEFAULT_FAILURE_BACKOFF,
            last_request_at: None,
            last_success_at: None,
            events,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Percent-encode raw bytes for the query string
    fn percent_encode(bytes: &[u8; 20]) -> String {
        bytes.iter().map(|b| format!("%{:02X}", b)).collect()
    }

    /// Whether the rate rule lets this announce through: the interval
    /// after a success is respected, but a failed attempt opens a retry
    /// once the backoff has elapsed. Non-Started events always pass.
    fn should_announce(&self, event: AnnounceEvent, now: Instant) -> bool {
        if event != AnnounceEvent::Started {
            return true;
        }
        let within_interval = self
            .last_success_at
            .map_or(false, |t| now.duration_since(t) < self.interval);
        let within_backoff = self
            .last_request_at
            .map_or(false, |t| now.duration_since(t) < self.backoff);
        !(within_interval && within_backoff)
    }

    fn build_url(&self, stats: AnnounceStats, event: AnnounceEvent) -> String {
        let params = [
            ("info_hash", Self::percent_encode(&self.info_hash)),
            ("peer_id", Self::percent_encode(&self.peer_id)),
            ("port", self.port.to_string()),
            ("uploaded", stats.uploaded.to_string()),
            ("downloaded", stats.downloaded.to_string()),
            ("left", stats.left.to_string()),
            ("event", event.as_str().to_string()),
            ("compact", "1".to_string()),
        ];
        let query = params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.url, separator, query)
    }

    /// Announce once. Failures are logged, never propagated; a failed or
    /// unparseable response leaves the interval and backoff untouched.
    pub async fn announce(&mut self, stats: AnnounceStats, event: AnnounceEvent) -> AnnounceOutcome {
        if !self.should_announce(event, Instant::now()) {
            debug!("Suppressing {} announce to {}", event.as_str(), self.url);
            return AnnounceOutcome::Suppressed;
        }
        self.last_request_at = Some(Instant::now());
        let url = self.build_url(stats, event);
        debug!("Announcing to {}", url);

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Announce to {} failed: {}", self.url, e);
                return AnnounceOutcome::Failed;
            }
        };
        if !response.status().is_success() {
            warn!("Tracker {} answered {}", self.url, response.status());
            return AnnounceOutcome::Failed;
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!("Reading tracker response from {} failed: {}", self.url, e);
                return AnnounceOutcome::Failed;
            }
        };
        let parsed: AnnounceResponse = match de::from_bytes(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Unparseable tracker response from {}: {}", self.url, e);
                return AnnounceOutcome::Failed;
            }
        };
        if let Some(reason) = &parsed.failure_reason {
            warn!("Tracker {} rejected the announce: {}", self.url, reason);
            return AnnounceOutcome::Failed;
        }

        self.last_success_at = Some(Instant::now());
        if let Some(interval) = parsed.interval.filter(|&i| i > 0) {
            self.interval = Duration::from_secs(interval as u64);
        }
        self.backoff = std::cmp::max(self.interval, DEFAULT_FAILURE_BACKOFF);

        let peers = parsed.peers();
        info!("Tracker {} returned {} peers", self.url, peers.len());
        let _ = self.events.send(Event::PeerListUpdated(peers));
        AnnounceOutcome::Announced
    }

    /// Announce loop: `Started` on a cadence until shutdown, then a final
    /// `Stopped`. The tracker is single-task owned for its whole life.
    pub async fn run(mut self, store: Arc<PieceStore>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let outcome = self.announce(self.stats_from(&store), AnnounceEvent::Started).await;
            let wait = match outcome {
                AnnounceOutcome::Failed => self.backoff,
                _ => self.interval,
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {
                    self.announce(self.stats_from(&store), AnnounceEvent::Stopped).await;
                    debug!("Tracker task for {} stopped", self.url);
                    return;
                }
            }
        }
    }

    fn stats_from(&self, store: &PieceStore) -> AnnounceStats {
        AnnounceStats {
            uploaded: store.uploaded(),
            downloaded: store.downloaded(),
            left: store.left(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const STATS: AnnounceStats = AnnounceStats { uploaded: 10, downloaded: 20, left: 30 };

    fn tracker(url: &str) -> Tracker {
        let (tx, _rx) = event::channel();
        Tracker::new(url, [1u8; 20], [2u8; 20], 6881, tx).unwrap()
    }

    /// Canned HTTP tracker: counts hits, records request lines, always
    /// answers with one compact peer and an 1800 s interval
    async fn spawn_tracker_stub() -> (SocketAddr, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let task_hits = hits.clone();
        let task_lines = lines.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                task_hits.fetch_add(1, Ordering::SeqCst);
                let mut request = Vec::new();
                let mut byte = [0u8; 1];
                while !request.ends_with(b"\r\n\r\n") {
                    if sock.read_exact(&mut byte).await.is_err() {
                        break;
                    }
                    request.push(byte[0]);
                }
                let request = String::from_utf8_lossy(&request).to_string();
                if let Some(line) = request.lines().next() {
                    task_lines.lock().unwrap().push(line.to_string());
                }
                let mut body = b"d8:intervali1800e5:peers6:".to_vec();
                body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
                body.extend_from_slice(b"e");
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(header.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.flush().await;
            }
        });
        (addr, hits, lines)
    }

    #[test]
    fn test_percent_encode_raw_bytes() {
        let mut bytes = [0u8; 20];
        bytes[0] = 0x00;
        bytes[1] = 0xff;
        bytes[2] = b'A';
        let encoded = Tracker::percent_encode(&bytes);
        assert!(encoded.starts_with("%00%FF%41"));
        assert_eq!(encoded.len(), 60);
    }

    #[test]
    fn test_rejects_invalid_url() {
        let (tx, _rx) = event::channel();
        assert!(Tracker::new("not a url", [0u8; 20], [0u8; 20], 1, tx).is_err());
    }

    #[test]
    fn test_rate_rule() {
        let mut t = tracker("http://127.0.0.1:1/announce");
        let now = Instant::now();

        // fresh tracker announces
        assert!(t.should_announce(AnnounceEvent::Started, now));

        // right after a success the interval is respected
        t.last_request_at = Some(now);
        t.last_success_at = Some(now);
        t.interval = Duration::from_secs(1800);
        t.backoff = Duration::from_secs(1800);
        assert!(!t.should_announce(AnnounceEvent::Started, now + Duration::from_secs(5)));
        assert!(t.should_announce(AnnounceEvent::Started, now + Duration::from_secs(1801)));

        // a failed attempt mid-interval: wait out the backoff, then retry
        t.backoff = Duration::from_secs(15);
        t.last_request_at = Some(now + Duration::from_secs(60));
        assert!(!t.should_announce(AnnounceEvent::Started, now + Duration::from_secs(65)));
        assert!(t.should_announce(AnnounceEvent::Started, now + Duration::from_secs(76)));

        // non-Started events always pass
        t.last_request_at = Some(now);
        t.backoff = Duration::from_secs(1800);
        assert!(t.should_announce(AnnounceEvent::Stopped, now + Duration::from_secs(1)));
        assert!(t.should_announce(AnnounceEvent::Paused, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_build_url_query() {
        let t = tracker("http://tracker.example/announce");
        let url = t.build_url(STATS, AnnounceEvent::Started);
        assert!(url.starts_with("http://tracker.example/announce?info_hash=%01"));
        assert!(url.contains("peer_id=%02"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=10"));
        assert!(url.contains("downloaded=20"));
        assert!(url.contains("left=30"));
        assert!(url.contains("event=started"));
        assert!(url.contains("compact=1"));
    }

    #[test]
    fn test_compact_peer_list() {
        let body = {
            let mut b = b"d8:intervali900e5:peers12:".to_vec();
            b.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]);
            b.extend_from_slice(b"e");
            b
        };
        let parsed: AnnounceResponse = de::from_bytes(&body).unwrap();
        assert_eq!(parsed.interval, Some(900));
        assert_eq!(
            parsed.peers(),
            vec![
                "10.0.0.1:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:6882".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_dictionary_peer_list() {
        let body = b"d8:intervali900e5:peersld2:ip8:10.0.0.34:porti6883eeee";
        let parsed: AnnounceResponse = de::from_bytes(body).unwrap();
        assert_eq!(parsed.peers(), vec!["10.0.0.3:6883".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_compact_ignores_trailing_partial_entry() {
        let mut body = b"d5:peers8:".to_vec();
        body.extend_from_slice(&[10, 0, 0, 1, 0x1a, 0xe1, 9, 9]);
        body.extend_from_slice(b"e");
        let parsed: AnnounceResponse = de::from_bytes(&body).unwrap();
        assert_eq!(parsed.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_started_announces_are_rate_limited() {
        let (addr, hits, lines) = spawn_tracker_stub().await;
        let (tx, mut rx) = event::channel();
        let mut t =
            Tracker::new(format!("http://{}/announce", addr), [1u8; 20], [2u8; 20], 6881, tx)
                .unwrap();

        // first Started goes out and ingests the peer list
        assert_eq!(t.announce(STATS, AnnounceEvent::Started).await, AnnounceOutcome::Announced);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(t.interval, Duration::from_secs(1800));
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::PeerListUpdated(vec!["127.0.0.1:6881".parse().unwrap()])
        );

        // a second Started within the interval is suppressed
        assert_eq!(t.announce(STATS, AnnounceEvent::Started).await, AnnounceOutcome::Suppressed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Stopped during the interval still goes out
        assert_eq!(t.announce(STATS, AnnounceEvent::Stopped).await, AnnounceOutcome::Announced);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let lines = lines.lock().unwrap();
        assert!(lines[0].contains("info_hash=%01"));
        assert!(lines[0].contains("event=started"));
        assert!(lines[1].contains("event=stopped"));
    }

    #[tokio::test]
    async fn test_unreachable_tracker_fails_quietly() {
        // nothing listens on this port
        let mut t = tracker("http://127.0.0.1:9/announce");
        assert_eq!(t.announce(STATS, AnnounceEvent::Started).await, AnnounceOutcome::Failed);
        assert_eq!(t.interval, DEFAULT_ANNOUNCE_INTERVAL);
        assert_eq!(t.backoff, DEFAULT_FAILURE_BACKOFF);
    }
}
