//! HTTP(S) tracker announces.
//!
//! Only HTTP trackers are spoken; UDP (BEP-15) announce URLs are skipped
//! during multiplexing. The `info_hash` and `peer_id` query parameters carry
//! raw bytes and are percent-encoded per byte, so the query string is built
//! by hand rather than through a URL library's pair encoder (which would
//! double-encode the percent signs).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_encode};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::bencode::{self, BencodeError, Value};
use crate::{PeerId, Sha1Hash};

/// Client identification prefix per BEP-20 conventions.
const PEER_ID_PREFIX: &[u8; 8] = b"-HT0100-";

/// Tracker connect and response-body deadline.
const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of peers requested per announce.
const NUMWANT: u32 = 50;

/// Percent-encode all non-alphanumeric bytes except `-._~`.
const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Result alias for tracker operations.
pub type Result<T> = std::result::Result<T, TrackerError>;

/// Errors raised while announcing.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The tracker answered with a `failure reason`.
    #[error("tracker reported failure: {0}")]
    Failure(String),
    /// The HTTP exchange failed.
    #[error("tracker HTTP error")]
    Http(#[from] reqwest::Error),
    /// The response body was not valid bencode.
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    /// The response was bencode but not a valid announce response.
    #[error("invalid tracker response: {reason}")]
    InvalidResponse {
        /// What was wrong with the document.
        reason: &'static str,
    },
    /// Every configured tracker failed; carries the last error seen.
    #[error("all trackers failed; last error: {last}")]
    AllFailed {
        /// Stringified final error.
        last: String,
    },
    /// The metadata listed no HTTP(S) trackers at all.
    #[error("no usable HTTP trackers configured")]
    NoUsableTrackers,
}

/// Optional announce events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnounceEvent {
    /// First announce of a download.
    Started,
    /// The download just reached 100%.
    Completed,
    /// The client is going away.
    Stopped,
}

impl AnnounceEvent {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// Transfer statistics reported with an announce.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnounceRequest {
    /// Total payload bytes uploaded (always 0 for this leecher).
    pub uploaded: u64,
    /// Total payload bytes downloaded so far.
    pub downloaded: u64,
    /// Payload bytes still missing.
    pub left: u64,
    /// Lifecycle event, when applicable.
    pub event: Option<AnnounceEvent>,
}

/// A parsed announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Re-announce interval requested by the tracker.
    pub interval: Option<Duration>,
    /// Peers returned by the tracker.
    pub peers: Vec<SocketAddr>,
}

/// Generate a fresh local peer id: the client prefix plus 12 random bytes.
#[must_use]
pub fn generate_peer_id() -> PeerId {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);
    peer_id
}

/// HTTP announce client for one torrent.
#[derive(Clone)]
pub struct TrackerClient {
    http: reqwest::Client,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
}

impl TrackerClient {
    /// Build a client announcing `info_hash` as `peer_id` on `port`.
    ///
    /// # Errors
    ///
    /// Fails if the underlying HTTP client cannot be constructed.
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId, port: u16) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(TRACKER_TIMEOUT)
            .timeout(TRACKER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            info_hash,
            peer_id,
            port,
        })
    }

    /// Announce to a single tracker and parse the bencoded response.
    ///
    /// # Errors
    ///
    /// Fails on HTTP errors, non-2xx statuses, undecodable bodies, and
    /// tracker-reported failures.
    pub async fn announce(
        &self,
        tracker_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let url = self.build_announce_url(tracker_url, request);
        debug!(tracker = tracker_url, "announcing");
        let response = self.http.get(url).send().await?.error_for_status()?;
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }

    /// Announce against the tracker list in metadata order.
    ///
    /// Non-HTTP(S) URLs are skipped; the first tracker that yields a
    /// parseable 200 wins and the last error is surfaced otherwise.
    ///
    /// # Errors
    ///
    /// [`TrackerError::NoUsableTrackers`] when nothing in the list speaks
    /// HTTP, [`TrackerError::AllFailed`] when every usable tracker errored.
    pub async fn announce_any(
        &self,
        trackers: &[String],
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let mut last_error: Option<TrackerError> = None;
        let mut usable = false;

        for tracker in trackers {
            if !is_http_tracker(tracker) {
                debug!(tracker, "skipping non-HTTP tracker");
                continue;
            }
            usable = true;
            match self.announce(tracker, request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(tracker, error = %err, "tracker announce failed");
                    last_error = Some(err);
                }
            }
        }

        if !usable {
            return Err(TrackerError::NoUsableTrackers);
        }
        Err(TrackerError::AllFailed {
            last: last_error.map_or_else(String::new, |err| err.to_string()),
        })
    }

    fn build_announce_url(&self, tracker_url: &str, request: &AnnounceRequest) -> String {
        let separator = if tracker_url.contains('?') { '&' } else { '?' };
        let mut url = format!(
            "{tracker_url}{separator}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={NUMWANT}",
            percent_encode(&self.info_hash, URL_ENCODE_RESERVED),
            percent_encode(&self.peer_id, URL_ENCODE_RESERVED),
            self.port,
            request.uploaded,
            request.downloaded,
            request.left,
        );
        if let Some(event) = request.event {
            url.push_str("&event=");
            url.push_str(event.as_str());
        }
        url
    }
}

fn is_http_tracker(tracker: &str) -> bool {
    Url::parse(tracker)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let document = bencode::decode(body)?;
    if document.as_dict().is_none() {
        return Err(TrackerError::InvalidResponse {
            reason: "response is not a dictionary",
        });
    }

    if let Some(reason) = document.get(b"failure reason") {
        let reason = reason
            .as_bytes()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .unwrap_or_else(|| "unspecified".to_string());
        return Err(TrackerError::Failure(reason));
    }

    let interval = document
        .get(b"interval")
        .and_then(Value::as_int)
        .filter(|seconds| *seconds > 0)
        .map(|seconds| Duration::from_secs(seconds as u64));

    let peers = match document.get(b"peers") {
        Some(Value::Bytes(compact)) => parse_compact_peers(compact)?,
        Some(Value::List(entries)) => parse_dict_peers(entries),
        Some(_) => {
            return Err(TrackerError::InvalidResponse {
                reason: "peers is neither compact bytes nor a list",
            });
        }
        None => Vec::new(),
    };

    Ok(AnnounceResponse { interval, peers })
}

fn parse_compact_peers(compact: &[u8]) -> Result<Vec<SocketAddr>> {
    if compact.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse {
            reason: "compact peer list is not a multiple of 6 bytes",
        });
    }
    Ok(compact
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::new(IpAddr::V4(ip), port)
        })
        .collect())
}

fn parse_dict_peers(entries: &[Value]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| {
            let ip = entry
                .get(b"ip")
                .and_then(Value::as_str)
                .and_then(|ip| ip.parse::<IpAddr>().ok())?;
            let port = entry
                .get(b"port")
                .and_then(Value::as_int)
                .and_then(|port| u16::try_from(port).ok())?;
            Some(SocketAddr::new(ip, port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use std::collections::BTreeMap;

    #[test]
    fn peer_id_carries_client_prefix_and_random_tail() {
        let first = generate_peer_id();
        let second = generate_peer_id();
        assert_eq!(&first[..8], PEER_ID_PREFIX);
        assert_eq!(&second[..8], PEER_ID_PREFIX);
        assert_ne!(first, second, "random tail should differ");
    }

    #[test]
    fn announce_url_percent_encodes_raw_bytes() {
        let client = TrackerClient::new([0xff; 20], *b"-HT0100-aaaaaaaaaaaa", 6881).unwrap();
        let url = client.build_announce_url(
            "http://tracker/announce",
            &AnnounceRequest {
                uploaded: 0,
                downloaded: 10,
                left: 90,
                event: Some(AnnounceEvent::Started),
            },
        );
        assert!(url.starts_with("http://tracker/announce?info_hash="));
        assert!(url.contains(&"%FF".repeat(20)));
        assert!(url.contains("peer_id=-HT0100-aaaaaaaaaaaa"));
        assert!(url.contains("port=6881"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("numwant=50"));
        assert!(url.contains("event=started"));
    }

    #[test]
    fn announce_url_appends_to_existing_query() {
        let client = TrackerClient::new([0u8; 20], [b'a'; 20], 6881).unwrap();
        let url = client.build_announce_url("http://tracker/a?key=abc", &AnnounceRequest::default());
        assert!(url.starts_with("http://tracker/a?key=abc&info_hash="));
    }

    #[test]
    fn parses_compact_peer_lists() {
        let mut doc = BTreeMap::new();
        doc.insert(b"interval".to_vec(), Value::Int(1800));
        doc.insert(
            b"peers".to_vec(),
            Value::Bytes(vec![127, 0, 0, 1, 0x1a, 0xe1, 10, 0, 0, 2, 0x1a, 0xe2]),
        );
        let body = bencode::encode(&Value::Dict(doc));

        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, Some(Duration::from_secs(1800)));
        assert_eq!(
            response.peers,
            vec![
                "127.0.0.1:6881".parse().unwrap(),
                "10.0.0.2:6882".parse().unwrap()
            ]
        );
    }

    #[test]
    fn parses_dictionary_peer_lists() {
        let mut peer = BTreeMap::new();
        peer.insert(b"ip".to_vec(), Value::Bytes(b"192.168.1.9".to_vec()));
        peer.insert(b"port".to_vec(), Value::Int(51413));
        peer.insert(b"peer id".to_vec(), Value::Bytes(vec![0u8; 20]));
        let mut doc = BTreeMap::new();
        doc.insert(b"peers".to_vec(), Value::List(vec![Value::Dict(peer)]));
        let body = bencode::encode(&Value::Dict(doc));

        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.peers, vec!["192.168.1.9:51413".parse().unwrap()]);
        assert_eq!(response.interval, None);
    }

    #[test]
    fn failure_reason_surfaces_as_error() {
        let mut doc = BTreeMap::new();
        doc.insert(
            b"failure reason".to_vec(),
            Value::Bytes(b"torrent not registered".to_vec()),
        );
        let body = bencode::encode(&Value::Dict(doc));
        match parse_announce_response(&body) {
            Err(TrackerError::Failure(reason)) => {
                assert_eq!(reason, "torrent not registered");
            }
            other => panic!("expected failure reason, got {other:?}"),
        }
    }

    #[test]
    fn truncated_compact_list_is_invalid() {
        let mut doc = BTreeMap::new();
        doc.insert(b"peers".to_vec(), Value::Bytes(vec![127, 0, 0, 1, 0x1a]));
        let body = bencode::encode(&Value::Dict(doc));
        assert!(matches!(
            parse_announce_response(&body),
            Err(TrackerError::InvalidResponse { .. })
        ));
    }

    #[tokio::test]
    async fn announce_any_rejects_udp_only_lists() {
        let client = TrackerClient::new([0u8; 20], [b'a'; 20], 6881).unwrap();
        let trackers = vec!["udp://tracker:6969/announce".to_string()];
        assert!(matches!(
            client.announce_any(&trackers, &AnnounceRequest::default()).await,
            Err(TrackerError::NoUsableTrackers)
        ));
    }
}
