//! The HTTP tracker client: builds an announce request and parses the
//! bencoded response.
//!
//! Grounded in `minTorrent`'s `tracker.py` for the parameter set
//! (`info_hash`, `peer_id`, `port`, `uploaded`, `downloaded`, `left`,
//! `compact`, `event`) and compact-only peer parsing, using the teacher's
//! dependency choices (`reqwest`, `url`, `percent-encoding`, `serde_bencode`)
//! rather than introducing new ones.

use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use percent_encoding::{percent_encode, NON_ALPHANUMERIC};
use serde_bencode::value::Value as BValue;
use url::Url;

use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// A peer as reported by the tracker: just enough to dial it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Peer {
    pub ip: Ipv4Addr,
    pub port: u16,
}

/// The event accompanying an announce, per BEP 3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Event {
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

/// The parameters of a single announce call.
pub(crate) struct AnnounceRequest {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Option<Event>,
}

/// The tracker's reply to an announce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TrackerResponse {
    /// The minimum interval clients should wait between announces.
    pub interval: Duration,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
    pub peers: Vec<Peer>,
}

pub(crate) struct TrackerClient {
    announce_url: String,
    http: reqwest::Client,
}

impl TrackerClient {
    pub fn new(announce_url: String) -> Self {
        Self {
            announce_url,
            http: reqwest::Client::new(),
        }
    }

    /// Performs a single announce and returns the parsed response.
    pub async fn announce(
        &self,
        req: AnnounceRequest,
    ) -> Result<TrackerResponse> {
        let url = build_announce_url(&self.announce_url, &req)?;
        log::debug!("announcing to {}", self.announce_url);
        let resp = self.http.get(url).send().await?;
        let body = resp.bytes().await?;
        log::trace!("tracker response: {} bytes", body.len());
        parse_response(&body)
    }
}

fn build_announce_url(base: &str, req: &AnnounceRequest) -> Result<Url> {
    let mut url = Url::parse(base)?;
    let mut query = format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        percent_encode(&req.info_hash[..], NON_ALPHANUMERIC),
        percent_encode(&req.peer_id[..], NON_ALPHANUMERIC),
        req.port,
        req.uploaded,
        req.downloaded,
        req.left,
    );
    if let Some(event) = req.event {
        query.push_str("&event=");
        query.push_str(event.as_str());
    }
    url.set_query(Some(&query));
    Ok(url)
}

fn parse_response(body: &[u8]) -> Result<TrackerResponse> {
    let value: BValue = serde_bencode::from_bytes(body)?;
    let dict = match value {
        BValue::Dict(dict) => dict,
        _ => {
            return Err(Error::Tracker(
                "tracker response is not a bencoded dictionary".into(),
            ))
        }
    };

    let interval = match get_int(&dict, "interval") {
        Some(i) => Duration::from_secs(i as u64),
        None => {
            return Err(Error::Tracker(
                "tracker response missing interval".into(),
            ))
        }
    };
    let complete = get_int(&dict, "complete").map(|i| i as u64);
    let incomplete = get_int(&dict, "incomplete").map(|i| i as u64);

    let peers = match dict.get("peers".as_bytes()) {
        Some(BValue::Bytes(bytes)) => parse_compact_peers(bytes)?,
        Some(BValue::List(_)) => return Err(Error::TrackerPeerFormatUnsupported),
        _ => {
            return Err(Error::Tracker("tracker response missing peers".into()))
        }
    };

    Ok(TrackerResponse {
        interval,
        complete,
        incomplete,
        peers,
    })
}

fn get_int(dict: &HashMap<Vec<u8>, BValue>, key: &str) -> Option<i64> {
    match dict.get(key.as_bytes()) {
        Some(BValue::Int(i)) => Some(*i),
        _ => None,
    }
}

fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<Peer>> {
    if bytes.len() % 6 != 0 {
        return Err(Error::Tracker(
            "compact peer list length not a multiple of 6".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|c| Peer {
            ip: Ipv4Addr::new(c[0], c[1], c[2], c[3]),
            port: u16::from_be_bytes([c[4], c[5]]),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compact_peer_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:completei1e10:incompletei2e8:intervali900e5:peers6:");
        body.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        body.extend_from_slice(b"e");

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.interval, Duration::from_secs(900));
        assert_eq!(resp.complete, Some(1));
        assert_eq!(resp.incomplete, Some(2));
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].ip, Ipv4Addr::new(127, 0, 0, 1));
        assert_eq!(resp.peers[0].port, 0x1ae1);
    }

    #[test]
    fn rejects_dictionary_peer_list() {
        let body = b"d8:intervali900e5:peerslee".to_vec();
        let err = parse_response(&body).unwrap_err();
        assert!(matches!(err, Error::TrackerPeerFormatUnsupported));
    }

    #[tokio::test]
    async fn announces_over_http_and_parses_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali1800e5:peers6:");
        body.extend_from_slice(&[10, 0, 0, 1, 0x00, 0x50]);
        body.extend_from_slice(b"e");

        let _m = mockito::mock("GET", mockito::Matcher::Regex("^/announce.*".into()))
            .with_status(200)
            .with_body(body)
            .create();

        let client =
            TrackerClient::new(format!("{}/announce", mockito::server_url()));
        let resp = client
            .announce(AnnounceRequest {
                info_hash: [1; 20],
                peer_id: [2; 20],
                port: 6881,
                uploaded: 0,
                downloaded: 0,
                left: 1000,
                event: Some(Event::Started),
            })
            .await
            .unwrap();

        assert_eq!(resp.interval, Duration::from_secs(1800));
        assert_eq!(resp.peers.len(), 1);
        assert_eq!(resp.peers[0].port, 80);
    }
}
