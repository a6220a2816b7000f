//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The fixed 8 byte prefix of our peer id, identifying this client
/// implementation, per the convention described in BEP 20
/// (http://bittorrent.org/beps/bep_0020.html).
pub const PEER_ID_PREFIX: &[u8; 8] = b"-MT0001-";

/// Generates a fresh 20 byte peer id: [`PEER_ID_PREFIX`] followed by 12
/// random decimal digits.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = b'0' + rng.gen_range(0..10);
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses a freshly generated peer id (see [`generate_peer_id`]).
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: generate_peer_id(),
            },
            torrent: TorrentConf::new(download_dir),
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The id of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The capacity of the shared peer queue that the tracker announce loop
    /// feeds and peer sessions drain. Sized generously so that a burst of
    /// freshly announced peers is never dropped while sessions catch up.
    pub peer_queue_capacity: usize,

    /// The number of concurrent peer session workers to run. Each worker
    /// repeatedly dequeues a peer, drives one connection to completion (or
    /// failure), and loops back for the next.
    pub session_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 minutes.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// How long an outstanding block request may go unanswered before it is
    /// considered stale and becomes eligible for reassignment to a different
    /// peer. Fixed at 5 minutes by the wire protocol's de facto convention.
    pub request_timeout: Duration,

    /// Upper bound on how long a peer session waits for the other side's
    /// handshake to fully arrive. A slow-loris peer that trickles bytes in
    /// below the codec's frame threshold would otherwise hang the session
    /// worker driving it indefinitely.
    pub handshake_timeout: Duration,

    /// How long a connected peer session waits for any message, including a
    /// keep-alive, before treating the peer as unresponsive and closing the
    /// connection.
    pub peer_idle_timeout: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // Large enough to absorb a full tracker announce response (which
            // may list hundreds of peers) without ever blocking the announce
            // loop on a full queue.
            peer_queue_capacity: 500,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host with file descriptors.
            session_count: 40,
            // needs testing
            announce_interval: Duration::from_secs(30 * 60),
            // needs testing
            tracker_error_threshold: 15,
            request_timeout: Duration::from_secs(5 * 60),
            handshake_timeout: Duration::from_secs(10),
            peer_idle_timeout: Duration::from_secs(2 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_id_has_expected_shape() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], PEER_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }
}
