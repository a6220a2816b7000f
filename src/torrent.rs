//! Information shared, read-only, by every peer session of a torrent.
//!
//! Grounded in the teacher's `torrent::SharedStatus`, which every
//! `PeerSession` holds an `Arc` to for the duration of the connection.

use crate::{storage_info::StorageInfo, PeerId, Sha1Hash};

/// Immutable, per-torrent information every peer session needs: who we are,
/// what we're downloading, and how big it is.
pub(crate) struct SharedStatus {
    /// The torrent's info hash, verified against every peer's handshake.
    pub info_hash: Sha1Hash,
    /// Our own client id, sent in every handshake.
    pub client_id: PeerId,
    /// Storage layout derived from the torrent's metainfo.
    pub storage: StorageInfo,
}
