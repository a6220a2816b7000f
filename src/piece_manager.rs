//! The global piece scheduler: tracks which blocks are missing, assigns
//! requests to peers, verifies completed pieces, and persists verified
//! bytes through the file assembler.
//!
//! This unifies three collaborating pieces of the teacher's design into one
//! module with a flat public API: the teacher's `piece_picker::PiecePicker`
//! (which piece to try next), `download::PieceDownload` (per-piece block
//! bookkeeping), and `disk::io::Torrent` (digest verification and the
//! synchronous write, offloaded via `spawn_blocking` exactly as the teacher
//! does it). Unlike the teacher, which pipelines up to
//! `best_request_queue_len` requests per peer, callers of this module are
//! expected to keep at most one block outstanding per peer at a time.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    time::{Duration, Instant},
};

use sha1::{Digest, Sha1};
use tokio::task;

use crate::{
    block_count, block_len,
    clock::{Clock, SystemClock},
    disk::FileAssembler,
    error::Result,
    storage_info::StorageInfo,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Missing,
    Pending,
    Retrieved,
}

struct Block {
    state: BlockState,
    data: Vec<u8>,
}

/// A piece that has at least one non-`Missing` block but hasn't yet been
/// verified.
struct OngoingPiece {
    blocks: Vec<Block>,
}

impl OngoingPiece {
    fn new(len: u32) -> Self {
        let count = block_count(len);
        let blocks = (0..count)
            .map(|_| Block {
                state: BlockState::Missing,
                data: Vec::new(),
            })
            .collect();
        Self { blocks }
    }

    fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|b| b.state == BlockState::Retrieved)
    }

    fn reset(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::Missing;
            block.data.clear();
        }
    }

    fn concat(&self) -> Vec<u8> {
        self.blocks.iter().flat_map(|b| b.data.iter().copied()).collect()
    }
}

/// Builds an all-`false` bitfield of the given length. `BitVec` has no
/// stable single-call "n falses" constructor across versions, so this just
/// collects from an iterator, which every version supports via `FromIterator`.
fn empty_bitfield(len: usize) -> Bitfield {
    std::iter::repeat(false).take(len).collect()
}

struct PendingRequest {
    block: BlockInfo,
    peer_id: PeerId,
    issued_at: Instant,
}

/// The piece manager, generic over the clock used to judge request
/// staleness so tests can advance time without sleeping.
pub(crate) struct PieceManager<C: Clock = SystemClock> {
    storage: StorageInfo,
    piece_hashes: Vec<Sha1Hash>,
    missing: VecDeque<PieceIndex>,
    ongoing: HashMap<PieceIndex, OngoingPiece>,
    have: HashSet<PieceIndex>,
    peers: HashMap<PeerId, Bitfield>,
    pending: Vec<PendingRequest>,
    assembler: FileAssembler,
    clock: C,
    request_timeout: Duration,
}

impl PieceManager<SystemClock> {
    pub(crate) fn new(
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        request_timeout: Duration,
    ) -> Result<Self> {
        Self::with_clock(storage, piece_hashes, request_timeout, SystemClock)
    }
}

impl<C: Clock> PieceManager<C> {
    pub(crate) fn with_clock(
        storage: StorageInfo,
        piece_hashes: Vec<Sha1Hash>,
        request_timeout: Duration,
        clock: C,
    ) -> Result<Self> {
        let assembler = FileAssembler::new(&storage)?;
        let missing = (0..storage.piece_count).collect();
        Ok(Self {
            storage,
            piece_hashes,
            missing,
            ongoing: HashMap::new(),
            have: HashSet::new(),
            peers: HashMap::new(),
            pending: Vec::new(),
            assembler,
            clock,
            request_timeout,
        })
    }

    /// Registers or replaces a peer's piece holdings.
    pub(crate) fn add_peer(&mut self, peer_id: PeerId, bitfield: Bitfield) {
        log::debug!("registering peer {} bitfield", hex::encode(peer_id));
        self.peers.insert(peer_id, bitfield);
    }

    /// Marks a single additional piece as held by a peer, creating an empty
    /// holdings record for the peer if this is the first we've heard of it.
    pub(crate) fn update_peer(&mut self, peer_id: PeerId, piece_index: PieceIndex) {
        let piece_count = self.storage.piece_count;
        let bitfield = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| empty_bitfield(piece_count));
        if piece_index < bitfield.len() {
            bitfield.set(piece_index, true);
        }
    }

    /// Drops a peer's recorded holdings, e.g. on disconnect.
    pub(crate) fn remove_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
    }

    /// Releases a block a peer no longer intends to fulfill, e.g. because it
    /// choked us or its connection closed, so the block is immediately
    /// eligible for reassignment instead of waiting out the staleness
    /// horizon in `next_request`'s strategy 3.
    pub(crate) fn release(&mut self, peer_id: &PeerId, block: BlockInfo) {
        if let Some(pos) = self
            .pending
            .iter()
            .position(|req| req.peer_id == *peer_id && req.block == block)
        {
            self.pending.remove(pos);
        }
        if let Some(piece) = self.ongoing.get_mut(&block.piece_index) {
            let offset_index = (block.offset / crate::BLOCK_LEN) as usize;
            if let Some(b) = piece.blocks.get_mut(offset_index) {
                if b.state == BlockState::Pending {
                    b.state = BlockState::Missing;
                }
            }
        }
    }

    /// Picks the next block to request from `peer_id`, or `None` if this
    /// peer currently has no eligible work.
    pub(crate) fn next_request(&mut self, peer_id: PeerId) -> Option<BlockInfo> {
        let holds = |bitfield: &Bitfield, index: PieceIndex| {
            bitfield.get(index).map(|b| *b).unwrap_or(false)
        };

        // strategy 1: continue an ongoing piece this peer holds
        if let Some(bitfield) = self.peers.get(&peer_id) {
            let bitfield = bitfield.clone();
            let mut ongoing_indices: Vec<_> = self.ongoing.keys().copied().collect();
            ongoing_indices.sort_unstable();
            for index in ongoing_indices {
                if !holds(&bitfield, index) {
                    continue;
                }
                let piece = self.ongoing.get_mut(&index).expect("just listed key");
                if let Some(offset_index) = piece
                    .blocks
                    .iter()
                    .position(|b| b.state == BlockState::Missing)
                {
                    let len = block_len(
                        self.storage.piece_len(index).ok()?,
                        offset_index,
                    );
                    let block = BlockInfo {
                        piece_index: index,
                        offset: offset_index as u32 * crate::BLOCK_LEN,
                        len,
                    };
                    piece.blocks[offset_index].state = BlockState::Pending;
                    self.pending.push(PendingRequest {
                        block,
                        peer_id,
                        issued_at: self.clock.now(),
                    });
                    return Some(block);
                }
            }
        }

        // strategy 2: start a new piece this peer holds
        if let Some(bitfield) = self.peers.get(&peer_id).cloned() {
            if let Some(pos) = self
                .missing
                .iter()
                .position(|index| holds(&bitfield, *index))
            {
                let index = self.missing.remove(pos).expect("position just found");
                let piece_len = self.storage.piece_len(index).ok()?;
                let mut piece = OngoingPiece::new(piece_len);
                piece.blocks[0].state = BlockState::Pending;
                let block = BlockInfo {
                    piece_index: index,
                    offset: 0,
                    len: block_len(piece_len, 0),
                };
                self.ongoing.insert(index, piece);
                self.pending.push(PendingRequest {
                    block,
                    peer_id,
                    issued_at: self.clock.now(),
                });
                return Some(block);
            }
        }

        // strategy 3: re-request an expired block, picking the earliest by
        // piece index then block offset among all expired entries, rather
        // than the first one encountered, so reassignment stays sequential
        // the same way strategies 1 and 2 are
        let now = self.clock.now();
        let expired_index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, req)| {
                now.saturating_duration_since(req.issued_at)
                    >= self.request_timeout
            })
            .min_by_key(|(_, req)| (req.block.piece_index, req.block.offset))
            .map(|(index, _)| index);
        if let Some(index) = expired_index {
            let entry = &mut self.pending[index];
            entry.peer_id = peer_id;
            entry.issued_at = now;
            return Some(entry.block);
        }

        None
    }

    /// Integrates a received block, verifying and persisting its piece if
    /// this was the final missing block.
    pub(crate) async fn on_block_received(
        &mut self,
        piece_index: PieceIndex,
        begin: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        // scoped so the mutable borrow of `self.ongoing` ends before the
        // `spawn_blocking().await` below, which also needs `self`
        let is_complete = {
            let piece = match self.ongoing.get_mut(&piece_index) {
                Some(piece) => piece,
                None => {
                    log::debug!(
                        "discarding block for piece {} not in progress",
                        piece_index
                    );
                    return Ok(());
                }
            };

            let offset_index = (begin / crate::BLOCK_LEN) as usize;
            let block = match piece.blocks.get_mut(offset_index) {
                Some(block) if block.state != BlockState::Retrieved => block,
                _ => {
                    log::debug!(
                        "discarding unexpected or duplicate block {}/{}",
                        piece_index,
                        begin
                    );
                    return Ok(());
                }
            };

            block.data = data;
            block.state = BlockState::Retrieved;
            piece.is_complete()
        };

        self.pending.retain(|req| {
            !(req.block.piece_index == piece_index && req.block.offset == begin)
        });

        if !is_complete {
            return Ok(());
        }

        let piece_data = self.ongoing[&piece_index].concat();
        let expected = self.piece_hashes[piece_index];

        let (is_valid, piece_data) = task::spawn_blocking(move || {
            let actual = Sha1::digest(&piece_data);
            let is_valid = actual.as_slice() == &expected[..];
            (is_valid, piece_data)
        })
        .await
        .expect("digest task panicked");

        if is_valid {
            log::info!("piece {} verified", piece_index);
            self.assembler.write_piece(piece_index, &piece_data)?;
            self.ongoing.remove(&piece_index);
            self.have.insert(piece_index);
            self.pending.retain(|req| req.block.piece_index != piece_index);
        } else {
            log::warn!("piece {} failed digest check, discarding", piece_index);
            if let Some(piece) = self.ongoing.get_mut(&piece_index) {
                piece.reset();
            }
            self.pending.retain(|req| req.block.piece_index != piece_index);
        }

        Ok(())
    }

    /// True iff every piece has been verified and persisted.
    pub(crate) fn complete(&self) -> bool {
        self.have.len() == self.storage.piece_count
    }

    /// Releases resources held by the manager. The underlying file handles
    /// are also closed implicitly when the assembler is dropped.
    pub(crate) fn close(self) {
        log::info!(
            "closing piece manager: {}/{} pieces verified",
            self.have.len(),
            self.storage.piece_count
        );
    }
}
