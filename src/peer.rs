mod codec;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{select, stream::Fuse, FutureExt, Sink, SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{
        mpsc::{self, UnboundedSender},
        RwLock,
    },
    time::timeout,
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::*, piece_manager::PieceManager, torrent::SharedStatus, BlockInfo,
    PeerId,
};
use codec::*;

/// Drives a single outbound connection to a peer: handshake, availability
/// exchange, then a steady state in which it asks the shared piece manager
/// for work and requests it.
///
/// Unlike a session that pipelines several outstanding requests at once,
/// this session keeps at most one block request in flight at a time: it only
/// asks the piece manager for the next block once the previous one has
/// either arrived or the peer chokes us.
pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    piece_manager: Arc<RwLock<PieceManager>>,
    cmd_port: Fuse<Receiver>,
    addr: SocketAddr,
    status: Status,
    /// The single block we're currently waiting on, if any.
    outgoing_request: Option<BlockInfo>,
    peer_info: Option<PeerInfo>,
    /// Upper bound on waiting for the peer's handshake to fully arrive.
    handshake_timeout: Duration,
    /// How long to wait for any message, including a keep-alive, once
    /// connected before giving up on an unresponsive peer.
    idle_timeout: Duration,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_manager: Arc<RwLock<PieceManager>>,
        addr: SocketAddr,
        handshake_timeout: Duration,
        idle_timeout: Duration,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_manager,
                cmd_port: UnboundedReceiverStream::new(cmd_port).fuse(),
                addr,
                status: Status::default(),
                outgoing_request: None,
                peer_info: None,
                handshake_timeout,
                idle_timeout,
            },
            cmd_chan,
        )
    }

    /// Connects to the peer, performs the handshake and availability
    /// exchange, then runs the steady state message loop until the
    /// connection closes, errors, or a shutdown command arrives.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("starting peer {} session", self.addr);

        self.status.state = State::Connecting;
        let socket = TcpStream::connect(self.addr).await?;
        log::info!("connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::debug!("sending handshake to peer {}", self.addr);
        socket.send(handshake.clone()).await?;

        log::debug!("waiting for peer {} handshake", self.addr);
        let peer_handshake =
            match timeout(self.handshake_timeout, socket.next()).await {
                Ok(Some(handshake)) => handshake?,
                Ok(None) => {
                    log::warn!("peer {} closed before handshaking", self.addr);
                    return Ok(());
                }
                Err(_) => {
                    log::warn!(
                        "peer {} handshake timed out after {:?}",
                        self.addr,
                        self.handshake_timeout
                    );
                    return Err(Error::InvalidHandshake);
                }
            };
        log::debug!("received handshake from peer {}", self.addr);

        if peer_handshake.info_hash != self.torrent.info_hash {
            log::warn!("peer {} sent mismatched info hash", self.addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        self.peer_info = Some(PeerInfo {
            peer_id: peer_handshake.peer_id,
        });

        // switch codecs, carrying over whatever bytes the peer may have
        // already sent past the handshake
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        self.status.state = State::AvailabilityExchange;
        log::debug!("peer {} session state: {:?}", self.addr, self.status.state);

        self.run(socket).await
    }

    async fn run(&mut self, socket: Framed<TcpStream, PeerCodec>) -> Result<()> {
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        loop {
            select! {
                msg = timeout(self.idle_timeout, stream.select_next_some()).fuse() => {
                    let msg = match msg {
                        Ok(msg) => msg?,
                        Err(_) => {
                            log::warn!(
                                "peer {} idle for {:?}, closing connection",
                                self.addr,
                                self.idle_timeout
                            );
                            break;
                        }
                    };
                    if self.status.state == State::AvailabilityExchange {
                        self.handle_availability_msg(&mut sink, msg).await?;
                        self.status.state = State::Connected;
                        log::debug!(
                            "peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("shutting down peer {} session", self.addr);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(block) = self.outgoing_request.take() {
            self.release_request(block).await;
        }
        if let Some(peer_info) = &self.peer_info {
            self.piece_manager.write().await.remove_peer(&peer_info.peer_id);
        }

        Ok(())
    }

    /// Handles the first message after the handshake, which must be either a
    /// bitfield or the start of steady-state traffic (an empty-holdings
    /// peer is allowed to skip the bitfield entirely, per the wire
    /// protocol).
    async fn handle_availability_msg(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        msg: Message,
    ) -> Result<()> {
        let peer_id = self
            .peer_info
            .as_ref()
            .expect("handshake completed before availability exchange")
            .peer_id;

        match msg {
            Message::Bitfield(mut bitfield) => {
                log::debug!("peer {} sent bitfield", self.addr);
                bitfield.resize(self.torrent.storage.piece_count, false);
                self.piece_manager.write().await.add_peer(peer_id, bitfield);
            }
            other => {
                // not every peer announces a bitfield; treat any other
                // message as "peer has nothing yet" and dispatch it
                // normally once we're in the connected state
                self.handle_msg(sink, other).await?;
            }
        }

        sink.send(Message::Interested).await?;
        self.status.is_interested = true;
        Ok(())
    }

    async fn handle_msg(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {
                log::trace!("peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::debug!("peer {} choked us", self.addr);
                    self.status.is_choked = true;
                    if let Some(block) = self.outgoing_request.take() {
                        self.release_request(block).await;
                    }
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::debug!("peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                }
                self.request_next(sink).await?;
            }
            Message::Interested => {
                self.status.is_peer_interested = true;
            }
            Message::NotInterested => {
                self.status.is_peer_interested = false;
            }
            Message::Have { piece_index } => {
                if let Some(peer_info) = &self.peer_info {
                    self.piece_manager
                        .write()
                        .await
                        .update_peer(peer_info.peer_id, piece_index);
                }
                if !self.status.is_choked {
                    self.request_next(sink).await?;
                }
            }
            Message::Bitfield(_) => {
                log::warn!(
                    "peer {} sent bitfield message outside availability exchange",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::Piece { piece_index, offset, data } => {
                self.handle_piece_msg(piece_index, offset, data).await?;
                if !self.status.is_choked {
                    self.request_next(sink).await?;
                }
            }
            // we never advertise a bitfield (we only leech), so a well
            // behaved peer has no reason to send these; we log and move on
            // rather than tearing down the connection over it
            Message::Request(_) => {
                log::warn!("peer {} sent unexpected request message", self.addr);
            }
            Message::Cancel(_) => {
                log::warn!("peer {} sent unexpected cancel message", self.addr);
            }
            Message::Port(_) => {
                log::trace!("peer {} sent port message, ignoring", self.addr);
            }
            Message::Unknown { id } => {
                log::debug!("peer {} sent unknown message id {}", self.addr, id);
            }
        }

        Ok(())
    }

    /// Asks the piece manager for the next block to request, if we don't
    /// already have one outstanding, and sends it.
    async fn request_next(
        &mut self,
        sink: &mut (impl Sink<Message, Error = Error> + Unpin),
    ) -> Result<()> {
        if self.status.is_choked
            || !self.status.is_interested
            || self.outgoing_request.is_some()
        {
            return Ok(());
        }
        let peer_id = match &self.peer_info {
            Some(info) => info.peer_id,
            None => return Ok(()),
        };

        let block = {
            let mut piece_manager = self.piece_manager.write().await;
            piece_manager.next_request(peer_id)
        };
        if let Some(block) = block {
            log::trace!("requesting {:?} from peer {}", block, self.addr);
            sink.send(Message::Request(block)).await?;
            self.outgoing_request = Some(block);
        }
        Ok(())
    }

    async fn handle_piece_msg(
        &mut self,
        piece_index: crate::PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        let expected = self.outgoing_request;
        if expected.map(|b| b.piece_index) != Some(piece_index)
            || expected.map(|b| b.offset) != Some(offset)
        {
            log::warn!(
                "peer {} sent block {}/{} we didn't request, discarding",
                self.addr,
                piece_index,
                offset
            );
            return Ok(());
        }
        self.outgoing_request = None;
        self.status.downloaded_block_bytes_count += data.len() as u64;
        self.piece_manager
            .write()
            .await
            .on_block_received(piece_index, offset, data)
            .await
    }

    /// Tells the piece manager this session no longer intends to fulfill a
    /// request it made, e.g. because the peer choked us or disconnected, so
    /// the block can be reassigned immediately instead of waiting out the
    /// staleness horizon.
    async fn release_request(&mut self, block: BlockInfo) {
        let peer_id = match &self.peer_info {
            Some(info) => info.peer_id,
            None => return,
        };
        self.piece_manager.write().await.release(&peer_id, block);
    }
}

/// The channel on which the engine sends commands to a peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiverStream<Command>;

/// The commands a peer session can receive.
pub(crate) enum Command {
    Shutdown,
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    state: State,
    is_choked: bool,
    is_interested: bool,
    is_peer_interested: bool,
    downloaded_block_bytes_count: u64,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_interested: false,
            downloaded_block_bytes_count: 0,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    Connecting,
    Handshaking,
    AvailabilityExchange,
    Connected,
}

impl Default for State {
    fn default() -> Self {
        Self::Connecting
    }
}

/// Information about the peer we're connected to, set after a successful
/// handshake.
struct PeerInfo {
    peer_id: PeerId,
}
