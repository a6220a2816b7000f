//! The torrent engine: wires together the tracker client, the piece
//! manager and a pool of peer sessions, and drives a single torrent's
//! download to completion.
//!
//! Grounded in the teacher's `disk::io::Disk` event loop (own the shared
//! state, dispatch work, shut down cooperatively) and `peer::PeerSession`'s
//! task-per-connection model, generalized here into a fixed-size worker pool
//! that drains a shared peer queue fed by periodic tracker announces.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::{
    conf::Conf,
    error::Result,
    metainfo::Metainfo,
    peer::PeerSession,
    piece_manager::PieceManager,
    storage_info::StorageInfo,
    torrent::SharedStatus,
    tracker::{AnnounceRequest, Event, TrackerClient},
};

/// Runs a single torrent download to completion: announces to the tracker,
/// connects to the peers it returns, and drives the piece manager until
/// every piece is verified and written to disk.
///
/// Returns once the download is complete or `shutdown` resolves, whichever
/// comes first.
pub async fn run(
    conf: Conf,
    metainfo: Metainfo,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    let info_hash = metainfo.info_hash()?;
    let piece_hashes = metainfo.piece_hashes();
    let storage = StorageInfo::new(&metainfo, conf.torrent.download_dir.clone());
    let download_len = storage.download_len;

    log::info!(
        "starting torrent {} ({} pieces, {} bytes)",
        hex::encode(info_hash),
        storage.piece_count,
        download_len
    );

    let shared = Arc::new(SharedStatus {
        info_hash,
        client_id: conf.engine.client_id,
        storage: storage.clone(),
    });
    let piece_manager = Arc::new(RwLock::new(PieceManager::new(
        storage,
        piece_hashes,
        conf.torrent.request_timeout,
    )?));

    let (peer_tx, peer_rx) =
        mpsc::channel::<SocketAddr>(conf.torrent.peer_queue_capacity);
    let peer_rx = Arc::new(Mutex::new(peer_rx));
    // one slot per worker, holding the command sender of whichever session
    // it's currently driving, if any; used to fan out a shutdown command to
    // every live connection without the engine needing to know about
    // sessions that haven't been spawned yet
    let active_senders: Arc<Mutex<HashMap<usize, crate::peer::Sender>>> =
        Arc::new(Mutex::new(HashMap::new()));

    let mut session_handles = Vec::with_capacity(conf.torrent.session_count);
    for worker_id in 0..conf.torrent.session_count {
        let shared = Arc::clone(&shared);
        let piece_manager = Arc::clone(&piece_manager);
        let peer_rx = Arc::clone(&peer_rx);
        let active_senders = Arc::clone(&active_senders);
        let handshake_timeout = conf.torrent.handshake_timeout;
        let idle_timeout = conf.torrent.peer_idle_timeout;
        session_handles.push(tokio::spawn(async move {
            run_session_worker(
                worker_id,
                shared,
                piece_manager,
                peer_rx,
                active_senders,
                handshake_timeout,
                idle_timeout,
            )
            .await;
        }));
    }

    let tracker = TrackerClient::new(metainfo.announce.clone());
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();
    let mut tracker_error_count: usize = 0;
    let tracker_error_threshold = conf.torrent.tracker_error_threshold;

    if !announce(
        &tracker,
        &shared,
        &piece_manager,
        download_len,
        Some(Event::Started),
        &peer_tx,
        &mut seen_peers,
    )
    .await
    {
        tracker_error_count += 1;
    }

    let announce_interval = conf.torrent.announce_interval;
    tokio::pin!(shutdown);
    let result = 'outer: loop {
        tokio::select! {
            _ = tokio::time::sleep(announce_interval) => {
                if piece_manager.read().await.complete() {
                    break 'outer Ok(());
                }
                if tracker_error_count >= tracker_error_threshold {
                    log::trace!(
                        "tracker error threshold reached, skipping announce"
                    );
                    continue;
                }
                let succeeded = announce(
                    &tracker,
                    &shared,
                    &piece_manager,
                    download_len,
                    None,
                    &peer_tx,
                    &mut seen_peers,
                )
                .await;
                if succeeded {
                    tracker_error_count = 0;
                } else {
                    tracker_error_count += 1;
                    if tracker_error_count >= tracker_error_threshold {
                        log::warn!(
                            "tracker failed {} consecutive times, giving up on further announces",
                            tracker_error_count
                        );
                    }
                }
            }
            _ = wait_until_complete(&piece_manager) => {
                break 'outer Ok(());
            }
            _ = &mut shutdown => {
                log::info!("shutdown requested, winding down torrent engine");
                break 'outer Ok(());
            }
        }
    };

    for (_, sender) in active_senders.lock().await.drain() {
        let _ = sender.send(crate::peer::Command::Shutdown);
    }

    if tracker_error_count < tracker_error_threshold {
        announce(
            &tracker,
            &shared,
            &piece_manager,
            download_len,
            Some(Event::Completed),
            &peer_tx,
            &mut seen_peers,
        )
        .await;
    }

    // dropping the sender closes the channel, which unblocks every worker's
    // `recv` call with `None` and lets them return
    drop(peer_tx);
    for handle in session_handles {
        let _ = handle.await;
    }

    match Arc::try_unwrap(piece_manager) {
        Ok(lock) => lock.into_inner().close(),
        Err(_) => log::warn!(
            "piece manager still referenced after all sessions joined"
        ),
    }

    result
}

/// Polls the piece manager until it reports completion. Used as one arm of
/// the main `select!` so the engine notices completion promptly rather than
/// waiting for the next announce tick.
async fn wait_until_complete(piece_manager: &RwLock<PieceManager>) {
    loop {
        if piece_manager.read().await.complete() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
}

/// Performs a single tracker announce, logging failures rather than
/// propagating them, and enqueues any newly seen peers for the session
/// workers to dial. Returns whether the announce succeeded, so the caller
/// can track consecutive failures against `tracker_error_threshold`.
async fn announce(
    tracker: &TrackerClient,
    shared: &SharedStatus,
    piece_manager: &RwLock<PieceManager>,
    download_len: u64,
    event: Option<Event>,
    peer_tx: &mpsc::Sender<SocketAddr>,
    seen_peers: &mut HashSet<SocketAddr>,
) -> bool {
    let downloaded = if piece_manager.read().await.complete() {
        download_len
    } else {
        0
    };
    let req = AnnounceRequest {
        info_hash: shared.info_hash,
        peer_id: shared.client_id,
        port: 0,
        uploaded: 0,
        downloaded,
        left: download_len.saturating_sub(downloaded),
        event,
    };

    match tracker.announce(req).await {
        Ok(resp) => {
            log::info!(
                "tracker returned {} peers (interval {}s)",
                resp.peers.len(),
                resp.interval.as_secs()
            );
            for peer in resp.peers {
                let addr =
                    SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
                if seen_peers.insert(addr) {
                    if peer_tx.send(addr).await.is_err() {
                        log::debug!("peer queue closed, dropping announce result");
                        break;
                    }
                }
            }
            true
        }
        Err(e) => {
            log::warn!("tracker announce failed: {}", e);
            false
        }
    }
}

/// A single worker in the session pool: repeatedly dequeues a peer address,
/// drives one connection to completion (or failure), and loops back for the
/// next, until the peer queue is closed.
async fn run_session_worker(
    worker_id: usize,
    shared: Arc<SharedStatus>,
    piece_manager: Arc<RwLock<PieceManager>>,
    peer_rx: Arc<Mutex<mpsc::Receiver<SocketAddr>>>,
    active_senders: Arc<Mutex<HashMap<usize, crate::peer::Sender>>>,
    handshake_timeout: std::time::Duration,
    idle_timeout: std::time::Duration,
) {
    loop {
        let addr = {
            let mut rx = peer_rx.lock().await;
            rx.recv().await
        };
        let addr = match addr {
            Some(addr) => addr,
            None => {
                log::debug!("session worker {} exiting: peer queue closed", worker_id);
                return;
            }
        };

        let (mut session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&shared),
            Arc::clone(&piece_manager),
            addr,
            handshake_timeout,
            idle_timeout,
        );
        active_senders.lock().await.insert(worker_id, cmd_chan);
        if let Err(e) = session.start().await {
            log::debug!("peer {} session ended: {}", addr, e);
        }
        active_senders.lock().await.remove(&worker_id);
    }
}
