//! Torrent sessions: the download engine and its lifecycle.
//!
//! A download is a pool of per-peer worker tasks draining a shared queue of
//! piece descriptors. Workers publish verified pieces on a result channel;
//! the result consumer owns the backing file and the session bitfield and is
//! the only place either is mutated. Pieces complete in arbitrary order but
//! always land at their own offset, so the file is only whole once every
//! piece is in.

use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use sha1::{Digest, Sha1};
use tokio::{
    sync::{mpsc, Mutex, RwLock},
    task, time,
};

use crate::{
    conf::Conf,
    error::*,
    metainfo::Metainfo,
    peer::PeerSession,
    storage_info::StorageInfo,
    store::PieceStore,
    tracker::{self, Announce, Event},
    Bitfield, PeerId, PieceIndex, Sha1Hash,
};

/// How often the result loop rechecks the paused flag while no results are
/// arriving.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How often a worker rechecks the shared work queue when it finds it empty.
///
/// Workers poll the queue instead of parking inside `recv` so that none of
/// them holds the queue lock while waiting: the result loop needs that lock
/// to close the queue at completion.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A piece that still needs to be downloaded.
#[derive(Clone, Copy, Debug)]
struct PieceWork {
    index: PieceIndex,
    len: u32,
    hash: Sha1Hash,
}

/// A downloaded and verified piece on its way into the file.
struct DownloadedPiece {
    index: PieceIndex,
    data: Vec<u8>,
}

/// Download progress counters, shared with whoever drives the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct DownloadStatus {
    /// The number of pieces downloaded, verified, and written out.
    pub done_pieces: usize,
    /// The number of worker tasks currently attached to a peer.
    pub active_peers: usize,
}

/// Seeding counters, shared with whoever drives the engine.
#[derive(Clone, Copy, Debug, Default)]
pub struct SeedStatus {
    /// The number of remote peers currently being served.
    pub active_peers: usize,
    /// The total number of block bytes served.
    pub seeded_bytes: u64,
}

/// A torrent session. Downloading and seeding run independently of each
/// other on the same metainfo.
pub struct Torrent {
    pub(crate) meta: Arc<Metainfo>,
    pub(crate) storage: StorageInfo,
    pub(crate) conf: Conf,
    paused: Arc<AtomicBool>,
    download_status: Arc<RwLock<DownloadStatus>>,
    pub(crate) seed_status: Arc<RwLock<SeedStatus>>,
    state: Option<DownloadState>,
}

/// The channels and file handle of a download in progress, kept across a
/// pause so resuming picks up where the session left off.
struct DownloadState {
    store: Arc<PieceStore>,
    /// Which pieces are verified and on disk. Only the result loop writes
    /// this.
    own_pieces: Bitfield,
    done_pieces: usize,
    work_chan: mpsc::Sender<PieceWork>,
    /// The receiving half of the work queue, shared by all workers.
    work_port: Arc<Mutex<mpsc::Receiver<PieceWork>>>,
    result_chan: mpsc::UnboundedSender<DownloadedPiece>,
    result_port: mpsc::UnboundedReceiver<DownloadedPiece>,
}

impl Torrent {
    pub fn new(meta: Metainfo, conf: Conf) -> Self {
        let storage = StorageInfo::new(&meta);
        Self {
            meta: Arc::new(meta),
            storage,
            conf,
            paused: Arc::new(AtomicBool::new(false)),
            download_status: Arc::new(RwLock::new(DownloadStatus::default())),
            seed_status: Arc::new(RwLock::new(SeedStatus::default())),
            state: None,
        }
    }

    /// A snapshot of the download progress counters.
    pub async fn download_status(&self) -> DownloadStatus {
        *self.download_status.read().await
    }

    /// A snapshot of the seeding counters.
    pub async fn seed_status(&self) -> SeedStatus {
        *self.seed_status.read().await
    }

    /// Whether every piece has been downloaded and written out.
    pub fn is_complete(&self) -> bool {
        self.state
            .as_ref()
            .map(|state| state.done_pieces == self.storage.piece_count)
            .unwrap_or(false)
    }

    /// Asks the session to pause. Cooperative: workers finish the piece they
    /// are on, return their queue items, and exit; `start_download` returns
    /// once the result loop observes the flag. Pausing twice is the same as
    /// pausing once.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes a paused download: announces again for a fresh peer list and
    /// re-spawns the workers. A no-op unless a download was started and has
    /// not finished.
    pub async fn resume(&mut self) -> Result<()> {
        if self.state.is_none() || self.is_complete() {
            return Ok(());
        }
        self.paused.store(false, Ordering::SeqCst);
        self.run().await
    }

    /// Downloads the torrent into the given file, blocking until the
    /// download completes or is paused.
    ///
    /// Pieces already present in the file are recovered by re-hashing, so an
    /// interrupted download restarted with the same path continues instead
    /// of starting over.
    pub async fn start_download(&mut self, output: impl Into<PathBuf>) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        if self.state.is_none() {
            let state = self.init_download(output.into()).await?;
            self.download_status.write().await.done_pieces = state.done_pieces;
            self.state = Some(state);
        }
        if self.is_complete() {
            log::info!("torrent {} is already fully on disk", self.meta.name);
            return Ok(());
        }
        self.paused.store(false, Ordering::SeqCst);
        self.run().await
    }

    /// Opens the backing file, recovers the pieces already present, and
    /// queues the missing ones.
    async fn init_download(&self, output: PathBuf) -> Result<DownloadState> {
        let store = Arc::new(PieceStore::open(&output, self.storage)?);
        let (own_pieces, done_pieces) = {
            let store = Arc::clone(&store);
            let meta = Arc::clone(&self.meta);
            task::spawn_blocking(move || store.scan(&meta.piece_hashes))
                .await
                .map_err(|_| Error::Channel)??
        };
        log::info!(
            "torrent {}: {}/{} pieces recovered from disk",
            self.meta.name,
            done_pieces,
            self.storage.piece_count
        );

        let piece_count = self.storage.piece_count;
        // bounded by the piece count so returning an item can never block or
        // overflow
        let (mut work_chan, work_port) = mpsc::channel(piece_count.max(1));
        for index in 0..piece_count {
            if own_pieces[index] {
                continue;
            }
            let work = PieceWork {
                index,
                len: self.storage.piece_len(index)?,
                hash: self.meta.piece_hashes[index],
            };
            work_chan.try_send(work).map_err(|_| Error::Channel)?;
        }
        let (result_chan, result_port) = mpsc::unbounded_channel();

        Ok(DownloadState {
            store,
            own_pieces,
            done_pieces,
            work_chan,
            work_port: Arc::new(Mutex::new(work_port)),
            result_chan,
            result_port,
        })
    }

    /// Announces, spawns one worker per peer, and consumes results until the
    /// download completes or is paused.
    async fn run(&mut self) -> Result<()> {
        let state = match &mut self.state {
            Some(state) => state,
            None => return Ok(()),
        };

        let params = Announce {
            info_hash: self.meta.info_hash,
            peer_id: self.conf.client_id,
            port: self.conf.port,
            downloaded: 0,
            uploaded: 0,
            left: self.storage.total_len,
            event: Event::Started,
        };
        let peers = tracker::request_peers(&self.meta.announce_list, &params).await?;
        log::info!(
            "torrent {}: downloading from {} peers",
            self.meta.name,
            peers.len()
        );
        self.download_status.write().await.active_peers = peers.len();

        for addr in peers {
            task::spawn(download_worker(
                addr,
                self.conf.client_id,
                self.meta.info_hash,
                self.storage.piece_count,
                self.conf.cipher_enabled,
                state.work_chan.clone(),
                Arc::clone(&state.work_port),
                state.result_chan.clone(),
                Arc::clone(&self.paused),
                Arc::clone(&self.download_status),
            ));
        }

        // the result loop: the only writer of the file and the bitfield
        while state.done_pieces < self.storage.piece_count {
            if self.paused.load(Ordering::SeqCst) {
                log::info!("torrent {} paused", self.meta.name);
                return Ok(());
            }
            let piece = match time::timeout(
                PAUSE_POLL_INTERVAL,
                state.result_port.recv(),
            )
            .await
            {
                Ok(Some(piece)) => piece,
                // we hold a sender, so the channel cannot close under us
                Ok(None) => return Err(Error::Channel),
                // no result yet, go recheck the paused flag
                Err(_) => continue,
            };

            let index = piece.index;
            let store = Arc::clone(&state.store);
            // a file error here is fatal to the session
            task::spawn_blocking(move || store.write_piece(index, &piece.data))
                .await
                .map_err(|_| Error::Channel)??;

            state.own_pieces.set(index, true);
            state.done_pieces += 1;
            {
                let mut status = self.download_status.write().await;
                status.done_pieces = state.done_pieces;
            }
            log::info!(
                "torrent {}: piece {} done ({}/{})",
                self.meta.name,
                index,
                state.done_pieces,
                self.storage.piece_count
            );
        }

        // closing the queue drains the workers out
        state.work_port.lock().await.close();
        log::info!("torrent {} download complete", self.meta.name);
        Ok(())
    }
}

/// A single peer's download loop: drains the shared work queue and publishes
/// verified pieces, returning any item it cannot serve.
async fn download_worker(
    addr: SocketAddr,
    client_id: PeerId,
    info_hash: Sha1Hash,
    piece_count: usize,
    cipher_enabled: bool,
    mut work_chan: mpsc::Sender<PieceWork>,
    work_port: Arc<Mutex<mpsc::Receiver<PieceWork>>>,
    result_chan: mpsc::UnboundedSender<DownloadedPiece>,
    paused: Arc<AtomicBool>,
    status: Arc<RwLock<DownloadStatus>>,
) {
    let mut session = match PeerSession::outbound(
        addr,
        client_id,
        info_hash,
        piece_count,
        cipher_enabled,
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            log::warn!("peer {}: could not establish session: {}", addr, e);
            decrement_active_peers(&status).await;
            return;
        }
    };

    // prime the peer to unchoke us; a failure here surfaces on the first read
    let _ = session.send_unchoke().await;
    let _ = session.send_interested().await;

    loop {
        let work = {
            let mut work_port = work_port.lock().await;
            work_port.try_recv()
        };
        let work = match work {
            Ok(work) => work,
            Err(mpsc::error::TryRecvError::Empty) => {
                if paused.load(Ordering::SeqCst) {
                    break;
                }
                // every piece is in flight elsewhere right now, but another
                // worker may still fail and return one
                time::delay_for(QUEUE_POLL_INTERVAL).await;
                continue;
            }
            // the queue was closed, the download is done
            Err(mpsc::error::TryRecvError::Closed) => break,
        };

        if paused.load(Ordering::SeqCst) {
            let _ = work_chan.try_send(work);
            break;
        }

        if !session.has_piece(work.index) {
            let _ = work_chan.try_send(work);
            // let workers whose peers have this piece get at it instead of
            // immediately dequeueing it again
            time::delay_for(QUEUE_POLL_INTERVAL).await;
            continue;
        }

        let data = match session.download_piece(work.index, work.len).await {
            Ok(data) => data,
            Err(e) => {
                log::warn!(
                    "peer {}: piece {} failed: {}",
                    session.addr(),
                    work.index,
                    e
                );
                let _ = work_chan.try_send(work);
                break;
            }
        };

        if Sha1::digest(&data).as_slice() != &work.hash[..] {
            log::warn!(
                "peer {}: piece {} failed its integrity check, requeued",
                session.addr(),
                work.index
            );
            let _ = work_chan.try_send(work);
            continue;
        }

        let _ = session.send_have(work.index).await;
        let piece = DownloadedPiece {
            index: work.index,
            data,
        };
        if result_chan.send(piece).is_err() {
            break;
        }
    }

    decrement_active_peers(&status).await;
}

async fn decrement_active_peers(status: &RwLock<DownloadStatus>) {
    let mut status = status.write().await;
    status.active_peers = status.active_peers.saturating_sub(1);
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn test_conf() -> Conf {
        let mut conf = Conf::new();
        conf.cipher_enabled = false;
        conf
    }

    #[test]
    fn test_pause_is_idempotent() {
        let meta = Metainfo {
            name: "x".into(),
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]],
            piece_len: 16384,
            len: 16384,
            announce_list: vec![],
            description: None,
            path: None,
        };
        let torrent = Torrent::new(meta, test_conf());
        torrent.pause();
        torrent.pause();
        assert!(torrent.paused.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_resume_before_start_is_a_noop() {
        let meta = Metainfo {
            name: "x".into(),
            info_hash: [0; 20],
            piece_hashes: vec![[0; 20]],
            piece_len: 16384,
            len: 16384,
            announce_list: vec![],
            description: None,
            path: None,
        };
        let mut torrent = Torrent::new(meta, test_conf());
        torrent.resume().await.unwrap();
        assert!(!torrent.is_complete());
    }

    // A download whose file is already fully on disk finishes without
    // contacting any tracker.
    #[tokio::test]
    async fn test_start_download_with_complete_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("done.bin");
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let meta = Metainfo::create_from_file(
            &path,
            "http://127.0.0.1:1/announce",
            "done.bin",
            "",
            16384,
        )
        .unwrap();
        let mut torrent = Torrent::new(meta, test_conf());
        torrent.start_download(&path).await.unwrap();

        assert!(torrent.is_complete());
        let status = torrent.download_status().await;
        assert_eq!(status.done_pieces, 3);
    }
}
