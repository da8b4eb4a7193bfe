//! The seeding side of a torrent session: a listener that serves verified
//! pieces of the local file to remote peers.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use sha1::{Digest, Sha1};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::RwLock,
    task,
};

use crate::{
    error::*,
    metainfo::Metainfo,
    peer::{Message, PeerSession},
    storage_info::StorageInfo,
    store::PieceStore,
    torrent::{SeedStatus, Torrent},
    tracker::{self, Announce, Event},
    Bitfield, BlockInfo, PeerId, Sha1Hash,
};

impl Torrent {
    /// Binds the session port and serves pieces of the local file to anyone
    /// who asks, indefinitely.
    ///
    /// The file named by the metainfo is scanned first so only verified
    /// pieces are advertised, and a tracker announce is fired off in the
    /// background so other clients can discover us.
    pub async fn start_seeder(&self) -> Result<()> {
        let path = self
            .meta
            .path
            .clone()
            .ok_or(Error::InvalidMetainfo("no local file to seed"))?;
        let store = Arc::new(PieceStore::open_existing(&path, self.storage)?);
        let (own_pieces, piece_count) = {
            let store = Arc::clone(&store);
            let meta = Arc::clone(&self.meta);
            task::spawn_blocking(move || store.scan(&meta.piece_hashes))
                .await
                .map_err(|_| Error::Channel)??
        };
        log::info!(
            "seeding torrent {}: {}/{} pieces available",
            self.meta.name,
            piece_count,
            self.storage.piece_count
        );

        // let the swarm know about us without holding up the listener
        let announce_list = self.meta.announce_list.clone();
        let params = Announce {
            info_hash: self.meta.info_hash,
            peer_id: self.conf.client_id,
            port: self.conf.port,
            downloaded: 0,
            uploaded: 0,
            left: 0,
            event: Event::None,
        };
        task::spawn(async move {
            if let Err(e) = tracker::request_peers(&announce_list, &params).await {
                log::debug!("seeding announce returned nothing: {}", e);
            }
        });

        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.conf.port));
        let mut listener = TcpListener::bind(addr).await?;
        log::info!("seeder listening on port {}", self.conf.port);

        loop {
            let (socket, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("failed to accept connection: {}", e);
                    continue;
                }
            };
            task::spawn(serve_peer(
                socket,
                addr,
                self.conf.client_id,
                self.conf.cipher_enabled,
                Arc::clone(&self.meta),
                self.storage,
                own_pieces.clone(),
                Arc::clone(&store),
                Arc::clone(&self.seed_status),
            ));
        }
    }
}

async fn serve_peer(
    socket: TcpStream,
    addr: SocketAddr,
    client_id: PeerId,
    cipher_enabled: bool,
    meta: Arc<Metainfo>,
    storage: StorageInfo,
    own_pieces: Bitfield,
    store: Arc<PieceStore>,
    status: Arc<RwLock<SeedStatus>>,
) {
    log::info!("inbound connection from {}", addr);
    {
        status.write().await.active_peers += 1;
    }
    if let Err(e) = serve_peer_loop(
        socket,
        addr,
        client_id,
        cipher_enabled,
        &meta,
        storage,
        &own_pieces,
        &store,
        &status,
    )
    .await
    {
        log::info!("peer {} done: {}", addr, e);
    }
    let mut status = status.write().await;
    status.active_peers = status.active_peers.saturating_sub(1);
}

async fn serve_peer_loop(
    socket: TcpStream,
    addr: SocketAddr,
    client_id: PeerId,
    cipher_enabled: bool,
    meta: &Arc<Metainfo>,
    storage: StorageInfo,
    own_pieces: &Bitfield,
    store: &Arc<PieceStore>,
    status: &RwLock<SeedStatus>,
) -> Result<()> {
    let mut session = PeerSession::inbound(
        socket,
        addr,
        client_id,
        meta.info_hash,
        own_pieces,
        cipher_enabled,
    )
    .await?;

    loop {
        match session.read_msg().await? {
            Message::Interested => {
                session.set_peer_interested(true);
                session.send_unchoke().await?;
            }
            Message::NotInterested => {
                session.set_peer_interested(false);
            }
            Message::Request(block) => {
                if !session.is_peer_interested() {
                    log::warn!(
                        "peer {} requested a block before declaring interest",
                        addr
                    );
                    continue;
                }
                let data = match read_requested_block(
                    &meta.piece_hashes,
                    &storage,
                    store,
                    block,
                )
                .await
                {
                    Ok(data) => data,
                    Err(e) => {
                        // a bad request is dropped, not fatal to the peer
                        log::warn!(
                            "peer {}: rejected request {:?}: {}",
                            addr,
                            block,
                            e
                        );
                        continue;
                    }
                };
                session
                    .send_block(block.piece_index, block.offset, data)
                    .await?;
                status.write().await.seeded_bytes += block.len as u64;
            }
            // keep-alives, the download direction's flow control, and
            // anything unknown
            _ => (),
        }
    }
}

/// Validates a request against the piece geometry and reads its bytes from
/// the backing file. A request spanning a whole piece is re-hashed before it
/// is served.
async fn read_requested_block(
    piece_hashes: &[Sha1Hash],
    storage: &StorageInfo,
    store: &Arc<PieceStore>,
    block: BlockInfo,
) -> Result<Vec<u8>> {
    // also rejects out of range piece indices
    let piece_len = storage.piece_len(block.piece_index)?;
    if block.offset as u64 + block.len as u64 > piece_len as u64 {
        return Err(Error::InvalidMessage);
    }

    let data = {
        let store = Arc::clone(store);
        task::spawn_blocking(move || {
            store.read_block(block.piece_index, block.offset, block.len)
        })
        .await
        .map_err(|_| Error::Channel)??
    };

    if block.offset == 0 && block.len == piece_len {
        let expected = &piece_hashes[block.piece_index];
        if Sha1::digest(&data).as_slice() != &expected[..] {
            return Err(Error::HashMismatch);
        }
    }
    Ok(data)
}
