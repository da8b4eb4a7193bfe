//! Peer sessions: the dialing side used by the download workers and the
//! listening side used by the seeder.

pub(crate) mod codec;

use std::{io, net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    crypt::{self, CipherStream},
    error::*,
    Bitfield, BlockInfo, PeerId, PieceIndex, Sha1Hash, BLOCK_LEN,
};
pub(crate) use codec::Message;
use codec::*;

/// How long a TCP dial may take before the peer is abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a read may stall while a piece download is in progress.
const PIECE_TIMEOUT: Duration = Duration::from_secs(30);

/// The number of block requests kept outstanding on a connection to saturate
/// the link.
const MAX_REQUEST_BACKLOG: usize = 5;

/// Both sides of a connection start out choked and not interested.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            is_choked: true,
            is_peer_interested: false,
        }
    }
}

/// An established connection with a peer, on either side of the protocol.
pub(crate) struct PeerSession {
    addr: SocketAddr,
    socket: Framed<CipherStream, PeerCodec>,
    status: Status,
    /// Which pieces the remote has, per its bitfield and have messages.
    pieces: Bitfield,
}

impl PeerSession {
    /// Creates an outbound session: dials the peer, runs the optional cipher
    /// preamble, exchanges handshakes and captures the peer's bitfield, which
    /// it must send as its first message.
    pub async fn outbound(
        addr: SocketAddr,
        client_id: PeerId,
        info_hash: Sha1Hash,
        piece_count: usize,
        cipher_enabled: bool,
    ) -> Result<Self> {
        log::debug!("connecting to peer {}", addr);
        let socket =
            time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await??;
        let socket = crypt::outbound(socket, cipher_enabled).await?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        log::debug!("sending handshake to peer {}", addr);
        socket.send(Handshake::new(info_hash, client_id)).await?;
        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(disconnected()),
        };
        if peer_handshake.info_hash != info_hash {
            log::warn!("peer {} handshake info hash mismatch", addr);
            return Err(Error::InvalidPeerInfoHash);
        }

        let mut socket = switch_codec(socket);

        // the peer must declare its piece availability before anything else
        let msg = match socket.next().await {
            Some(msg) => msg?,
            None => return Err(disconnected()),
        };
        let mut pieces = match msg {
            Message::Bitfield(bitfield) => bitfield,
            _ => {
                log::warn!("peer {} did not send a bitfield first", addr);
                return Err(Error::UnexpectedMessage);
            }
        };
        // the wire bitfield is padded out to a byte boundary, which may make
        // it longer than the actual piece count
        pieces.resize(piece_count, false);

        log::info!("peer {} session established", addr);
        Ok(Self {
            addr,
            socket,
            status: Status::default(),
            pieces,
        })
    }

    /// Creates an inbound session on an accepted socket: runs the listening
    /// side of the cipher preamble, answers the peer's handshake and sends our
    /// bitfield.
    pub async fn inbound(
        socket: TcpStream,
        addr: SocketAddr,
        client_id: PeerId,
        info_hash: Sha1Hash,
        own_pieces: &Bitfield,
        cipher_enabled: bool,
    ) -> Result<Self> {
        let socket = crypt::inbound(socket, cipher_enabled).await?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        let peer_handshake = match socket.next().await {
            Some(handshake) => handshake?,
            None => return Err(disconnected()),
        };
        if peer_handshake.info_hash != info_hash {
            log::warn!("peer {} handshake info hash mismatch", addr);
            return Err(Error::InvalidPeerInfoHash);
        }
        socket.send(Handshake::new(info_hash, client_id)).await?;

        let mut socket = switch_codec(socket);
        socket.send(Message::Bitfield(own_pieces.clone())).await?;

        log::info!("inbound peer {} session established", addr);
        Ok(Self {
            addr,
            socket,
            status: Status::default(),
            pieces: Bitfield::repeat(false, own_pieces.len()),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether the remote claims to have the piece. Out of range indices read
    /// as not present.
    pub fn has_piece(&self, index: PieceIndex) -> bool {
        self.pieces.get(index).map(|bit| *bit).unwrap_or(false)
    }

    pub fn is_peer_interested(&self) -> bool {
        self.status.is_peer_interested
    }

    pub fn set_peer_interested(&mut self, is_interested: bool) {
        self.status.is_peer_interested = is_interested;
    }

    /// Reads the next message, blocking until the peer sends one.
    pub async fn read_msg(&mut self) -> Result<Message> {
        match self.socket.next().await {
            Some(msg) => {
                let msg = msg?;
                log::trace!("peer {} sent {:?}", self.addr, msg.id());
                Ok(msg)
            }
            None => Err(disconnected()),
        }
    }

    async fn read_msg_deadline(&mut self) -> Result<Message> {
        Ok(time::timeout(PIECE_TIMEOUT, self.read_msg()).await??)
    }

    pub async fn send_unchoke(&mut self) -> Result<()> {
        self.socket.send(Message::Unchoke).await
    }

    pub async fn send_interested(&mut self) -> Result<()> {
        self.socket.send(Message::Interested).await
    }

    pub async fn send_have(&mut self, index: PieceIndex) -> Result<()> {
        self.socket.send(Message::Have { piece_index: index }).await
    }

    async fn send_request(&mut self, block: BlockInfo) -> Result<()> {
        self.socket.send(Message::Request(block)).await
    }

    pub async fn send_block(
        &mut self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<()> {
        self.socket
            .send(Message::Block {
                piece_index,
                offset,
                data,
            })
            .await
    }

    /// Downloads one piece through the request pipeline: keeps up to
    /// [`MAX_REQUEST_BACKLOG`] requests outstanding and assembles the piece
    /// buffer from the block responses, tolerating chokes and interleaved
    /// have messages. Every read is bounded by a deadline so a stalled peer
    /// cannot sit on the piece forever.
    pub async fn download_piece(
        &mut self,
        index: PieceIndex,
        piece_len: u32,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0; piece_len as usize];
        let mut downloaded: u32 = 0;
        let mut requested: u32 = 0;
        let mut backlog: usize = 0;

        while downloaded < piece_len {
            if !self.status.is_choked {
                while backlog < MAX_REQUEST_BACKLOG && requested < piece_len {
                    let len = BLOCK_LEN.min(piece_len - requested);
                    self.send_request(BlockInfo {
                        piece_index: index,
                        offset: requested,
                        len,
                    })
                    .await?;
                    requested += len;
                    backlog += 1;
                }
            }

            match self.read_msg_deadline().await? {
                Message::Choke => self.status.is_choked = true,
                Message::Unchoke => self.status.is_choked = false,
                Message::Have { piece_index } => {
                    set_piece(&mut self.pieces, piece_index)
                }
                Message::Block {
                    piece_index,
                    offset,
                    data,
                } => {
                    downloaded +=
                        copy_block(index, &mut buf, piece_index, offset, &data)?;
                    // blocks the peer volunteers don't shrink the backlog
                    backlog = backlog.saturating_sub(1);
                }
                // keep-alives and flow control for the serving direction
                _ => (),
            }
        }
        Ok(buf)
    }
}

/// Marks a piece as present, ignoring out of range announcements.
fn set_piece(pieces: &mut Bitfield, index: PieceIndex) {
    if index < pieces.len() {
        pieces.set(index, true);
    } else {
        log::warn!("have message with piece index {} out of range", index);
    }
}

/// Validates a block response against the piece being assembled and copies
/// its data into place, returning the block's length.
fn copy_block(
    expected_index: PieceIndex,
    buf: &mut [u8],
    piece_index: PieceIndex,
    offset: u32,
    data: &[u8],
) -> Result<u32> {
    if piece_index != expected_index {
        log::warn!(
            "block for piece {} while downloading piece {}",
            piece_index,
            expected_index
        );
        return Err(Error::InvalidMessage);
    }
    let offset = offset as usize;
    if offset >= buf.len() || offset + data.len() > buf.len() {
        log::warn!(
            "block at {} with length {} overruns piece of length {}",
            offset,
            data.len(),
            buf.len()
        );
        return Err(Error::InvalidMessage);
    }
    buf[offset..offset + data.len()].copy_from_slice(data);
    Ok(data.len() as u32)
}

/// Replaces the handshake codec with the peer message codec, keeping any
/// bytes the peer may have sent right after its handshake.
fn switch_codec(
    socket: Framed<CipherStream, HandshakeCodec>,
) -> Framed<CipherStream, PeerCodec> {
    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
    // reuse buffers of previous codec
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    Framed::from_parts(new_parts)
}

fn disconnected() -> Error {
    Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}
