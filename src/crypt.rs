//! The optional stream cipher transport.
//!
//! The dialing side generates an AES-256 key and a CTR IV and sends both in
//! the clear right after the TCP connect; the listening side reads them and
//! keys an identical cipher pair. From then on the socket is an enciphered
//! duplex channel, with one exception: the first byte each side sends (the
//! handshake's pstrlen) stays in the clear, so a reader can frame the
//! handshake before its cipher direction is consulted.
//!
//! Since the key travels in band, this is traffic obfuscation only and not a
//! confidential channel. Peers that speak standard BitTorrent need the layer
//! disabled, in which case the stream is a transparent pass-through.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use aes::Aes256;
use ctr::cipher::{NewCipher, StreamCipher};
use futures::ready;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};

use crate::error::*;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub(crate) const KEY_LEN: usize = 32;
pub(crate) const IV_LEN: usize = 16;

/// Performs the dialer's side of the transport setup: generate and send the
/// key and IV, then wrap the socket.
pub(crate) async fn outbound(
    mut socket: TcpStream,
    enabled: bool,
) -> Result<CipherStream> {
    if !enabled {
        return Ok(CipherStream::plain(socket));
    }
    let mut key = [0; KEY_LEN];
    let mut iv = [0; IV_LEN];
    {
        let mut rng = rand::thread_rng();
        rng.fill(&mut key[..]);
        rng.fill(&mut iv[..]);
    }
    socket.write_all(&key).await?;
    socket.write_all(&iv).await?;
    CipherStream::keyed(socket, &key, &iv)
}

/// Performs the listener's side of the transport setup: read the dialer's
/// key and IV, then wrap the socket.
pub(crate) async fn inbound(
    mut socket: TcpStream,
    enabled: bool,
) -> Result<CipherStream> {
    if !enabled {
        return Ok(CipherStream::plain(socket));
    }
    let mut key = [0; KEY_LEN];
    let mut iv = [0; IV_LEN];
    socket.read_exact(&mut key).await?;
    socket.read_exact(&mut iv).await?;
    CipherStream::keyed(socket, &key, &iv)
}

/// One direction of the transport: its keystream and how many bytes are
/// still owed to the cleartext prefix.
struct Direction {
    cipher: Aes256Ctr,
    cleartext_left: usize,
}

impl Direction {
    fn apply(&mut self, buf: &mut [u8]) {
        let skip = self.cleartext_left.min(buf.len());
        self.cleartext_left -= skip;
        self.cipher.apply_keystream(&mut buf[skip..]);
    }
}

/// A socket wrapper enciphering both directions, or passing through
/// unchanged when the transport is disabled.
pub(crate) struct CipherStream {
    io: TcpStream,
    recv: Option<Direction>,
    send: Option<Direction>,
    /// Ciphertext accepted by `poll_write` but not yet written to the socket.
    pending: Vec<u8>,
}

impl CipherStream {
    fn plain(io: TcpStream) -> Self {
        Self {
            io,
            recv: None,
            send: None,
            pending: Vec::new(),
        }
    }

    fn keyed(io: TcpStream, key: &[u8], iv: &[u8]) -> Result<Self> {
        let new_cipher = || {
            Aes256Ctr::new_from_slices(key, iv).map_err(|_| {
                Error::from(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid cipher key or iv length",
                ))
            })
        };
        Ok(Self {
            recv: Some(Direction {
                cipher: new_cipher()?,
                cleartext_left: 1,
            }),
            send: Some(Direction {
                cipher: new_cipher()?,
                cleartext_left: 1,
            }),
            io,
            pending: Vec::new(),
        })
    }

    fn flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.pending.is_empty() {
            let n = ready!(Pin::new(&mut self.io).poll_write(cx, &self.pending))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending.drain(..n);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for CipherStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.io).poll_read(cx, buf))?;
        if let Some(recv) = &mut this.recv {
            recv.apply(&mut buf[..n]);
        }
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for CipherStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.send.is_none() {
            return Pin::new(&mut this.io).poll_write(cx, buf);
        }
        // Encipher into the pending buffer and accept the bytes right away;
        // the socket write is started here and completed by later writes or
        // the flush.
        let start = this.pending.len();
        this.pending.extend_from_slice(buf);
        if let Some(send) = &mut this.send {
            send.apply(&mut this.pending[start..]);
        }
        if let Poll::Ready(Err(e)) = this.flush_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.flush_pending(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.flush_pending(cx))?;
        Pin::new(&mut this.io).poll_shutdown(cx)
    }
}
