//! All errors that the engine may produce.

use std::{fmt, io};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Bencode (de)serialization errors.
    Bencode(serde_bencode::Error),
    /// The metainfo is syntactically valid bencoding but violates the
    /// single file torrent shape (missing keys, inconsistent lengths).
    InvalidMetainfo(&'static str),
    /// The concatenated piece hash string is not a multiple of 20 bytes.
    InvalidPieces,
    /// The info hash in the peer's handshake did not match ours.
    InvalidPeerInfoHash,
    /// The handshake protocol string is empty or not the BitTorrent v1
    /// protocol string.
    InvalidProtocol,
    /// The peer sent a message that is not valid at this point of the
    /// exchange (e.g. anything but a bitfield right after the handshake).
    UnexpectedMessage,
    /// A message payload violates the wire format.
    InvalidMessage,
    /// A piece index is not within the torrent's piece count.
    InvalidPieceIndex,
    /// A piece did not hash to its expected value.
    HashMismatch,
    /// A network or timer deadline elapsed.
    Timeout,
    /// Every tracker in the announce list was tried and the cumulative peer
    /// set is still empty.
    NoPeers,
    /// The tracker replied but the response could not be used.
    TrackerResponse(&'static str),
    /// An internal channel or task was closed while still needed.
    Channel,
    /// HTTP tracker errors.
    Http(reqwest::Error),
    /// IO errors, from both the network and the backing file.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Bencode(e) => write!(f, "bencode error: {}", e),
            Error::InvalidMetainfo(reason) => {
                write!(f, "invalid metainfo: {}", reason)
            }
            Error::InvalidPieces => {
                write!(f, "piece hash string is not a multiple of 20 bytes")
            }
            Error::InvalidPeerInfoHash => {
                write!(f, "peer handshake info hash mismatch")
            }
            Error::InvalidProtocol => {
                write!(f, "invalid handshake protocol string")
            }
            Error::UnexpectedMessage => write!(f, "unexpected peer message"),
            Error::InvalidMessage => write!(f, "malformed peer message"),
            Error::InvalidPieceIndex => write!(f, "piece index out of range"),
            Error::HashMismatch => {
                write!(f, "piece failed its integrity check")
            }
            Error::Timeout => write!(f, "operation timed out"),
            Error::NoPeers => write!(f, "no peers from any tracker"),
            Error::TrackerResponse(reason) => {
                write!(f, "tracker response error: {}", reason)
            }
            Error::Channel => write!(f, "internal channel closed"),
            Error::Http(e) => write!(f, "http error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_bencode::Error> for Error {
    fn from(e: serde_bencode::Error) -> Self {
        Self::Bencode(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}
