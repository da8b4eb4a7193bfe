#[macro_use]
extern crate serde_derive;

pub mod conf;
mod crypt;
pub mod error;
pub mod metainfo;
mod peer;
mod seed;
mod storage_info;
mod store;
pub mod torrent;
mod tracker;

use bitvec::prelude::{BitVec, Msb0};

pub use conf::Conf;
pub use metainfo::Metainfo;
pub use torrent::{DownloadStatus, SeedStatus, Torrent};

/// A piece's position within the torrent. Carried as a 4-byte big endian
/// integer on the wire, but kept as `usize` in memory so it can index
/// bitfields and hash lists directly.
pub type PieceIndex = usize;

/// A 20 byte client identity, announced to trackers and exchanged in
/// handshakes (BEP 20).
pub type PeerId = [u8; 20];

/// A 20 byte SHA-1 digest.
pub type Sha1Hash = [u8; 20];

/// Piece availability, one bit per piece in piece order.
///
/// The layout matches the wire format of the bitfield message: the highest
/// bit of the first byte is piece 0, so byte `k`'s top bit is piece `8k`. A
/// set bit means the piece is present and verified.
pub type Bitfield = BitVec<Msb0, u8>;

/// The block size requests are cut into, 16 KiB. Only a piece's trailing
/// block may be shorter.
pub(crate) const BLOCK_LEN: u32 = 0x4000;

/// A byte range within one piece, the unit of a single request/block
/// exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockInfo {
    /// The piece this block belongs to.
    pub piece_index: PieceIndex,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes.
    pub len: u32,
}
