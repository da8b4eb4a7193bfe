use crate::{error::*, metainfo::Metainfo, PieceIndex};

/// Information about a torrent's piece geometry: the piece count and lengths
/// and the download length.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece.
    pub piece_len: u32,
    /// The length of the last piece in torrent, which may differ from the
    /// normal piece length if the download size is not an exact multiple of
    /// the piece length.
    pub last_piece_len: u32,
    /// The length of the download, in bytes.
    pub total_len: u64,
}

impl StorageInfo {
    /// Extracts storage related information from the torrent metainfo.
    pub fn new(metainfo: &Metainfo) -> Self {
        let piece_count = metainfo.piece_count();
        let total_len = metainfo.len;
        let piece_len = metainfo.piece_len;
        let last_piece_len = if piece_count == 0 {
            0
        } else {
            (total_len - piece_len as u64 * (piece_count - 1) as u64) as u32
        };
        Self {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
        }
    }

    /// Returns the length of the piece at the given index.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index == self.piece_count.wrapping_sub(1) {
            Ok(self.last_piece_len)
        } else if index < self.piece_count {
            Ok(self.piece_len)
        } else {
            Err(Error::InvalidPieceIndex)
        }
    }

    /// Returns the byte offset of the piece within the download.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StorageInfo {
        StorageInfo {
            piece_count: 3,
            piece_len: 16384,
            last_piece_len: 1000,
            total_len: 2 * 16384 + 1000,
        }
    }

    #[test]
    fn test_piece_len() {
        let info = info();
        assert_eq!(info.piece_len(0).unwrap(), 16384);
        assert_eq!(info.piece_len(1).unwrap(), 16384);
        assert_eq!(info.piece_len(2).unwrap(), 1000);
        assert!(matches!(info.piece_len(3), Err(Error::InvalidPieceIndex)));
    }

    #[test]
    fn test_piece_offset() {
        let info = info();
        assert_eq!(info.piece_offset(0), 0);
        assert_eq!(info.piece_offset(2), 32768);
    }
}
