//! The file backed piece store.
//!
//! All access is positional (`pread`/`pwrite`), so concurrent readers and
//! writers never race on a shared cursor. The store performs sync IO and is
//! potentially blocking: async callers run its methods on the blocking thread
//! pool.

use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::AsRawFd,
    path::Path,
};

use nix::sys::uio::{pread, pwrite};
use sha1::{Digest, Sha1};

use crate::{error::*, storage_info::StorageInfo, Bitfield, PieceIndex, Sha1Hash};

pub(crate) struct PieceStore {
    file: File,
    info: StorageInfo,
}

impl PieceStore {
    /// Opens (creating if necessary) the download file for reading and
    /// writing.
    pub fn open(path: impl AsRef<Path>, info: StorageInfo) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(Self { file, info })
    }

    /// Opens an existing, presumably complete, file for seeding.
    pub fn open_existing(path: impl AsRef<Path>, info: StorageInfo) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file, info })
    }

    /// Hashes every piece sized slice of the file and returns which pieces
    /// are already present and valid, along with their count. Pieces the file
    /// is too short to contain count as absent.
    pub fn scan(&self, piece_hashes: &[Sha1Hash]) -> Result<(Bitfield, usize)> {
        debug_assert_eq!(piece_hashes.len(), self.info.piece_count);
        let mut pieces = Bitfield::repeat(false, self.info.piece_count);
        let mut piece_count = 0;
        let mut buf = vec![0; self.info.piece_len as usize];
        for (index, expected_hash) in piece_hashes.iter().enumerate() {
            let len = self.info.piece_len(index)? as usize;
            match self.read_exact_at(self.info.piece_offset(index), &mut buf[..len]) {
                Ok(()) => (),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => continue,
                Err(e) => return Err(e.into()),
            }
            if Sha1::digest(&buf[..len]).as_slice() == &expected_hash[..] {
                pieces.set(index, true);
                piece_count += 1;
            }
        }
        log::debug!(
            "scanned backing file: {}/{} pieces present",
            piece_count,
            self.info.piece_count
        );
        Ok((pieces, piece_count))
    }

    /// Writes a whole downloaded piece at its offset in the file.
    pub fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u32, self.info.piece_len(index)?);
        let fd = self.file.as_raw_fd();
        let mut offset = self.info.piece_offset(index);
        let mut pos = 0;
        // IO syscalls are not guaranteed to transfer the whole buffer in one
        // go, so keep going until every byte is confirmed written
        while pos < data.len() {
            let n = pwrite(fd, &data[pos..], offset as i64).map_err(nix_to_io)?;
            pos += n;
            offset += n as u64;
        }
        Ok(())
    }

    /// Reads a block out of a piece.
    pub fn read_block(
        &self,
        index: PieceIndex,
        block_offset: u32,
        len: u32,
    ) -> Result<Vec<u8>> {
        let mut buf = vec![0; len as usize];
        let offset = self.info.piece_offset(index) + block_offset as u64;
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_exact_at(&self, mut offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let mut pos = 0;
        while pos < buf.len() {
            let n = pread(fd, &mut buf[pos..], offset as i64).map_err(nix_to_io)?;
            if n == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            pos += n;
            offset += n as u64;
        }
        Ok(())
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(buf: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(buf);
        let mut hash = [0; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    fn info() -> StorageInfo {
        StorageInfo {
            piece_count: 3,
            piece_len: 4096,
            last_piece_len: 1000,
            total_len: 2 * 4096 + 1000,
        }
    }

    fn pieces() -> Vec<Vec<u8>> {
        vec![vec![0xA1; 4096], vec![0xB2; 4096], vec![0xC3; 1000]]
    }

    #[test]
    fn test_write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::open(dir.path().join("out.bin"), info()).unwrap();

        // write out of order, read back by block
        store.write_piece(2, &pieces()[2]).unwrap();
        store.write_piece(0, &pieces()[0]).unwrap();
        assert_eq!(store.read_block(0, 0, 4096).unwrap(), pieces()[0]);
        assert_eq!(store.read_block(2, 100, 200).unwrap(), vec![0xC3; 200]);
    }

    #[test]
    fn test_scan_reports_present_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let store = PieceStore::open(&path, info()).unwrap();
        let hashes: Vec<_> = pieces().iter().map(|p| sha1(p)).collect();

        // nothing on disk yet
        let (bitfield, count) = store.scan(&hashes).unwrap();
        assert_eq!(count, 0);
        assert!(!bitfield.any());

        // pieces 0 and 2 written; 1 is a hole of zeroes and must not verify
        store.write_piece(0, &pieces()[0]).unwrap();
        store.write_piece(2, &pieces()[2]).unwrap();
        let (bitfield, count) = store.scan(&hashes).unwrap();
        assert_eq!(count, 2);
        assert!(bitfield[0]);
        assert!(!bitfield[1]);
        assert!(bitfield[2]);
    }

    #[test]
    fn test_short_file_block_read_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = PieceStore::open(dir.path().join("out.bin"), info()).unwrap();
        store.write_piece(0, &pieces()[0]).unwrap();
        assert!(store.read_block(1, 0, 4096).is_err());
    }
}
