//! Parsing, creation, and saving of single file `.torrent` metainfo.

use std::{
    collections::HashSet,
    fs,
    io::Read,
    ops::Range,
    path::{Path, PathBuf},
};

use sha1::{Digest, Sha1};

use crate::{error::*, Sha1Hash};

/// The parsed metainfo of a single file torrent. Immutable after parsing.
#[derive(Clone, Debug)]
pub struct Metainfo {
    /// The name of the download, also used as its file name.
    pub name: String,
    /// The SHA-1 hash of the raw bencoded `info` dictionary, identifying the
    /// torrent in the swarm.
    pub info_hash: Sha1Hash,
    /// The expected hash of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
    /// The length of the download, in bytes.
    pub len: u64,
    /// The tracker URLs to announce to, in order, without duplicates.
    pub announce_list: Vec<String>,
    /// Free form description, carried in the info dictionary.
    pub description: Option<String>,
    /// The path of a local copy of the download, if one is known. This is
    /// what the seeder serves from.
    pub path: Option<PathBuf>,
}

/// The shape of the whole `.torrent` file, as read from disk.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: Option<String>,
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: RawInfo,
}

/// The `info` dictionary. Field order matches the sorted key order bencoding
/// mandates.
#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    length: u64,
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct RawTorrent {
    announce: String,
    info: RawInfo,
}

impl Metainfo {
    /// Reads and parses the `.torrent` file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let buf = fs::read(path)?;
        Self::from_bytes(&buf)
    }

    /// Parses a bencoded `.torrent` byte buffer.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw: RawMetainfo = serde_bencode::from_bytes(buf)?;

        // The info hash must be computed over the verbatim bencoded bytes of
        // the info value as they appear in the input. Re-encoding the parsed
        // struct would drop keys we don't model and change the hash.
        let info_span = raw_info_span(buf)?;
        let info_hash = sha1(&buf[info_span]);

        if raw.info.piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length must be positive"));
        }
        let piece_hashes = split_piece_hashes(&raw.info.pieces)?;
        let piece_count = (raw.info.length + raw.info.piece_length as u64 - 1)
            / raw.info.piece_length as u64;
        if piece_count != piece_hashes.len() as u64 {
            return Err(Error::InvalidMetainfo(
                "piece hash count does not match length",
            ));
        }

        // The flat `announce` key comes first, then every single element tier
        // of `announce-list`, skipping duplicates but keeping the order.
        let mut announce_list = Vec::new();
        let mut seen = HashSet::new();
        let tiers = raw.announce_list.unwrap_or_default();
        for url in raw
            .announce
            .into_iter()
            .chain(tiers.into_iter().filter(|t| t.len() == 1).flatten())
        {
            if seen.insert(url.clone()) {
                announce_list.push(url);
            }
        }

        log::debug!(
            "parsed torrent {} info hash {}",
            raw.info.name,
            hex::encode(&info_hash)
        );

        Ok(Self {
            name: raw.info.name,
            info_hash,
            piece_hashes,
            piece_len: raw.info.piece_length,
            len: raw.info.length,
            announce_list,
            description: raw.info.description,
            path: None,
        })
    }

    /// Builds the metainfo of an existing local file so it can be shared:
    /// hashes the file in `piece_length` sized chunks (the last chunk may be
    /// short) and records the file as the seeding source.
    pub fn create_from_file(
        path: impl Into<PathBuf>,
        announce: &str,
        name: &str,
        description: &str,
        piece_length: u32,
    ) -> Result<Self> {
        if piece_length == 0 {
            return Err(Error::InvalidMetainfo("piece length must be positive"));
        }
        let path = path.into();
        let mut file = fs::File::open(&path)?;

        let mut pieces = Vec::new();
        let mut len: u64 = 0;
        let mut chunk = vec![0; piece_length as usize];
        loop {
            let mut read = 0;
            while read < chunk.len() {
                let n = file.read(&mut chunk[read..])?;
                if n == 0 {
                    break;
                }
                read += n;
            }
            if read == 0 {
                break;
            }
            pieces.extend_from_slice(&sha1(&chunk[..read]));
            len += read as u64;
            if read < chunk.len() {
                break;
            }
        }

        let info = RawInfo {
            description: Some(description.to_string()),
            length: len,
            name: name.to_string(),
            piece_length,
            pieces: pieces.clone(),
        };
        let info_bytes = serde_bencode::to_bytes(&info)?;
        let info_hash = sha1(&info_bytes);

        Ok(Self {
            name: name.to_string(),
            info_hash,
            piece_hashes: split_piece_hashes(&pieces)?,
            piece_len: piece_length,
            len,
            announce_list: vec![announce.to_string()],
            description: Some(description.to_string()),
            path: Some(path),
        })
    }

    /// Bencodes the metainfo into a `.torrent` file at the given path.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let announce = self
            .announce_list
            .first()
            .ok_or(Error::InvalidMetainfo("no announce url"))?;
        let mut pieces = Vec::with_capacity(self.piece_hashes.len() * 20);
        for hash in &self.piece_hashes {
            pieces.extend_from_slice(hash);
        }
        let torrent = RawTorrent {
            announce: announce.clone(),
            info: RawInfo {
                description: self.description.clone(),
                length: self.len,
                name: self.name.clone(),
                piece_length: self.piece_len,
                pieces,
            },
        };
        fs::write(path, serde_bencode::to_bytes(&torrent)?)?;
        Ok(())
    }

    /// The number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }
}

fn sha1(buf: &[u8]) -> Sha1Hash {
    let digest = Sha1::digest(buf);
    let mut hash = [0; 20];
    hash.copy_from_slice(&digest);
    hash
}

fn split_piece_hashes(pieces: &[u8]) -> Result<Vec<Sha1Hash>> {
    if pieces.len() % 20 != 0 {
        return Err(Error::InvalidPieces);
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

/// Returns the byte range of the raw bencoded `info` value within a torrent
/// buffer, by walking the top level dictionary without decoding values.
fn raw_info_span(buf: &[u8]) -> Result<Range<usize>> {
    if buf.first() != Some(&b'd') {
        return Err(Error::InvalidMetainfo("torrent is not a dictionary"));
    }
    let mut pos = 1;
    while buf.get(pos).copied().ok_or(TRUNCATED)? != b'e' {
        let (key, key_end) = parse_bytes(buf, pos)?;
        let val_end = skip_value(buf, key_end)?;
        if key == b"info" {
            return Ok(key_end..val_end);
        }
        pos = val_end;
    }
    Err(Error::InvalidMetainfo("no info dictionary"))
}

const TRUNCATED: Error = Error::InvalidMetainfo("truncated bencoding");

/// Parses a bencoded byte string at `pos`, returning its contents and the
/// offset one past its end.
fn parse_bytes(buf: &[u8], pos: usize) -> Result<(&[u8], usize)> {
    let colon = buf[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|i| pos + i)
        .ok_or(TRUNCATED)?;
    let len: usize = std::str::from_utf8(&buf[pos..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(TRUNCATED)?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or(TRUNCATED)?;
    Ok((&buf[start..end], end))
}

/// Returns the offset one past the bencoded value starting at `pos`.
fn skip_value(buf: &[u8], pos: usize) -> Result<usize> {
    match buf.get(pos).copied().ok_or(TRUNCATED)? {
        b'i' => buf[pos..]
            .iter()
            .position(|&b| b == b'e')
            .map(|i| pos + i + 1)
            .ok_or(TRUNCATED),
        b'l' | b'd' => {
            let mut pos = pos + 1;
            while buf.get(pos).copied().ok_or(TRUNCATED)? != b'e' {
                pos = skip_value(buf, pos)?;
            }
            Ok(pos + 1)
        }
        b'0'..=b'9' => parse_bytes(buf, pos).map(|(_, end)| end),
        _ => Err(TRUNCATED),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds the bencoding of a small two piece torrent by hand.
    fn sample_torrent() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d");
        buf.extend_from_slice(b"8:announce17:udp://a.test:8080");
        buf.extend_from_slice(
            b"13:announce-listll17:udp://a.test:8080el17:http://b.test/annel4:more4:tier4:urlsee",
        );
        buf.extend_from_slice(b"4:infod");
        buf.extend_from_slice(b"6:lengthi17000e");
        buf.extend_from_slice(b"4:name8:test.bin");
        buf.extend_from_slice(b"12:piece lengthi16384e");
        buf.extend_from_slice(b"6:pieces40:");
        buf.extend_from_slice(&[0xAB; 20]);
        buf.extend_from_slice(&[0xCD; 20]);
        buf.extend_from_slice(b"e");
        buf.extend_from_slice(b"e");
        buf
    }

    #[test]
    fn test_parse_sample_torrent() {
        let buf = sample_torrent();
        let meta = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(meta.name, "test.bin");
        assert_eq!(meta.len, 17000);
        assert_eq!(meta.piece_len, 16384);
        assert_eq!(meta.piece_hashes, vec![[0xAB; 20], [0xCD; 20]]);
        // the flat announce is first and deduplicated against the list
        assert_eq!(
            meta.announce_list,
            vec![
                "udp://a.test:8080".to_string(),
                "http://b.test/ann".to_string()
            ]
        );
        assert_eq!(meta.description, None);
        assert_eq!(meta.path, None);
    }

    // The hash must cover the exact bytes of the info value in the input, not
    // a re-encoding of the parsed fields.
    #[test]
    fn test_info_hash_covers_raw_span() {
        let buf = sample_torrent();
        let span = raw_info_span(&buf).unwrap();
        assert_eq!(buf[span.start], b'd');
        assert_eq!(buf[span.end - 1], b'e');
        // the info dict runs to the second to last byte of the torrent
        assert_eq!(span.end, buf.len() - 1);

        let meta = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(meta.info_hash, sha1(&buf[raw_info_span(&buf).unwrap()]));
    }

    #[test]
    fn test_malformed_pieces_length() {
        // 21 byte piece string
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d4:infod6:lengthi10e4:name1:x12:piece lengthi10e6:pieces21:");
        buf.extend_from_slice(&[0; 21]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidPieces)
        ));
    }

    #[test]
    fn test_piece_count_must_match_length() {
        // 17000 bytes at 16384 piece length needs 2 hashes, only 1 given
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d4:infod6:lengthi17000e4:name1:x12:piece lengthi16384e6:pieces20:",
        );
        buf.extend_from_slice(&[0; 20]);
        buf.extend_from_slice(b"ee");
        assert!(matches!(
            Metainfo::from_bytes(&buf),
            Err(Error::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_missing_info_is_a_parse_error() {
        assert!(matches!(
            Metainfo::from_bytes(b"d8:announce3:urle"),
            Err(Error::Bencode(_))
        ));
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        fs::write(&data_path, &data).unwrap();

        let meta = Metainfo::create_from_file(
            &data_path,
            "http://tracker.test/announce",
            "payload.bin",
            "a test payload",
            16384,
        )
        .unwrap();
        assert_eq!(meta.len, 40_000);
        assert_eq!(meta.piece_count(), 3);
        assert_eq!(meta.piece_hashes[0], sha1(&data[..16384]));
        assert_eq!(meta.piece_hashes[2], sha1(&data[32768..]));
        assert_eq!(meta.path.as_deref(), Some(data_path.as_path()));

        // saving and reopening preserves the fields and the info hash
        let torrent_path = dir.path().join("payload.torrent");
        meta.save(&torrent_path).unwrap();
        let reopened = Metainfo::open(&torrent_path).unwrap();
        assert_eq!(reopened.info_hash, meta.info_hash);
        assert_eq!(reopened.piece_hashes, meta.piece_hashes);
        assert_eq!(reopened.len, meta.len);
        assert_eq!(reopened.description.as_deref(), Some("a test payload"));
        assert_eq!(
            reopened.announce_list,
            vec!["http://tracker.test/announce".to_string()]
        );
    }
}
