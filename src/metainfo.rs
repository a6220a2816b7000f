//! Parses a `.torrent` file's bencoded metainfo dictionary into the shape the
//! rest of the engine needs: an info hash, a flat list of piece digests, and
//! a file system structure (single file or archive).

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::{
    storage_info::{FileInfo, FsStructure},
    Sha1Hash,
};

/// A parsed `.torrent` file.
#[derive(Debug, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    pub announce: String,
}

impl Metainfo {
    /// Parses a metainfo dictionary from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }

    /// Computes the info hash: the SHA-1 digest of the bencoded `info`
    /// dictionary, re-encoded exactly as parsed (field order matters for
    /// bencode, which is why this re-encodes rather than hashing a slice of
    /// the original input).
    pub fn info_hash(&self) -> Result<Sha1Hash, serde_bencode::Error> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Returns the number of pieces, derived from the length of the
    /// concatenated piece hash string.
    pub fn piece_count(&self) -> usize {
        self.info.pieces.len() / 20
    }

    /// Splits the concatenated piece hash string into individual 20 byte
    /// SHA-1 digests, one per piece, in piece order.
    pub fn piece_hashes(&self) -> Vec<Sha1Hash> {
        self.info
            .pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect()
    }

    /// The nominal length of a piece, in bytes. The last piece may be
    /// shorter; see [`crate::storage_info::StorageInfo`].
    pub fn piece_len(&self) -> u32 {
        self.info.piece_length as u32
    }

    /// Derives the file system structure (single file or archive) that this
    /// torrent describes.
    pub fn structure(&self) -> FsStructure {
        match &self.info.files {
            Some(files) => {
                let mut torrent_offset = 0;
                let files = files
                    .iter()
                    .map(|file| {
                        let info = FileInfo {
                            path: file.path.iter().collect::<PathBuf>(),
                            len: file.length,
                            torrent_offset,
                        };
                        torrent_offset += file.length;
                        info
                    })
                    .collect();
                FsStructure::Archive { files }
            }
            None => FsStructure::File(FileInfo {
                path: PathBuf::from(&self.info.name),
                len: self.info.length.unwrap_or(0),
                torrent_offset: 0,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bencode_single_file(
        name: &str,
        piece_length: u64,
        pieces: &[u8],
        length: u64,
    ) -> Vec<u8> {
        // hand rolled minimal bencode dict so the parser test doesn't depend
        // on a second encoder implementation
        let head = format!(
            "d8:announce13:http://t.test4:infod6:lengthi{length}e4:name{name_len}:{name}12:piece lengthi{piece_length}e6:pieces{pieces_len}:",
            length = length,
            name_len = name.len(),
            name = name,
            piece_length = piece_length,
            pieces_len = pieces.len(),
        );
        let mut raw = head.into_bytes();
        raw.extend_from_slice(pieces);
        raw.extend_from_slice(b"ee");
        raw
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = [7u8; 20];
        let raw = bencode_single_file("file.bin", 32768, &pieces, 40000);
        let metainfo = Metainfo::from_bytes(&raw).unwrap();
        assert_eq!(metainfo.announce, "http://t.test");
        assert_eq!(metainfo.info.name, "file.bin");
        assert_eq!(metainfo.piece_len(), 32768);
        assert_eq!(metainfo.piece_count(), 1);
        assert_eq!(metainfo.piece_hashes(), vec![pieces]);
        assert!(matches!(metainfo.structure(), FsStructure::File(_)));
    }

    #[test]
    fn info_hash_is_stable_for_same_info() {
        let pieces = [1u8; 20];
        let raw = bencode_single_file("a.bin", 16384, &pieces, 16384);
        let a = Metainfo::from_bytes(&raw).unwrap();
        let b = Metainfo::from_bytes(&raw).unwrap();
        assert_eq!(a.info_hash().unwrap(), b.info_hash().unwrap());
    }
}
