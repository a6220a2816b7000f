//! The file assembler: owns the on-disk file handles for a torrent and
//! writes verified piece bytes to them.
//!
//! Grounded in the teacher's `disk::io::Torrent`: file handles are opened
//! once, up front, and writes for a given piece are split across whichever
//! files that piece's byte range intersects, using `StorageInfo`'s own
//! prefix-sum bookkeeping (`files_intersecting_piece`, `FileInfo::get_slice`)
//! to work out which handle gets which bytes at which offset. Where the
//! teacher reaches for `nix::sys::uio::pwritev` for a single vectored
//! syscall per piece, this module instead issues one `seek` + `write_all`
//! per intersecting file, which is plain standard library IO and avoids the
//! added surface of a platform-specific vectored-IO dependency for a piece
//! count that is, in practice, always small.

use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::Mutex,
};

use crate::{
    error::{Error, Result},
    storage_info::{FsStructure, StorageInfo},
    PieceIndex,
};

/// Opens and owns every file a torrent writes to, and assembles verified
/// piece bytes into them.
pub(crate) struct FileAssembler {
    /// Open file handles, in the same order as the files appear in
    /// `info.structure` (a single entry for `FsStructure::File`).
    handles: Vec<Mutex<File>>,
    info: StorageInfo,
}

impl FileAssembler {
    /// Opens (creating as necessary) every file described by `info`,
    /// creating any intermediate directories an archive download needs.
    pub(crate) fn new(info: &StorageInfo) -> Result<Self> {
        let handles = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "opening single file {:?} ({} bytes)",
                    file.path,
                    file.len
                );
                vec![Self::open_file(&file.path)?]
            }
            FsStructure::Archive { files } => {
                log::debug!("opening {} files for archive download", files.len());
                if !info.download_dir.exists() {
                    fs::create_dir_all(&info.download_dir)?;
                }
                let mut opened = Vec::with_capacity(files.len());
                for file in files {
                    let path = info.download_dir.join(&file.path);
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            log::info!("creating directory {:?}", parent);
                            fs::create_dir_all(parent)?;
                        }
                    }
                    opened.push(Self::open_file(&path)?);
                }
                opened
            }
        };
        Ok(Self {
            handles,
            info: info.clone(),
        })
    }

    fn open_file(path: &Path) -> Result<Mutex<File>> {
        let handle = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                log::warn!("failed to open {:?}: {}", path, e);
                Error::Io(e)
            })?;
        Ok(Mutex::new(handle))
    }

    /// Writes a verified piece's bytes, splitting them across whichever
    /// files the piece's byte range intersects.
    ///
    /// Writing the same bytes to the same offset twice is a no-op as far as
    /// on-disk content is concerned, satisfying idempotent-completion.
    pub(crate) fn write_piece(
        &self,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<()> {
        let piece_offset = index as u64 * self.info.piece_len as u64;
        log::trace!(
            "writing piece {} ({} bytes at offset {})",
            index,
            data.len(),
            piece_offset
        );

        let file_range = self.info.files_intersecting_piece(index)?;
        let mut written = 0u64;
        for file_index in file_range {
            let file_info = match &self.info.structure {
                FsStructure::File(file) => file,
                FsStructure::Archive { files } => &files[file_index],
            };
            let remaining = data.len() as u64 - written;
            let slice =
                file_info.get_slice(piece_offset + written, remaining);
            let bytes =
                &data[written as usize..(written + slice.len) as usize];

            let mut handle = self.handles[file_index]
                .lock()
                .expect("torrent file mutex poisoned");
            handle.seek(SeekFrom::Start(slice.offset))?;
            handle.write_all(bytes)?;

            written += slice.len;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metainfo::Metainfo, storage_info::FileInfo};
    use std::path::PathBuf;

    fn raw_metainfo(
        name: &str,
        piece_length: u64,
        pieces: &[u8],
        length: u64,
    ) -> Vec<u8> {
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
    fn writes_single_file_piece_at_offset() {
        let dir = std::env::temp_dir().join(format!(
            "bitleech-disk-test-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();

        let pieces = [0u8; 20];
        let raw = raw_metainfo("out.bin", 8, &pieces, 8);
        let metainfo = Metainfo::from_bytes(&raw).unwrap();
        let info = StorageInfo::new(&metainfo, dir.clone());

        let assembler = FileAssembler::new(&info).unwrap();
        assembler.write_piece(0, b"abcdefgh").unwrap();

        let written = fs::read(dir.join("out.bin")).unwrap();
        assert_eq!(written, b"abcdefgh");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn splits_piece_across_two_files() {
        let files = vec![
            FileInfo {
                path: PathBuf::from("/tmp/does-not-matter-a"),
                len: 4,
                torrent_offset: 0,
            },
            FileInfo {
                path: PathBuf::from("/tmp/does-not-matter-b"),
                len: 4,
                torrent_offset: 4,
            },
        ];
        let dir = std::env::temp_dir().join(format!(
            "bitleech-disk-test-split-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let files: Vec<_> = files
            .into_iter()
            .enumerate()
            .map(|(i, mut f)| {
                f.path = dir.join(format!("f{}", i));
                f
            })
            .collect();
        let info = StorageInfo {
            piece_count: 1,
            piece_len: 8,
            last_piece_len: 8,
            download_len: 8,
            download_dir: dir.clone(),
            structure: FsStructure::Archive { files },
        };
        let assembler = FileAssembler::new(&info).unwrap();
        assembler.write_piece(0, b"abcdefgh").unwrap();
        assert_eq!(fs::read(dir.join("f0")).unwrap(), b"abcd");
        assert_eq!(fs::read(dir.join("f1")).unwrap(), b"efgh");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn splits_piece_across_three_files_with_uneven_boundaries() {
        let dir = std::env::temp_dir().join(format!(
            "bitleech-disk-test-uneven-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let files = vec![
            FileInfo {
                path: dir.join("f0"),
                len: 3,
                torrent_offset: 0,
            },
            FileInfo {
                path: dir.join("f1"),
                len: 2,
                torrent_offset: 3,
            },
            FileInfo {
                path: dir.join("f2"),
                len: 5,
                torrent_offset: 5,
            },
        ];
        let info = StorageInfo {
            piece_count: 1,
            piece_len: 10,
            last_piece_len: 10,
            download_len: 10,
            download_dir: dir.clone(),
            structure: FsStructure::Archive { files },
        };
        let assembler = FileAssembler::new(&info).unwrap();
        assembler.write_piece(0, b"abcdefghij").unwrap();
        assert_eq!(fs::read(dir.join("f0")).unwrap(), b"abc");
        assert_eq!(fs::read(dir.join("f1")).unwrap(), b"de");
        assert_eq!(fs::read(dir.join("f2")).unwrap(), b"fghij");
        let _ = fs::remove_dir_all(&dir);
    }
}
