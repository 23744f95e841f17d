//! On-disk assembly of the torrent payload.
//!
//! Pieces are written only after hash verification. A piece may straddle
//! file boundaries in a multi-file torrent, in which case its bytes are split
//! across the affected files. Partial downloads live under a scratch root
//! and are moved into their final location during finalization.

use std::ops::Range;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use crate::bitfield::Bitfield;
use crate::error::{EngineError, Result};
use crate::metainfo::TorrentMetadata;
use crate::{FileIndex, PieceIndex};

/// Location and span of one file within the contiguous torrent byte stream.
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// Path relative to the download root.
    pub path: PathBuf,
    /// File length in bytes.
    pub len: u64,
    /// Offset of the file's first byte within the torrent stream.
    pub torrent_offset: u64,
}

impl FileInfo {
    fn torrent_end_offset(&self) -> u64 {
        self.torrent_offset + self.len
    }

    fn byte_range(&self) -> Range<u64> {
        self.torrent_offset..self.torrent_end_offset()
    }

    /// The in-file slice overlapping a torrent-stream range starting at
    /// `torrent_offset` with at most `len` bytes.
    fn slice(&self, torrent_offset: u64, len: u64) -> (u64, u64) {
        debug_assert!(torrent_offset >= self.torrent_offset);
        debug_assert!(torrent_offset < self.torrent_end_offset());
        let offset = torrent_offset - self.torrent_offset;
        let available = self.torrent_end_offset() - torrent_offset;
        (offset, len.min(available))
    }
}

/// Derived layout facts about a torrent's payload.
#[derive(Clone, Debug)]
pub struct StorageInfo {
    /// Number of pieces.
    pub piece_count: usize,
    /// Nominal piece length.
    pub piece_len: u32,
    /// Length of the final piece.
    pub last_piece_len: u32,
    /// Total payload size.
    pub total_len: u64,
    /// Flattened file list with torrent-stream offsets.
    pub files: Vec<FileInfo>,
    /// Index of the file served to players.
    pub primary_index: FileIndex,
}

impl StorageInfo {
    /// Extract layout facts from parsed metadata.
    #[must_use]
    pub fn new(metadata: &TorrentMetadata) -> Self {
        let mut offset = 0u64;
        let files = metadata
            .files
            .iter()
            .map(|entry| {
                let info = FileInfo {
                    path: entry.path.clone(),
                    len: entry.length,
                    torrent_offset: offset,
                };
                offset += entry.length;
                info
            })
            .collect();

        let piece_count = metadata.num_pieces();
        let total_len = metadata.total_size();
        let last_piece_len =
            (total_len - u64::from(metadata.piece_length) * (piece_count as u64 - 1)) as u32;

        Self {
            piece_count,
            piece_len: metadata.piece_length,
            last_piece_len,
            total_len,
            files,
            primary_index: metadata.primary_file_index(),
        }
    }

    /// Length of the piece at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPieceIndex`] for out-of-bounds indices.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        if index + 1 == self.piece_count {
            Ok(self.last_piece_len)
        } else if index + 1 < self.piece_count {
            Ok(self.piece_len)
        } else {
            Err(EngineError::InvalidPieceIndex { index })
        }
    }

    /// Byte offset of a piece within the torrent stream.
    #[must_use]
    pub const fn piece_offset(&self, index: PieceIndex) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Indices of the files the piece overlaps.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPieceIndex`] for out-of-bounds indices.
    pub fn files_intersecting_piece(&self, index: PieceIndex) -> Result<Range<FileIndex>> {
        let start = self.piece_offset(index);
        let end = start + u64::from(self.piece_len(index)?);
        Ok(self.files_intersecting_bytes(start..end))
    }

    fn files_intersecting_bytes(&self, byte_range: Range<u64>) -> Range<FileIndex> {
        let first = match self
            .files
            .iter()
            .position(|file| file.byte_range().contains(&byte_range.start))
        {
            Some(index) => index,
            None => return 0..0,
        };

        let mut range = first..first + 1;
        for (index, file) in self.files.iter().enumerate().skip(first + 1) {
            if !byte_range.contains(&file.torrent_offset) {
                break;
            }
            range.end = index + 1;
        }
        range
    }

    /// Bytes of the file at `file_index` that are contiguously verified from
    /// the file's first byte, given our piece ownership.
    ///
    /// This is what bounds progressive streaming of a still-growing
    /// download.
    #[must_use]
    pub fn contiguous_file_bytes(&self, file_index: FileIndex, own: &Bitfield) -> u64 {
        let Some(file) = self.files.get(file_index) else {
            return 0;
        };
        if file.len == 0 {
            return 0;
        }

        let file_end = file.torrent_end_offset();
        let first_piece = (file.torrent_offset / u64::from(self.piece_len)) as usize;
        let mut covered_to = file.torrent_offset;

        for piece in first_piece..self.piece_count {
            if !own.has(piece) {
                break;
            }
            let piece_end =
                self.piece_offset(piece) + u64::from(self.piece_len(piece).unwrap_or(0));
            covered_to = piece_end.min(file_end);
            if covered_to == file_end {
                break;
            }
        }
        covered_to.saturating_sub(file.torrent_offset)
    }
}

/// Writer that lands verified pieces in the right files under a root
/// directory.
#[derive(Clone, Debug)]
pub struct TorrentStorage {
    info: StorageInfo,
    root: PathBuf,
}

impl TorrentStorage {
    /// A storage writer rooted at `root`.
    #[must_use]
    pub fn new(info: StorageInfo, root: PathBuf) -> Self {
        Self { info, root }
    }

    /// The derived layout facts.
    #[must_use]
    pub const fn info(&self) -> &StorageInfo {
        &self.info
    }

    /// Absolute path of a file while it lives under this storage root.
    #[must_use]
    pub fn absolute_path(&self, file_index: FileIndex) -> Option<PathBuf> {
        self.info
            .files
            .get(file_index)
            .map(|file| self.root.join(&file.path))
    }

    /// Write a verified piece, splitting it across file boundaries.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors and invalid piece indices.
    pub async fn write_piece(&self, index: PieceIndex, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len() as u32, self.info.piece_len(index)?);
        let mut stream_offset = self.info.piece_offset(index);
        let mut remaining: &[u8] = bytes;

        for file_index in self.info.files_intersecting_piece(index)? {
            let file = &self.info.files[file_index];
            let (file_offset, slice_len) = file.slice(stream_offset, remaining.len() as u64);
            let (chunk, rest) = remaining.split_at(slice_len as usize);

            let path = self.root.join(&file.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut handle = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .await?;
            handle.seek(std::io::SeekFrom::Start(file_offset)).await?;
            handle.write_all(chunk).await?;
            handle.flush().await?;

            stream_offset += slice_len;
            remaining = rest;
        }
        debug_assert!(remaining.is_empty());
        Ok(())
    }

    /// Move every file into `dest_root`, preserving relative paths. Returns
    /// the destination paths in file order.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors; a failed rename falls back to
    /// copy-and-remove for cross-device moves.
    pub async fn finalize_into(&self, dest_root: &Path) -> Result<Vec<PathBuf>> {
        let mut destinations = Vec::with_capacity(self.info.files.len());
        for file in &self.info.files {
            let source = self.root.join(&file.path);
            let destination = dest_root.join(&file.path);
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent).await?;
            }
            if let Err(err) = fs::rename(&source, &destination).await {
                debug!(error = %err, "rename failed; copying across devices");
                fs::copy(&source, &destination).await?;
                fs::remove_file(&source).await?;
            }
            destinations.push(destination);
        }
        // leftover scratch directories are harmless; best-effort cleanup
        let _ = fs::remove_dir_all(&self.root).await;
        Ok(destinations)
    }

    /// Delete the scratch root and everything under it.
    pub async fn remove_partials(&self) {
        let _ = fs::remove_dir_all(&self.root).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info_with_files(piece_len: u32, lens: &[u64]) -> StorageInfo {
        let mut offset = 0u64;
        let files = lens
            .iter()
            .enumerate()
            .map(|(index, &len)| {
                let file = FileInfo {
                    path: PathBuf::from(format!("t/f{index}")),
                    len,
                    torrent_offset: offset,
                };
                offset += len;
                file
            })
            .collect::<Vec<_>>();
        let total_len = offset;
        let piece_count = total_len.div_ceil(u64::from(piece_len)) as usize;
        let last_piece_len =
            (total_len - u64::from(piece_len) * (piece_count as u64 - 1)) as u32;
        StorageInfo {
            piece_count,
            piece_len,
            last_piece_len,
            total_len,
            files,
            primary_index: 0,
        }
    }

    #[test]
    fn files_intersecting_piece_handles_straddles() {
        // pieces of 16 bytes over files of 9, 11, 7, 9, 12, 16, 8 bytes
        let info = info_with_files(16, &[9, 11, 7, 9, 12, 16, 8]);
        assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
        assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
        assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
        assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
        assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
        assert!(info.files_intersecting_piece(5).is_err());
    }

    #[test]
    fn contiguous_bytes_follow_verified_prefix() {
        // one file of 40 bytes over 16-byte pieces
        let info = info_with_files(16, &[40]);
        let mut own = Bitfield::new(3);
        assert_eq!(info.contiguous_file_bytes(0, &own), 0);

        own.set(0);
        assert_eq!(info.contiguous_file_bytes(0, &own), 16);
        // a later piece without the middle one does not extend the prefix
        own.set(2);
        assert_eq!(info.contiguous_file_bytes(0, &own), 16);
        own.set(1);
        assert_eq!(info.contiguous_file_bytes(0, &own), 40);
    }

    #[test]
    fn contiguous_bytes_respect_file_offsets() {
        // second file starts mid-piece 0
        let info = info_with_files(16, &[10, 30]);
        let mut own = Bitfield::new(3);
        own.set(0);
        // piece 0 covers bytes 0..16, so 6 bytes of file 1 are ready
        assert_eq!(info.contiguous_file_bytes(1, &own), 6);
        own.set(1);
        assert_eq!(info.contiguous_file_bytes(1, &own), 22);
        own.set(2);
        assert_eq!(info.contiguous_file_bytes(1, &own), 30);
    }

    #[tokio::test]
    async fn write_piece_splits_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let info = info_with_files(8, &[5, 11]);
        let storage = TorrentStorage::new(info, dir.path().to_path_buf());

        storage.write_piece(0, &[1, 1, 1, 1, 1, 2, 2, 2]).await.unwrap();
        storage.write_piece(1, &[3, 3, 3, 3, 3, 3, 3, 3]).await.unwrap();

        let first = std::fs::read(dir.path().join("t/f0")).unwrap();
        assert_eq!(first, vec![1, 1, 1, 1, 1]);
        let second = std::fs::read(dir.path().join("t/f1")).unwrap();
        assert_eq!(second, vec![2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3]);
    }

    #[tokio::test]
    async fn out_of_order_writes_assemble_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let info = info_with_files(4, &[8]);
        let storage = TorrentStorage::new(info, dir.path().to_path_buf());

        storage.write_piece(1, &[5, 6, 7, 8]).await.unwrap();
        storage.write_piece(0, &[1, 2, 3, 4]).await.unwrap();

        let content = std::fs::read(dir.path().join("t/f0")).unwrap();
        assert_eq!(content, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn finalize_moves_files_and_clears_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let info = info_with_files(4, &[4]);
        let storage = TorrentStorage::new(info, scratch.path().join("job"));

        storage.write_piece(0, &[9, 9, 9, 9]).await.unwrap();
        let moved = storage.finalize_into(library.path()).await.unwrap();

        assert_eq!(moved, vec![library.path().join("t/f0")]);
        assert_eq!(std::fs::read(&moved[0]).unwrap(), vec![9, 9, 9, 9]);
        assert!(!scratch.path().join("job").exists());
    }
}
