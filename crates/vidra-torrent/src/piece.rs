//! Per-piece block buffers and hash verification.

use sha1::{Digest, Sha1};

use crate::{BLOCK_LEN, BlockInfo, PieceIndex, Sha1Hash, block_count, block_len};

/// Outcome of writing a block into a piece buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    /// The block was new and has been recorded.
    Accepted,
    /// The block was already present; the write was a no-op.
    Duplicate,
    /// The block lies outside the piece or has the wrong length; no state
    /// changed.
    Rejected,
}

/// In-memory assembly buffer for a single piece.
///
/// Once `verify` succeeds the contents are immutable; a failed verify resets
/// both the byte buffer and the block bitmap so the piece can be
/// redownloaded.
#[derive(Debug, Clone)]
pub struct PieceBuffer {
    index: PieceIndex,
    length: u32,
    expected_hash: Sha1Hash,
    buf: Vec<u8>,
    received: Vec<bool>,
}

impl PieceBuffer {
    /// Create an empty buffer for the piece at `index`.
    #[must_use]
    pub fn new(index: PieceIndex, length: u32, expected_hash: Sha1Hash) -> Self {
        Self {
            index,
            length,
            expected_hash,
            buf: vec![0u8; length as usize],
            received: vec![false; block_count(length)],
        }
    }

    /// The piece index this buffer assembles.
    #[must_use]
    pub const fn index(&self) -> PieceIndex {
        self.index
    }

    /// The piece length in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.length
    }

    /// Whether the piece holds zero bytes (never true for a valid torrent).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Record a block received from a peer.
    ///
    /// Offsets must be block-aligned and the payload must match the expected
    /// block length; anything else is rejected without touching state.
    /// Duplicate writes are idempotent.
    pub fn write_block(&mut self, offset: u32, data: &[u8]) -> BlockWrite {
        if offset % BLOCK_LEN != 0 || offset >= self.length {
            return BlockWrite::Rejected;
        }
        let block_index = (offset / BLOCK_LEN) as usize;
        let expected_len = block_len(self.length, block_index);
        if data.len() as u32 != expected_len {
            return BlockWrite::Rejected;
        }
        if self.received[block_index] {
            return BlockWrite::Duplicate;
        }

        let start = offset as usize;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.received[block_index] = true;
        BlockWrite::Accepted
    }

    /// The lowest unfilled block as a wire request, or `None` when the piece
    /// is fully buffered.
    #[must_use]
    pub fn next_block_request(&self) -> Option<BlockInfo> {
        self.received
            .iter()
            .position(|received| !received)
            .map(|block_index| self.block_info(block_index))
    }

    /// All currently unfilled blocks, lowest offset first.
    pub fn missing_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(block_index, _)| self.block_info(block_index))
    }

    /// Number of blocks still missing.
    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.received.iter().filter(|received| !**received).count()
    }

    /// Whether every block has been buffered.
    #[must_use]
    pub fn is_filled(&self) -> bool {
        self.received.iter().all(|received| *received)
    }

    /// Hash the buffered bytes against the expected digest.
    ///
    /// On success the caller may take the bytes; on failure the buffer and
    /// the block bitmap are reset so the piece gets redownloaded.
    pub fn verify(&mut self) -> bool {
        let digest = Sha1::digest(&self.buf);
        if digest.as_slice() == self.expected_hash {
            true
        } else {
            self.buf.fill(0);
            self.received.fill(false);
            false
        }
    }

    /// Consume the buffer, yielding the assembled piece bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn block_info(&self, block_index: usize) -> BlockInfo {
        BlockInfo {
            piece_index: self.index as u32,
            offset: block_index as u32 * BLOCK_LEN,
            len: block_len(self.length, block_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        hash
    }

    #[test]
    fn verify_accepts_matching_hash() {
        let data = vec![42u8; BLOCK_LEN as usize];
        let mut piece = PieceBuffer::new(0, BLOCK_LEN, hash_of(&data));
        assert_eq!(piece.write_block(0, &data), BlockWrite::Accepted);
        assert!(piece.is_filled());
        assert!(piece.verify());
        assert_eq!(piece.into_bytes(), data);
    }

    #[test]
    fn verify_failure_resets_buffer_and_bitmap() {
        let data = vec![42u8; BLOCK_LEN as usize];
        let mut corrupted = data.clone();
        corrupted[100] = 43;

        let mut piece = PieceBuffer::new(0, BLOCK_LEN, hash_of(&data));
        assert_eq!(piece.write_block(0, &corrupted), BlockWrite::Accepted);
        assert!(!piece.verify());
        assert!(!piece.is_filled());
        assert_eq!(piece.missing_count(), 1);
        assert_eq!(
            piece.next_block_request(),
            Some(BlockInfo {
                piece_index: 0,
                offset: 0,
                len: BLOCK_LEN,
            })
        );
    }

    #[test]
    fn duplicate_writes_are_idempotent() {
        let length = 2 * BLOCK_LEN;
        let mut piece = PieceBuffer::new(3, length, [0u8; 20]);
        let block = vec![7u8; BLOCK_LEN as usize];
        assert_eq!(piece.write_block(0, &block), BlockWrite::Accepted);
        assert_eq!(piece.write_block(0, &block), BlockWrite::Duplicate);
        assert_eq!(piece.missing_count(), 1);
    }

    #[test]
    fn out_of_range_writes_change_nothing() {
        let length = BLOCK_LEN + 100;
        let mut piece = PieceBuffer::new(0, length, [0u8; 20]);

        // misaligned offset
        assert_eq!(
            piece.write_block(1, &vec![0u8; BLOCK_LEN as usize]),
            BlockWrite::Rejected
        );
        // offset past the piece
        assert_eq!(
            piece.write_block(2 * BLOCK_LEN, &[0u8; 1]),
            BlockWrite::Rejected
        );
        // final block with the wrong length
        assert_eq!(
            piece.write_block(BLOCK_LEN, &vec![0u8; 101]),
            BlockWrite::Rejected
        );
        assert_eq!(piece.missing_count(), 2);
    }

    #[test]
    fn next_block_request_walks_lowest_first() {
        let length = 2 * BLOCK_LEN + 10;
        let mut piece = PieceBuffer::new(1, length, [0u8; 20]);

        let first = piece.next_block_request().unwrap();
        assert_eq!((first.offset, first.len), (0, BLOCK_LEN));
        assert_eq!(
            piece.write_block(0, &vec![1u8; BLOCK_LEN as usize]),
            BlockWrite::Accepted
        );

        let second = piece.next_block_request().unwrap();
        assert_eq!((second.offset, second.len), (BLOCK_LEN, BLOCK_LEN));
        assert_eq!(
            piece.write_block(BLOCK_LEN, &vec![1u8; BLOCK_LEN as usize]),
            BlockWrite::Accepted
        );

        // short trailing block
        let tail = piece.next_block_request().unwrap();
        assert_eq!((tail.offset, tail.len), (2 * BLOCK_LEN, 10));
        assert_eq!(
            piece.write_block(2 * BLOCK_LEN, &[1u8; 10]),
            BlockWrite::Accepted
        );
        assert!(piece.next_block_request().is_none());
    }
}
