#![forbid(unsafe_code)]
#![deny(
    unused_must_use,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions)]

//! BitTorrent V1 download engine for the Vidra platform.
//!
//! The crate is leecher-only and speaks to HTTP(S) trackers exclusively: no
//! seeding, no DHT, no UDP announce. Layout: `bencode.rs` (codec),
//! `metainfo.rs` (torrent metadata), `magnet.rs` (magnet URIs), `tracker.rs`
//! (announces), `peer/` (wire codec and per-peer session), `bitfield.rs`,
//! `piece.rs` (block buffers and verification), `picker.rs` (piece
//! selection), `storage.rs` (on-disk assembly), `download.rs` (per-torrent
//! orchestration).

pub mod bencode;
pub mod bitfield;
pub mod download;
pub mod error;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod piece;
pub mod storage;
pub mod tracker;

pub use bitfield::Bitfield;
pub use download::{
    DownloadHandle, DownloadOutcome, DownloadSession, DownloadPhase, EngineConfig,
    ProgressSnapshot,
};
pub use error::{EngineError, Result};
pub use magnet::MagnetLink;
pub use metainfo::TorrentMetadata;

/// The type of a piece's index.
///
/// On the wire all indices travel as 4-byte big endian integers; in the code
/// we use `usize` to stay consistent with other Rust index types.
pub type PieceIndex = usize;

/// The type of a file's index within the torrent layout.
pub type FileIndex = usize;

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The peer ID is an arbitrary 20 byte string.
pub type PeerId = [u8; 20];

/// The block length used for peer requests (except possibly the final block
/// of a piece). It is the widely accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A block is a fixed size chunk of a piece, which in turn is a fixed size
/// chunk of a torrent. Downloads happen at this block granularity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub piece_index: u32,
    /// The zero-based byte offset into the piece.
    pub offset: u32,
    /// The block's length in bytes, at most [`BLOCK_LEN`].
    pub len: u32,
}

impl BlockInfo {
    /// Returns the index of the block within its piece.
    #[must_use]
    pub fn index_in_piece(&self) -> usize {
        // the last block may be shorter than the canonical block length
        debug_assert!(self.len <= BLOCK_LEN);
        debug_assert!(self.len > 0);
        (self.offset / BLOCK_LEN) as usize
    }
}

/// Returns the length of the block at the index in a piece of the given
/// length.
///
/// # Panics
///
/// Panics if the index multiplied by the block length would exceed the piece
/// length.
#[must_use]
pub fn block_len(piece_len: u32, index: usize) -> u32 {
    let block_offset = index as u32 * BLOCK_LEN;
    assert!(piece_len > block_offset);
    std::cmp::min(piece_len - block_offset, BLOCK_LEN)
}

/// Returns the number of blocks in a piece of the given length.
#[must_use]
pub fn block_count(piece_len: u32) -> usize {
    (piece_len as usize).div_ceil(BLOCK_LEN as usize)
}
