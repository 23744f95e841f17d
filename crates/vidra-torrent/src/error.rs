//! Error types for the download engine.

use thiserror::Error;

use crate::PieceIndex;
use crate::bencode::BencodeError;
use crate::peer::codec::WireError;
use crate::tracker::TrackerError;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while driving a torrent download.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A bencode document could not be decoded.
    #[error(transparent)]
    Bencode(#[from] BencodeError),
    /// The torrent metadata was structurally invalid.
    #[error("invalid torrent metadata: {reason}")]
    InvalidMetainfo {
        /// What the parser stumbled over.
        reason: &'static str,
    },
    /// A magnet URI could not be parsed.
    #[error("invalid magnet URI: {reason}")]
    InvalidMagnet {
        /// What the parser stumbled over.
        reason: String,
    },
    /// The magnet carried no usable metadata source.
    ///
    /// Vidra does not speak the metadata-exchange extension, so a magnet must
    /// either name an `xs` source for the `.torrent` document or the caller
    /// must supply the metainfo bytes directly.
    #[error("magnet does not carry a metadata source (xs) and metadata exchange is unsupported")]
    NoMetadataSource,
    /// The `.torrent` document could not be fetched from its source URL.
    #[error("failed to fetch torrent metadata")]
    MetadataFetch(#[source] reqwest::Error),
    /// Tracker communication failed on every configured tracker.
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    /// A peer violated the wire protocol.
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The remote handshake advertised a different info-hash.
    #[error("peer handshake advertised a foreign info-hash")]
    InvalidInfoHash,
    /// A peer bitfield was too short for the torrent's piece count.
    #[error("peer bitfield does not cover the piece count")]
    InvalidBitfield,
    /// An out-of-bounds piece index was used.
    #[error("piece index {index} is out of bounds")]
    InvalidPieceIndex {
        /// The offending index.
        index: PieceIndex,
    },
    /// A piece kept failing hash verification past the retry budget.
    #[error("piece {index} failed verification {attempts} times")]
    PieceVerification {
        /// The piece that failed.
        index: PieceIndex,
        /// How many verification attempts were made.
        attempts: u32,
    },
    /// All trackers failed and no peers were known for the grace period.
    #[error("no peers available: {detail}")]
    NoPeers {
        /// Last tracker error or a summary of the peer drought.
        detail: String,
    },
    /// Disk IO failed while assembling the download.
    #[error("storage error")]
    Io(#[from] std::io::Error),
}
