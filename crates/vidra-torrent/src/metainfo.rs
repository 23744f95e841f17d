//! Torrent metadata parsed from `.torrent` documents.
//!
//! The info-hash is the SHA-1 of the canonically re-encoded `info`
//! dictionary; because the bencode encoder sorts keys, two documents with the
//! same logical `info` always hash identically regardless of surrounding
//! fields such as `announce`.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::{EngineError, Result};
use crate::{PieceIndex, Sha1Hash};

/// File name extensions treated as streamable video payloads.
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "avi", "webm", "mov", "m4v", "ts"];

/// Immutable torrent metadata.
#[derive(Debug, Clone)]
pub struct TorrentMetadata {
    /// SHA-1 of the canonical-encoded `info` dictionary.
    pub info_hash: Sha1Hash,
    /// Display name from the `info` dictionary.
    pub name: String,
    /// Nominal piece length in bytes.
    pub piece_length: u32,
    /// Announce URLs in first-occurrence order.
    pub trackers: Vec<String>,
    /// Flattened file layout; single-file torrents have exactly one entry
    /// whose path is the torrent name.
    pub files: Vec<TorrentFileEntry>,
    /// Whether the document declared a multi-file layout.
    pub multi_file: bool,
    piece_hashes: Vec<Sha1Hash>,
    total_size: u64,
}

/// A single file within the torrent payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFileEntry {
    /// Path relative to the download root. Multi-file paths are prefixed with
    /// the torrent name.
    pub path: PathBuf,
    /// Length of the file in bytes.
    pub length: u64,
}

impl TorrentMetadata {
    /// Parse a `.torrent` document.
    ///
    /// # Errors
    ///
    /// Fails on bencode errors and on structurally invalid metadata (missing
    /// `info`, inconsistent piece table, empty layout).
    pub fn from_bytes(blob: &[u8]) -> Result<Self> {
        let document = bencode::decode(blob)?;
        let info = document
            .get(b"info")
            .ok_or(EngineError::InvalidMetainfo {
                reason: "missing info dictionary",
            })?;
        if info.as_dict().is_none() {
            return Err(EngineError::InvalidMetainfo {
                reason: "info is not a dictionary",
            });
        }

        let info_hash = compute_info_hash(info);

        let name = info
            .get(b"name")
            .and_then(Value::as_bytes)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .filter(|name| !name.is_empty())
            .ok_or(EngineError::InvalidMetainfo {
                reason: "missing name",
            })?;

        let piece_length = info
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|len| *len > 0)
            .and_then(|len| u32::try_from(len).ok())
            .ok_or(EngineError::InvalidMetainfo {
                reason: "missing or invalid piece length",
            })?;

        let pieces = info
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or(EngineError::InvalidMetainfo {
                reason: "missing piece table",
            })?;
        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(EngineError::InvalidMetainfo {
                reason: "piece table is not a multiple of 20 bytes",
            });
        }
        let piece_hashes: Vec<Sha1Hash> = pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let (files, multi_file) = parse_layout(info, &name)?;
        let total_size: u64 = files.iter().map(|file| file.length).sum();
        if total_size == 0 {
            return Err(EngineError::InvalidMetainfo {
                reason: "torrent declares no payload bytes",
            });
        }

        // the piece table must cover the payload exactly
        let expected_pieces = total_size.div_ceil(u64::from(piece_length)) as usize;
        if expected_pieces != piece_hashes.len() {
            return Err(EngineError::InvalidMetainfo {
                reason: "piece table does not match payload size",
            });
        }

        let trackers = parse_trackers(&document);

        Ok(Self {
            info_hash,
            name,
            piece_length,
            trackers,
            files,
            multi_file,
            piece_hashes,
            total_size,
        })
    }

    /// Total payload size in bytes.
    #[must_use]
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of pieces in the torrent.
    #[must_use]
    pub const fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Expected SHA-1 hash of the piece at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPieceIndex`] for out-of-bounds indices.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        self.piece_hashes
            .get(index)
            .copied()
            .ok_or(EngineError::InvalidPieceIndex { index })
    }

    /// Length of the piece at `index`; only the final piece may be short.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPieceIndex`] for out-of-bounds indices.
    pub fn piece_len(&self, index: PieceIndex) -> Result<u32> {
        let count = self.num_pieces();
        if index + 1 == count {
            let tail =
                self.total_size - (count as u64 - 1) * u64::from(self.piece_length);
            Ok(tail as u32)
        } else if index + 1 < count {
            Ok(self.piece_length)
        } else {
            Err(EngineError::InvalidPieceIndex { index })
        }
    }

    /// Fetch and parse a `.torrent` document from an HTTP(S) source, as named
    /// by a magnet's `xs` parameter.
    ///
    /// # Errors
    ///
    /// Fails on HTTP errors, non-2xx statuses, and invalid documents.
    pub async fn fetch(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(EngineError::MetadataFetch)?;
        let body = client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(EngineError::MetadataFetch)?
            .bytes()
            .await
            .map_err(EngineError::MetadataFetch)?;
        Self::from_bytes(&body)
    }

    /// Index of the file served to players: the largest entry with a known
    /// video extension, or simply the largest file when none match.
    #[must_use]
    pub fn primary_file_index(&self) -> usize {
        let largest_video = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| has_video_extension(&file.path))
            .max_by_key(|(_, file)| file.length)
            .map(|(index, _)| index);
        largest_video.unwrap_or_else(|| {
            self.files
                .iter()
                .enumerate()
                .max_by_key(|(_, file)| file.length)
                .map_or(0, |(index, _)| index)
        })
    }
}

fn has_video_extension(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn compute_info_hash(info: &Value) -> Sha1Hash {
    let canonical = bencode::encode(info);
    let digest = Sha1::digest(&canonical);
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&digest);
    info_hash
}

fn parse_layout(info: &Value, name: &str) -> Result<(Vec<TorrentFileEntry>, bool)> {
    if let Some(files) = info.get(b"files") {
        let entries = files.as_list().ok_or(EngineError::InvalidMetainfo {
            reason: "files is not a list",
        })?;
        if entries.is_empty() {
            return Err(EngineError::InvalidMetainfo {
                reason: "files list is empty",
            });
        }
        let mut layout = Vec::with_capacity(entries.len());
        for entry in entries {
            let length = entry
                .get(b"length")
                .and_then(Value::as_int)
                .filter(|len| *len >= 0)
                .ok_or(EngineError::InvalidMetainfo {
                    reason: "file entry missing length",
                })?;
            let segments = entry
                .get(b"path")
                .and_then(Value::as_list)
                .filter(|segments| !segments.is_empty())
                .ok_or(EngineError::InvalidMetainfo {
                    reason: "file entry missing path",
                })?;
            // multi-file paths are rooted at the torrent name
            let mut path = PathBuf::from(name);
            for segment in segments {
                let part = segment
                    .as_bytes()
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .filter(|part| !part.is_empty() && part != ".." && part != ".")
                    .ok_or(EngineError::InvalidMetainfo {
                        reason: "file path segment invalid",
                    })?;
                path.push(part);
            }
            layout.push(TorrentFileEntry {
                path,
                length: length as u64,
            });
        }
        Ok((layout, true))
    } else {
        let length = info
            .get(b"length")
            .and_then(Value::as_int)
            .filter(|len| *len > 0)
            .ok_or(EngineError::InvalidMetainfo {
                reason: "single-file torrent missing length",
            })?;
        Ok((
            vec![TorrentFileEntry {
                path: PathBuf::from(name),
                length: length as u64,
            }],
            false,
        ))
    }
}

fn parse_trackers(document: &Value) -> Vec<String> {
    let mut trackers = Vec::new();
    let mut push = |url: String| {
        if !url.is_empty() && !trackers.contains(&url) {
            trackers.push(url);
        }
    };

    if let Some(announce) = document.get(b"announce").and_then(Value::as_bytes) {
        push(String::from_utf8_lossy(announce).into_owned());
    }
    if let Some(tiers) = document.get(b"announce-list").and_then(Value::as_list) {
        for tier in tiers {
            let Some(urls) = tier.as_list() else {
                continue;
            };
            for url in urls {
                if let Some(bytes) = url.as_bytes() {
                    push(String::from_utf8_lossy(bytes).into_owned());
                }
            }
        }
    }
    trackers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::Value;
    use std::collections::BTreeMap;

    fn bytes(value: impl AsRef<[u8]>) -> Value {
        Value::Bytes(value.as_ref().to_vec())
    }

    fn base_info(length: u64) -> BTreeMap<Vec<u8>, Value> {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes("x"));
        info.insert(b"piece length".to_vec(), Value::Int(262_144));
        info.insert(b"length".to_vec(), Value::Int(length as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 80]));
        info
    }

    fn document(announce: &str, info: BTreeMap<Vec<u8>, Value>) -> Vec<u8> {
        let mut doc = BTreeMap::new();
        doc.insert(b"announce".to_vec(), bytes(announce));
        doc.insert(b"info".to_vec(), Value::Dict(info));
        bencode::encode(&Value::Dict(doc))
    }

    #[test]
    fn info_hash_ignores_announce_field() {
        let first = document("http://tracker-a/announce", base_info(1_048_576));
        let second = document("http://tracker-b/announce", base_info(1_048_576));
        let first = TorrentMetadata::from_bytes(&first).unwrap();
        let second = TorrentMetadata::from_bytes(&second).unwrap();
        assert_eq!(first.info_hash, second.info_hash);
        assert_ne!(first.trackers, second.trackers);
    }

    #[test]
    fn piece_boundaries_follow_total_size() {
        // 4 pieces of 262144 except a short tail
        let total: u64 = 3 * 262_144 + 1_000;
        let mut info = base_info(total);
        info.insert(b"length".to_vec(), Value::Int(total as i64));
        let metadata =
            TorrentMetadata::from_bytes(&document("http://t/", info)).unwrap();

        assert_eq!(
            metadata.num_pieces(),
            total.div_ceil(262_144) as usize
        );
        assert_eq!(metadata.piece_len(0).unwrap(), 262_144);
        assert_eq!(metadata.piece_len(3).unwrap(), 1_000);
        assert!(metadata.piece_len(4).is_err());
    }

    #[test]
    fn rejects_mismatched_piece_table() {
        let mut info = base_info(1_048_576);
        // five hashes for a four-piece payload
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 100]));
        let result = TorrentMetadata::from_bytes(&document("http://t/", info));
        assert!(matches!(
            result,
            Err(EngineError::InvalidMetainfo { .. })
        ));
    }

    #[test]
    fn multi_file_paths_are_prefixed_with_name() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes("movie"));
        info.insert(b"piece length".to_vec(), Value::Int(16_384));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        let mut file = BTreeMap::new();
        file.insert(b"length".to_vec(), Value::Int(10_000));
        file.insert(
            b"path".to_vec(),
            Value::List(vec![bytes("sub"), bytes("movie.mp4")]),
        );
        info.insert(b"files".to_vec(), Value::List(vec![Value::Dict(file)]));

        let metadata =
            TorrentMetadata::from_bytes(&document("http://t/", info)).unwrap();
        assert!(metadata.multi_file);
        assert_eq!(
            metadata.files[0].path,
            PathBuf::from("movie/sub/movie.mp4")
        );
    }

    #[test]
    fn announce_list_flattens_in_first_occurrence_order() {
        let mut doc = BTreeMap::new();
        doc.insert(b"announce".to_vec(), bytes("http://primary/"));
        doc.insert(
            b"announce-list".to_vec(),
            Value::List(vec![
                Value::List(vec![bytes("http://primary/"), bytes("http://a/")]),
                Value::List(vec![bytes("http://b/")]),
            ]),
        );
        doc.insert(b"info".to_vec(), Value::Dict(base_info(1_048_576)));
        let metadata =
            TorrentMetadata::from_bytes(&bencode::encode(&Value::Dict(doc))).unwrap();
        assert_eq!(
            metadata.trackers,
            vec![
                "http://primary/".to_string(),
                "http://a/".to_string(),
                "http://b/".to_string()
            ]
        );
    }

    #[test]
    fn primary_file_prefers_largest_video() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), bytes("bundle"));
        info.insert(b"piece length".to_vec(), Value::Int(1 << 20));
        info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
        let mut nfo = BTreeMap::new();
        nfo.insert(b"length".to_vec(), Value::Int(900_000));
        nfo.insert(b"path".to_vec(), Value::List(vec![bytes("notes.nfo")]));
        let mut movie = BTreeMap::new();
        movie.insert(b"length".to_vec(), Value::Int(100_000));
        movie.insert(b"path".to_vec(), Value::List(vec![bytes("feature.mkv")]));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![Value::Dict(nfo), Value::Dict(movie)]),
        );

        let metadata =
            TorrentMetadata::from_bytes(&document("http://t/", info)).unwrap();
        assert_eq!(metadata.primary_file_index(), 1);
    }
}
