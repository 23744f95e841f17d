//! Magnet URI parsing.
//!
//! A magnet carries the info-hash and optional tracker hints but no piece
//! table; the engine therefore needs a metadata source (`xs`) or the raw
//! `.torrent` document to actually download.

use percent_encoding::percent_decode_str;

use crate::Sha1Hash;
use crate::error::{EngineError, Result};

/// A parsed `magnet:?` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// 20-byte info-hash from the `xt=urn:btih:` parameter.
    pub info_hash: Sha1Hash,
    /// Display name (`dn`), when present.
    pub name: Option<String>,
    /// Tracker hints (`tr`), in order of appearance.
    pub trackers: Vec<String>,
    /// Exact metadata source (`xs`), when present: an HTTP(S) URL serving the
    /// `.torrent` document.
    pub metadata_source: Option<String>,
}

impl MagnetLink {
    /// Parse a magnet URI.
    ///
    /// # Errors
    ///
    /// Fails when the scheme is wrong, the info-hash is missing or not
    /// 40 hex characters, or a parameter cannot be percent-decoded.
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| invalid("missing magnet:? scheme"))?;

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut metadata_source = None;

        for pair in query.split('&').filter(|pair| !pair.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid("parameter without value"))?;
            let value = decode_component(value)?;
            match key {
                "xt" => {
                    let digest = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| invalid("xt is not a urn:btih hash"))?;
                    info_hash = Some(parse_btih(digest)?);
                }
                "dn" => name = Some(value),
                "tr" => trackers.push(value),
                "xs" => metadata_source = Some(value),
                // other parameters (xl, kt, ...) are irrelevant to downloading
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| invalid("missing xt info-hash"))?;
        Ok(Self {
            info_hash,
            name,
            trackers,
            metadata_source,
        })
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidMagnet {
        reason: reason.into(),
    }
}

fn decode_component(raw: &str) -> Result<String> {
    // '+' encodes a space in magnet query strings
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| invalid("parameter is not valid UTF-8"))
}

fn parse_btih(digest: &str) -> Result<Sha1Hash> {
    if digest.len() != 40 {
        return Err(invalid(format!(
            "info-hash must be 40 hex characters, got {}",
            digest.len()
        )));
    }
    let bytes = hex::decode(digest).map_err(|_| invalid("info-hash is not hex"))?;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678\
        &dn=Example+Movie&tr=http://t1/&tr=http://t2/";

    #[test]
    fn parses_hash_name_and_trackers() {
        let magnet = MagnetLink::parse(EXAMPLE).unwrap();
        assert_eq!(magnet.name.as_deref(), Some("Example Movie"));
        assert_eq!(magnet.trackers, vec!["http://t1/", "http://t2/"]);
        assert_eq!(magnet.info_hash[0], 0x12);
        assert_eq!(magnet.info_hash[19], 0x78);
        assert!(magnet.metadata_source.is_none());
    }

    #[test]
    fn accepts_uppercase_hex() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:1234567890ABCDEF1234567890ABCDEF12345678",
        )
        .unwrap();
        assert_eq!(magnet.info_hash[8], 0x12);
        assert!(magnet.trackers.is_empty());
    }

    #[test]
    fn decodes_percent_escaped_trackers() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678\
             &tr=udp%3A%2F%2Ftracker%2Fannounce",
        )
        .unwrap();
        assert_eq!(magnet.trackers, vec!["udp://tracker/announce"]);
    }

    #[test]
    fn captures_metadata_source() {
        let magnet = MagnetLink::parse(
            "magnet:?xt=urn:btih:1234567890abcdef1234567890abcdef12345678\
             &xs=https%3A%2F%2Fexample.com%2Ffile.torrent",
        )
        .unwrap();
        assert_eq!(
            magnet.metadata_source.as_deref(),
            Some("https://example.com/file.torrent")
        );
    }

    #[test]
    fn rejects_missing_or_short_hash() {
        assert!(MagnetLink::parse("magnet:?dn=NoHash").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:abcdef").is_err());
        assert!(MagnetLink::parse("http://not-a-magnet/").is_err());
    }
}
