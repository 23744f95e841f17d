//! Handshake and wire-message codecs for the peer protocol.
//!
//! Two `tokio-util` codecs share the socket: [`HandshakeCodec`] frames the
//! fixed 68-byte handshake, after which the connection switches to
//! [`WireCodec`] for length-prefixed messages, reusing the read/write buffers
//! so nothing the peer pipelined after its handshake is lost.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::{BlockInfo, PeerId, Sha1Hash};

/// The protocol string transmitted in every handshake.
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Upper bound on a single frame. The largest legitimate frame is a PIECE
/// message (9 bytes of header plus one block); bitfields of very large
/// torrents stay well under this.
const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Errors raised by the peer wire codecs.
#[derive(Debug, Error)]
pub enum WireError {
    /// The socket failed.
    #[error("peer socket error")]
    Io(#[from] std::io::Error),
    /// The 68-byte handshake was structurally invalid.
    #[error("invalid handshake")]
    InvalidHandshake,
    /// A frame advertised a message id outside 0..=8.
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    /// A frame's payload did not match its message id.
    #[error("invalid payload for message id {id}")]
    InvalidPayload {
        /// The message id whose payload was malformed.
        id: u8,
    },
    /// A frame advertised an implausible length.
    #[error("frame of {0} bytes exceeds the protocol maximum")]
    OversizedFrame(u32),
}

/// The fixed-size connection preamble: protocol string, reserved bytes,
/// info-hash and peer id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Info-hash of the torrent this connection is about.
    pub info_hash: Sha1Hash,
    /// The remote (or, when sending, our own) peer id.
    pub peer_id: PeerId,
}

impl Handshake {
    /// Build an outbound handshake.
    #[must_use]
    pub const fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// Codec for the 68-byte handshake exchanged right after connecting.
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = WireError;

    fn encode(&mut self, handshake: Handshake, dst: &mut BytesMut) -> Result<(), WireError> {
        dst.reserve(68);
        dst.put_u8(PROTOCOL_STRING.len() as u8);
        dst.put_slice(PROTOCOL_STRING.as_bytes());
        dst.put_slice(&[0u8; 8]);
        dst.put_slice(&handshake.info_hash);
        dst.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, WireError> {
        let Some(&prefix) = src.first() else {
            return Ok(None);
        };
        if prefix as usize != PROTOCOL_STRING.len() {
            return Err(WireError::InvalidHandshake);
        }
        let total = 1 + prefix as usize + 8 + 20 + 20;
        if src.len() < total {
            return Ok(None);
        }

        src.advance(1);
        let protocol = src.split_to(prefix as usize);
        if protocol.as_ref() != PROTOCOL_STRING.as_bytes() {
            return Err(WireError::InvalidHandshake);
        }
        src.advance(8); // reserved bytes, all features unsupported

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&src.split_to(20));
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&src.split_to(20));

        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A non-handshake protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length heartbeat frame.
    KeepAlive,
    /// The peer will not serve our requests.
    Choke,
    /// The peer will serve our requests.
    Unchoke,
    /// We want to download from the peer.
    Interested,
    /// We no longer want to download from the peer.
    NotInterested,
    /// The peer acquired a piece.
    Have {
        /// Index of the newly available piece.
        piece_index: u32,
    },
    /// The peer's full piece availability, sent right after the handshake.
    /// Raw bytes; sizing against the piece count happens in the session.
    Bitfield(Vec<u8>),
    /// Request for a block.
    Request(BlockInfo),
    /// A block of piece data.
    Piece {
        /// Piece the block belongs to.
        piece_index: u32,
        /// Byte offset of the block within the piece.
        offset: u32,
        /// The block payload.
        data: Vec<u8>,
    },
    /// Withdraw an earlier request (used during endgame).
    Cancel(BlockInfo),
}

impl Message {
    /// The wire message id, or `None` for keep-alives.
    #[must_use]
    pub const fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield(_) => Some(5),
            Self::Request(_) => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Cancel(_) => Some(8),
        }
    }
}

/// Codec for every message after the handshake:
/// `[4-byte big-endian length][1-byte id][payload]`, with a zero length
/// denoting a keep-alive.
pub struct WireCodec;

impl Encoder<Message> for WireCodec {
    type Error = WireError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), WireError> {
        match message {
            Message::KeepAlive => dst.put_u32(0),
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                dst.put_u32(1);
                // id() is Some for everything but keep-alives
                dst.put_u8(message.id().unwrap_or_default());
            }
            Message::Have { piece_index } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(piece_index);
            }
            Message::Bitfield(bytes) => {
                dst.put_u32(1 + bytes.len() as u32);
                dst.put_u8(5);
                dst.put_slice(&bytes);
            }
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_index);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
            Message::Piece {
                piece_index,
                offset,
                data,
            } => {
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(piece_index);
                dst.put_u32(offset);
                dst.put_slice(&data);
            }
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_index);
                dst.put_u32(block.offset);
                dst.put_u32(block.len);
            }
        }
        Ok(())
    }
}

impl Decoder for WireCodec {
    type Item = Message;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if frame_len > MAX_FRAME_LEN {
            return Err(WireError::OversizedFrame(frame_len));
        }
        if src.len() < 4 + frame_len as usize {
            src.reserve(4 + frame_len as usize - src.len());
            return Ok(None);
        }

        src.advance(4);
        if frame_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let mut payload = src.split_to(frame_len as usize);
        let id = payload.get_u8();
        let message = match id {
            0..=3 => {
                if !payload.is_empty() {
                    return Err(WireError::InvalidPayload { id });
                }
                match id {
                    0 => Message::Choke,
                    1 => Message::Unchoke,
                    2 => Message::Interested,
                    _ => Message::NotInterested,
                }
            }
            4 => {
                if payload.len() != 4 {
                    return Err(WireError::InvalidPayload { id });
                }
                Message::Have {
                    piece_index: payload.get_u32(),
                }
            }
            5 => Message::Bitfield(payload.to_vec()),
            6 | 8 => {
                if payload.len() != 12 {
                    return Err(WireError::InvalidPayload { id });
                }
                let block = BlockInfo {
                    piece_index: payload.get_u32(),
                    offset: payload.get_u32(),
                    len: payload.get_u32(),
                };
                if id == 6 {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                }
            }
            7 => {
                if payload.len() < 8 {
                    return Err(WireError::InvalidPayload { id });
                }
                let piece_index = payload.get_u32();
                let offset = payload.get_u32();
                Message::Piece {
                    piece_index,
                    offset,
                    data: payload.to_vec(),
                }
            }
            other => return Err(WireError::UnknownMessageId(other)),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) -> Message {
        let mut buf = BytesMut::new();
        WireCodec
            .encode(message, &mut buf)
            .expect("encode never fails");
        WireCodec
            .decode(&mut buf)
            .expect("decode succeeds")
            .expect("frame complete")
    }

    #[test]
    fn round_trips_every_message_type() {
        let block = BlockInfo {
            piece_index: 3,
            offset: 0x4000,
            len: 0x4000,
        };
        let messages = [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 99 },
            Message::Bitfield(vec![0b1010_0000, 0x01]),
            Message::Request(block),
            Message::Piece {
                piece_index: 3,
                offset: 0x4000,
                data: vec![7u8; 64],
            },
            Message::Cancel(block),
        ];
        for message in messages {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let mut buf = BytesMut::new();
        WireCodec
            .encode(Message::Have { piece_index: 1 }, &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..3]);
        assert!(WireCodec.decode(&mut partial).unwrap().is_none());

        let mut partial = BytesMut::from(&full[..6]);
        assert!(WireCodec.decode(&mut partial).unwrap().is_none());

        let mut complete = full;
        assert_eq!(
            WireCodec.decode(&mut complete).unwrap(),
            Some(Message::Have { piece_index: 1 })
        );
    }

    #[test]
    fn unknown_id_fails_decoding() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(14);
        assert!(matches!(
            WireCodec.decode(&mut buf),
            Err(WireError::UnknownMessageId(14))
        ));
    }

    #[test]
    fn under_length_payload_fails_decoding() {
        // HAVE with a 2-byte payload instead of 4
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(4);
        buf.put_u16(1);
        assert!(matches!(
            WireCodec.decode(&mut buf),
            Err(WireError::InvalidPayload { id: 4 })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(matches!(
            WireCodec.decode(&mut buf),
            Err(WireError::OversizedFrame(_))
        ));
    }

    #[test]
    fn handshake_round_trips() {
        let sent = Handshake::new([1u8; 20], *b"-HT0100-abcdefghijkl");
        let mut buf = BytesMut::new();
        HandshakeCodec.encode(sent.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), 68);
        let received = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(received, sent);
    }

    #[test]
    fn handshake_with_wrong_protocol_string_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(19);
        buf.put_slice(b"BitTorrent protocoX");
        buf.put_slice(&[0u8; 8 + 40]);
        assert!(matches!(
            HandshakeCodec.decode(&mut buf),
            Err(WireError::InvalidHandshake)
        ));
    }

    #[test]
    fn incomplete_handshake_waits() {
        let mut buf = BytesMut::new();
        HandshakeCodec
            .encode(Handshake::new([0u8; 20], [1u8; 20]), &mut buf)
            .unwrap();
        let mut partial = BytesMut::from(&buf[..40]);
        assert!(HandshakeCodec.decode(&mut partial).unwrap().is_none());
    }
}
