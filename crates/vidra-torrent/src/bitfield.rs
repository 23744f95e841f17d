//! Piece availability bitfields.
//!
//! Serialized MSB-first: piece 0 is the most significant bit of byte 0, so
//! bit `i` lives in byte `i / 8` under mask `0x80 >> (i % 8)`.

use bitvec::prelude::{BitVec, Msb0};

use crate::PieceIndex;
use crate::error::{EngineError, Result};

/// Dense piece-ownership bit vector sized to the torrent's piece count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<u8, Msb0>,
}

impl Bitfield {
    /// An all-zero bitfield for `num_pieces` pieces.
    #[must_use]
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, num_pieces),
        }
    }

    /// Decode a wire bitfield.
    ///
    /// The raw data may carry spare trailing bits when the piece count is not
    /// a multiple of 8; those are sliced off.
    ///
    /// # Errors
    ///
    /// Fails when the payload is too short to cover `num_pieces`.
    pub fn from_bytes(bytes: &[u8], num_pieces: usize) -> Result<Self> {
        if bytes.len() * 8 < num_pieces {
            return Err(EngineError::InvalidBitfield);
        }
        let mut bits = BitVec::<u8, Msb0>::from_slice(bytes);
        bits.truncate(num_pieces);
        Ok(Self { bits })
    }

    /// Serialize MSB-first, padding the final byte with zero bits.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bits = self.bits.clone();
        bits.set_uninitialized(false);
        bits.into_vec()
    }

    /// Number of pieces the bitfield covers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// Whether the bitfield covers zero pieces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Mark a piece as owned. Out-of-range indices are ignored.
    pub fn set(&mut self, index: PieceIndex) {
        if index < self.bits.len() {
            self.bits.set(index, true);
        }
    }

    /// Whether the piece at `index` is owned.
    #[must_use]
    pub fn has(&self, index: PieceIndex) -> bool {
        self.bits.get(index).is_some_and(|bit| *bit)
    }

    /// Number of owned pieces.
    #[must_use]
    pub fn count_set(&self) -> usize {
        self.bits.count_ones()
    }

    /// Whether every piece is owned.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    /// Lowest piece index missing here but present in `peer`.
    #[must_use]
    pub fn first_missing_in(&self, peer: &Self) -> Option<PieceIndex> {
        (0..self.bits.len().min(peer.len()))
            .find(|&index| !self.has(index) && peer.has(index))
    }

    /// Whether `peer` has at least one piece we are missing.
    #[must_use]
    pub fn is_interesting(&self, peer: &Self) -> bool {
        self.first_missing_in(peer).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_are_msb_first() {
        let mut field = Bitfield::new(10);
        field.set(0);
        field.set(9);
        let bytes = field.to_bytes();
        assert_eq!(bytes.len(), 2);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], 0x80 >> 1);
    }

    #[test]
    fn round_trip_preserves_set_bits() {
        let mut field = Bitfield::new(21);
        for index in [0, 3, 8, 15, 20] {
            field.set(index);
        }
        let restored = Bitfield::from_bytes(&field.to_bytes(), 21).unwrap();
        assert_eq!(restored, field);
        assert_eq!(restored.count_set(), 5);
    }

    #[test]
    fn from_bytes_slices_spare_bits() {
        // 10 pieces in 2 bytes leaves 6 spare bits which must be dropped
        let field = Bitfield::from_bytes(&[0xff, 0xff], 10).unwrap();
        assert_eq!(field.len(), 10);
        assert!(field.is_complete());
    }

    #[test]
    fn from_bytes_rejects_short_payload() {
        assert!(matches!(
            Bitfield::from_bytes(&[0xff], 10),
            Err(EngineError::InvalidBitfield)
        ));
    }

    #[test]
    fn first_missing_in_intersects_availability() {
        let mut own = Bitfield::new(8);
        own.set(0);
        own.set(1);
        let mut peer = Bitfield::new(8);
        peer.set(1);
        peer.set(4);
        assert_eq!(own.first_missing_in(&peer), Some(4));
        assert!(own.is_interesting(&peer));

        own.set(4);
        assert_eq!(own.first_missing_in(&peer), None);
        assert!(!own.is_interesting(&peer));
    }

    #[test]
    fn out_of_range_set_is_ignored() {
        let mut field = Bitfield::new(4);
        field.set(17);
        assert_eq!(field.count_set(), 0);
    }
}
