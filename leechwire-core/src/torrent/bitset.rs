//! Fixed-length bit vector for piece and block completion tracking.

use bytes::Bytes;

/// Fixed-length bit vector over `len` indices.
///
/// Bits are stored most-significant-first within each byte, which is the
/// layout of the wire `Bitfield` message. Spare bits in the last byte are
/// always zero. Accessing an index outside `0..len` is a programming error
/// and panics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBitset {
    bits: Vec<u8>,
    len: usize,
}

impl PieceBitset {
    /// Creates a bitset of `len` cleared bits.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Sets bit `index`.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn set(&mut self, index: usize) {
        let (byte, mask) = self.locate(index);
        self.bits[byte] |= mask;
    }

    /// Clears bit `index`.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn clear(&mut self, index: usize) {
        let (byte, mask) = self.locate(index);
        self.bits[byte] &= !mask;
    }

    /// Returns the value of bit `index`.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn test(&self, index: usize) -> bool {
        let (byte, mask) = self.locate(index);
        self.bits[byte] & mask != 0
    }

    /// Returns the smallest unset index, or `None` when every bit is set.
    pub fn first_unset(&self) -> Option<usize> {
        self.bits
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0xFF)
            .map(|(i, byte)| i * 8 + byte.leading_ones() as usize)
            .filter(|&index| index < self.len)
    }

    /// Number of indices tracked.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length bitset.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// True when every bit in range is set.
    pub fn is_complete(&self) -> bool {
        self.first_unset().is_none()
    }

    /// Clears every bit.
    pub fn reset(&mut self) {
        self.bits.fill(0);
    }

    /// Raw bytes in wire bitfield layout.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Owned copy of the raw bytes, ready for a `Bitfield` message.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn locate(&self, index: usize) -> (usize, u8) {
        assert!(
            index < self.len,
            "bitset index out of range: {index} >= {}",
            self.len
        );
        (index / 8, 0x80 >> (index % 8))
    }
}
