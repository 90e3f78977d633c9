//! Portable cross-rank heap addressing
//!
//! A `HeapPos` packs a rank and a byte offset from that rank's anchor block
//! into a single 64-bit word. The anchor block never moves for the lifetime
//! of the heap, so a `HeapPos` stays valid no matter how many growth events
//! happen after it was encoded. The token is plain data: it can be stored in
//! records, sent through the heap itself, and resolved on any rank.

use static_assertions::const_assert_eq;

/// Low bits of a `HeapPos` holding the rank.
pub const RANK_BITS: u32 = 24;

/// High bits of a `HeapPos` holding the byte offset from the anchor block.
pub const OFFSET_BITS: u32 = 64 - RANK_BITS;

/// Maximum number of ranks representable in a `HeapPos`.
pub const MAX_RANKS: usize = 1 << RANK_BITS;

/// Maximum anchor-relative byte offset representable in a `HeapPos`.
pub const MAX_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

const RANK_MASK: u64 = (1 << RANK_BITS) - 1;

// The two fields must tile the word exactly.
const_assert_eq!(RANK_BITS + OFFSET_BITS, 64);

/// Opaque (rank, offset-from-anchor) token.
///
/// The all-zero value is the null token: data offsets always start past the
/// block header, so offset 0 can never address written bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapPos(u64);

impl HeapPos {
    /// The null token. Useful as an "unset" marker inside records that are
    /// themselves pushed through the heap.
    pub const NULL: HeapPos = HeapPos(0);

    /// Pack a rank and an anchor-relative byte offset.
    ///
    /// Returns `None` if either field exceeds its bit budget; callers treat
    /// that as a fatal configuration error (the heap was built larger than
    /// the address format can describe).
    pub fn pack(rank: usize, offset: u64) -> Option<HeapPos> {
        debug_assert!(offset != 0, "offset 0 is reserved for the null token");
        if rank >= MAX_RANKS || offset > MAX_OFFSET {
            return None;
        }
        Some(HeapPos((offset << RANK_BITS) | rank as u64))
    }

    /// Rank component.
    pub fn rank(self) -> usize {
        (self.0 & RANK_MASK) as usize
    }

    /// Byte offset from the rank's anchor block.
    pub fn offset(self) -> u64 {
        self.0 >> RANK_BITS
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Raw word, for embedding in serialized records.
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a token from its raw word.
    pub fn from_u64(raw: u64) -> HeapPos {
        HeapPos(raw)
    }
}

impl core::fmt::Debug for HeapPos {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_null() {
            write!(f, "HeapPos(null)")
        } else {
            write!(f, "HeapPos(rank={}, offset={})", self.rank(), self.offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        let pos = HeapPos::pack(13, 4096).unwrap();
        assert_eq!(pos.rank(), 13);
        assert_eq!(pos.offset(), 4096);
        assert!(!pos.is_null());
    }

    #[test]
    fn test_pack_limits() {
        assert!(HeapPos::pack(MAX_RANKS - 1, MAX_OFFSET).is_some());
        assert!(HeapPos::pack(MAX_RANKS, 8).is_none());
        assert!(HeapPos::pack(0, MAX_OFFSET + 1).is_none());
    }

    #[test]
    fn test_null_token() {
        assert!(HeapPos::NULL.is_null());
        assert_eq!(HeapPos::default(), HeapPos::NULL);
        assert_eq!(HeapPos::from_u64(0), HeapPos::NULL);
    }

    #[test]
    fn test_raw_word_survives_serialization() {
        let pos = HeapPos::pack(7, 123_456).unwrap();
        let raw = pos.as_u64();
        assert_eq!(HeapPos::from_u64(raw), pos);
    }
}
