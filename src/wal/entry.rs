//! WAL record framing, segment headers and log positions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Bytes of frame metadata preceding each record payload (length + checksum).
pub(crate) const FRAME_HEADER_LEN: u64 = 8;

/// Sanity cap on a single record payload.
pub const MAX_RECORD_SIZE: u64 = 16 * 1024 * 1024;

/// Bits of a packed position reserved for the byte offset within a segment.
const OFFSET_BITS: u32 = 40;

/// Largest segment id representable in a packed position.
pub const MAX_SEGMENT_ID: u64 = (1 << 23) - 1;

/// Largest in-segment offset representable in a packed position.
pub const MAX_OFFSET: u64 = (1 << OFFSET_BITS) - 1;

/// Identifies one record in the log: the segment it lives in and the byte
/// offset of its frame within that segment. Positions are assigned in append
/// order and compare lexicographically, so they form a strict monotonic
/// sequence per log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub segment_id: u64,
    pub offset: u64,
}

impl Position {
    /// Pack into a single signed scalar for on-disk persistence.
    ///
    /// The segment id occupies the high 23 bits and the offset the low 40,
    /// which keeps packing injective for any segment smaller than 1 TiB.
    /// The result is non-negative; negative scalars are reserved as the
    /// "nothing delivered yet" sentinel.
    pub fn pack(self) -> i64 {
        debug_assert!(self.segment_id <= MAX_SEGMENT_ID);
        debug_assert!(self.offset <= MAX_OFFSET);
        ((self.segment_id << OFFSET_BITS) | self.offset) as i64
    }

    /// Inverse of [`pack`](Self::pack). Negative scalars decode to `None`.
    pub fn unpack(raw: i64) -> Option<Self> {
        if raw < 0 {
            return None;
        }
        let raw = raw as u64;
        Some(Self {
            segment_id: raw >> OFFSET_BITS,
            offset: raw & MAX_OFFSET,
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.offset)
    }
}

/// Encode one record payload as a length-prefixed, checksummed frame.
///
/// Layout: `[len: u32 le][crc32(payload): u32 le][payload]`. A zero-length
/// payload produces a valid 8-byte frame.
pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN as usize + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Header written at the start of every segment file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Segment format version.
    pub version: u32,
    /// Segment creation timestamp (unix millis).
    pub created_at: u64,
    /// Header checksum.
    pub checksum: u32,
}

impl SegmentHeader {
    /// Current segment format version.
    pub const VERSION: u32 = 1;

    /// Create a header for a fresh segment.
    pub fn new() -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;

        let mut header = Self {
            version: Self::VERSION,
            created_at,
            checksum: 0,
        };
        header.checksum = header.calculate_checksum();
        header
    }

    fn calculate_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&self.created_at.to_le_bytes());
        hasher.finalize()
    }

    /// Validate header integrity.
    pub fn validate_checksum(&self) -> bool {
        self.checksum == self.calculate_checksum()
    }

    /// Serialize header to bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize header from bytes.
    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

impl Default for SegmentHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn positions_order_by_segment_then_offset() {
        let a = Position { segment_id: 0, offset: 100 };
        let b = Position { segment_id: 0, offset: 200 };
        let c = Position { segment_id: 1, offset: 0 };
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn pack_roundtrip() {
        let pos = Position { segment_id: 7, offset: 64 * 1024 * 1024 };
        assert_eq!(Position::unpack(pos.pack()), Some(pos));
    }

    #[test]
    fn negative_scalar_is_sentinel() {
        assert_eq!(Position::unpack(-1), None);
        assert_eq!(Position::unpack(i64::MIN), None);
    }

    #[test]
    fn frame_carries_length_and_checksum() {
        let frame = encode_frame(b"hello");
        assert_eq!(frame.len(), 13);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 5);
        let crc = u32::from_le_bytes(frame[4..8].try_into().unwrap());
        assert_eq!(crc, crc32fast::hash(b"hello"));
        assert_eq!(&frame[8..], b"hello");
    }

    #[test]
    fn empty_frame_is_valid() {
        let frame = encode_frame(b"");
        assert_eq!(frame.len(), 8);
        assert_eq!(u32::from_le_bytes(frame[0..4].try_into().unwrap()), 0);
    }

    #[test]
    fn segment_header_roundtrip() {
        let header = SegmentHeader::new();
        assert!(header.validate_checksum());

        let bytes = header.serialize().unwrap();
        let decoded = SegmentHeader::deserialize(&bytes).unwrap();
        assert!(decoded.validate_checksum());
        assert_eq!(decoded.created_at, header.created_at);
    }

    proptest! {
        #[test]
        fn packing_is_injective_and_order_preserving(
            a_seg in 0u64..=MAX_SEGMENT_ID,
            a_off in 0u64..=MAX_OFFSET,
            b_seg in 0u64..=MAX_SEGMENT_ID,
            b_off in 0u64..=MAX_OFFSET,
        ) {
            let a = Position { segment_id: a_seg, offset: a_off };
            let b = Position { segment_id: b_seg, offset: b_off };
            prop_assert_eq!(Position::unpack(a.pack()), Some(a));
            prop_assert_eq!(a < b, a.pack() < b.pack());
            prop_assert_eq!(a == b, a.pack() == b.pack());
        }
    }
}
