//! Delivered-byte bookkeeping for a single stream.

/// Tracks how far into the asset the consumer has been served.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCursor {
    last_delivered_offset: u64,
    expected_length: Option<u64>,
    finalized: bool,
}

impl StreamCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the length the upstream announced. May be rounded up by
    /// engines that only know the size approximately.
    pub fn expect_length(&mut self, length: Option<u64>) {
        self.expected_length = length;
    }

    /// Records that `len` bytes at `offset` were handed to the consumer.
    ///
    /// The delivered offset only moves forward, even if chunks are reported
    /// out of order.
    pub fn record_delivery(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        self.last_delivered_offset = self.last_delivered_offset.max(end);
    }

    /// Marks the stream terminated. Returns true only on the first call.
    pub fn finalize(&mut self) -> bool {
        !std::mem::replace(&mut self.finalized, true)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether everything announced has been delivered. An unknown length
    /// counts as zero, so a stream without a length is always complete.
    pub fn is_complete(&self) -> bool {
        self.last_delivered_offset >= self.expected_length.unwrap_or(0)
    }

    pub fn last_delivered_offset(&self) -> u64 {
        self.last_delivered_offset
    }

    pub fn expected_length(&self) -> Option<u64> {
        self.expected_length
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_finalize_only_once() {
        let mut cursor = StreamCursor::new();
        assert!(!cursor.is_finalized());
        assert!(cursor.finalize());
        assert!(!cursor.finalize());
        assert!(cursor.is_finalized());
    }

    #[test]
    fn test_completion_against_expected_length() {
        let mut cursor = StreamCursor::new();
        cursor.expect_length(Some(1000));

        cursor.record_delivery(0, 400);
        assert!(!cursor.is_complete());
        assert_eq!(cursor.last_delivered_offset(), 400);

        cursor.record_delivery(400, 600);
        assert!(cursor.is_complete());
    }

    #[test]
    fn test_unknown_length_is_complete() {
        let cursor = StreamCursor::new();
        assert_eq!(cursor.expected_length(), None);
        assert!(cursor.is_complete());
    }

    #[test]
    fn test_late_chunk_does_not_rewind() {
        let mut cursor = StreamCursor::new();
        cursor.record_delivery(500, 100);
        cursor.record_delivery(0, 100);
        assert_eq!(cursor.last_delivered_offset(), 600);
    }

    proptest! {
        #[test]
        fn prop_contiguous_delivery_sums_lengths(
            lengths in prop::collection::vec(0u64..10_000, 0..64)
        ) {
            let mut cursor = StreamCursor::new();
            let mut offset = 0u64;
            let mut previous = 0u64;

            for len in &lengths {
                cursor.record_delivery(offset, *len);
                offset += len;
                prop_assert!(cursor.last_delivered_offset() >= previous);
                previous = cursor.last_delivered_offset();
            }

            prop_assert_eq!(cursor.last_delivered_offset(), lengths.iter().sum::<u64>());
        }

        #[test]
        fn prop_offset_never_decreases(
            chunks in prop::collection::vec((0u64..1_000_000, 0u64..10_000), 0..64)
        ) {
            let mut cursor = StreamCursor::new();
            let mut previous = 0u64;

            for (offset, len) in chunks {
                cursor.record_delivery(offset, len);
                prop_assert!(cursor.last_delivered_offset() >= previous);
                previous = cursor.last_delivered_offset();
            }
        }
    }
}
