// src/utils.rs
// Block range utilities shared by the replay and reconciliation passes.

use crate::error::{PipelineError, Result};

/// Splits an inclusive `[from_block, to_block]` span into sub-ranges of at most
/// `batch_size` blocks, so `eth_getLogs` queries stay under provider range limits.
///
/// The batcher is a plain value: cloning it (or calling [`RangeBatcher::ranges`]
/// again) restarts the enumeration from the first range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeBatcher {
    from_block: u64,
    to_block: u64,
    batch_size: u64,
}

impl RangeBatcher {
    pub fn new(from_block: u64, to_block: u64, batch_size: u64) -> Result<Self> {
        if to_block < from_block {
            return Err(PipelineError::InvalidRange { from_block, to_block });
        }
        if batch_size == 0 {
            return Err(PipelineError::validation("batch_size must be greater than 0"));
        }
        Ok(Self {
            from_block,
            to_block,
            batch_size,
        })
    }

    pub fn ranges(&self) -> BlockRanges {
        BlockRanges {
            next: Some(self.from_block),
            to_block: self.to_block,
            batch_size: self.batch_size,
        }
    }

    /// Number of sub-ranges the span splits into, never zero.
    pub fn range_count(&self) -> u64 {
        (self.to_block - self.from_block) / self.batch_size + 1
    }
}

impl IntoIterator for RangeBatcher {
    type Item = (u64, u64);
    type IntoIter = BlockRanges;

    fn into_iter(self) -> BlockRanges {
        self.ranges()
    }
}

/// Lazy iterator over the `(start, end)` pairs of a [`RangeBatcher`].
#[derive(Debug, Clone)]
pub struct BlockRanges {
    next: Option<u64>,
    to_block: u64,
    batch_size: u64,
}

impl Iterator for BlockRanges {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<(u64, u64)> {
        let start = self.next?;
        let end = start
            .saturating_add(self.batch_size - 1)
            .min(self.to_block);
        // end == u64::MAX can't be followed by anything
        self.next = if end >= self.to_block { None } else { Some(end + 1) };
        Some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_block_chunks(from_block: u64, to_block: u64, chunk_size: u64) -> Result<Vec<(u64, u64)>> {
        Ok(RangeBatcher::new(from_block, to_block, chunk_size)?.ranges().collect())
    }

    fn assert_covers(ranges: &[(u64, u64)], from: u64, to: u64, size: u64) {
        assert_eq!(ranges.first().map(|r| r.0), Some(from));
        assert_eq!(ranges.last().map(|r| r.1), Some(to));
        for w in ranges.windows(2) {
            assert_eq!(w[0].1 + 1, w[1].0, "ranges must be contiguous");
        }
        for (a, b) in ranges {
            assert!(a <= b);
            assert!(b - a + 1 <= size);
        }
    }

    #[test]
    fn test_exact_multiple() {
        let ranges = create_block_chunks(0, 9, 5).unwrap();
        assert_eq!(ranges, vec![(0, 4), (5, 9)]);
    }

    #[test]
    fn test_short_last_range() {
        let ranges = create_block_chunks(100, 110, 5).unwrap();
        assert_eq!(ranges, vec![(100, 104), (105, 109), (110, 110)]);
    }

    #[test]
    fn test_single_block() {
        let batcher = RangeBatcher::new(7, 7, 1000).unwrap();
        assert_eq!(batcher.ranges().collect::<Vec<_>>(), vec![(7, 7)]);
        assert_eq!(batcher.range_count(), 1);
    }

    #[test]
    fn test_invalid_range() {
        let err = RangeBatcher::new(10, 9, 5).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidRange { from_block: 10, to_block: 9 }));
        assert!(RangeBatcher::new(1, 2, 0).is_err());
    }

    #[test]
    fn test_restartable() {
        let batcher = RangeBatcher::new(18_786_171, 18_800_000, 2_000).unwrap();
        let first: Vec<_> = batcher.ranges().collect();
        let second: Vec<_> = batcher.into_iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len() as u64, batcher.range_count());
    }

    #[test]
    fn test_near_u64_max() {
        let ranges = create_block_chunks(u64::MAX - 3, u64::MAX, 3).unwrap();
        assert_eq!(ranges, vec![(u64::MAX - 3, u64::MAX - 1), (u64::MAX, u64::MAX)]);
    }

    #[test]
    fn test_coverage_grid() {
        for from in [0u64, 1, 17] {
            for len in [0u64, 1, 2, 9, 10, 11, 99] {
                for size in [1u64, 2, 3, 10, 1000] {
                    let to = from + len;
                    let ranges = create_block_chunks(from, to, size).unwrap();
                    assert_covers(&ranges, from, to, size);
                }
            }
        }
    }
}
