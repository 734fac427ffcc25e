// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Free-index pool over a contiguous range

use roaring::RoaringBitmap;
use std::ops::RangeInclusive;

/// Lowest-free-first pool of indices. Reserved indices look permanently in use.
#[derive(Debug)]
pub(crate) struct IndexPool {
    range: RangeInclusive<u32>,
    free: RoaringBitmap,
    reserved: RoaringBitmap,
}

impl IndexPool {
    pub(crate) fn new(range: RangeInclusive<u32>, reserved: impl IntoIterator<Item = u32>) -> Self {
        let reserved: RoaringBitmap = reserved
            .into_iter()
            .filter(|i| range.contains(i))
            .collect();
        let mut free = RoaringBitmap::new();
        free.insert_range(range.clone());
        free -= &reserved;
        Self {
            range,
            free,
            reserved,
        }
    }

    pub(crate) fn take(&mut self) -> Option<u32> {
        let index = self.free.min()?;
        self.free.remove(index);
        Some(index)
    }

    /// Returns false if the index does not belong to this pool or is already free.
    pub(crate) fn give(&mut self, index: u32) -> bool {
        if !self.range.contains(&index) || self.reserved.contains(index) {
            return false;
        }
        self.free.insert(index)
    }

    pub(crate) fn is_reserved(&self, index: u32) -> bool {
        self.reserved.contains(index)
    }

    pub(crate) fn is_free(&self, index: u32) -> bool {
        self.free.contains(index)
    }

    pub(crate) fn free_count(&self) -> u64 {
        self.free.len()
    }

    pub(crate) fn capacity(&self) -> u64 {
        let span = u64::from(*self.range.end()) - u64::from(*self.range.start()) + 1;
        span - self.reserved.len()
    }
}

#[cfg(test)]
mod tests {
    use super::IndexPool;

    #[test]
    fn lowest_first_and_reserved_skipped() {
        let mut pool = IndexPool::new(10..=14, [11, 12, 99]);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.take(), Some(10));
        assert_eq!(pool.take(), Some(13));
        assert_eq!(pool.take(), Some(14));
        assert_eq!(pool.take(), None);
        assert!(pool.give(13));
        assert!(!pool.give(13));
        assert!(!pool.give(11));
        assert!(!pool.give(20));
        assert!(pool.is_reserved(12));
        assert_eq!(pool.take(), Some(13));
    }

    #[test]
    fn reserved_never_taken() {
        bolero::check!()
            .with_type()
            .for_each(|(reserved, takes): &(Vec<u8>, u8)| {
                let mut pool = IndexPool::new(0..=255, reserved.iter().map(|r| u32::from(*r)));
                for _ in 0..*takes {
                    let Some(i) = pool.take() else { break };
                    assert!(!reserved.contains(&u8::try_from(i).unwrap()));
                }
            });
    }
}
