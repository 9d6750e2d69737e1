// Copyright (c) 2026 The rtalloc developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::DeviceSize;
use smallvec::SmallVec;

/// A reclaimed range of a block, available to be handed out again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) struct FreeRegion {
    pub offset: DeviceSize,
    pub size: DeviceSize,
}

/// The regions of a block that were freed, in the order they were freed.
///
/// Regions are never split nor coalesced: a region that is reused is handed out whole, and the
/// difference to the requested size is accounted as unused memory of that suballocation.
#[derive(Debug, Default)]
pub(super) struct FreeList {
    regions: SmallVec<[FreeRegion; 8]>,
}

impl FreeList {
    #[inline]
    pub fn push(&mut self, region: FreeRegion) {
        debug_assert!(region.size != 0);
        debug_assert!(self.regions.iter().all(|other| {
            other.offset + other.size <= region.offset
                || region.offset + region.size <= other.offset
        }));

        self.regions.push(region);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.regions.clear();
    }

    #[inline]
    pub fn sizes(&self) -> impl Iterator<Item = DeviceSize> + '_ {
        self.regions.iter().map(|region| region.size)
    }

    /// Removes and returns the region best suited to hold `size` bytes.
    ///
    /// An exact fit is taken as soon as it is seen. Otherwise the region with the least slack is
    /// chosen, unless that slack is at least twice the requested size, in which case nothing is
    /// returned and the caller should place the allocation elsewhere.
    ///
    /// This is a linear scan over the free-list. The list only grows with churn within a single
    /// block, so it stays short in practice.
    pub fn take_best_fit(&mut self, size: DeviceSize) -> Option<FreeRegion> {
        let mut best: Option<(usize, DeviceSize)> = None;

        for (index, region) in self.regions.iter().enumerate() {
            let Some(slack) = region.size.checked_sub(size) else {
                continue;
            };

            if slack == 0 {
                return Some(self.regions.remove(index));
            }

            if best.map_or(true, |(_, min_slack)| slack < min_slack) {
                best = Some((index, slack));
            }
        }

        let (index, slack) = best?;

        (slack < size.saturating_mul(2)).then(|| self.regions.remove(index))
    }
}
