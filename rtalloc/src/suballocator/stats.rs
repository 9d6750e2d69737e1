// Copyright (c) 2026 The rtalloc developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::DeviceSize;
use std::fmt::{self, Display};

/// Memory usage statistics of a [`Suballocator`].
///
/// [`Suballocator`]: super::Suballocator
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    /// Bytes that live suballocations save compared to placing each of them in a block of its
    /// own, as a result of rounding up to the block alignment rather than the allocation
    /// alignment.
    pub alignment_savings: DeviceSize,

    /// Bytes handed out as part of reused free regions beyond what the requests needed.
    pub fragmented_size: DeviceSize,

    /// Sum of the sizes of all blocks.
    pub total_resident_memory_size: DeviceSize,

    /// Bytes of the blocks not covered by any live request: free regions, the untouched tail of
    /// each block, and the padding and slack of live suballocations.
    pub unused_size: DeviceSize,

    /// Fragmentation of the free space, between 0 and 100.
    pub fragmentation: f64,

    /// Number of blocks.
    pub block_count: usize,

    /// Number of live suballocations.
    pub allocation_count: usize,
}

impl Stats {
    /// Returns the number of resident bytes that are holding live requests.
    #[inline]
    pub fn used_size(&self) -> DeviceSize {
        self.total_resident_memory_size
            .saturating_sub(self.unused_size)
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: f64 = (1024 * 1024) as f64;

        writeln!(
            f,
            "Resident memory: {:.3} MiB in {} blocks",
            self.total_resident_memory_size as f64 / MIB,
            self.block_count,
        )?;
        writeln!(
            f,
            "Used memory: {:.3} MiB by {} suballocations",
            self.used_size() as f64 / MIB,
            self.allocation_count,
        )?;
        writeln!(
            f,
            "Unused memory: {:.3} MiB ({:.3} MiB reuse slack)",
            self.unused_size as f64 / MIB,
            self.fragmented_size as f64 / MIB,
        )?;
        writeln!(
            f,
            "Alignment savings: {:.3} MiB",
            self.alignment_savings as f64 / MIB,
        )?;
        write!(f, "Fragmentation: {:.2}%", self.fragmentation)
    }
}

/// Accumulates the sum-of-squares fragmentation metric over a number of blocks.
///
/// Each block's free space, that is its free regions plus the tail behind the bump pointer, is
/// scored on its own: with `quality` the sum of the squares of the region sizes and `total` the
/// sum of the region sizes, the block's fragmentation is `(1 - (sqrt(quality) / total)²) * 100`,
/// or zero if either sum is zero. A single region therefore scores 0, and the score approaches
/// 100 as the same amount of free space is split into more and smaller regions. The scores of
/// the blocks are combined by weighting each with the block's free space.
#[derive(Debug, Default)]
pub(super) struct Fragmentation {
    weighted: f64,
    total_unused: DeviceSize,
}

impl Fragmentation {
    pub fn add_block(&mut self, free_regions: impl IntoIterator<Item = DeviceSize>) {
        let mut quality = 0.0f64;
        let mut total: DeviceSize = 0;

        for size in free_regions {
            let size_f = size as f64;
            quality += size_f * size_f;
            total += size;
        }

        self.total_unused += total;

        if quality == 0.0 || total == 0 {
            return;
        }

        let quality_ratio = quality.sqrt() / total as f64;
        let fragmentation = (1.0 - quality_ratio * quality_ratio) * 100.0;

        self.weighted += fragmentation.clamp(0.0, 100.0) * total as f64;
    }

    /// Returns the fragmentation, between 0 and 100, and the total number of free bytes.
    pub fn finish(self) -> (f64, DeviceSize) {
        if self.total_unused == 0 {
            return (0.0, 0);
        }

        let fragmentation = self.weighted / self.total_unused as f64;

        (fragmentation.clamp(0.0, 100.0), self.total_unused)
    }
}
