// Copyright (c) 2026 The rtalloc developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The block suballocator.
//!
//! A [`Suballocator`] owns a growable list of [`Block`]s of a fixed granularity and carves
//! aligned suballocations out of them. Within a block, memory is handed out by a bump pointer.
//! Freed suballocations don't move the bump pointer back, but are kept in a per-block free-list
//! and handed out again to later requests that fit them well enough. A block is released once
//! its last suballocation is freed, except for the last remaining block, which is kept around
//! to avoid churn when the allocator oscillates between zero and one live suballocation.
//!
//! Requests that are larger than the block size get a dedicated block of exactly their size,
//! which is released as soon as that suballocation is freed.
//!
//! # Locking
//!
//! All bookkeeping of a suballocator is protected by a single mutex, which is held for the
//! entirety of [`allocate`] and [`free`], including the creation and release of blocks. Only
//! [`size`] can be read without taking the lock.
//!
//! [`allocate`]: Suballocator::allocate
//! [`free`]: Suballocator::free
//! [`size`]: Suballocator::size

pub use self::stats::Stats;
use self::{
    free_list::{FreeList, FreeRegion},
    stats::Fragmentation,
};
use crate::{
    block::{Block, BlockError, BlockIdentity},
    layout::{align_up, is_aligned, DeviceAlignment},
    slotmap::{new_key_type, SlotMap},
    DeviceSize, NonExhaustive, ACCEL_STRUCT_ALIGNMENT, COMPACTION_SIZE_BLOCK_SIZE,
    COMPACTION_SIZE_DESCRIPTOR_SIZE, DEFAULT_BLOCK_SIZE,
};
use parking_lot::Mutex;
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    iter,
    num::NonZeroU64,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

mod free_list;
mod stats;

const fn alignment(alignment: DeviceSize) -> DeviceAlignment {
    match DeviceAlignment::new(alignment) {
        Some(alignment) => alignment,
        None => panic!("alignment must be a power of two"),
    }
}

const ACCEL_STRUCT_DEVICE_ALIGNMENT: DeviceAlignment = alignment(ACCEL_STRUCT_ALIGNMENT);

const COMPACTION_SIZE_DEVICE_ALIGNMENT: DeviceAlignment =
    alignment(COMPACTION_SIZE_DESCRIPTOR_SIZE);

new_key_type! {
    struct BlockId;
}

new_key_type! {
    struct SubBlockId;
}

/// Suballocates memory for many short and long lived requests out of a few large [`Block`]s.
///
/// See [the module-level documentation] for the placement strategy.
///
/// [the module-level documentation]: self
pub struct Suballocator<B: Block> {
    id: NonZeroU64,
    context: Arc<B::Context>,
    block_size: DeviceSize,
    allocation_alignment: DeviceAlignment,
    // Sum of the sizes of all blocks. Only written while the state is locked.
    resident_size: AtomicU64,
    state: Mutex<SuballocatorState<B>>,
}

struct SuballocatorState<B: Block> {
    blocks: SlotMap<BlockId, BlockDesc<B>>,
    // Blocks in creation order.
    order: Vec<BlockId>,
    sub_blocks: SlotMap<SubBlockId, SubBlock>,
    alignment_savings: DeviceSize,
    fragmented_size: DeviceSize,
}

struct BlockDesc<B> {
    block: B,
    identity: BlockIdentity,
    alignment: DeviceAlignment,
    size: DeviceSize,
    current_offset: DeviceSize,
    sub_block_count: usize,
    free_list: FreeList,
    dedicated: bool,
}

#[derive(Clone, Copy, Debug)]
struct SubBlock {
    block: BlockId,
    offset: DeviceSize,
    size: DeviceSize,
    unused_size: DeviceSize,
    // Part of `unused_size` that comes from reusing a larger free region.
    slack: DeviceSize,
}

#[derive(Clone, Copy, Debug)]
struct Placement {
    offset: DeviceSize,
    size: DeviceSize,
    unused_size: DeviceSize,
    slack: DeviceSize,
    reused: bool,
}

impl<B: Block> Suballocator<B> {
    /// Creates a new `Suballocator` whose blocks are allocated from `context`.
    ///
    /// No block is allocated until the first call to [`allocate`].
    ///
    /// [`allocate`]: Self::allocate
    pub fn new(
        context: Arc<B::Context>,
        create_info: SuballocatorCreateInfo,
    ) -> Result<Self, SuballocatorError> {
        create_info.validate()?;

        let SuballocatorCreateInfo {
            block_size,
            allocation_alignment,
            _ne: _,
        } = create_info;

        Ok(Suballocator {
            id: next_allocator_id(),
            context,
            block_size,
            allocation_alignment,
            resident_size: AtomicU64::new(0),
            state: Mutex::new(SuballocatorState {
                blocks: SlotMap::default(),
                order: Vec::new(),
                sub_blocks: SlotMap::default(),
                alignment_savings: 0,
                fragmented_size: 0,
            }),
        })
    }

    /// Returns the context that blocks are allocated from.
    #[inline]
    pub fn context(&self) -> &Arc<B::Context> {
        &self.context
    }

    /// Returns the size of the blocks that are created for requests that aren't oversized.
    #[inline]
    pub fn block_size(&self) -> DeviceSize {
        self.block_size
    }

    /// Returns the alignment that every request is rounded up to.
    #[inline]
    pub fn allocation_alignment(&self) -> DeviceAlignment {
        self.allocation_alignment
    }

    /// Suballocates `size` bytes, rounded up to the allocation alignment.
    ///
    /// If the aligned size exceeds the block size, a dedicated block of exactly that size is
    /// created. Otherwise the blocks are scanned in creation order and the request is placed in
    /// the first block that can hold it, either in a previously freed region or behind the
    /// block's bump pointer. A new block is created if none can.
    ///
    /// # Errors
    ///
    /// - Returns [`ZeroSize`] if `size` is zero.
    /// - Returns [`SizeOverflow`] if rounding up `size` overflows.
    /// - Returns [`OutOfMemory`] if a new block was needed and couldn't be allocated.
    /// - Returns [`InvalidAlignment`] if a new block was allocated with an alignment that isn't
    ///   compatible with the allocation alignment.
    ///
    /// [`ZeroSize`]: SuballocatorError::ZeroSize
    /// [`SizeOverflow`]: SuballocatorError::SizeOverflow
    /// [`OutOfMemory`]: SuballocatorError::OutOfMemory
    /// [`InvalidAlignment`]: SuballocatorError::InvalidAlignment
    pub fn allocate(
        &self,
        size: DeviceSize,
    ) -> Result<SubAllocation<B::Handle>, SuballocatorError> {
        if size == 0 {
            return Err(SuballocatorError::ZeroSize);
        }

        let aligned_size =
            align_up(size, self.allocation_alignment).ok_or(SuballocatorError::SizeOverflow)?;

        let mut state = self.state.lock();
        let state = &mut *state;

        if aligned_size > self.block_size {
            let block_id = self.create_block(state, aligned_size, true)?;
            let desc = state
                .blocks
                .get_mut(block_id)
                .ok_or(SuballocatorError::InvariantViolation("created block went missing"))?;
            desc.current_offset = aligned_size;

            tracing::trace!(
                size,
                aligned_size,
                block = desc.identity.0,
                "placed an oversized request in a dedicated block"
            );

            return state.insert_sub_block(
                self.id,
                block_id,
                Placement {
                    offset: 0,
                    size: aligned_size,
                    unused_size: aligned_size - size,
                    slack: 0,
                    reused: false,
                },
            );
        }

        if state.order.is_empty() {
            self.create_block(state, self.block_size, false)?;
        }

        let mut index = 0;

        while let Some(&block_id) = state.order.get(index) {
            let is_last = index + 1 == state.order.len();
            let desc = state
                .blocks
                .get_mut(block_id)
                .ok_or(SuballocatorError::InvariantViolation("block order is stale"))?;

            if let Some(placement) = desc.place(size, aligned_size) {
                tracing::trace!(
                    size,
                    aligned_size,
                    block = desc.identity.0,
                    offset = placement.offset,
                    reused = placement.reused,
                    "suballocated"
                );

                return state.insert_sub_block(self.id, block_id, placement);
            }

            if is_last {
                self.create_block(state, self.block_size, false)?;
            }

            index += 1;
        }

        // Every block that was scanned either fit the request or was followed by a new one, so
        // this is only reached if the block list is corrupt.
        Err(SuballocatorError::OutOfMemory {
            size: aligned_size,
            source: BlockError::OutOfDeviceMemory,
        })
    }

    /// Frees the suballocation identified by `handle`.
    ///
    /// The freed range is added to its block's free-list, unless the block was dedicated to
    /// this suballocation, in which case the block is released right away. A block whose last
    /// suballocation is freed is released as well, unless it is the only block left, in which
    /// case it is kept and emptied.
    ///
    /// # Errors
    ///
    /// - Returns [`ForeignHandle`] if `handle` was returned by a different suballocator.
    /// - Returns [`DoubleFree`] if the suballocation was already freed.
    /// - Returns [`UseAfterFree`] if the block of the suballocation was already released.
    /// - Returns [`InvariantViolation`] if the bookkeeping of the suballocation is inconsistent.
    ///
    /// [`ForeignHandle`]: SuballocatorError::ForeignHandle
    /// [`DoubleFree`]: SuballocatorError::DoubleFree
    /// [`UseAfterFree`]: SuballocatorError::UseAfterFree
    /// [`InvariantViolation`]: SuballocatorError::InvariantViolation
    pub fn free(&self, handle: SubBlockHandle) -> Result<(), SuballocatorError> {
        if handle.allocator != self.id {
            tracing::warn!(?handle, "rejected a free of another suballocator's handle");

            return Err(SuballocatorError::ForeignHandle);
        }

        let mut state = self.state.lock();
        let state = &mut *state;

        let Some(&sub_block) = state.sub_blocks.get(handle.sub_block) else {
            let err = if state.blocks.contains_key(handle.block) {
                SuballocatorError::DoubleFree
            } else {
                SuballocatorError::UseAfterFree
            };
            tracing::warn!(?handle, %err, "rejected a free");

            return Err(err);
        };

        if sub_block.block != handle.block {
            return Err(SuballocatorError::InvariantViolation(
                "handle refers to a sub-block of another block",
            ));
        }

        let desc = state
            .blocks
            .get_mut(sub_block.block)
            .ok_or(SuballocatorError::InvariantViolation("sub-block outlived its block"))?;

        let covers_block = sub_block.offset == 0 && sub_block.size == desc.size;

        if desc.dedicated && !covers_block {
            tracing::warn!(
                block = desc.identity.0,
                block_size = desc.size,
                sub_block_size = sub_block.size,
                "dedicated block isn't covered by its suballocation"
            );
            debug_assert!(covers_block, "dedicated block isn't covered by its suballocation");

            return Err(SuballocatorError::InvariantViolation(
                "dedicated block isn't covered by its suballocation",
            ));
        }

        state.sub_blocks.remove(handle.sub_block);
        state.alignment_savings = state
            .alignment_savings
            .saturating_sub(alignment_savings(sub_block.size, desc.alignment));
        state.fragmented_size = state.fragmented_size.saturating_sub(sub_block.slack);
        desc.sub_block_count -= 1;

        tracing::trace!(
            block = desc.identity.0,
            offset = sub_block.offset,
            size = sub_block.size,
            "freed"
        );

        if desc.dedicated {
            self.destroy_block(state, sub_block.block);

            return Ok(());
        }

        desc.free_list.push(FreeRegion {
            offset: sub_block.offset,
            size: sub_block.size,
        });

        if desc.sub_block_count == 0 {
            if state.order.len() > 1 {
                self.destroy_block(state, sub_block.block);
            } else {
                desc.free_list.clear();
                desc.current_offset = 0;
            }
        }

        Ok(())
    }

    /// Returns the total size of all blocks.
    ///
    /// This doesn't take the lock, so it may be out of date by the time it returns if other
    /// threads are allocating or freeing concurrently.
    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.resident_size.load(Ordering::Acquire)
    }

    /// Returns memory usage statistics.
    pub fn stats(&self) -> Stats {
        let state = self.state.lock();

        let mut total_resident_memory_size = 0;
        let mut fragmentation = Fragmentation::default();

        for desc in state.blocks_in_order() {
            total_resident_memory_size += desc.size;
            fragmentation.add_block(desc.free_regions());
        }

        let (fragmentation, free_size) = fragmentation.finish();
        let live_unused_size: DeviceSize = state
            .sub_blocks
            .iter()
            .map(|(_, sub_block)| sub_block.unused_size)
            .sum();

        Stats {
            alignment_savings: state.alignment_savings,
            fragmented_size: state.fragmented_size,
            total_resident_memory_size,
            unused_size: free_size + live_unused_size,
            fragmentation,
            block_count: state.order.len(),
            allocation_count: state.sub_blocks.len() as usize,
        }
    }

    /// Returns the fragmentation of the free space, between 0 and 100, together with the total
    /// number of free bytes.
    ///
    /// The free space of a block consists of its free-list plus the tail behind its bump
    /// pointer. Free space that is one contiguous region per block scores 0.
    pub fn fragmentation(&self) -> (f64, DeviceSize) {
        let state = self.state.lock();
        let mut fragmentation = Fragmentation::default();

        for desc in state.blocks_in_order() {
            fragmentation.add_block(desc.free_regions());
        }

        fragmentation.finish()
    }

    /// Returns a description of every block, in creation order.
    ///
    /// Two suballocators with the same configuration that are driven with the same sequence of
    /// requests produce block lists of the same length, with blocks of the same size at the
    /// same index.
    pub fn blocks(&self) -> Vec<BlockInfo<B::Handle>> {
        let state = self.state.lock();

        state
            .blocks_in_order()
            .map(|desc| BlockInfo {
                handle: desc.block.handle(),
                identity: desc.identity,
                size: desc.size,
                current_offset: desc.current_offset,
                sub_block_count: desc.sub_block_count,
                free_region_count: desc.free_list.len(),
                dedicated: desc.dedicated,
            })
            .collect()
    }

    /// Returns the placement of a live suballocation, or [`None`] if it has been freed or
    /// belongs to a different suballocator.
    pub fn sub_block(&self, handle: SubBlockHandle) -> Option<SubBlockInfo> {
        if handle.allocator != self.id {
            return None;
        }

        let state = self.state.lock();
        let sub_block = state
            .sub_blocks
            .get(handle.sub_block)
            .filter(|sub_block| sub_block.block == handle.block)?;
        let desc = state.blocks.get(sub_block.block)?;

        Some(SubBlockInfo {
            block_identity: desc.identity,
            offset: sub_block.offset,
            size: sub_block.size,
            unused_size: sub_block.unused_size,
        })
    }

    /// Returns `true` if the suballocation has been freed, or its block released.
    #[inline]
    pub fn is_free(&self, handle: SubBlockHandle) -> bool {
        self.sub_block(handle).is_none()
    }

    /// Releases every block. Handles of suballocations made before the call are reported as
    /// [`UseAfterFree`] afterward.
    ///
    /// [`UseAfterFree`]: SuballocatorError::UseAfterFree
    pub fn reset(&mut self) {
        let state = self.state.get_mut();
        let block_count = state.order.len();

        state.order.clear();
        state.sub_blocks.clear();
        state.alignment_savings = 0;
        state.fragmented_size = 0;

        for desc in state.blocks.drain() {
            desc.block.free(&self.context);
        }

        *self.resident_size.get_mut() = 0;

        if block_count != 0 {
            tracing::debug!(block_count, "released all blocks");
        }
    }

    fn create_block(
        &self,
        state: &mut SuballocatorState<B>,
        size: DeviceSize,
        dedicated: bool,
    ) -> Result<BlockId, SuballocatorError> {
        let block = B::allocate(&self.context, size).map_err(|source| {
            tracing::warn!(size, %source, "failed to allocate a block");

            SuballocatorError::OutOfMemory { size, source }
        })?;

        let block_alignment = block.alignment();
        let alignment = match DeviceAlignment::new(block_alignment) {
            Some(alignment) if alignment >= self.allocation_alignment => alignment,
            _ => {
                tracing::warn!(
                    block_alignment,
                    allocation_alignment = self.allocation_alignment.as_devicesize(),
                    "allocated a block with an incompatible alignment"
                );
                block.free(&self.context);

                return Err(SuballocatorError::InvalidAlignment {
                    allocation_alignment: self.allocation_alignment,
                    block_alignment,
                });
            }
        };

        let identity = block.identity();
        let block_id = state.blocks.insert(BlockDesc {
            block,
            identity,
            alignment,
            size,
            current_offset: 0,
            sub_block_count: 0,
            free_list: FreeList::default(),
            dedicated,
        });
        state.order.push(block_id);
        self.resident_size.fetch_add(size, Ordering::Release);

        tracing::debug!(
            block = identity.0,
            size,
            dedicated,
            block_count = state.order.len(),
            "created a block"
        );

        Ok(block_id)
    }

    fn destroy_block(&self, state: &mut SuballocatorState<B>, block_id: BlockId) {
        let Some(desc) = state.blocks.remove(block_id) else {
            return;
        };

        state.order.retain(|&id| id != block_id);
        self.resident_size.fetch_sub(desc.size, Ordering::Release);

        tracing::debug!(
            block = desc.identity.0,
            size = desc.size,
            block_count = state.order.len(),
            "released a block"
        );

        desc.block.free(&self.context);
    }
}

impl<B: Block> Drop for Suballocator<B> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<B: Block> Debug for Suballocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suballocator")
            .field("block_size", &self.block_size)
            .field("allocation_alignment", &self.allocation_alignment)
            .field("resident_size", &self.size())
            .finish_non_exhaustive()
    }
}

impl<B: Block> SuballocatorState<B> {
    fn blocks_in_order(&self) -> impl Iterator<Item = &BlockDesc<B>> + '_ {
        self.order.iter().filter_map(|&id| self.blocks.get(id))
    }

    fn insert_sub_block(
        &mut self,
        allocator: NonZeroU64,
        block_id: BlockId,
        placement: Placement,
    ) -> Result<SubAllocation<B::Handle>, SuballocatorError> {
        let desc = self
            .blocks
            .get_mut(block_id)
            .ok_or(SuballocatorError::InvariantViolation("placed in a missing block"))?;

        desc.sub_block_count += 1;
        self.alignment_savings += alignment_savings(placement.size, desc.alignment);
        self.fragmented_size += placement.slack;

        let sub_block = self.sub_blocks.insert(SubBlock {
            block: block_id,
            offset: placement.offset,
            size: placement.size,
            unused_size: placement.unused_size,
            slack: placement.slack,
        });

        Ok(SubAllocation {
            block: desc.block.handle(),
            block_identity: desc.identity,
            offset: placement.offset,
            size: placement.size,
            unused_size: placement.unused_size,
            handle: SubBlockHandle {
                allocator,
                block: block_id,
                sub_block,
            },
        })
    }
}

impl<B> BlockDesc<B> {
    /// Finds room for a request of `aligned_size` bytes, first in the free-list, then behind
    /// the bump pointer.
    fn place(&mut self, size: DeviceSize, aligned_size: DeviceSize) -> Option<Placement> {
        if self.dedicated {
            return None;
        }

        if let Some(region) = self.free_list.take_best_fit(aligned_size) {
            let slack = region.size - aligned_size;

            return Some(Placement {
                offset: region.offset,
                size: region.size,
                unused_size: slack,
                slack,
                reused: true,
            });
        }

        let end = self
            .current_offset
            .checked_add(aligned_size)
            .filter(|&end| end <= self.size)?;
        let offset = self.current_offset;
        self.current_offset = end;

        Some(Placement {
            offset,
            size: aligned_size,
            unused_size: aligned_size - size,
            slack: 0,
            reused: false,
        })
    }

    fn free_regions(&self) -> impl Iterator<Item = DeviceSize> + '_ {
        self.free_list
            .sizes()
            .chain(iter::once(self.size - self.current_offset))
    }
}

fn next_allocator_id() -> NonZeroU64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    NonZeroU64::new(COUNTER.fetch_add(1, Ordering::Relaxed)).unwrap_or_else(|| {
        eprintln!("the suballocator ID counter has overflown");
        std::process::abort();
    })
}

/// Bytes saved by placing `size` bytes in a shared block rather than in a block of its own.
fn alignment_savings(size: DeviceSize, block_alignment: DeviceAlignment) -> DeviceSize {
    align_up(size, block_alignment).map_or(0, |aligned| aligned - size)
}

/// Parameters to create a new [`Suballocator`].
#[derive(Clone, Debug)]
pub struct SuballocatorCreateInfo {
    /// The size of the blocks that requests are placed in. Requests that are larger get a
    /// dedicated block of their own.
    ///
    /// Must not be zero, and must be a multiple of `allocation_alignment`.
    ///
    /// The default value is [`DEFAULT_BLOCK_SIZE`].
    ///
    /// [`DEFAULT_BLOCK_SIZE`]: crate::DEFAULT_BLOCK_SIZE
    pub block_size: DeviceSize,

    /// The alignment that the size and offset of every suballocation is rounded up to.
    ///
    /// Blocks must be at least this aligned.
    ///
    /// The default value is [`ACCEL_STRUCT_ALIGNMENT`].
    ///
    /// [`ACCEL_STRUCT_ALIGNMENT`]: crate::ACCEL_STRUCT_ALIGNMENT
    pub allocation_alignment: DeviceAlignment,

    pub _ne: NonExhaustive,
}

impl Default for SuballocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        SuballocatorCreateInfo {
            block_size: DEFAULT_BLOCK_SIZE,
            allocation_alignment: ACCEL_STRUCT_DEVICE_ALIGNMENT,
            _ne: NonExhaustive(()),
        }
    }
}

impl SuballocatorCreateInfo {
    /// Returns a `SuballocatorCreateInfo` for acceleration structure storage, scratch memory and
    /// their readback copies, with the given `block_size`.
    #[inline]
    pub fn accel_struct(block_size: DeviceSize) -> Self {
        SuballocatorCreateInfo {
            block_size,
            ..Default::default()
        }
    }

    /// Returns a `SuballocatorCreateInfo` for slots that receive compacted-size query results.
    ///
    /// Every slot is [`COMPACTION_SIZE_DESCRIPTOR_SIZE`] bytes, so the offset of a slot divided
    /// by that size is its query index within the block.
    ///
    /// [`COMPACTION_SIZE_DESCRIPTOR_SIZE`]: crate::COMPACTION_SIZE_DESCRIPTOR_SIZE
    #[inline]
    pub fn compaction_size_query() -> Self {
        SuballocatorCreateInfo {
            block_size: COMPACTION_SIZE_BLOCK_SIZE,
            allocation_alignment: COMPACTION_SIZE_DEVICE_ALIGNMENT,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), SuballocatorError> {
        if self.block_size == 0 {
            return Err(SuballocatorError::InvalidCreateInfo(
                "`block_size` must not be zero",
            ));
        }

        if !is_aligned(self.block_size, self.allocation_alignment) {
            return Err(SuballocatorError::InvalidCreateInfo(
                "`block_size` must be a multiple of `allocation_alignment`",
            ));
        }

        Ok(())
    }
}

/// A suballocation returned by [`Suballocator::allocate`].
#[derive(Clone, Debug)]
pub struct SubAllocation<H> {
    /// Handle of the block that the suballocation resides in.
    pub block: H,

    /// Identity of the block that the suballocation resides in.
    pub block_identity: BlockIdentity,

    /// Offset of the suballocation from the start of the block.
    pub offset: DeviceSize,

    /// Size reserved for the suballocation. This is the requested size rounded up to the
    /// allocation alignment, or more if a larger free region was reused.
    pub size: DeviceSize,

    /// Part of `size` that wasn't requested.
    pub unused_size: DeviceSize,

    /// Handle to pass to [`Suballocator::free`].
    pub handle: SubBlockHandle,
}

impl<H> SubAllocation<H> {
    /// Returns the range of the block that the suballocation occupies.
    #[inline]
    pub fn range(&self) -> Range<DeviceSize> {
        self.offset..self.offset + self.size
    }
}

/// Identifies a suballocation of a [`Suballocator`].
///
/// Handles stay valid to pass around after the suballocation is freed: freeing it again, or
/// passing it to a different suballocator, is detected and reported instead of affecting
/// another suballocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubBlockHandle {
    allocator: NonZeroU64,
    block: BlockId,
    sub_block: SubBlockId,
}

/// The placement of a live suballocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubBlockInfo {
    pub block_identity: BlockIdentity,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub unused_size: DeviceSize,
}

/// Describes a block of a [`Suballocator`].
#[derive(Clone, Debug)]
pub struct BlockInfo<H> {
    /// Handle of the block.
    pub handle: H,

    /// Identity of the block.
    pub identity: BlockIdentity,

    /// Size of the block.
    pub size: DeviceSize,

    /// Offset of the bump pointer. Nothing has ever been placed behind it.
    pub current_offset: DeviceSize,

    /// Number of live suballocations in the block.
    pub sub_block_count: usize,

    /// Number of freed regions waiting to be reused.
    pub free_region_count: usize,

    /// Whether the block was created for a single oversized request.
    pub dedicated: bool,
}

/// Error that can be returned by a [`Suballocator`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SuballocatorError {
    /// A new block was needed, but it couldn't be allocated.
    OutOfMemory {
        /// The size of the block.
        size: DeviceSize,
        source: BlockError,
    },

    /// A new block was allocated with an alignment that isn't a power of two or that is smaller
    /// than the allocation alignment. The block has been released again.
    InvalidAlignment {
        allocation_alignment: DeviceAlignment,
        block_alignment: DeviceSize,
    },

    /// The requested size was zero.
    ZeroSize,

    /// Rounding the requested size up to the allocation alignment overflowed.
    SizeOverflow,

    /// The handle was returned by a different suballocator.
    ForeignHandle,

    /// The suballocation has already been freed.
    DoubleFree,

    /// The block of the suballocation has already been released.
    UseAfterFree,

    /// The internal bookkeeping is inconsistent.
    InvariantViolation(&'static str),

    /// The create info is invalid.
    InvalidCreateInfo(&'static str),
}

impl Error for SuballocatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::OutOfMemory { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl Display for SuballocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { size, .. } => {
                write!(f, "failed to allocate a block of {size} bytes")
            }
            Self::InvalidAlignment {
                allocation_alignment,
                block_alignment,
            } => write!(
                f,
                "a block was allocated with an alignment of {block_alignment}, which is \
                incompatible with the allocation alignment of {}",
                allocation_alignment.as_devicesize(),
            ),
            Self::ZeroSize => f.write_str("the requested size was zero"),
            Self::SizeOverflow => {
                f.write_str("the requested size overflows when rounded up to the alignment")
            }
            Self::ForeignHandle => {
                f.write_str("the handle was returned by a different suballocator")
            }
            Self::DoubleFree => f.write_str("the suballocation has already been freed"),
            Self::UseAfterFree => {
                f.write_str("the block of the suballocation has already been released")
            }
            Self::InvariantViolation(msg) => write!(f, "internal invariant violated: {msg}"),
            Self::InvalidCreateInfo(msg) => write!(f, "invalid create info: {msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{VirtualBlock, VirtualBlockHandle, VirtualHeap};
    use crossbeam_queue::ArrayQueue;
    use proptest::prelude::*;
    use std::thread;

    const A256: DeviceAlignment = alignment(256);

    fn heap() -> Arc<VirtualHeap> {
        Arc::new(VirtualHeap::new(1 << 30))
    }

    fn suballocator(
        heap: &Arc<VirtualHeap>,
        block_size: DeviceSize,
        allocation_alignment: DeviceAlignment,
    ) -> Suballocator<VirtualBlock> {
        Suballocator::new(
            heap.clone(),
            SuballocatorCreateInfo {
                block_size,
                allocation_alignment,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn assert_disjoint<'a>(
        allocs: impl IntoIterator<Item = &'a SubAllocation<VirtualBlockHandle>>,
    ) {
        let mut ranges = allocs
            .into_iter()
            .map(|alloc| (alloc.block_identity, alloc.range()))
            .collect::<Vec<_>>();
        ranges.sort_by_key(|(identity, range)| (*identity, range.start));

        for pair in ranges.windows(2) {
            let ((a_identity, a), (b_identity, b)) = (&pair[0], &pair[1]);

            if a_identity == b_identity {
                assert!(a.end <= b.start, "{a:?} overlaps {b:?} in block {a_identity:?}");
            }
        }
    }

    #[test]
    fn shared_then_oversized() {
        let heap = heap();
        let allocator = suballocator(&heap, 65536, A256);

        let a = allocator.allocate(1000).unwrap();
        assert_eq!((a.offset, a.size, a.unused_size), (0, 1024, 24));

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, 65536);
        assert_eq!(blocks[0].current_offset, 1024);

        let b = allocator.allocate(70000).unwrap();
        assert_eq!((b.offset, b.size, b.unused_size), (0, 70144, 144));
        assert_ne!(b.block_identity, a.block_identity);
        assert_eq!(b.block.address_at(b.offset) % 65536, 0);

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].size, 70144);
        assert_eq!(blocks[1].identity, b.block_identity);
        assert!(blocks[1].dedicated);
        assert!(!blocks[0].dedicated);

        assert_eq!(allocator.size(), 65536 + 70144);
        assert_eq!(heap.used(), allocator.size());
    }

    #[test]
    fn full_block_grows_then_empty_block_is_released() {
        let heap = heap();
        let allocator = suballocator(&heap, 1024, A256);

        let a = allocator.allocate(800).unwrap();
        assert_eq!((a.offset, a.size), (0, 1024));

        let b = allocator.allocate(800).unwrap();
        assert_eq!((b.offset, b.size), (0, 1024));
        assert_ne!(b.block_identity, a.block_identity);

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].identity, a.block_identity);
        assert_eq!(blocks[1].identity, b.block_identity);

        allocator.free(a.handle).unwrap();

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].identity, b.block_identity);
        assert_eq!(heap.block_count(), 1);
        assert_eq!(allocator.size(), 1024);
    }

    #[test]
    fn too_small_free_region_falls_through_to_bump() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(1000).unwrap();
        let b = allocator.allocate(1000).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(b.offset, 1024);

        allocator.free(a.handle).unwrap();

        let c = allocator.allocate(1200).unwrap();
        assert_eq!((c.offset, c.size), (2048, 1280));
        assert_eq!(c.block_identity, a.block_identity);

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].free_region_count, 1);
        assert_eq!(blocks[0].current_offset, 3328);
        assert_eq!(allocator.stats().fragmented_size, 0);
    }

    #[test]
    fn free_region_reused_with_slack() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(2048).unwrap();
        let _b = allocator.allocate(1000).unwrap();
        allocator.free(a.handle).unwrap();

        // Rounds up to 1792, leaving 256 bytes of slack in the 2048-byte region.
        let d = allocator.allocate(1700).unwrap();
        assert_eq!(d.block_identity, a.block_identity);
        assert_eq!(d.range(), 0..2048);
        assert_ne!(Some(d.size), align_up(1700, A256));
        assert_eq!(d.unused_size, 256);

        let blocks = allocator.blocks();
        assert_eq!(blocks[0].free_region_count, 0);
        assert_eq!(blocks[0].current_offset, 3072);
        assert_eq!(allocator.stats().fragmented_size, 256);

        assert_eq!(
            allocator.sub_block(d.handle),
            Some(SubBlockInfo {
                block_identity: a.block_identity,
                offset: 0,
                size: 2048,
                unused_size: 256,
            }),
        );

        allocator.free(d.handle).unwrap();
        assert_eq!(allocator.stats().fragmented_size, 0);
    }

    #[test]
    fn offsets_and_sizes_are_aligned() {
        let heap = heap();
        let allocator = suballocator(&heap, 64 * 1024, A256);
        let mut allocs = Vec::new();

        for size in (1..100_000).step_by(3571) {
            let alloc = allocator.allocate(size).unwrap();
            assert!(is_aligned(alloc.offset, A256));
            assert!(is_aligned(alloc.size, A256));
            assert!(alloc.size >= size);
            allocs.push(alloc);
        }

        // Free every other one and allocate again to go through the free-lists.
        for alloc in allocs.iter().step_by(2) {
            allocator.free(alloc.handle).unwrap();
        }

        allocs = allocs.into_iter().skip(1).step_by(2).collect();

        for size in (1..50_000).step_by(4999) {
            let alloc = allocator.allocate(size).unwrap();
            assert!(is_aligned(alloc.offset, A256));
            assert!(is_aligned(alloc.size, A256));
            allocs.push(alloc);
        }

        assert_disjoint(&allocs);
    }

    #[test]
    fn freed_region_is_reused() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let x = allocator.allocate(2000).unwrap();
        let _keep = allocator.allocate(100).unwrap();
        allocator.free(x.handle).unwrap();
        assert!(allocator.is_free(x.handle));

        let y = allocator.allocate(1500).unwrap();
        assert_eq!(y.block_identity, x.block_identity);
        assert_eq!(y.offset, x.offset);
        assert_eq!(y.size, x.size);
        assert_eq!(allocator.blocks().len(), 1);

        // An exact fit has no slack.
        allocator.free(y.handle).unwrap();
        let z = allocator.allocate(2048).unwrap();
        assert_eq!((z.offset, z.unused_size), (0, 0));
    }

    #[test]
    fn oversized_block_is_released_on_free() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let _small = allocator.allocate(100).unwrap();
        let big = allocator.allocate(10000).unwrap();
        assert_eq!(big.size, 10240);

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].size, 10240);

        allocator.free(big.handle).unwrap();

        let blocks = allocator.blocks();
        assert_eq!(blocks.len(), 1);
        assert!(blocks.iter().all(|b| b.identity != big.block_identity));
        assert_eq!(heap.block_count(), 1);
        assert_eq!(allocator.size(), 4096);
    }

    #[test]
    fn oversized_first_request_creates_one_block() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let big = allocator.allocate(5000).unwrap();
        assert_eq!(big.size, 5120);
        assert_eq!(allocator.blocks().len(), 1);

        // Dedicated blocks are never kept around, even as the last block.
        allocator.free(big.handle).unwrap();
        assert!(allocator.blocks().is_empty());
        assert_eq!(allocator.size(), 0);
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn last_empty_block_is_retained() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        for size in [1000, 4096, 1, 2500] {
            let alloc = allocator.allocate(size).unwrap();
            assert_eq!(alloc.offset, 0);
            allocator.free(alloc.handle).unwrap();

            let blocks = allocator.blocks();
            assert_eq!(blocks.len(), 1);
            assert_eq!(blocks[0].current_offset, 0);
            assert_eq!(blocks[0].free_region_count, 0);
            assert_eq!(heap.block_count(), 1);
        }

        let allocator = suballocator(&heap, 1024, A256);
        let a = allocator.allocate(1024).unwrap();
        let b = allocator.allocate(1024).unwrap();
        assert_eq!(allocator.blocks().len(), 2);

        allocator.free(b.handle).unwrap();
        assert_eq!(allocator.blocks().len(), 1);

        allocator.free(a.handle).unwrap();
        assert_eq!(allocator.blocks().len(), 1);
    }

    #[test]
    fn fragmentation_grows_with_splitting() {
        let heap = heap();

        {
            let allocator = suballocator(&heap, 4096, A256);
            assert_eq!(allocator.fragmentation(), (0.0, 0));

            let a = allocator.allocate(1024).unwrap();
            let _rest = allocator.allocate(3072).unwrap();
            assert_eq!(allocator.fragmentation(), (0.0, 0));

            allocator.free(a.handle).unwrap();
            assert_eq!(allocator.fragmentation(), (0.0, 1024));
        }

        let mut results = Vec::new();

        for pieces in [1, 2, 4] {
            let allocator = suballocator(&heap, 4096, A256);
            let allocs = (0..pieces)
                .map(|_| allocator.allocate(1024 / pieces).unwrap())
                .collect::<Vec<_>>();
            let _rest = allocator.allocate(3072).unwrap();

            for alloc in allocs {
                allocator.free(alloc.handle).unwrap();
            }

            let (fragmentation, free_size) = allocator.fragmentation();
            assert_eq!(free_size, 1024);
            assert_eq!(allocator.stats().fragmentation, fragmentation);
            results.push(fragmentation);
        }

        assert_eq!(results[0], 0.0);
        assert!((results[1] - 50.0).abs() < 1e-9);
        assert!((results[2] - 75.0).abs() < 1e-9);
    }

    #[test]
    fn stats_account_for_every_byte() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(1000).unwrap();
        let b = allocator.allocate(2000).unwrap();
        let c = allocator.allocate(9000).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.total_resident_memory_size, 4096 + 9216);
        assert_eq!(stats.total_resident_memory_size, allocator.size());
        assert_eq!(stats.block_count, 2);
        assert_eq!(stats.allocation_count, 3);
        assert_eq!(stats.used_size(), 12000);

        allocator.free(b.handle).unwrap();
        let d = allocator.allocate(1500).unwrap();
        assert_eq!(d.size, 2048);

        // The padding of a reused region counts as used.
        let stats = allocator.stats();
        assert_eq!(stats.used_size(), 1000 + 1536 + 9000);
        assert_eq!(stats.unused_size, 24 + 512 + 216 + (4096 - 3072));

        for handle in [a.handle, c.handle, d.handle] {
            allocator.free(handle).unwrap();
        }

        let stats = allocator.stats();
        assert_eq!(stats.used_size(), 0);
        assert_eq!(stats.unused_size, 4096);
        assert_eq!(stats.alignment_savings, 0);
        assert_eq!(stats.fragmented_size, 0);
    }

    #[test]
    fn alignment_savings_track_live_suballocations() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(1000).unwrap();
        assert_eq!(allocator.stats().alignment_savings, 65536 - 1024);

        let big = allocator.allocate(70000).unwrap();
        assert_eq!(
            allocator.stats().alignment_savings,
            (65536 - 1024) + (131072 - 70144),
        );

        allocator.free(big.handle).unwrap();
        assert_eq!(allocator.stats().alignment_savings, 65536 - 1024);

        allocator.free(a.handle).unwrap();
        assert_eq!(allocator.stats().alignment_savings, 0);
    }

    #[test]
    fn double_free() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(1000).unwrap();
        let b = allocator.allocate(1000).unwrap();

        allocator.free(a.handle).unwrap();
        assert_eq!(allocator.free(a.handle), Err(SuballocatorError::DoubleFree));
        assert!(!allocator.is_free(b.handle));
        assert_eq!(allocator.stats().allocation_count, 1);

        allocator.free(b.handle).unwrap();
        assert_eq!(allocator.free(b.handle), Err(SuballocatorError::DoubleFree));
    }

    #[test]
    fn stale_handle_does_not_free_its_successor() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(1000).unwrap();
        allocator.free(a.handle).unwrap();

        let b = allocator.allocate(1000).unwrap();
        assert_eq!(b.offset, a.offset);
        assert_ne!(b.handle, a.handle);

        assert_eq!(allocator.free(a.handle), Err(SuballocatorError::DoubleFree));
        assert!(allocator.is_free(a.handle));
        assert!(!allocator.is_free(b.handle));

        allocator.free(b.handle).unwrap();
    }

    #[test]
    fn handles_are_bound_to_their_suballocator() {
        let heap = heap();
        let a = suballocator(&heap, 4096, A256);
        let b = suballocator(&heap, 4096, A256);

        let from_a = a.allocate(1000).unwrap();
        let from_b = b.allocate(1000).unwrap();
        assert_eq!(from_a.offset, from_b.offset);

        assert_eq!(b.free(from_a.handle), Err(SuballocatorError::ForeignHandle));
        assert_eq!(b.sub_block(from_a.handle), None);
        assert!(!b.is_free(from_b.handle));
        assert_eq!(b.stats().allocation_count, 1);

        assert_eq!(a.free(from_b.handle), Err(SuballocatorError::ForeignHandle));
        assert!(!a.is_free(from_a.handle));

        a.free(from_a.handle).unwrap();
        b.free(from_b.handle).unwrap();
    }

    #[test]
    fn use_after_free() {
        let heap = heap();
        let allocator = suballocator(&heap, 1024, A256);

        let _a = allocator.allocate(1024).unwrap();
        let b = allocator.allocate(1024).unwrap();
        allocator.free(b.handle).unwrap();
        assert_eq!(allocator.free(b.handle), Err(SuballocatorError::UseAfterFree));

        let big = allocator.allocate(5000).unwrap();
        allocator.free(big.handle).unwrap();
        assert_eq!(
            allocator.free(big.handle),
            Err(SuballocatorError::UseAfterFree),
        );
        assert!(allocator.is_free(big.handle));
    }

    #[test]
    fn out_of_memory() {
        let heap = Arc::new(VirtualHeap::new(2048));
        let allocator = suballocator(&heap, 1024, A256);

        let a = allocator.allocate(1024).unwrap();
        let _b = allocator.allocate(1024).unwrap();

        let err = allocator.allocate(1).unwrap_err();
        assert_eq!(
            err,
            SuballocatorError::OutOfMemory {
                size: 1024,
                source: BlockError::OutOfDeviceMemory,
            },
        );
        assert!(err.source().is_some());
        assert_eq!(allocator.blocks().len(), 2);

        assert_eq!(
            allocator.allocate(4000).unwrap_err(),
            SuballocatorError::OutOfMemory {
                size: 4096,
                source: BlockError::OutOfDeviceMemory,
            },
        );

        // Freeing makes room again.
        allocator.free(a.handle).unwrap();
        assert_eq!(heap.used(), 1024);
        allocator.allocate(1).unwrap();
    }

    #[test]
    fn incompatible_block_alignment() {
        for block_alignment in [128, 3000] {
            let heap = Arc::new(VirtualHeap::with_alignment(1 << 20, block_alignment));
            let allocator = suballocator(&heap, 4096, A256);

            assert_eq!(
                allocator.allocate(1).unwrap_err(),
                SuballocatorError::InvalidAlignment {
                    allocation_alignment: A256,
                    block_alignment,
                },
            );
            assert_eq!(heap.block_count(), 0);
            assert_eq!(heap.used(), 0);
            assert_eq!(allocator.size(), 0);
            assert!(allocator.blocks().is_empty());
        }
    }

    #[test]
    fn invalid_requests() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);

        assert_eq!(allocator.allocate(0).unwrap_err(), SuballocatorError::ZeroSize);
        assert_eq!(
            allocator.allocate(DeviceSize::MAX).unwrap_err(),
            SuballocatorError::SizeOverflow,
        );
        assert_eq!(heap.block_count(), 0);
    }

    #[test]
    fn invalid_create_info() {
        let heap = heap();

        for block_size in [0, 1000] {
            let result = Suballocator::<VirtualBlock>::new(
                heap.clone(),
                SuballocatorCreateInfo::accel_struct(block_size),
            );

            assert!(matches!(
                result,
                Err(SuballocatorError::InvalidCreateInfo(_)),
            ));
        }
    }

    #[test]
    fn compaction_size_query_slots() {
        let heap = heap();
        let allocator = Suballocator::<VirtualBlock>::new(
            heap.clone(),
            SuballocatorCreateInfo::compaction_size_query(),
        )
        .unwrap();
        assert_eq!(allocator.block_size(), COMPACTION_SIZE_BLOCK_SIZE);
        assert_eq!(
            allocator.allocation_alignment().as_devicesize(),
            COMPACTION_SIZE_DESCRIPTOR_SIZE,
        );

        let slots = (0..3)
            .map(|_| allocator.allocate(COMPACTION_SIZE_DESCRIPTOR_SIZE).unwrap())
            .collect::<Vec<_>>();

        for (index, slot) in slots.iter().enumerate() {
            assert_eq!(slot.offset / COMPACTION_SIZE_DESCRIPTOR_SIZE, index as DeviceSize);
            assert_eq!((slot.size, slot.unused_size), (8, 0));
        }
    }

    #[test]
    fn paired_pools_stay_in_lockstep() {
        let heap = heap();
        let results = suballocator(&heap, 4096, A256);
        let readback = suballocator(&heap, 4096, A256);

        let sizes = [1000, 5000, 3000, 2000, 800, 4096, 100];
        let mut pairs = Vec::new();

        for (i, size) in sizes.into_iter().enumerate() {
            let pair = (
                results.allocate(size).unwrap(),
                readback.allocate(size).unwrap(),
            );
            assert_eq!((pair.0.offset, pair.0.size), (pair.1.offset, pair.1.size));
            pairs.push(pair);

            if i % 3 == 2 {
                let (a, b) = pairs.remove(0);
                results.free(a.handle).unwrap();
                readback.free(b.handle).unwrap();
            }
        }

        let layout = |allocator: &Suballocator<VirtualBlock>| {
            allocator
                .blocks()
                .into_iter()
                .map(|block| (block.size, block.current_offset, block.sub_block_count))
                .collect::<Vec<_>>()
        };

        assert_eq!(layout(&results), layout(&readback));
    }

    #[test]
    fn reset_releases_every_block() {
        let heap = heap();
        let mut allocator = suballocator(&heap, 4096, A256);

        let a = allocator.allocate(1000).unwrap();
        let _b = allocator.allocate(4000).unwrap();
        let _c = allocator.allocate(9000).unwrap();
        assert_eq!(heap.block_count(), 3);

        allocator.reset();
        assert_eq!(heap.block_count(), 0);
        assert_eq!(heap.used(), 0);
        assert_eq!(allocator.size(), 0);
        assert_eq!(allocator.stats(), Stats::default());
        assert_eq!(allocator.free(a.handle), Err(SuballocatorError::UseAfterFree));

        let d = allocator.allocate(1000).unwrap();
        assert_eq!(d.offset, 0);
        assert_eq!(allocator.free(a.handle), Err(SuballocatorError::UseAfterFree));
        assert!(!allocator.is_free(d.handle));
    }

    #[test]
    fn drop_releases_every_block() {
        let heap = heap();

        {
            let allocator = suballocator(&heap, 4096, A256);
            allocator.allocate(1000).unwrap();
            allocator.allocate(4096).unwrap();
            allocator.allocate(10000).unwrap();
            assert_eq!(heap.block_count(), 3);
        }

        assert_eq!(heap.block_count(), 0);
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn concurrent_allocations() {
        const THREADS: DeviceSize = 12;
        const ALLOCATIONS_PER_THREAD: DeviceSize = 100;
        const ALLOCATION_STEP: DeviceSize = 117;
        const BLOCK_SIZE: DeviceSize = 64 * 1024;

        let heap = heap();
        let allocator = suballocator(&heap, BLOCK_SIZE, A256);
        let allocs = ArrayQueue::new((ALLOCATIONS_PER_THREAD * THREADS) as usize);

        // Using threads to randomize allocation order.
        thread::scope(|scope| {
            for i in 1..=THREADS {
                let (allocator, allocs) = (&allocator, &allocs);

                scope.spawn(move || {
                    for _ in 0..ALLOCATIONS_PER_THREAD {
                        allocs
                            .push(allocator.allocate(i * ALLOCATION_STEP).unwrap())
                            .unwrap();
                    }
                });
            }
        });

        let stats = allocator.stats();
        assert_eq!(
            stats.allocation_count,
            (ALLOCATIONS_PER_THREAD * THREADS) as usize,
        );
        assert_eq!(stats.total_resident_memory_size, allocator.size());
        assert_eq!(allocator.size(), heap.used());

        let allocs = allocs.into_iter().collect::<Vec<_>>();
        assert_disjoint(&allocs);

        let queue = ArrayQueue::new(allocs.len());
        for alloc in allocs {
            queue.push(alloc).unwrap();
        }

        thread::scope(|scope| {
            for _ in 0..THREADS {
                let (allocator, queue) = (&allocator, &queue);

                scope.spawn(move || {
                    while let Some(alloc) = queue.pop() {
                        allocator.free(alloc.handle).unwrap();
                    }
                });
            }
        });

        let stats = allocator.stats();
        assert_eq!(stats.allocation_count, 0);
        assert_eq!(stats.block_count, 1);
        assert_eq!(stats.unused_size, BLOCK_SIZE);
        assert_eq!(stats.alignment_savings, 0);
        assert_eq!(heap.block_count(), 1);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Allocate(DeviceSize),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (1..6000 as DeviceSize).prop_map(Op::Allocate),
            2 => any::<usize>().prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn random_workload_upholds_invariants(ops in prop::collection::vec(op(), 1..200)) {
            let heap = heap();
            let allocator = suballocator(&heap, 4096, A256);
            let mut live: Vec<(SubAllocation<VirtualBlockHandle>, DeviceSize)> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate(size) => {
                        let alloc = allocator.allocate(size).unwrap();
                        prop_assert!(is_aligned(alloc.offset, A256));
                        prop_assert!(is_aligned(alloc.size, A256));
                        prop_assert!(alloc.size >= size);
                        live.push((alloc, size));
                    }
                    Op::Free(index) => {
                        if !live.is_empty() {
                            let (alloc, _) = live.swap_remove(index % live.len());
                            allocator.free(alloc.handle).unwrap();
                        }
                    }
                }

                assert_disjoint(live.iter().map(|(alloc, _)| alloc));

                let blocks = allocator.blocks();
                prop_assert_eq!(
                    allocator.size(),
                    blocks.iter().map(|block| block.size).sum::<DeviceSize>()
                );
                prop_assert_eq!(allocator.size(), heap.used());

                let stats = allocator.stats();
                let requested: DeviceSize = live.iter().map(|(_, size)| size).sum();
                let aligned: DeviceSize = live
                    .iter()
                    .map(|&(_, size)| align_up(size, A256).unwrap())
                    .sum();
                prop_assert_eq!(stats.total_resident_memory_size, allocator.size());
                prop_assert_eq!(stats.allocation_count, live.len());
                prop_assert!(stats.used_size() >= requested);
                prop_assert!(stats.used_size() <= aligned);
                prop_assert!((0.0..=100.0).contains(&stats.fragmentation));
            }
        }
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serialize_stats() {
        let heap = heap();
        let allocator = suballocator(&heap, 4096, A256);
        let _a = allocator.allocate(1000).unwrap();

        let stats = allocator.stats();
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"total_resident_memory_size\":4096"));
        assert_eq!(serde_json::from_str::<Stats>(&json).unwrap(), stats);
    }
}
