// Copyright (c) 2026 The rtalloc developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The backing memory that the [`Suballocator`] divides up.
//!
//! A [`Block`] is a single contiguous allocation made from the underlying device. The suballocator
//! is written once, generically over this trait, and only ever asks a block to come into
//! existence with a given size, to go away again, and to report its alignment and identity.
//! Different kinds of blocks, for example device-local acceleration structure storage versus
//! host-visible readback memory, only differ in how they implement [`Block::allocate`].
//!
//! [`VirtualBlock`] is an implementation that doesn't reserve any real memory, but hands out
//! address ranges from a [`VirtualHeap`] with a fixed budget. It is useful for testing and for
//! planning memory usage ahead of time.
//!
//! [`Suballocator`]: crate::Suballocator

use crate::{DeviceSize, BLOCK_ALIGNMENT};
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

/// A contiguous allocation of backing memory that can be suballocated.
///
/// # Implementing the trait
///
/// - `allocate` must return a block of at least `size` bytes, or an error if the memory can't be
///   provided. It must not return a block that aliases any other currently allocated block.
/// - `identity` must be stable for the lifetime of the block and distinct from the identity of
///   every other block that is currently allocated from the same context.
/// - `alignment` must be constant for the lifetime of the block.
pub trait Block: Sized + Send {
    /// The device or allocator context that blocks are created from and returned to.
    type Context: ?Sized + Send + Sync;

    /// A cheap value copy of the block given out to callers, for example to compute device
    /// addresses or to record copies from the block.
    type Handle: Clone + Debug + Send + Sync;

    /// Allocates a new block of `size` bytes.
    fn allocate(context: &Self::Context, size: DeviceSize) -> Result<Self, BlockError>;

    /// Returns the block's memory to `context`.
    fn free(self, context: &Self::Context);

    /// Returns the alignment of the start of the block, in bytes.
    fn alignment(&self) -> DeviceSize;

    /// Returns an identity used to tell blocks apart. It is never dereferenced.
    fn identity(&self) -> BlockIdentity;

    /// Returns a handle to the block.
    fn handle(&self) -> Self::Handle;
}

/// An opaque identity of a [`Block`], such as the address of its memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockIdentity(pub u64);

/// Error that can be returned when allocating a [`Block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockError {
    /// There is not enough memory on the host.
    OutOfHostMemory,

    /// There is not enough memory on the device.
    OutOfDeviceMemory,
}

impl Error for BlockError {}

impl Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::OutOfHostMemory => "out of host memory",
            Self::OutOfDeviceMemory => "out of device memory",
        })
    }
}

/// A pretend device heap that [`VirtualBlock`]s are allocated from.
///
/// Blocks are placed at increasing, never reused addresses, each aligned to the heap's alignment,
/// and may only be allocated as long as their total size stays within the heap's capacity.
#[derive(Debug)]
pub struct VirtualHeap {
    capacity: DeviceSize,
    alignment: DeviceSize,
    used: AtomicU64,
    next_address: AtomicU64,
    block_count: AtomicUsize,
}

impl VirtualHeap {
    /// Creates a new `VirtualHeap` with the given capacity, whose blocks are aligned to
    /// [`BLOCK_ALIGNMENT`].
    #[inline]
    pub fn new(capacity: DeviceSize) -> Self {
        Self::with_alignment(capacity, BLOCK_ALIGNMENT)
    }

    /// Creates a new `VirtualHeap` whose blocks report the given alignment.
    ///
    /// The alignment is reported as-is and isn't validated.
    #[inline]
    pub fn with_alignment(capacity: DeviceSize, alignment: DeviceSize) -> Self {
        VirtualHeap {
            capacity,
            alignment,
            used: AtomicU64::new(0),
            // Start away from zero so that no block has a null address.
            next_address: AtomicU64::new(alignment.max(1)),
            block_count: AtomicUsize::new(0),
        }
    }

    /// Returns the total number of bytes that may be allocated at once.
    #[inline]
    pub fn capacity(&self) -> DeviceSize {
        self.capacity
    }

    /// Returns the number of bytes currently allocated.
    #[inline]
    pub fn used(&self) -> DeviceSize {
        self.used.load(Ordering::Acquire)
    }

    /// Returns the number of blocks currently allocated.
    #[inline]
    pub fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Acquire)
    }
}

/// A [`Block`] living in a [`VirtualHeap`].
#[derive(Debug)]
pub struct VirtualBlock {
    address: u64,
    size: DeviceSize,
    alignment: DeviceSize,
}

/// A copy of a [`VirtualBlock`]'s placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VirtualBlockHandle {
    /// The address of the start of the block.
    pub address: u64,

    /// The size of the block in bytes.
    pub size: DeviceSize,
}

impl VirtualBlockHandle {
    /// Returns the address of the byte at `offset` within the block.
    #[inline]
    pub fn address_at(&self, offset: DeviceSize) -> u64 {
        debug_assert!(offset <= self.size);

        self.address + offset
    }
}

impl Block for VirtualBlock {
    type Context = VirtualHeap;

    type Handle = VirtualBlockHandle;

    fn allocate(heap: &VirtualHeap, size: DeviceSize) -> Result<Self, BlockError> {
        heap.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size)
                    .filter(|&new_used| new_used <= heap.capacity)
            })
            .map_err(|_| BlockError::OutOfDeviceMemory)?;

        // Keep consecutive blocks apart by at least one alignment unit.
        let alignment = heap.alignment.max(1);
        let stride = size
            .div_ceil(alignment)
            .saturating_add(1)
            .saturating_mul(alignment);
        let address = heap.next_address.fetch_add(stride, Ordering::Relaxed);

        heap.block_count.fetch_add(1, Ordering::AcqRel);

        Ok(VirtualBlock {
            address,
            size,
            alignment: heap.alignment,
        })
    }

    fn free(self, heap: &VirtualHeap) {
        heap.used.fetch_sub(self.size, Ordering::AcqRel);
        heap.block_count.fetch_sub(1, Ordering::AcqRel);
    }

    #[inline]
    fn alignment(&self) -> DeviceSize {
        self.alignment
    }

    #[inline]
    fn identity(&self) -> BlockIdentity {
        BlockIdentity(self.address)
    }

    #[inline]
    fn handle(&self) -> VirtualBlockHandle {
        VirtualBlockHandle {
            address: self.address,
            size: self.size,
        }
    }
}
