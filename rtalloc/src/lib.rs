// Copyright (c) 2026 The rtalloc developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Block suballocation of GPU memory for ray tracing acceleration structure builds.
//!
//! Building acceleration structures requires a lot of short and long lived buffers: scratch
//! memory for the build itself, the result buffer, a compacted copy of the result, and small query
//! slots receiving the compacted size. Creating a native buffer for each of these is slow and
//! wastes memory, because device allocations come with a large alignment (typically 64 KiB) while
//! an acceleration structure only needs 256 bytes.
//!
//! This crate provides the [`Suballocator`], which carves such requests out of a small, growable
//! set of large memory [blocks]. The graphics API specific part, actually creating and destroying
//! the memory behind a block, is left to an implementation of the [`Block`] trait supplied by the
//! caller.
//!
//! # Brief summary
//!
//! - A [`Block`] is one contiguous allocation of backing memory. The suballocator creates blocks
//!   lazily, at a configurable granularity, and releases them again once they become empty.
//!
//! - [`Suballocator::allocate`] returns a [`SubAllocation`], which is the block's handle, an
//!   offset into the block and an opaque [`SubBlockHandle`]. The handle is only good for calling
//!   [`Suballocator::free`] or for querying the suballocation.
//!
//! - Handles are generation-tagged. Freeing a handle twice, or freeing a handle whose block is
//!   already gone, is reported as an error instead of corrupting the allocator.
//!
//! - [`Suballocator::stats`] reports how much memory is resident, how much of it is unused and how
//!   fragmented the free space is.
//!
//! # Examples
//!
//! ```
//! use rtalloc::{
//!     block::{VirtualBlock, VirtualHeap},
//!     Suballocator, SuballocatorCreateInfo,
//! };
//! use std::sync::Arc;
//!
//! let heap = Arc::new(VirtualHeap::new(64 * 1024 * 1024));
//! let allocator = Suballocator::<VirtualBlock>::new(
//!     heap,
//!     SuballocatorCreateInfo::accel_struct(1024 * 1024),
//! )
//! .unwrap();
//!
//! let scratch = allocator.allocate(1000).unwrap();
//! assert_eq!(scratch.offset, 0);
//! assert_eq!(scratch.size, 1024);
//!
//! allocator.free(scratch.handle).unwrap();
//! assert!(allocator.is_free(scratch.handle));
//! ```
//!
//! [blocks]: Block

pub use self::{
    block::{Block, BlockError, BlockIdentity},
    layout::DeviceAlignment,
    suballocator::{
        BlockInfo, Stats, SubAllocation, SubBlockHandle, SubBlockInfo, Suballocator,
        SuballocatorCreateInfo, SuballocatorError,
    },
};
use std::num::NonZeroU64;

pub mod block;
pub mod layout;
mod slotmap;
pub mod suballocator;

/// Represents memory size and offset values on a device.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// A [`DeviceSize`] that is known not to equal zero.
pub type NonZeroDeviceSize = NonZeroU64;

/// Minimum alignment of an acceleration structure within its buffer.
pub const ACCEL_STRUCT_ALIGNMENT: DeviceSize = 256;

/// Alignment that device memory allocations typically come with.
pub const BLOCK_ALIGNMENT: DeviceSize = 64 * 1024;

/// Default granularity of the blocks backing scratch, result and compaction memory.
pub const DEFAULT_BLOCK_SIZE: DeviceSize = 8 * 1024 * 1024;

/// Size of a single compacted-size query result.
pub const COMPACTION_SIZE_DESCRIPTOR_SIZE: DeviceSize = 8;

/// Granularity of the blocks backing compacted-size queries.
pub const COMPACTION_SIZE_BLOCK_SIZE: DeviceSize = 64 * 1024;

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());
