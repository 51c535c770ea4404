//! Segregated free-list memory allocator with boundary-tag coalescing.
//!
//! [`SegregatedAllocator`] manages a single contiguous arena obtained from a
//! [`MemoryProvider`] and hands out variable-sized blocks of it. It keeps one
//! free list per power-of-two size class, coalesces freed blocks with their
//! neighbors immediately, and grows the arena on demand.
//!
//! # Features
//!
//! - First-fit search within size classes, starting at the request's class
//! - Splitting of oversized fits, keeping the remainder as a free block
//! - O(1) coalescing through header and footer tags
//! - In-place resizing when neighbors are free
//! - Heap walks, statistics and a consistency checker for debugging
//!
//! Every block size is a multiple of [`DWORD_SIZE`] bytes and at least
//! [`MIN_BLOCK_SIZE`] bytes, and every payload is [`DWORD_SIZE`]-aligned
//! relative to the arena start.
//!
//! # Usage Example
//!
//! ```rust
//! use segalloc::{MemLib, SegregatedAllocator};
//!
//! let mut heap = SegregatedAllocator::init(MemLib::default()).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap().unwrap();
//! heap.payload_mut(ptr)[..5].copy_from_slice(b"hello");
//!
//! let ptr = heap.resize(Some(ptr), 500).unwrap().unwrap();
//! assert_eq!(&heap.payload(ptr)[..5], b"hello");
//!
//! heap.release(Some(ptr));
//! assert!(heap.check_consistency().is_ok());
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use snafu::{Location, Snafu};

pub use self::{
    block::{DWORD_SIZE, HeapPtr, MIN_BLOCK_SIZE, Tag, WORD_SIZE},
    check::{ConsistencyReport, Violation},
    diagnostics::{BlockInfo, Blocks, HeapDump, HeapStats},
    free_list::FreeList,
    segregated::SegregatedAllocator,
    size_class::{BUCKET_COUNT, MAX_CLASS, MIN_CLASS, classify},
};
pub use memlib::{ExtendError, MemLib, MemoryProvider};

mod arena;
mod block;
mod check;
mod diagnostics;
mod free_list;
mod segregated;
mod size_class;

/// Default number of bytes the arena grows by when no free block fits.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 7;

/// Allocator tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes to request from the provider on growth.
    ///
    /// Must be a multiple of [`DWORD_SIZE`] and at least
    /// [`MIN_BLOCK_SIZE`].
    pub chunk_size: usize,
}

impl Config {
    pub const DEFAULT: Self = Self {
        chunk_size: DEFAULT_CHUNK_SIZE,
    };

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Error returned by [`SegregatedAllocator::init`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum InitError {
    #[snafu(display("failed to reserve the heap sentinels"))]
    Extend {
        source: ExtendError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena break {start:#x} is not aligned to {DWORD_SIZE} bytes"))]
    MisalignedArena {
        start: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "invalid chunk size {chunk_size}: must be a multiple of {DWORD_SIZE} and at least {MIN_BLOCK_SIZE}"
    ))]
    InvalidChunkSize {
        chunk_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Error returned by [`SegregatedAllocator::allocate`] and
/// [`SegregatedAllocator::resize`].
///
/// A failed request leaves the heap as it was.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum AllocError {
    #[snafu(display("failed to grow the heap by {increment} bytes"))]
    Extend {
        increment: usize,
        source: ExtendError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("request of {size} bytes is too large"))]
    SizeOverflow {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
