//! Segregated free-list allocator with boundary-tag coalescing.
//!
//! # Algorithm
//!
//! - **Layout**: every block carries a header and a footer tag, so both
//!   neighbors of a block can be found in O(1). The arena is bracketed by an
//!   allocated prologue block and a zero-sized allocated epilogue header.
//! - **Free lists**: free blocks are kept in [`BUCKET_COUNT`] doubly linked
//!   lists, one per power-of-two size class. The links live inside the free
//!   blocks.
//! - **Allocation**: first fit within the request's size class, then in each
//!   larger class. A fit leaving at least [`MIN_BLOCK_SIZE`] bytes is split
//!   and the high-address remainder goes back to its bucket.
//! - **Deallocation**: the block is coalesced with free neighbors
//!   immediately, so no two free blocks are ever adjacent.
//! - **Growth**: when no fit exists, the arena is extended by at least one
//!   chunk and the new space is merged with a free block at the old end.
//!
//! ```text
//! ┌─────┬──────────┬────────────┬──────────┬─────┬──────────┬──────┐
//! │ pad │ prologue │ block      │ block    │ ... │ block    │ epi- │
//! │     │ hdr│ftr  │ hdr│...│ftr│          │     │          │ logue│
//! └─────┴──────────┴────────────┴──────────┴─────┴──────────┴──────┘
//! ```
//!
//! # Thread Safety
//!
//! The allocator is single-threaded. All operations take `&mut self`;
//! concurrent use needs a lock around the whole allocator.

use log::{debug, trace};
use memlib::{MemLib, MemoryProvider};
use snafu::{OptionExt as _, ResultExt as _, ensure};

use crate::{
    AllocError, Config, InitError,
    arena::Arena,
    block::{DWORD_SIZE, HeapPtr, MIN_BLOCK_SIZE, Tag, WORD_SIZE},
    free_list::{FreeList, FreeLists},
    size_class::{BUCKET_COUNT, classify},
};

/// A general-purpose allocator over a single growable arena.
///
/// Pointers handed out are [`HeapPtr`] arena offsets; use
/// [`payload`](Self::payload) and [`payload_mut`](Self::payload_mut) to
/// access the memory behind them.
pub struct SegregatedAllocator<P = MemLib> {
    arena: Arena<P>,
    free_lists: FreeLists,
    /// Payload pointer of the prologue block.
    heap_start: HeapPtr,
    config: Config,
}

impl<P> SegregatedAllocator<P>
where
    P: MemoryProvider,
{
    /// Creates an allocator on top of `provider` with [`Config::DEFAULT`].
    ///
    /// See [`with_config`](Self::with_config).
    pub fn init(provider: P) -> Result<Self, InitError> {
        Self::with_config(provider, Config::DEFAULT)
    }

    /// Creates an allocator on top of `provider`.
    ///
    /// Requests four words from the provider and lays down the alignment
    /// padding, the prologue header and footer and the epilogue header. All
    /// buckets start empty.
    ///
    /// The provider's current break must be double-word aligned. Bytes
    /// below the break are left alone.
    pub fn with_config(provider: P, config: Config) -> Result<Self, InitError> {
        use crate::init_error::{ExtendSnafu, InvalidChunkSizeSnafu, MisalignedArenaSnafu};

        ensure!(
            config.chunk_size >= MIN_BLOCK_SIZE && config.chunk_size.is_multiple_of(DWORD_SIZE),
            InvalidChunkSizeSnafu {
                chunk_size: config.chunk_size,
            }
        );

        let mut arena = Arena::new(provider);
        let brk = arena.len();
        ensure!(
            brk.is_multiple_of(DWORD_SIZE),
            MisalignedArenaSnafu { start: brk }
        );

        let start = arena.extend(4 * WORD_SIZE).context(ExtendSnafu)?;
        arena.set_tag(start, Tag::new(0, false)); // alignment padding
        arena.set_tag(start + WORD_SIZE, Tag::PROLOGUE);
        arena.set_tag(start + 2 * WORD_SIZE, Tag::PROLOGUE);
        arena.set_tag(start + 3 * WORD_SIZE, Tag::EPILOGUE);

        let heap_start = HeapPtr::new(start + DWORD_SIZE);
        debug!(
            "heap initialized at {heap_start}, chunk size {}",
            config.chunk_size
        );

        Ok(Self {
            arena,
            free_lists: FreeLists::new(),
            heap_start,
            config,
        })
    }

    /// Allocates a block with at least `size` usable bytes.
    ///
    /// Returns `Ok(None)` for a zero-sized request. The arena is only grown
    /// when no free block fits; if growing fails, nothing is changed and the
    /// error is returned.
    pub fn allocate(&mut self, size: usize) -> Result<Option<HeapPtr>, AllocError> {
        if size == 0 {
            return Ok(None);
        }
        let asize = adjust_size(size)?;
        self.allocate_block(asize).map(Some)
    }

    /// Releases a block obtained from this allocator.
    ///
    /// `None` is ignored. The block is merged with any free neighbor and the
    /// result is inserted into the bucket matching its final size.
    ///
    /// Releasing the same pointer twice, or a pointer that did not come from
    /// this allocator, corrupts the heap.
    pub fn release(&mut self, ptr: Option<HeapPtr>) {
        let Some(bp) = ptr else {
            return;
        };
        debug_assert!(self.arena.is_allocated(bp), "release of free block {bp}");

        let size = self.arena.block_size(bp);
        self.arena.set_block(bp, size, false);
        let bp = self.coalesce(bp);
        self.insert_free(bp);
    }

    /// Changes the size of a block, moving it if necessary.
    ///
    /// - `size == 0` releases `ptr` and returns `Ok(None)`.
    /// - `ptr == None` behaves like [`allocate`](Self::allocate).
    /// - Shrinking splits off the tail when it is at least [`MIN_BLOCK_SIZE`]
    ///   bytes, otherwise the block is left as is.
    /// - Growing first tries to absorb free neighbors in place. The whole
    ///   merged region stays allocated; no tail is split off.
    /// - Otherwise a new block is allocated, the old payload is copied and
    ///   the old block is released.
    ///
    /// On error the original block is untouched and still owned by the
    /// caller.
    pub fn resize(
        &mut self,
        ptr: Option<HeapPtr>,
        size: usize,
    ) -> Result<Option<HeapPtr>, AllocError> {
        if size == 0 {
            self.release(ptr);
            return Ok(None);
        }
        let Some(bp) = ptr else {
            return self.allocate(size);
        };

        let asize = adjust_size(size)?;
        let old_size = self.arena.block_size(bp);
        if asize <= old_size {
            self.shrink(bp, old_size, asize);
            return Ok(Some(bp));
        }

        if let Some(bp) = self.grow_in_place(bp, old_size, asize) {
            return Ok(Some(bp));
        }

        let new_bp = self.allocate_block(asize)?;
        let len = usize::min(size, old_size - DWORD_SIZE);
        self.arena.copy(bp, new_bp, len);
        self.release(Some(bp));
        trace!("resize moved {bp} -> {new_bp} ({len} bytes copied)");
        Ok(Some(new_bp))
    }

    /// Returns the usable bytes of an allocated block.
    ///
    /// The slice covers the whole block minus its tags, which can be more
    /// than was requested.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` lies outside the arena.
    #[must_use]
    pub fn payload(&self, ptr: HeapPtr) -> &[u8] {
        self.arena.payload(ptr)
    }

    /// Returns the usable bytes of an allocated block, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` lies outside the arena.
    pub fn payload_mut(&mut self, ptr: HeapPtr) -> &mut [u8] {
        self.arena.payload_mut(ptr)
    }

    /// Returns how many bytes can be stored in the block at `ptr`.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` lies outside the arena.
    #[must_use]
    pub fn usable_size(&self, ptr: HeapPtr) -> usize {
        self.arena.block_size(ptr) - DWORD_SIZE
    }

    /// Iterates over the members of bucket `index`, front to back.
    ///
    /// # Panics
    ///
    /// Panics if `index >= BUCKET_COUNT`.
    #[must_use]
    pub fn free_list(&self, index: usize) -> FreeList<'_, P> {
        assert!(index < BUCKET_COUNT, "bucket index {index} out of range");
        self.free_lists.iter(&self.arena, index)
    }

    /// Returns the current size of the arena in bytes.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.arena.len()
    }

    /// Returns the payload pointer of the prologue block.
    #[must_use]
    pub fn heap_start(&self) -> HeapPtr {
        self.heap_start
    }
}

impl<P> SegregatedAllocator<P> {
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn provider(&self) -> &P {
        self.arena.provider()
    }

    /// Consumes the allocator and returns the provider with the arena.
    #[must_use]
    pub fn into_provider(self) -> P {
        self.arena.into_provider()
    }

    pub(crate) fn arena(&self) -> &Arena<P> {
        &self.arena
    }

    #[cfg(test)]
    pub(crate) fn arena_mut(&mut self) -> &mut Arena<P> {
        &mut self.arena
    }

    pub(crate) fn free_lists(&self) -> &FreeLists {
        &self.free_lists
    }
}

impl<P> SegregatedAllocator<P>
where
    P: MemoryProvider,
{
    /// Finds or makes room for a block of exactly `asize` bytes and marks it
    /// allocated.
    fn allocate_block(&mut self, asize: usize) -> Result<HeapPtr, AllocError> {
        let bp = match self.find_fit(asize) {
            Some(bp) => bp,
            None => {
                let bp = self.grow(usize::max(asize, self.config.chunk_size))?;
                self.split(bp, asize)
            }
        };
        let size = self.arena.block_size(bp);
        self.place(bp, size);
        Ok(bp)
    }

    /// Extends the arena by at least `bytes` and returns the new free block,
    /// merged with a free block at the old end of the arena.
    ///
    /// The returned block is not in any bucket.
    fn grow(&mut self, bytes: usize) -> Result<HeapPtr, AllocError> {
        use crate::alloc_error::ExtendSnafu;

        // keep the arena a whole number of double words
        let size = bytes.div_ceil(WORD_SIZE).next_multiple_of(2) * WORD_SIZE;
        let start = self
            .arena
            .extend(size)
            .context(ExtendSnafu { increment: size })?;

        // the new block's header takes the place of the old epilogue
        let bp = HeapPtr::new(start);
        self.arena.set_block(bp, size, false);
        let epilogue = self.arena.next_block(bp);
        self.arena.set_tag(epilogue.header(), Tag::EPILOGUE);
        debug!("heap grown by {size} bytes at {bp}");

        Ok(self.coalesce(bp))
    }

    /// Merges the free block `bp` with its free neighbors.
    ///
    /// `bp` must already be tagged free and must not be in any bucket.
    /// Absorbed neighbors are unlinked from their buckets. Returns the merged
    /// block, which the caller inserts afterwards.
    fn coalesce(&mut self, bp: HeapPtr) -> HeapPtr {
        let next = self.arena.next_block(bp);
        let prev_allocated = self.arena.is_prev_allocated(bp);
        let next_allocated = self.arena.is_allocated(next);
        let mut size = self.arena.block_size(bp);

        match (prev_allocated, next_allocated) {
            (true, true) => bp,
            (true, false) => {
                size += self.unlink(next);
                self.arena.set_block(bp, size, false);
                trace!("coalesced {bp} with next {next}, size {size}");
                bp
            }
            (false, true) => {
                let prev = self.arena.prev_block(bp);
                size += self.unlink(prev);
                self.arena.set_block(prev, size, false);
                trace!("coalesced {bp} with prev {prev}, size {size}");
                prev
            }
            (false, false) => {
                let prev = self.arena.prev_block(bp);
                size += self.unlink(prev) + self.unlink(next);
                self.arena.set_block(prev, size, false);
                trace!("coalesced {bp} with prev {prev} and next {next}, size {size}");
                prev
            }
        }
    }

    /// First-fit search starting at the size class of `asize`.
    ///
    /// The found block is removed from its bucket and split if the remainder
    /// can form a block of its own.
    fn find_fit(&mut self, asize: usize) -> Option<HeapPtr> {
        for index in classify(asize)..BUCKET_COUNT {
            let Some(bp) = self
                .free_lists
                .iter(&self.arena, index)
                .find(|&bp| self.arena.block_size(bp) >= asize)
            else {
                continue;
            };
            self.free_lists.remove(&mut self.arena, index, bp);
            trace!("fit for {asize} bytes found at {bp} in bucket {index}");
            return Some(self.split(bp, asize));
        }
        None
    }

    /// Carves `asize` bytes off the front of the unlisted free block `bp`.
    ///
    /// If the remainder is smaller than [`MIN_BLOCK_SIZE`] the whole block is
    /// returned untouched; otherwise the remainder becomes a free block in
    /// its bucket.
    fn split(&mut self, bp: HeapPtr, asize: usize) -> HeapPtr {
        let size = self.arena.block_size(bp);
        debug_assert!(size >= asize);
        let remainder = size - asize;
        if remainder < MIN_BLOCK_SIZE {
            return bp;
        }

        self.arena.set_block(bp, asize, false);
        let rest = bp.add(asize);
        self.arena.set_block(rest, remainder, false);
        self.insert_free(rest);
        trace!("split {bp}: {asize} + {remainder}");
        bp
    }

    /// Marks an already carved block allocated with exactly `size` bytes.
    fn place(&mut self, bp: HeapPtr, size: usize) {
        self.arena.set_block(bp, size, true);
    }

    /// Shrinks the allocated block `bp` to `asize`, freeing the tail if it can
    /// form a block of its own.
    fn shrink(&mut self, bp: HeapPtr, old_size: usize, asize: usize) {
        let remainder = old_size - asize;
        if remainder < MIN_BLOCK_SIZE {
            return;
        }

        self.place(bp, asize);
        let rest = bp.add(asize);
        self.arena.set_block(rest, remainder, false);
        // the old right neighbor may be free
        let rest = self.coalesce(rest);
        self.insert_free(rest);
        trace!("shrunk {bp}: {old_size} -> {asize}");
    }

    /// Tries to grow the allocated block `bp` to at least `asize` bytes by
    /// absorbing free neighbors.
    ///
    /// Nothing is changed unless the merged size is large enough. On success
    /// the payload is moved to the start of the merged region if the left
    /// neighbor was absorbed, and the returned block keeps the full merged
    /// size.
    fn grow_in_place(&mut self, bp: HeapPtr, old_size: usize, asize: usize) -> Option<HeapPtr> {
        let next = self.arena.next_block(bp);
        let next_free = !self.arena.is_allocated(next);
        let prev = (!self.arena.is_prev_allocated(bp)).then(|| self.arena.prev_block(bp));

        let mut merged = old_size;
        if let Some(prev) = prev {
            merged += self.arena.block_size(prev);
        }
        if next_free {
            merged += self.arena.block_size(next);
        }
        if merged < asize {
            return None;
        }

        if next_free {
            self.unlink(next);
        }
        let start = match prev {
            Some(prev) => {
                self.unlink(prev);
                self.arena.copy(bp, prev, old_size - DWORD_SIZE);
                prev
            }
            None => bp,
        };
        self.place(start, merged);
        trace!("resized {bp} in place -> {start}, {old_size} -> {merged}");
        Some(start)
    }

    /// Removes a free block from the bucket matching its size and returns the
    /// size.
    fn unlink(&mut self, bp: HeapPtr) -> usize {
        let size = self.arena.block_size(bp);
        self.free_lists.remove(&mut self.arena, classify(size), bp);
        size
    }

    fn insert_free(&mut self, bp: HeapPtr) {
        let size = self.arena.block_size(bp);
        self.free_lists.insert(&mut self.arena, classify(size), bp);
    }
}

/// Returns the block size needed for a request of `size` payload bytes.
///
/// Adds room for the header and footer and rounds up to the alignment unit,
/// but never returns less than [`MIN_BLOCK_SIZE`].
pub(crate) fn adjust_size(size: usize) -> Result<usize, AllocError> {
    use crate::alloc_error::SizeOverflowSnafu;

    if size <= DWORD_SIZE {
        return Ok(MIN_BLOCK_SIZE);
    }
    let padded = size
        .checked_add(DWORD_SIZE + (DWORD_SIZE - 1))
        .context(SizeOverflowSnafu { size })?;
    Ok(padded / DWORD_SIZE * DWORD_SIZE)
}
