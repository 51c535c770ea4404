//! Read-only views of the heap: block walks, statistics and dumps.

use core::fmt;

use memlib::MemoryProvider;

use crate::{
    arena::Arena,
    block::{DWORD_SIZE, HeapPtr},
    segregated::SegregatedAllocator,
    size_class::BUCKET_COUNT,
};

/// One block found while walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload pointer of the block.
    pub ptr: HeapPtr,
    /// Size of the whole block, including its tags.
    pub size: usize,
    pub allocated: bool,
}

/// Iterator over all blocks between the prologue and the epilogue, in
/// address order.
///
/// Returned by [`SegregatedAllocator::blocks`]. The walk assumes a
/// consistent heap; use [`SegregatedAllocator::check_consistency`] on a heap
/// that may be damaged.
pub struct Blocks<'a, P> {
    arena: &'a Arena<P>,
    next: HeapPtr,
}

impl<P> Iterator for Blocks<'_, P>
where
    P: MemoryProvider,
{
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let tag = self.arena.header(self.next);
        if tag.size() == 0 {
            return None;
        }
        let info = BlockInfo {
            ptr: self.next,
            size: tag.size(),
            allocated: tag.is_allocated(),
        };
        self.next = self.next.add(tag.size());
        Some(info)
    }
}

/// Summary of heap usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Size of the arena, sentinels included.
    pub heap_size: usize,
    pub allocated_blocks: usize,
    /// Bytes in allocated blocks, tags included.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    /// Bytes in free blocks, tags included.
    pub free_bytes: usize,
    /// Size of the largest free block, or zero.
    pub largest_free: usize,
    /// Number of members of each bucket.
    pub bucket_lengths: [usize; BUCKET_COUNT],
}

impl<P> SegregatedAllocator<P>
where
    P: MemoryProvider,
{
    /// Walks every block after the prologue in address order.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_, P> {
        Blocks {
            arena: self.arena(),
            next: self.heap_start().add(DWORD_SIZE),
        }
    }

    /// Collects block and bucket statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.heap_size(),
            ..HeapStats::default()
        };
        for block in self.blocks() {
            if block.allocated {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += block.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size;
                stats.largest_free = stats.largest_free.max(block.size);
            }
        }
        for (index, len) in stats.bucket_lengths.iter_mut().enumerate() {
            *len = self.free_list(index).count();
        }
        stats
    }

    /// Returns a [`Display`](fmt::Display)able listing of all blocks and
    /// non-empty buckets.
    #[must_use]
    pub fn dump(&self) -> HeapDump<'_, P> {
        HeapDump { allocator: self }
    }
}

/// Human-readable heap listing returned by [`SegregatedAllocator::dump`].
///
/// ```text
/// heap: 160 bytes, start 0x10
///   0x20 size 32 allocated
///   0x40 size 96 free
/// bucket 7: 0x40
/// ```
pub struct HeapDump<'a, P> {
    allocator: &'a SegregatedAllocator<P>,
}

impl<P> fmt::Display for HeapDump<'_, P>
where
    P: MemoryProvider,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocator = self.allocator;
        writeln!(
            f,
            "heap: {} bytes, start {}",
            allocator.heap_size(),
            allocator.heap_start()
        )?;
        for block in allocator.blocks() {
            let state = if block.allocated { "allocated" } else { "free" };
            writeln!(f, "  {} size {} {state}", block.ptr, block.size)?;
        }
        for index in 0..BUCKET_COUNT {
            let mut members = allocator.free_list(index).peekable();
            if members.peek().is_none() {
                continue;
            }
            write!(f, "bucket {index}:")?;
            for ptr in members {
                write!(f, " {ptr}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{string::ToString as _, vec::Vec};

    use memlib::MemLib;

    use super::*;

    #[test]
    fn test_blocks_empty_heap() {
        let allocator = SegregatedAllocator::init(MemLib::new(1024)).unwrap();
        assert_eq!(allocator.blocks().count(), 0);
        assert_eq!(
            allocator.stats(),
            HeapStats {
                heap_size: 32,
                ..HeapStats::default()
            }
        );
    }

    #[test]
    fn test_blocks_in_address_order() {
        let mut allocator = SegregatedAllocator::init(MemLib::new(1024)).unwrap();
        let a = allocator.allocate(16).unwrap().unwrap();
        let b = allocator.allocate(40).unwrap().unwrap();
        let blocks = allocator.blocks().collect::<Vec<_>>();
        assert_eq!(
            blocks,
            [
                BlockInfo {
                    ptr: a,
                    size: 32,
                    allocated: true,
                },
                BlockInfo {
                    ptr: b,
                    size: 64,
                    allocated: true,
                },
                BlockInfo {
                    ptr: HeapPtr::new(128),
                    size: 32,
                    allocated: false,
                },
            ]
        );
    }

    #[test]
    fn test_stats() {
        let mut allocator = SegregatedAllocator::init(MemLib::new(4096)).unwrap();
        let a = allocator.allocate(16).unwrap().unwrap();
        let _b = allocator.allocate(16).unwrap().unwrap();
        allocator.release(Some(a));

        let stats = allocator.stats();
        assert_eq!(stats.heap_size, 160);
        assert_eq!(stats.allocated_blocks, 1);
        assert_eq!(stats.allocated_bytes, 32);
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.free_bytes, 96);
        assert_eq!(stats.largest_free, 64);
        assert_eq!(stats.bucket_lengths[5], 1);
        assert_eq!(stats.bucket_lengths[6], 1);
        assert_eq!(stats.bucket_lengths.iter().sum::<usize>(), 2);
    }

    #[test]
    fn test_dump() {
        let mut allocator = SegregatedAllocator::init(MemLib::new(1024)).unwrap();
        let _a = allocator.allocate(16).unwrap().unwrap();
        let dump = allocator.dump().to_string();
        assert_eq!(
            dump,
            "heap: 160 bytes, start 0x10\n  0x20 size 32 allocated\n  0x40 size 96 free\nbucket 7: 0x40\n"
        );
    }
}
