//! Segregated free lists.
//!
//! Each bucket is the head of a doubly linked list whose nodes are the free
//! blocks themselves: the first two payload words of a free block hold the
//! `next` and `prev` links. No memory outside the arena is used, apart from
//! the fixed table of list heads.
//!
//! ```text
//! heads[k] ──► ┌──────┐ next ┌──────┐ next ┌──────┐
//!              │ blk  │ ───► │ blk  │ ───► │ blk  │ ───► none
//!   none ◄──── │      │ ◄─── │      │ ◄─── │      │
//!         prev └──────┘ prev └──────┘ prev └──────┘
//! ```
//!
//! Blocks are pushed at the front and unlinked by identity, so both
//! operations are O(1).

use memlib::MemoryProvider;

use crate::{arena::Arena, block::HeapPtr, size_class::BUCKET_COUNT};

pub(crate) struct FreeLists {
    heads: [Option<HeapPtr>; BUCKET_COUNT],
}

impl FreeLists {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [None; BUCKET_COUNT],
        }
    }

    pub(crate) fn head(&self, index: usize) -> Option<HeapPtr> {
        self.heads[index]
    }

    /// Pushes `bp` to the front of bucket `index`.
    pub(crate) fn insert<P>(&mut self, arena: &mut Arena<P>, index: usize, bp: HeapPtr)
    where
        P: MemoryProvider,
    {
        let head = self.heads[index];
        arena.set_prev_free(bp, None);
        arena.set_next_free(bp, head);
        if let Some(head) = head {
            arena.set_prev_free(head, Some(bp));
        }
        self.heads[index] = Some(bp);
    }

    /// Unlinks `bp` from bucket `index` and clears its links.
    ///
    /// `index` must be the bucket `bp` was inserted into.
    pub(crate) fn remove<P>(&mut self, arena: &mut Arena<P>, index: usize, bp: HeapPtr)
    where
        P: MemoryProvider,
    {
        match (arena.prev_free(bp), arena.next_free(bp)) {
            // sole element
            (None, None) => {
                debug_assert_eq!(self.heads[index], Some(bp), "block {bp} is not in bucket {index}");
                self.heads[index] = None;
            }
            // head
            (None, Some(next)) => {
                debug_assert_eq!(self.heads[index], Some(bp), "block {bp} is not in bucket {index}");
                self.heads[index] = Some(next);
                arena.set_prev_free(next, None);
            }
            // interior
            (Some(prev), Some(next)) => {
                arena.set_next_free(prev, Some(next));
                arena.set_prev_free(next, Some(prev));
            }
            // tail
            (Some(prev), None) => {
                arena.set_next_free(prev, None);
            }
        }
        arena.set_next_free(bp, None);
        arena.set_prev_free(bp, None);
    }

    pub(crate) fn iter<'a, P>(&self, arena: &'a Arena<P>, index: usize) -> FreeList<'a, P> {
        FreeList {
            arena,
            next: self.heads[index],
        }
    }
}

/// Iterator over the members of one free-list bucket, front to back.
///
/// Returned by [`SegregatedAllocator::free_list`](crate::SegregatedAllocator::free_list).
pub struct FreeList<'a, P> {
    arena: &'a Arena<P>,
    next: Option<HeapPtr>,
}

impl<P> Iterator for FreeList<'_, P>
where
    P: MemoryProvider,
{
    type Item = HeapPtr;

    fn next(&mut self) -> Option<Self::Item> {
        let bp = self.next?;
        self.next = self.arena.next_free(bp);
        Some(bp)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use memlib::MemLib;

    use super::*;

    const BUCKET: usize = 6;

    fn setup() -> (Arena<MemLib>, FreeLists, [HeapPtr; 3]) {
        let mut arena = Arena::new(MemLib::new(256));
        arena.extend(256).unwrap();
        let blocks = [HeapPtr::new(16), HeapPtr::new(80), HeapPtr::new(144)];
        for bp in blocks {
            arena.set_block(bp, 64, false);
        }
        (arena, FreeLists::new(), blocks)
    }

    fn members(lists: &FreeLists, arena: &Arena<MemLib>) -> Vec<HeapPtr> {
        lists.iter(arena, BUCKET).collect()
    }

    #[test]
    fn test_insert_pushes_front() {
        let (mut arena, mut lists, [a, b, c]) = setup();
        lists.insert(&mut arena, BUCKET, a);
        lists.insert(&mut arena, BUCKET, b);
        lists.insert(&mut arena, BUCKET, c);
        assert_eq!(members(&lists, &arena), [c, b, a]);
        assert_eq!(lists.head(BUCKET), Some(c));
        assert_eq!(arena.prev_free(c), None);
        assert_eq!(arena.prev_free(b), Some(c));
        assert_eq!(arena.prev_free(a), Some(b));
        assert_eq!(lists.head(BUCKET + 1), None);
    }

    #[test]
    fn test_remove_sole() {
        let (mut arena, mut lists, [a, ..]) = setup();
        lists.insert(&mut arena, BUCKET, a);
        lists.remove(&mut arena, BUCKET, a);
        assert_eq!(lists.head(BUCKET), None);
        assert_eq!(arena.next_free(a), None);
        assert_eq!(arena.prev_free(a), None);
    }

    #[test]
    fn test_remove_head() {
        let (mut arena, mut lists, [a, b, c]) = setup();
        for bp in [a, b, c] {
            lists.insert(&mut arena, BUCKET, bp);
        }
        lists.remove(&mut arena, BUCKET, c);
        assert_eq!(members(&lists, &arena), [b, a]);
        assert_eq!(arena.prev_free(b), None);
    }

    #[test]
    fn test_remove_interior() {
        let (mut arena, mut lists, [a, b, c]) = setup();
        for bp in [a, b, c] {
            lists.insert(&mut arena, BUCKET, bp);
        }
        lists.remove(&mut arena, BUCKET, b);
        assert_eq!(members(&lists, &arena), [c, a]);
        assert_eq!(arena.prev_free(a), Some(c));
        assert_eq!(arena.next_free(b), None);
        assert_eq!(arena.prev_free(b), None);
    }

    #[test]
    fn test_remove_tail() {
        let (mut arena, mut lists, [a, b, c]) = setup();
        for bp in [a, b, c] {
            lists.insert(&mut arena, BUCKET, bp);
        }
        lists.remove(&mut arena, BUCKET, a);
        assert_eq!(members(&lists, &arena), [c, b]);
        assert_eq!(arena.next_free(b), None);
    }
}
