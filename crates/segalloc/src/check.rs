//! Heap consistency checker.
//!
//! The checker never trusts what it reads. Tags are read with a bounds check,
//! links are only followed to blocks found by the address-order walk, and a
//! block listed twice ends the list walk, so a corrupted heap cannot make it
//! loop or panic.

use alloc::{collections::BTreeSet, vec::Vec};
use core::fmt;

use log::debug;
use memlib::MemoryProvider;

use crate::{
    arena::Arena,
    block::{DWORD_SIZE, HeapPtr, MIN_BLOCK_SIZE, Tag, WORD_SIZE},
    free_list::FreeLists,
    segregated::SegregatedAllocator,
    size_class::{BUCKET_COUNT, classify},
};

/// A broken heap invariant found by
/// [`SegregatedAllocator::check_consistency`].
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum Violation {
    #[display("prologue is damaged: header {header:?}, footer {footer:?}")]
    BadPrologue {
        header: Option<Tag>,
        footer: Option<Tag>,
    },
    #[display("epilogue at {ptr} is damaged: {tag:?}")]
    BadEpilogue { ptr: HeapPtr, tag: Tag },
    #[display("block walk reached {ptr}, outside the arena")]
    Truncated { ptr: HeapPtr },
    #[display("block at {ptr} has size {size}, below the minimum block size")]
    Undersized { ptr: HeapPtr, size: usize },
    #[display("block at {ptr} with size {size} overlaps the arena end {arena_end:#x}")]
    Overlap {
        ptr: HeapPtr,
        size: usize,
        arena_end: usize,
    },
    #[display("block at {ptr} has header {header:?} but footer {footer:?}")]
    TagMismatch {
        ptr: HeapPtr,
        header: Tag,
        footer: Tag,
    },
    #[display("free blocks at {first} and {second} are adjacent")]
    AdjacentFree { first: HeapPtr, second: HeapPtr },
    #[display("bucket {bucket} contains allocated block {ptr}")]
    AllocatedInFreeList { bucket: usize, ptr: HeapPtr },
    #[display("bucket {bucket} contains {ptr} of size {size}, which belongs in bucket {expected}")]
    WrongBucket {
        bucket: usize,
        ptr: HeapPtr,
        size: usize,
        expected: usize,
    },
    #[display("bucket {bucket} links from {ptr} to {target}, outside the arena")]
    LinkOutOfBounds {
        bucket: usize,
        ptr: HeapPtr,
        target: HeapPtr,
    },
    #[display("bucket {bucket} contains {ptr}, which is not a block")]
    NotABlock { bucket: usize, ptr: HeapPtr },
    #[display("bucket {bucket} member {ptr} links back to {found:?}, expected {expected:?}")]
    BrokenBackLink {
        bucket: usize,
        ptr: HeapPtr,
        found: Option<HeapPtr>,
        expected: Option<HeapPtr>,
    },
    #[display("block {ptr} appears twice in the free lists (again in bucket {bucket})")]
    DuplicateListing { bucket: usize, ptr: HeapPtr },
    #[display("free block {ptr} is not in any bucket")]
    Unlisted { ptr: HeapPtr },
}

/// Result of [`SegregatedAllocator::check_consistency`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    violations: Vec<Violation>,
}

impl ConsistencyReport {
    /// Returns `true` if no violation was found.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

impl fmt::Display for ConsistencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "heap is consistent");
        }
        write!(f, "{} heap violation(s):", self.violations.len())?;
        for violation in &self.violations {
            write!(f, "\n  {violation}")?;
        }
        Ok(())
    }
}

impl<P> SegregatedAllocator<P>
where
    P: MemoryProvider,
{
    /// Validates the block structure and every free list.
    ///
    /// Checks the sentinels and the tags and size of every block, that no two
    /// free blocks are adjacent, and that the buckets hold exactly the free
    /// blocks, each once, with intact links.
    ///
    /// Does not modify the heap.
    #[must_use]
    pub fn check_consistency(&self) -> ConsistencyReport {
        let mut checker = Checker {
            arena: self.arena(),
            violations: Vec::new(),
        };
        // without a prologue there is nothing to check the lists against
        if let Some(walk) = checker.walk_blocks(self.heap_start()) {
            checker.check_free_lists(self.free_lists(), &walk);
        }

        let report = ConsistencyReport {
            violations: checker.violations,
        };
        if !report.is_ok() {
            debug!("{report}");
        }
        report
    }
}

/// Blocks found by the address-order walk.
struct Walk {
    /// Every block start, ascending.
    blocks: Vec<HeapPtr>,
    free: Vec<HeapPtr>,
}

struct Checker<'a, P> {
    arena: &'a Arena<P>,
    violations: Vec<Violation>,
}

impl<P> Checker<'_, P>
where
    P: MemoryProvider,
{
    fn walk_blocks(&mut self, heap_start: HeapPtr) -> Option<Walk> {
        let mut walk = Walk {
            blocks: Vec::new(),
            free: Vec::new(),
        };

        let header = self.arena.try_tag(heap_start.header());
        let footer = self.arena.try_tag(heap_start.footer(DWORD_SIZE));
        if header != Some(Tag::PROLOGUE) || footer != Some(Tag::PROLOGUE) {
            self.violations
                .push(Violation::BadPrologue { header, footer });
            return None;
        }

        let arena_end = self.arena.len();
        let mut prev_free = None;
        let mut bp = heap_start.add(DWORD_SIZE);
        loop {
            let Some(tag) = self.arena.try_tag(bp.header()) else {
                self.violations.push(Violation::Truncated { ptr: bp });
                break;
            };
            let size = tag.size();

            if size == 0 {
                if !tag.is_allocated() || bp.header() + WORD_SIZE != arena_end {
                    self.violations.push(Violation::BadEpilogue { ptr: bp, tag });
                }
                break;
            }
            if size < MIN_BLOCK_SIZE {
                self.violations.push(Violation::Undersized { ptr: bp, size });
            }
            // the next header must still fit in the arena
            if bp
                .offset()
                .checked_add(size)
                .is_none_or(|end| end > arena_end)
            {
                self.violations.push(Violation::Overlap {
                    ptr: bp,
                    size,
                    arena_end,
                });
                break;
            }

            let footer = self.arena.tag(bp.footer(size));
            if footer != tag {
                self.violations.push(Violation::TagMismatch {
                    ptr: bp,
                    header: tag,
                    footer,
                });
            }

            walk.blocks.push(bp);
            if tag.is_allocated() {
                prev_free = None;
            } else {
                if let Some(first) = prev_free {
                    self.violations
                        .push(Violation::AdjacentFree { first, second: bp });
                }
                walk.free.push(bp);
                prev_free = Some(bp);
            }
            bp = bp.add(size);
        }
        Some(walk)
    }

    fn check_free_lists(&mut self, free_lists: &FreeLists, walk: &Walk) {
        let arena_end = self.arena.len();
        let mut listed = BTreeSet::new();

        for bucket in 0..BUCKET_COUNT {
            let mut prev = None;
            let mut next = free_lists.head(bucket);
            while let Some(bp) = next {
                if walk.blocks.binary_search(&bp).is_err() {
                    self.violations.push(Violation::NotABlock { bucket, ptr: bp });
                    break;
                }
                if !listed.insert(bp) {
                    self.violations
                        .push(Violation::DuplicateListing { bucket, ptr: bp });
                    break;
                }

                let tag = self.arena.header(bp);
                if tag.is_allocated() {
                    self.violations
                        .push(Violation::AllocatedInFreeList { bucket, ptr: bp });
                }
                let expected = classify(tag.size());
                if expected != bucket {
                    self.violations.push(Violation::WrongBucket {
                        bucket,
                        ptr: bp,
                        size: tag.size(),
                        expected,
                    });
                }

                // every walked block ends inside the arena, so both links can
                // be read
                let found = self.arena.prev_free(bp);
                if found != prev {
                    self.violations.push(Violation::BrokenBackLink {
                        bucket,
                        ptr: bp,
                        found,
                        expected: prev,
                    });
                }

                next = self.arena.next_free(bp);
                if let Some(target) = next
                    && target.offset() >= arena_end
                {
                    self.violations.push(Violation::LinkOutOfBounds {
                        bucket,
                        ptr: bp,
                        target,
                    });
                    break;
                }
                prev = Some(bp);
            }
        }

        for &bp in &walk.free {
            if !listed.contains(&bp) {
                self.violations.push(Violation::Unlisted { ptr: bp });
            }
        }
    }
}
