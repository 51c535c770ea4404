//! Block layout and boundary tags.
//!
//! Every block in the arena is framed by two identical one-word boundary
//! tags. A block pointer (`bp`, [`HeapPtr`]) always points at the first
//! payload byte, one word after the header.
//!
//! ```text
//! Allocated block:
//!          bp
//!          v
//! ┌────────┬──────────────────────────────────────┬────────┐
//! │ header │ payload                              │ footer │
//! └────────┴──────────────────────────────────────┴────────┘
//!
//! Free block:
//! ┌────────┬──────────┬──────────┬────────────────┬────────┐
//! │ header │ next     │ prev     │ unused         │ footer │
//! └────────┴──────────┴──────────┴────────────────┴────────┘
//! ```
//!
//! The size stored in a tag covers the whole block including both tags, so
//! the next block starts at `bp + size` and the previous block's size can be
//! read from the word right before our header.

use core::fmt;

use dataview::Pod;
use platform_cast::CastFrom as _;

/// Size of a boundary tag or free-list link in bytes.
pub const WORD_SIZE: usize = 8;
/// The alignment unit: every block size and payload offset is a multiple of
/// this.
pub const DWORD_SIZE: usize = 2 * WORD_SIZE;
/// Smallest block that can hold a header, two links and a footer.
pub const MIN_BLOCK_SIZE: usize = 2 * DWORD_SIZE;

const ALLOCATED_BIT: u64 = 0x1;
const SIZE_MASK: u64 = !(DWORD_SIZE as u64 - 1);

const _: () = assert!(size_of::<Tag>() == WORD_SIZE);
const _: () = assert!(DWORD_SIZE.is_power_of_two());
const _: () = assert!(MIN_BLOCK_SIZE == 4 * WORD_SIZE);

/// A boundary tag: block size and allocated flag packed into one word.
///
/// The low bits of the size are always zero because sizes are multiples of
/// [`DWORD_SIZE`]; bit 0 carries the allocated flag.
#[repr(transparent)]
#[derive(Pod, Clone, Copy, PartialEq, Eq)]
pub struct Tag(u64);

impl Tag {
    /// Header and footer of the prologue block.
    pub const PROLOGUE: Self = Self(DWORD_SIZE as u64 | ALLOCATED_BIT);
    /// Header of the zero-sized epilogue block.
    pub const EPILOGUE: Self = Self(ALLOCATED_BIT);

    /// Packs `size` and the allocated flag into a tag.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`DWORD_SIZE`].
    #[must_use]
    pub fn new(size: usize, allocated: bool) -> Self {
        assert!(
            size.is_multiple_of(DWORD_SIZE),
            "block size {size} is not double-word aligned"
        );
        Self(u64::cast_from(size) | u64::from(allocated))
    }

    /// Returns the block size with the flag bits masked out.
    #[must_use]
    pub fn size(self) -> usize {
        usize::cast_from(self.0 & SIZE_MASK)
    }

    #[must_use]
    pub fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    /// Returns the raw tag word.
    #[must_use]
    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

/// An offset-based pointer to the payload of a block in the arena.
///
/// This is what [`SegregatedAllocator`](crate::SegregatedAllocator) hands
/// out instead of a raw address. It stays valid across arena growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{_0:#x}")]
#[repr(transparent)]
pub struct HeapPtr(usize);

impl fmt::LowerHex for HeapPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl HeapPtr {
    pub(crate) const fn new(offset: usize) -> Self {
        Self(offset)
    }

    /// Returns the arena offset of the first payload byte.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }

    /// Offset of the header tag.
    pub(crate) const fn header(self) -> usize {
        self.0 - WORD_SIZE
    }

    /// Offset of the footer tag of a block of `size` bytes.
    pub(crate) const fn footer(self, size: usize) -> usize {
        self.0 + size - DWORD_SIZE
    }

    /// Offset of the footer of the block right before this one.
    pub(crate) const fn prev_footer(self) -> usize {
        self.0 - DWORD_SIZE
    }

    /// Offset of the `next` free-list link.
    pub(crate) const fn next_link(self) -> usize {
        self.0
    }

    /// Offset of the `prev` free-list link.
    pub(crate) const fn prev_link(self) -> usize {
        self.0 + WORD_SIZE
    }

    pub(crate) const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    pub(crate) const fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }

    /// Encodes an optional pointer as a link word; zero means "none".
    pub(crate) fn encode_link(ptr: Option<Self>) -> u64 {
        ptr.map_or(0, |ptr| u64::cast_from(ptr.0))
    }

    /// Decodes a link word written by [`encode_link`](Self::encode_link).
    pub(crate) fn decode_link(link: u64) -> Option<Self> {
        (link != 0).then(|| Self(usize::cast_from(link)))
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        let tag = Tag::new(48, true);
        assert_eq!(tag.size(), 48);
        assert!(tag.is_allocated());
        assert_eq!(tag.bits(), 49);

        let tag = Tag::new(4096, false);
        assert_eq!(tag.size(), 4096);
        assert!(!tag.is_allocated());
    }

    #[test]
    fn test_size_masks_low_bits() {
        // bits below the alignment unit are reserved and never part of the size
        let tag = Tag(0x40 | 0xf);
        assert_eq!(tag.size(), 0x40);
        assert!(tag.is_allocated());
    }

    #[test]
    fn test_sentinels() {
        assert_eq!(Tag::PROLOGUE, Tag::new(DWORD_SIZE, true));
        assert_eq!(Tag::EPILOGUE, Tag::new(0, true));
        assert_eq!(Tag::EPILOGUE.size(), 0);
    }

    #[test]
    #[should_panic(expected = "not double-word aligned")]
    fn test_unaligned_size() {
        let _ = Tag::new(24, false);
    }

    #[test]
    fn test_ptr_offsets() {
        let bp = HeapPtr::new(0x40);
        assert_eq!(bp.header(), 0x38);
        assert_eq!(bp.footer(0x20), 0x50);
        assert_eq!(bp.prev_footer(), 0x30);
        assert_eq!(bp.next_link(), 0x40);
        assert_eq!(bp.prev_link(), 0x48);
        assert_eq!(bp.add(0x20), HeapPtr::new(0x60));
        assert_eq!(bp.sub(0x10), HeapPtr::new(0x30));
    }

    #[test]
    fn test_link_encoding() {
        assert_eq!(HeapPtr::encode_link(None), 0);
        assert_eq!(HeapPtr::decode_link(0), None);
        let bp = HeapPtr::new(0x1230);
        assert_eq!(HeapPtr::decode_link(HeapPtr::encode_link(Some(bp))), Some(bp));
    }

    #[test]
    fn test_ptr_display() {
        assert_eq!(alloc::format!("{}", HeapPtr::new(0x20)), "0x20");
    }
}
