//! Word-level access to the arena handed out by a [`MemoryProvider`].
//!
//! All reads and writes are bounds-checked by [`DataView`]. Offsets do not
//! need to be naturally aligned; the arena is only guaranteed to be
//! double-word aligned *relative to its own start*.

use dataview::DataView;
use memlib::{ExtendError, MemoryProvider};

use crate::block::{HeapPtr, Tag};

pub(crate) struct Arena<P> {
    provider: P,
}

impl<P> Arena<P> {
    pub(crate) const fn new(provider: P) -> Self {
        Self { provider }
    }

    pub(crate) fn provider(&self) -> &P {
        &self.provider
    }

    pub(crate) fn into_provider(self) -> P {
        self.provider
    }
}

impl<P> Arena<P>
where
    P: MemoryProvider,
{
    pub(crate) fn len(&self) -> usize {
        self.provider.heap_size()
    }

    pub(crate) fn extend(&mut self, increment: usize) -> Result<usize, ExtendError> {
        self.provider.extend(increment)
    }

    fn view(&self) -> &DataView {
        DataView::from(self.provider.heap())
    }

    fn view_mut(&mut self) -> &mut DataView {
        DataView::from_mut(self.provider.heap_mut())
    }

    pub(crate) fn tag(&self, offset: usize) -> Tag {
        self.view().read::<Tag>(offset)
    }

    /// Like [`tag`](Self::tag), but returns `None` instead of panicking when
    /// `offset` is outside the arena.
    pub(crate) fn try_tag(&self, offset: usize) -> Option<Tag> {
        self.view().try_read::<Tag>(offset)
    }

    pub(crate) fn set_tag(&mut self, offset: usize, tag: Tag) {
        self.view_mut().write(offset, &tag);
    }

    pub(crate) fn header(&self, bp: HeapPtr) -> Tag {
        self.tag(bp.header())
    }

    pub(crate) fn block_size(&self, bp: HeapPtr) -> usize {
        self.header(bp).size()
    }

    pub(crate) fn is_allocated(&self, bp: HeapPtr) -> bool {
        self.header(bp).is_allocated()
    }

    /// Writes identical header and footer tags for the block at `bp`.
    pub(crate) fn set_block(&mut self, bp: HeapPtr, size: usize, allocated: bool) {
        let tag = Tag::new(size, allocated);
        self.set_tag(bp.header(), tag);
        self.set_tag(bp.footer(size), tag);
    }

    pub(crate) fn next_block(&self, bp: HeapPtr) -> HeapPtr {
        bp.add(self.block_size(bp))
    }

    /// Returns the block right before `bp`, located through its footer.
    pub(crate) fn prev_block(&self, bp: HeapPtr) -> HeapPtr {
        bp.sub(self.tag(bp.prev_footer()).size())
    }

    /// Returns whether the block right before `bp` is allocated, reading only
    /// its footer.
    pub(crate) fn is_prev_allocated(&self, bp: HeapPtr) -> bool {
        self.tag(bp.prev_footer()).is_allocated()
    }

    pub(crate) fn next_free(&self, bp: HeapPtr) -> Option<HeapPtr> {
        HeapPtr::decode_link(self.view().read::<u64>(bp.next_link()))
    }

    pub(crate) fn prev_free(&self, bp: HeapPtr) -> Option<HeapPtr> {
        HeapPtr::decode_link(self.view().read::<u64>(bp.prev_link()))
    }

    pub(crate) fn set_next_free(&mut self, bp: HeapPtr, next: Option<HeapPtr>) {
        let link = HeapPtr::encode_link(next);
        self.view_mut().write(bp.next_link(), &link);
    }

    pub(crate) fn set_prev_free(&mut self, bp: HeapPtr, prev: Option<HeapPtr>) {
        let link = HeapPtr::encode_link(prev);
        self.view_mut().write(bp.prev_link(), &link);
    }

    /// Returns the usable bytes of the block at `bp`.
    pub(crate) fn payload(&self, bp: HeapPtr) -> &[u8] {
        let len = self.block_size(bp) - crate::block::DWORD_SIZE;
        &self.provider.heap()[bp.offset()..][..len]
    }

    pub(crate) fn payload_mut(&mut self, bp: HeapPtr) -> &mut [u8] {
        let len = self.block_size(bp) - crate::block::DWORD_SIZE;
        &mut self.provider.heap_mut()[bp.offset()..][..len]
    }

    /// Copies `len` bytes from `src` to `dst`; the ranges may overlap.
    pub(crate) fn copy(&mut self, src: HeapPtr, dst: HeapPtr, len: usize) {
        let start = src.offset();
        self.provider
            .heap_mut()
            .copy_within(start..start + len, dst.offset());
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use memlib::MemLib;

    use super::*;

    fn arena(size: usize) -> Arena<MemLib> {
        let mut arena = Arena::new(MemLib::new(size));
        arena.extend(size).unwrap();
        arena
    }

    #[test]
    fn test_block_tags() {
        let mut arena = arena(128);
        let bp = HeapPtr::new(16);
        arena.set_block(bp, 48, true);
        assert_eq!(arena.header(bp), Tag::new(48, true));
        assert_eq!(arena.tag(bp.footer(48)), Tag::new(48, true));
        assert_eq!(arena.tag(8), Tag::new(48, true));
        assert_eq!(arena.tag(48), Tag::new(48, true));
        assert_eq!(arena.block_size(bp), 48);
        assert!(arena.is_allocated(bp));
    }

    #[test]
    fn test_neighbors() {
        let mut arena = arena(128);
        let first = HeapPtr::new(16);
        arena.set_block(first, 32, false);
        let second = arena.next_block(first);
        assert_eq!(second, HeapPtr::new(48));
        arena.set_block(second, 64, true);

        assert_eq!(arena.prev_block(second), first);
        assert!(!arena.is_prev_allocated(second));
        assert_eq!(arena.next_block(second), HeapPtr::new(112));
    }

    #[test]
    fn test_links() {
        let mut arena = arena(128);
        let bp = HeapPtr::new(16);
        arena.set_next_free(bp, Some(HeapPtr::new(80)));
        arena.set_prev_free(bp, None);
        assert_eq!(arena.next_free(bp), Some(HeapPtr::new(80)));
        assert_eq!(arena.prev_free(bp), None);
    }

    #[test]
    fn test_try_tag_out_of_bounds() {
        let arena = arena(32);
        assert!(arena.try_tag(24).is_some());
        assert!(arena.try_tag(28).is_none());
        assert!(arena.try_tag(1024).is_none());
    }

    #[test]
    fn test_payload_and_copy() {
        let mut arena = arena(128);
        let bp = HeapPtr::new(16);
        arena.set_block(bp, 48, true);
        assert_eq!(arena.payload(bp).len(), 32);
        arena.payload_mut(bp).fill(0x33);

        let dst = HeapPtr::new(8);
        arena.copy(bp, dst, 32);
        assert!(arena.provider().heap()[8..40].iter().all(|&b| b == 0x33));
    }
}
