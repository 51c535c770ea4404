//! Mapping from block sizes to free-list buckets.
//!
//! Bucket `k` holds free blocks whose size `s` satisfies
//! `2^(k-1) < s <= 2^k`. The two boundary buckets absorb everything below
//! [`MIN_CLASS`] and above [`MAX_CLASS`].

use platform_cast::CastFrom as _;

use crate::block::MIN_BLOCK_SIZE;

/// Number of free-list buckets.
pub const BUCKET_COUNT: usize = 15;
/// Smallest bucket index in use; `2^MIN_CLASS` is the minimum block size.
pub const MIN_CLASS: usize = 5;
/// Largest bucket index; it takes every block larger than `2^(MAX_CLASS-1)`.
pub const MAX_CLASS: usize = BUCKET_COUNT - 1;

const _: () = assert!(1 << MIN_CLASS == MIN_BLOCK_SIZE);
const _: () = assert!(MIN_CLASS < MAX_CLASS);

/// Returns the bucket for a block of `size` bytes.
///
/// This is the smallest `k` with `2^k >= size`, clamped to
/// `MIN_CLASS..=MAX_CLASS`. Insertion and removal of a block must both call
/// this with the block's size at the time it was inserted.
#[must_use]
pub fn classify(size: usize) -> usize {
    let class = if size <= 1 {
        0
    } else {
        usize::cast_from(usize::BITS - (size - 1).leading_zeros())
    };
    class.clamp(MIN_CLASS, MAX_CLASS)
}
