//! Address-space provider for heap allocators.
//!
//! A heap allocator needs exactly one primitive from its environment: "give
//! me `n` more bytes directly after the ones you gave me before". On Unix
//! this is `sbrk`. This crate describes that primitive as the
//! [`MemoryProvider`] trait and ships [`MemLib`], a bounded provider backed
//! by an owned byte buffer, so that allocators can be exercised
//! deterministically and in isolation.
//!
//! The arena handed out by a provider is addressed by *offsets*, not raw
//! addresses. Offset `0` is the first byte the provider ever handed out.
//! Growing the arena never moves existing offsets, even though the backing
//! buffer itself may be reallocated.
//!
//! # Usage Example
//!
//! ```rust
//! use memlib::{MemLib, MemoryProvider as _};
//!
//! let mut memlib = MemLib::new(4096);
//!
//! let first = memlib.extend(64).unwrap();
//! let second = memlib.extend(64).unwrap();
//! assert_eq!(first, 0);
//! assert_eq!(second, 64);
//! assert_eq!(memlib.heap_size(), 128);
//!
//! // The limit is enforced without partial growth.
//! assert!(memlib.extend(8192).is_err());
//! assert_eq!(memlib.heap_size(), 128);
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::{collections::TryReserveError, vec::Vec};

use log::trace;
use snafu::{Location, ResultExt as _, Snafu, ensure};

/// Default upper bound of a [`MemLib`] arena (20 MiB).
pub const DEFAULT_MAX_HEAP: usize = 20 * (1 << 20);

/// Errors returned when a provider cannot extend its arena.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ExtendError {
    #[snafu(display(
        "arena exhausted: requested {requested} bytes, only {available} bytes available"
    ))]
    Exhausted {
        requested: usize,
        available: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to reserve {requested} bytes of backing memory"))]
    Reserve {
        requested: usize,
        #[snafu(source)]
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A monotonically growing, contiguous arena.
///
/// Implementors must guarantee that:
///
/// - [`extend`](Self::extend) either grows the arena by exactly `increment`
///   bytes or leaves it untouched
/// - bytes that were handed out keep their offset and contents across later
///   extensions
/// - the arena never shrinks on its own
pub trait MemoryProvider {
    /// Extends the arena by `increment` bytes.
    ///
    /// Returns the offset of the first new byte, which is the size of the
    /// arena before the call. An `increment` of zero returns the current
    /// break without growing.
    fn extend(&mut self, increment: usize) -> Result<usize, ExtendError>;

    /// Returns the bytes handed out so far.
    fn heap(&self) -> &[u8];

    /// Returns the bytes handed out so far, mutably.
    fn heap_mut(&mut self) -> &mut [u8];

    /// Returns the current size of the arena in bytes.
    fn heap_size(&self) -> usize {
        self.heap().len()
    }
}

impl<P> MemoryProvider for &mut P
where
    P: MemoryProvider + ?Sized,
{
    fn extend(&mut self, increment: usize) -> Result<usize, ExtendError> {
        (**self).extend(increment)
    }

    fn heap(&self) -> &[u8] {
        (**self).heap()
    }

    fn heap_mut(&mut self) -> &mut [u8] {
        (**self).heap_mut()
    }

    fn heap_size(&self) -> usize {
        (**self).heap_size()
    }
}

/// A bounded provider that simulates `sbrk` over an owned buffer.
///
/// The arena starts empty and can grow up to `max_heap` bytes. Newly handed
/// out bytes are zeroed.
#[derive(Debug, Clone)]
pub struct MemLib {
    heap: Vec<u8>,
    max_heap: usize,
}

impl Default for MemLib {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEAP)
    }
}

impl MemLib {
    /// Creates an empty arena that can grow up to `max_heap` bytes.
    ///
    /// No memory is reserved until the first [`extend`](MemoryProvider::extend).
    #[must_use]
    pub const fn new(max_heap: usize) -> Self {
        Self {
            heap: Vec::new(),
            max_heap,
        }
    }

    /// Returns the upper bound of the arena size.
    #[must_use]
    pub fn max_heap(&self) -> usize {
        self.max_heap
    }

    /// Returns how many more bytes can be handed out.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.max_heap - self.heap.len()
    }

    /// Drops the break back to offset zero.
    ///
    /// Everything handed out before is discarded. Allocators built on this
    /// arena must be re-initialized afterwards.
    pub fn reset(&mut self) {
        trace!("resetting arena of {} bytes", self.heap.len());
        self.heap.clear();
    }
}

impl MemoryProvider for MemLib {
    fn extend(&mut self, increment: usize) -> Result<usize, ExtendError> {
        use self::extend_error::{ExhaustedSnafu, ReserveSnafu};

        let brk = self.heap.len();
        let available = self.remaining();
        ensure!(
            increment <= available,
            ExhaustedSnafu {
                requested: increment,
                available,
            }
        );

        self.heap
            .try_reserve(increment)
            .context(ReserveSnafu {
                requested: increment,
            })?;
        self.heap.resize(brk + increment, 0);

        trace!(
            "arena break moved {brk:#x} -> {:#x} (+{increment})",
            self.heap.len()
        );
        Ok(brk)
    }

    fn heap(&self) -> &[u8] {
        &self.heap
    }

    fn heap_mut(&mut self) -> &mut [u8] {
        &mut self.heap
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extend_returns_previous_break() {
        let mut memlib = MemLib::new(1024);
        assert_eq!(memlib.extend(32).unwrap(), 0);
        assert_eq!(memlib.extend(16).unwrap(), 32);
        assert_eq!(memlib.extend(0).unwrap(), 48);
        assert_eq!(memlib.heap_size(), 48);
        assert_eq!(memlib.remaining(), 1024 - 48);
    }

    #[test]
    fn test_new_bytes_are_zeroed() {
        let mut memlib = MemLib::new(64);
        let start = memlib.extend(16).unwrap();
        assert!(memlib.heap()[start..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_contents_survive_extension() {
        let mut memlib = MemLib::new(1 << 16);
        memlib.extend(8).unwrap();
        memlib.heap_mut().copy_from_slice(b"onetwo!!");
        for _ in 0..100 {
            memlib.extend(256).unwrap();
        }
        assert_eq!(&memlib.heap()[..8], b"onetwo!!");
    }

    #[test]
    fn test_exhausted() {
        let mut memlib = MemLib::new(64);
        memlib.extend(48).unwrap();
        let err = memlib.extend(32).unwrap_err();
        assert!(matches!(
            err,
            ExtendError::Exhausted {
                requested: 32,
                available: 16,
                ..
            }
        ));
        // failed extension must not move the break
        assert_eq!(memlib.heap_size(), 48);
        assert_eq!(memlib.extend(16).unwrap(), 48);
        assert_eq!(memlib.remaining(), 0);
    }

    #[test]
    fn test_reset() {
        let mut memlib = MemLib::default();
        assert_eq!(memlib.max_heap(), DEFAULT_MAX_HEAP);
        memlib.extend(128).unwrap();
        memlib.reset();
        assert_eq!(memlib.heap_size(), 0);
        assert_eq!(memlib.extend(8).unwrap(), 0);
    }

    #[test]
    fn test_provider_by_mut_ref() {
        fn grow<P: MemoryProvider>(mut provider: P) -> usize {
            provider.extend(24).unwrap()
        }

        let mut memlib = MemLib::new(64);
        assert_eq!(grow(&mut memlib), 0);
        assert_eq!(grow(&mut memlib), 24);
        assert_eq!(memlib.heap_size(), 48);
    }
}
