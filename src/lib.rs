//! A pluggable memory allocator layer centered on a bitmap-based
//! sub-allocator that packs small objects into anonymous OS pages, with
//! large objects served directly by the OS paging facility.
//!
//! Three concrete strategies share one [`Allocator`] interface:
//! - [`bitmap_allocator::BitmapAllocator`] — the core bitmap page allocator.
//! - [`stdlib_allocator::StdAllocator`] — a thin adaptor over the host
//!   `malloc`/`realloc`/`free`.
//! - [`debug_allocator::DebugAllocator`] — wraps either of the above with
//!   red-zone corruption detection.
//!
//! Dispatch between the three is a trait object: there is no inheritance
//! hierarchy in Rust, so a `dyn Allocator` stands in for a capability
//! record of function pointers.

pub mod bitmap_allocator;
pub mod debug_allocator;
pub mod error;
pub mod stdlib_allocator;

pub(crate) mod bitmap;
pub(crate) mod geometry;
pub(crate) mod os;
pub(crate) mod page;
pub(crate) mod superblock;

use std::ptr::NonNull;
use std::sync::OnceLock;

pub use bitmap_allocator::BitmapAllocator;
pub use debug_allocator::DebugAllocator;
pub use error::AllocError;
pub use stdlib_allocator::StdAllocator;

/// The allocation quantum. Every small allocation is rounded up to a whole
/// number of these. Must be a power of two and at least `size_of::<usize>()`.
pub const UNIT_SIZE: usize = 16;

pub(crate) fn ceil_div(n: usize, d: usize) -> usize {
    n.div_ceil(d)
}

/// Logs `$($arg)*` at error level and aborts the process. Used for
/// corruption and internal-invariant failures, which are always fatal and
/// therefore never surfaced as `Result`s.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}
pub(crate) use fatal;

/// The shared capability set every concrete allocator implements:
/// `init`/`allocate`/`reallocate`/`release`/`dump`.
///
/// The interface deliberately does not store block sizes alongside
/// allocations: the caller is the source of truth, and must supply
/// matching sizes to `release`/`reallocate`. See [`SizedBox`] for a
/// wrapper that carries the size for you.
pub trait Allocator: Send + Sync {
    /// One-time setup, invoked once by [`init`] when this instance is
    /// installed as the process-wide default.
    fn init(&self) {}

    /// Allocates `nbytes`. Returns `None` (not an error) on OOM for
    /// `nbytes == 0`; a `clean` request guarantees `[0, nbytes)` of the
    /// returned block is zero.
    fn allocate(&self, nbytes: usize, clean: bool) -> Option<NonNull<u8>>;

    /// Resizes the block at `*addr` (caller-supplied `old_nbytes`) to
    /// `new_nbytes`. Returns whether the address changed; on failure,
    /// `*addr` is left untouched and `Ok`/`Err` reflects the failure.
    fn reallocate(
        &self,
        addr: &mut Option<NonNull<u8>>,
        old_nbytes: usize,
        new_nbytes: usize,
        clean: bool,
    ) -> Result<bool, AllocError>;

    /// Releases the block at `*addr` (caller-supplied `nbytes`) and clears
    /// `*addr` to `None`. A no-op if `*addr` is already `None`.
    ///
    /// `nbytes == 0` is an `InvalidArgument` (spec §7 item 2): the bitmap
    /// and debug allocators treat it as fatal (process abort) and never
    /// return `Err` for it, while the stdlib adaptor mirrors it as a
    /// genuine `Err` return instead of aborting, per the spec's explicit
    /// per-adaptor split.
    fn release(&self, addr: &mut Option<NonNull<u8>>, nbytes: usize) -> Result<(), AllocError>;

    /// Diagnostic dump of internal allocator state.
    fn dump(&self);
}

static DEFAULT: OnceLock<Box<dyn Allocator>> = OnceLock::new();

/// Installs `instance` as the process-wide default allocator, running its
/// `init()` first. Calling this more than once is a no-op after the first
/// call wins (mirrors the C original's single global instance).
pub fn init(instance: Box<dyn Allocator>) {
    instance.init();
    let _ = DEFAULT.set(instance);
}

/// The process-wide default allocator installed by [`init`].
///
/// # Panics
/// Panics if [`init`] has not been called yet.
pub fn default_allocator() -> &'static dyn Allocator {
    DEFAULT
        .get()
        .expect("bmalloc::init was never called")
        .as_ref()
}

/// Convenience wrapper over [`default_allocator`]`.allocate`.
pub fn allocate(nbytes: usize, clean: bool) -> Option<NonNull<u8>> {
    default_allocator().allocate(nbytes, clean)
}

/// Convenience wrapper over [`default_allocator`]`.reallocate`.
pub fn reallocate(
    addr: &mut Option<NonNull<u8>>,
    old_nbytes: usize,
    new_nbytes: usize,
    clean: bool,
) -> Result<bool, AllocError> {
    default_allocator().reallocate(addr, old_nbytes, new_nbytes, clean)
}

/// Convenience wrapper over [`default_allocator`]`.release`.
pub fn release(addr: &mut Option<NonNull<u8>>, nbytes: usize) -> Result<(), AllocError> {
    default_allocator().release(addr, nbytes)
}

/// Convenience wrapper over [`default_allocator`]`.dump`.
pub fn dump() {
    default_allocator().dump();
}

/// A sized wrapper around a raw allocation: stores the size alongside the
/// address and forwards it to `release`/`reallocate` automatically, so the
/// underlying size-in API doesn't leak into safe consumers that would
/// rather not track it themselves.
pub struct SizedBox {
    addr: Option<NonNull<u8>>,
    size: usize,
}

impl SizedBox {
    /// Allocates `size` bytes through the default allocator.
    pub fn new(size: usize, clean: bool) -> Option<Self> {
        let addr = allocate(size, clean)?;
        Some(SizedBox {
            addr: Some(addr),
            size,
        })
    }

    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Resizes in place (growing or shrinking), updating the tracked size.
    pub fn resize(&mut self, new_size: usize, clean: bool) -> Result<bool, AllocError> {
        let moved = reallocate(&mut self.addr, self.size, new_size, clean)?;
        self.size = new_size;
        Ok(moved)
    }
}

impl Drop for SizedBox {
    fn drop(&mut self) {
        if self.addr.is_some() {
            // `self.size` was whatever the allocator itself last accepted,
            // so a release here can never hit the zero-size InvalidArgument
            // case; nothing meaningful to do with an error in a destructor.
            let _ = release(&mut self.addr, self.size);
        }
    }
}

// `addr` is a plain allocation owned exclusively by this `SizedBox`.
unsafe impl Send for SizedBox {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_init() {
        INIT.call_once(|| {
            init(Box::new(BitmapAllocator::new()));
        });
    }

    #[test]
    fn small_allocate_release_cycle() {
        ensure_init();
        let allocator = BitmapAllocator::new();
        allocator.init();
        let mut addr = allocator.allocate(48, true);
        assert!(addr.is_some());
        assert_eq!(allocator.blocks_allocated(), 1);
        allocator.release(&mut addr, 48).unwrap();
        assert!(addr.is_none());
        assert_eq!(allocator.blocks_allocated(), 0);
        assert_eq!(allocator.num_bm_pages(), 0);
    }

    #[test]
    fn sized_box_tracks_its_own_size() {
        ensure_init();
        let mut b = SizedBox::new(32, true).unwrap();
        assert_eq!(b.len(), 32);
        b.resize(64, true).unwrap();
        assert_eq!(b.len(), 64);
    }
}
