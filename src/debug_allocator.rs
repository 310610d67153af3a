//! The debug adaptor: wraps any [`Allocator`] with poisoned red-zone
//! ("bubblewrap") padding around every block to detect out-of-bounds
//! writes at release time.

use std::mem::size_of;
use std::ptr;
use std::ptr::NonNull;
use std::slice;

use log::error;

use crate::error::AllocError;
use crate::Allocator;

const RED_ZONE: usize = 32;
const SENTINEL: u8 = 0xFF;

/// Header placed at the start of every region this adaptor hands to the
/// inner allocator, ahead of the lower red zone.
#[repr(C)]
struct DebugHeader {
    user_addr: usize,
    user_size: usize,
}

/// Wraps `inner` with bubblewrap red zones around every allocation.
pub struct DebugAllocator<A: Allocator> {
    inner: A,
}

impl<A: Allocator> DebugAllocator<A> {
    pub const fn new(inner: A) -> Self {
        DebugAllocator { inner }
    }

    fn region_size(user_bytes: usize) -> usize {
        size_of::<DebugHeader>() + user_bytes + 2 * RED_ZONE
    }

    fn region_base_of(user_ptr: NonNull<u8>) -> *mut u8 {
        unsafe { user_ptr.as_ptr().sub(size_of::<DebugHeader>() + RED_ZONE) }
    }
}

impl<A: Allocator> Allocator for DebugAllocator<A> {
    fn init(&self) {
        self.inner.init();
    }

    fn allocate(&self, nbytes: usize, clean: bool) -> Option<NonNull<u8>> {
        if nbytes == 0 {
            return None;
        }
        let region = self.inner.allocate(Self::region_size(nbytes), false)?;
        unsafe {
            let header = region.as_ptr().cast::<DebugHeader>();
            let user_ptr = region.as_ptr().add(size_of::<DebugHeader>() + RED_ZONE);
            header.write(DebugHeader {
                user_addr: user_ptr as usize,
                user_size: nbytes,
            });
            ptr::write_bytes(region.as_ptr().add(size_of::<DebugHeader>()), SENTINEL, RED_ZONE);
            ptr::write_bytes(user_ptr.add(nbytes), SENTINEL, RED_ZONE);
            if clean {
                ptr::write_bytes(user_ptr, 0, nbytes);
            }
            Some(NonNull::new_unchecked(user_ptr))
        }
    }

    fn release(&self, addr: &mut Option<NonNull<u8>>, nbytes: usize) -> Result<(), AllocError> {
        let Some(user_ptr) = addr.take() else {
            return Ok(());
        };
        if nbytes == 0 {
            crate::fatal!("debug allocator: release called with a zero size");
        }

        let region_base = Self::region_base_of(user_ptr);
        unsafe {
            let header = region_base.cast::<DebugHeader>();
            debug_assert_eq!(
                (*header).user_size,
                nbytes,
                "caller supplied the wrong size to release"
            );

            let below = slice::from_raw_parts(region_base.add(size_of::<DebugHeader>()), RED_ZONE);
            let above = slice::from_raw_parts(user_ptr.as_ptr().add(nbytes), RED_ZONE);
            let below_damaged = below.iter().filter(|&&b| b != SENTINEL).count();
            let above_damaged = above.iter().filter(|&&b| b != SENTINEL).count();

            if below_damaged > 0 || above_damaged > 0 {
                error!(
                    "bmalloc debug allocator: corruption detected around block at {:p}",
                    user_ptr.as_ptr()
                );
                if below_damaged > 0 {
                    error!("{below_damaged} byte(s) damaged below block: {below:02x?}");
                }
                if above_damaged > 0 {
                    error!("{above_damaged} byte(s) damaged above block: {above:02x?}");
                }
                std::process::abort();
            }
        }

        let mut region = unsafe { Some(NonNull::new_unchecked(region_base)) };
        self.inner.release(&mut region, Self::region_size(nbytes))
    }

    fn reallocate(
        &self,
        addr: &mut Option<NonNull<u8>>,
        old_n: usize,
        new_n: usize,
        clean: bool,
    ) -> Result<bool, AllocError> {
        // Always allocate-new + copy + release-old, never in place, so every
        // size change re-validates the red zones of the old block.
        match *addr {
            None => {
                if old_n != 0 {
                    return Err(AllocError::InvalidArgument(
                        "reallocate from a null address with nonzero old_nbytes",
                    ));
                }
                if new_n == 0 {
                    return Err(AllocError::InvalidArgument(
                        "reallocate with both old_nbytes and new_nbytes zero",
                    ));
                }
                let new_addr = self.allocate(new_n, clean).ok_or(AllocError::OutOfMemory)?;
                *addr = Some(new_addr);
                Ok(true)
            }
            Some(a) => {
                let new_addr = self.allocate(new_n, false).ok_or(AllocError::OutOfMemory)?;
                let copy_len = old_n.min(new_n);
                unsafe { ptr::copy_nonoverlapping(a.as_ptr(), new_addr.as_ptr(), copy_len) };
                if clean && new_n > old_n {
                    unsafe {
                        ptr::write_bytes(new_addr.as_ptr().add(old_n), 0, new_n - old_n);
                    }
                }
                let mut old = Some(a);
                self.release(&mut old, old_n)?;
                *addr = Some(new_addr);
                Ok(true)
            }
        }
    }

    fn dump(&self) {
        self.inner.dump();
    }
}
