//! The standard library adaptor: a thin shim over the host runtime's
//! `malloc`/`realloc`/`free` that preserves the same "caller supplies old
//! size" / "address may change" interface contract as the bitmap
//! allocator.

use std::ptr;
use std::ptr::NonNull;

use libc::c_void;

use crate::error::AllocError;
use crate::Allocator;

/// Routes every request straight through to the host `malloc` family.
#[derive(Default)]
pub struct StdAllocator;

impl StdAllocator {
    pub const fn new() -> Self {
        StdAllocator
    }
}

impl Allocator for StdAllocator {
    fn allocate(&self, nbytes: usize, clean: bool) -> Option<NonNull<u8>> {
        if nbytes == 0 {
            return None;
        }
        let raw = unsafe {
            if clean {
                libc::calloc(1, nbytes)
            } else {
                libc::malloc(nbytes)
            }
        };
        NonNull::new(raw.cast::<u8>())
    }

    fn release(&self, addr: &mut Option<NonNull<u8>>, nbytes: usize) -> Result<(), AllocError> {
        if addr.is_none() {
            return Ok(());
        }
        if nbytes == 0 {
            return Err(AllocError::InvalidArgument(
                "release called with a zero size",
            ));
        }
        let a = addr.take().unwrap();
        unsafe { libc::free(a.as_ptr().cast::<c_void>()) };
        Ok(())
    }

    fn reallocate(
        &self,
        addr: &mut Option<NonNull<u8>>,
        old_n: usize,
        new_n: usize,
        clean: bool,
    ) -> Result<bool, AllocError> {
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
                let raw = unsafe { libc::realloc(a.as_ptr().cast::<c_void>(), new_n) };
                let new_addr = NonNull::new(raw.cast::<u8>()).ok_or(AllocError::OutOfMemory)?;
                if clean && new_n > old_n {
                    unsafe {
                        ptr::write_bytes(new_addr.as_ptr().add(old_n), 0, new_n - old_n);
                    }
                }
                let moved = new_addr != a;
                *addr = Some(new_addr);
                Ok(moved)
            }
        }
    }

    fn dump(&self) {
        println!("stdlib allocator: no internal state to dump");
    }
}
