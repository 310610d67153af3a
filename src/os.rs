//! Anonymous, private OS page mappings: thin `libc` wrappers around
//! `mmap`/`munmap`/`mremap` for raw, page-granular memory management.

use std::ptr;
use std::sync::OnceLock;

use libc::c_void;
use log::error;

use crate::error::AllocError;

/// Queries (and caches) the runtime OS page size via `sysconf`.
pub(crate) fn sys_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Maps `size` bytes of fresh anonymous, private, read+write memory.
///
/// Freshly mapped anonymous memory is already zero, so `clean` is not acted
/// on here; it matters only on reuse through [`remap`].
pub(crate) fn map(size: usize, _clean: bool) -> Result<ptr::NonNull<u8>, AllocError> {
    debug_assert_eq!(size % sys_page_size(), 0);
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        error!(
            "mmap of {} bytes failed: {}",
            size,
            std::io::Error::last_os_error()
        );
        return Err(AllocError::OutOfMemory);
    }
    Ok(unsafe { ptr::NonNull::new_unchecked(ptr.cast::<u8>()) })
}

/// Unmaps `size` bytes starting at `addr`.
pub(crate) fn unmap(addr: ptr::NonNull<u8>, size: usize) {
    let rc = unsafe { libc::munmap(addr.as_ptr().cast::<c_void>(), size) };
    if rc != 0 {
        error!(
            "munmap of {:p} ({} bytes) failed: {}",
            addr.as_ptr(),
            size,
            std::io::Error::last_os_error()
        );
    }
}

/// Resizes a mapping from `old_size` to `new_size` (both assumed already
/// rounded to OS pages by the caller). Growing may return a different
/// address; shrinking never moves the mapping.
pub(crate) fn remap(
    addr: ptr::NonNull<u8>,
    old_size: usize,
    new_size: usize,
    clean: bool,
) -> Result<ptr::NonNull<u8>, AllocError> {
    if old_size == new_size {
        return Ok(addr);
    }

    #[cfg(target_os = "linux")]
    {
        let flags = if new_size > old_size {
            libc::MREMAP_MAYMOVE
        } else {
            0
        };
        let raw = unsafe {
            libc::mremap(
                addr.as_ptr().cast::<c_void>(),
                old_size,
                new_size,
                flags,
            )
        };
        if raw == libc::MAP_FAILED {
            error!("mremap failed: {}", std::io::Error::last_os_error());
            return Err(AllocError::OutOfMemory);
        }
        let new_addr = unsafe { ptr::NonNull::new_unchecked(raw.cast::<u8>()) };
        if clean && new_size > old_size {
            unsafe {
                ptr::write_bytes(new_addr.as_ptr().add(old_size), 0, new_size - old_size);
            }
        }
        Ok(new_addr)
    }

    #[cfg(not(target_os = "linux"))]
    {
        if new_size < old_size {
            // Shrinking never moves: just release the tail pages in place.
            unsafe {
                unmap(
                    ptr::NonNull::new_unchecked(addr.as_ptr().add(new_size)),
                    old_size - new_size,
                );
            }
            return Ok(addr);
        }

        // No portable in-place grow without mremap: map fresh, copy, unmap old.
        let new_addr = map(new_size, false)?;
        unsafe {
            ptr::copy_nonoverlapping(addr.as_ptr(), new_addr.as_ptr(), old_size);
        }
        unmap(addr, old_size);
        if clean {
            unsafe {
                ptr::write_bytes(new_addr.as_ptr().add(old_size), 0, new_size - old_size);
            }
        }
        Ok(new_addr)
    }
}
