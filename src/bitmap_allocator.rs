//! The allocator façade: routes requests between the small (bitmap) path
//! and the large (direct OS pages) path.

use std::ptr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use log::{debug, trace};

use crate::error::AllocError;
use crate::fatal;
use crate::geometry::Geometry;
use crate::os;
use crate::page::BmPage;
use crate::superblock::Superblock;
use crate::{ceil_div, Allocator, UNIT_SIZE};

/// The bitmap page allocator. Small requests are packed into OS pages
/// tracked by a [`Superblock`]; large requests go straight to the OS as
/// standalone multi-page mappings.
pub struct BitmapAllocator {
    geometry: OnceLock<Geometry>,
    superblock: OnceLock<Superblock>,
    blocks_allocated: AtomicUsize,
    num_bm_pages: AtomicUsize,
}

impl BitmapAllocator {
    pub const fn new() -> Self {
        BitmapAllocator {
            geometry: OnceLock::new(),
            superblock: OnceLock::new(),
            blocks_allocated: AtomicUsize::new(0),
            num_bm_pages: AtomicUsize::new(0),
        }
    }

    /// Number of outstanding allocations (small + large), for diagnostics
    /// and leak tracking.
    pub fn blocks_allocated(&self) -> usize {
        self.blocks_allocated.load(Ordering::SeqCst)
    }

    /// Number of live bitmap pages currently mapped.
    pub fn num_bm_pages(&self) -> usize {
        self.num_bm_pages.load(Ordering::SeqCst)
    }

    fn geometry(&self) -> &Geometry {
        self.geometry
            .get()
            .expect("BitmapAllocator::init was never called")
    }

    fn superblock(&self) -> &Superblock {
        self.superblock
            .get()
            .expect("BitmapAllocator::init was never called")
    }

    fn page_size(&self) -> usize {
        self.geometry().page_size
    }

    fn is_small_addr(&self, addr: NonNull<u8>) -> bool {
        (addr.as_ptr() as usize) % self.page_size() != 0
    }

    fn owning_page(&self, addr: NonNull<u8>) -> (BmPage, usize) {
        let page_size = self.page_size();
        let page_addr = (addr.as_ptr() as usize) & !(page_size - 1);
        let page = unsafe { BmPage::from_raw(NonNull::new_unchecked(page_addr as *mut u8)) };
        let offset = ((addr.as_ptr() as usize) - page_addr) / UNIT_SIZE;
        (page, offset)
    }

    fn allocate_small(&self, g: &Geometry, u: usize) -> Option<NonNull<u8>> {
        let sb = self.superblock();
        let page = match sb.find_and_detach(g, u) {
            Some(page) => page,
            None => {
                let base = os::map(g.page_size, true).ok()?;
                let page = unsafe { BmPage::from_raw(base) };
                page.init_header(g);
                self.num_bm_pages.fetch_add(1, Ordering::SeqCst);
                debug!("mapped fresh bitmap page {:#x}", page.addr());
                page
            }
        };

        let offset = page.find_free_block(g, u);
        if offset == 0 {
            fatal!(
                "bitmap invariant broken: bucket promised {} free units but page {:#x} had none",
                u,
                page.addr()
            );
        }
        page.mark_allocated(g, offset, u);
        let longest = page.find_longest_free_block(g);
        sb.attach(page, longest);
        trace!(
            "allocated {} units at offset {} of page {:#x}, now bucket {}",
            u,
            offset,
            page.addr(),
            longest
        );
        Some(unsafe { NonNull::new_unchecked(page.unit_addr(offset) as *mut u8) })
    }

    fn allocate_large(&self, nbytes: usize) -> Option<NonNull<u8>> {
        let page_size = self.page_size();
        let pages = ceil_div(nbytes, page_size);
        os::map(pages * page_size, true).ok()
    }

    /// Frees the units backing a small block, unmapping the page if that
    /// empties its data area. Does not touch `blocks_allocated`.
    fn free_small(&self, g: &Geometry, addr: NonNull<u8>, nbytes: usize) {
        let (page, offset) = self.owning_page(addr);
        let u = ceil_div(nbytes, UNIT_SIZE);
        let sb = self.superblock();
        sb.detach(page);
        page.mark_free(g, offset, u);
        let longest = page.find_longest_free_block(g);
        if longest == g.max_data_units {
            os::unmap(page.base_nonnull(), g.page_size);
            self.num_bm_pages.fetch_sub(1, Ordering::SeqCst);
            trace!("page {:#x} is empty, unmapped", page.addr());
        } else {
            sb.attach(page, longest);
        }
    }

    /// Unmaps a large block. Does not touch `blocks_allocated`.
    fn free_large(&self, addr: NonNull<u8>, nbytes: usize) {
        let page_size = self.page_size();
        let pages = ceil_div(nbytes, page_size);
        os::unmap(addr, pages * page_size);
    }
}

impl Default for BitmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for BitmapAllocator {
    fn init(&self) {
        let page_size = os::sys_page_size();
        let geometry = Geometry::compute(page_size);
        debug!(
            "bitmap allocator initialized: page_size={} units_per_page={} header_units={} max_data_units={}",
            geometry.page_size, geometry.units_per_page, geometry.header_units, geometry.max_data_units
        );
        let _ = self.geometry.set(geometry);
        let _ = self.superblock.set(Superblock::new(&geometry));
    }

    fn allocate(&self, nbytes: usize, clean: bool) -> Option<NonNull<u8>> {
        if nbytes == 0 {
            return None;
        }
        let g = self.geometry();
        let u = ceil_div(nbytes, UNIT_SIZE);

        let addr = if u < g.max_data_units {
            self.allocate_small(g, u)?
        } else {
            self.allocate_large(nbytes)?
        };

        if clean {
            unsafe { ptr::write_bytes(addr.as_ptr(), 0, nbytes) };
        }
        self.blocks_allocated.fetch_add(1, Ordering::SeqCst);
        Some(addr)
    }

    fn release(&self, addr: &mut Option<NonNull<u8>>, nbytes: usize) -> Result<(), AllocError> {
        let Some(a) = addr.take() else {
            return Ok(());
        };
        if nbytes == 0 {
            fatal!("release called with a zero size");
        }

        if self.is_small_addr(a) {
            self.free_small(self.geometry(), a, nbytes);
        } else {
            self.free_large(a, nbytes);
        }
        self.blocks_allocated.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn reallocate(
        &self,
        addr: &mut Option<NonNull<u8>>,
        old_n: usize,
        new_n: usize,
        clean: bool,
    ) -> Result<bool, AllocError> {
        let page_size = self.page_size();
        let g = self.geometry();

        let a = match *addr {
            None => {
                if old_n != 0 {
                    fatal!("reallocate: null address with nonzero old_nbytes ({old_n})");
                }
                if new_n == 0 {
                    fatal!("reallocate: both old_nbytes and new_nbytes are zero");
                }
                let new_addr = self.allocate(new_n, clean).ok_or(AllocError::OutOfMemory)?;
                *addr = Some(new_addr);
                return Ok(true);
            }
            Some(a) => a,
        };

        let old_u = ceil_div(old_n, UNIT_SIZE);
        let new_u = ceil_div(new_n, UNIT_SIZE);

        if old_u == new_u {
            if clean && new_n > old_n {
                unsafe { ptr::write_bytes(a.as_ptr().add(old_n), 0, new_n - old_n) };
            }
            return Ok(false);
        }

        if new_u < old_u {
            return self.reallocate_shrink(addr, a, old_n, new_n, old_u, new_u, g, page_size);
        }
        self.reallocate_grow(addr, a, old_n, new_n, old_u, new_u, clean, g, page_size)
    }

    fn dump(&self) {
        let g = self.geometry();
        println!(
            "bitmap allocator: {} blocks allocated, {} bitmap pages live",
            self.blocks_allocated(),
            self.num_bm_pages()
        );
        self.superblock().dump(g);
    }
}

impl BitmapAllocator {
    #[allow(clippy::too_many_arguments)]
    fn reallocate_shrink(
        &self,
        addr: &mut Option<NonNull<u8>>,
        a: NonNull<u8>,
        old_n: usize,
        new_n: usize,
        old_u: usize,
        new_u: usize,
        g: &Geometry,
        page_size: usize,
    ) -> Result<bool, AllocError> {
        if self.is_small_addr(a) {
            // small -> small: shrink in place.
            let (page, offset) = self.owning_page(a);
            let sb = self.superblock();
            sb.detach(page);
            page.shrink(g, offset, old_u, new_u);
            let longest = page.find_longest_free_block(g);
            sb.attach(page, longest);
            return Ok(false);
        }

        if new_u < g.max_data_units {
            // large -> small: try a fresh small allocation, copy, release the
            // large mapping.
            if let Some(new_addr) = self.allocate_small(g, new_u) {
                unsafe { ptr::copy_nonoverlapping(a.as_ptr(), new_addr.as_ptr(), new_n) };
                self.free_large(a, old_n);
                *addr = Some(new_addr);
                return Ok(true);
            }
            // No room for a fresh small block: fall back to an in-place OS
            // shrink, keeping the old page-aligned address even though the
            // block is now logically small-sized.
        }

        let old_pages = ceil_div(old_n, page_size);
        let new_pages = ceil_div(new_n, page_size).max(1);
        let shrunk = os::remap(a, old_pages * page_size, new_pages * page_size, false)?;
        debug_assert_eq!(shrunk, a, "an OS shrink must never move the mapping");
        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    fn reallocate_grow(
        &self,
        addr: &mut Option<NonNull<u8>>,
        a: NonNull<u8>,
        old_n: usize,
        new_n: usize,
        old_u: usize,
        new_u: usize,
        clean: bool,
        g: &Geometry,
        page_size: usize,
    ) -> Result<bool, AllocError> {
        if self.is_small_addr(a) {
            let (page, offset) = self.owning_page(a);
            if new_u < g.max_data_units {
                let sb = self.superblock();
                sb.detach(page);
                if page.grow(g, offset, old_u, new_u) {
                    let longest = page.find_longest_free_block(g);
                    sb.attach(page, longest);
                    if clean {
                        unsafe { ptr::write_bytes(a.as_ptr().add(old_n), 0, new_n - old_n) };
                    }
                    return Ok(false);
                }
                // Reattach unchanged; fall through to allocate-copy-release.
                let longest = page.find_longest_free_block(g);
                sb.attach(page, longest);
            }

            let new_addr = self.allocate(new_n, false).ok_or(AllocError::OutOfMemory)?;
            unsafe { ptr::copy_nonoverlapping(a.as_ptr(), new_addr.as_ptr(), old_n) };
            let mut old = Some(a);
            // `old_n` is the caller-supplied size of the block we're
            // replacing, never zero here, so this can't hit InvalidArgument.
            let _ = self.release(&mut old, old_n);
            if clean {
                unsafe { ptr::write_bytes(new_addr.as_ptr().add(old_n), 0, new_n - old_n) };
            }
            *addr = Some(new_addr);
            return Ok(true);
        }

        // large -> large, growing: OS mremap, allowed to move.
        let old_pages = ceil_div(old_n, page_size);
        let new_pages = ceil_div(new_n, page_size);
        let grown = os::remap(a, old_pages * page_size, new_pages * page_size, clean)?;
        *addr = Some(grown);
        Ok(grown != a)
    }
}
