//! Per-page bitmap operations and the `BmPage` layout.
//!
//! A `BmPage` is a thin, `Copy`able handle around the base address of one OS
//! page. The header — bucket back-pointer, circular-list `next`/`prev`, and
//! the bitmap itself — lives inside that page's own memory, co-located with
//! the data it tracks.

use core::ptr::NonNull;
use core::slice;

use crate::bitmap::{clear_bits, count_nonzero_bits, count_zero_bits, set_bits, Word, WORD_BITS};
use crate::geometry::Geometry;
use crate::UNIT_SIZE;

const BUCKET_OFFSET: usize = 0;
const NEXT_OFFSET: usize = core::mem::size_of::<usize>();
const PREV_OFFSET: usize = 2 * core::mem::size_of::<usize>();
const BITMAP_OFFSET: usize = 3 * core::mem::size_of::<usize>();

/// Sentinel stored in the bucket field while a page is not linked into any
/// superblock bucket (freshly mapped, not yet attached).
pub(crate) const DETACHED: usize = usize::MAX;

/// Handle to one OS page used by the small-object path. `BmPage`s are
/// exchanged between threads only while holding the superblock mutex or
/// after being exclusively detached from it, so a raw pointer is safe to
/// treat as `Send` under that discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct BmPage {
    base: NonNull<u8>,
}

unsafe impl Send for BmPage {}

impl BmPage {
    /// Wraps a raw, page-aligned, page-sized allocation as a `BmPage`.
    ///
    /// # Safety
    /// `base` must point to a writable region of at least `Geometry::page_size`
    /// bytes that nothing else is concurrently accessing.
    pub(crate) unsafe fn from_raw(base: NonNull<u8>) -> Self {
        BmPage { base }
    }

    pub(crate) fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub(crate) fn base_nonnull(&self) -> NonNull<u8> {
        self.base
    }

    fn field_ptr(&self, offset: usize) -> *mut usize {
        unsafe { self.base.as_ptr().add(offset).cast::<usize>() }
    }

    pub(crate) fn bucket(&self) -> usize {
        unsafe { *self.field_ptr(BUCKET_OFFSET) }
    }

    pub(crate) fn set_bucket(&self, k: usize) {
        unsafe { *self.field_ptr(BUCKET_OFFSET) = k };
    }

    pub(crate) fn next(&self) -> Option<BmPage> {
        let raw = unsafe { *self.field_ptr(NEXT_OFFSET) };
        NonNull::new(raw as *mut u8).map(|base| BmPage { base })
    }

    pub(crate) fn set_next(&self, page: Option<BmPage>) {
        let raw = page.map_or(0, |p| p.addr());
        unsafe { *self.field_ptr(NEXT_OFFSET) = raw };
    }

    pub(crate) fn prev(&self) -> Option<BmPage> {
        let raw = unsafe { *self.field_ptr(PREV_OFFSET) };
        NonNull::new(raw as *mut u8).map(|base| BmPage { base })
    }

    pub(crate) fn set_prev(&self, page: Option<BmPage>) {
        let raw = page.map_or(0, |p| p.addr());
        unsafe { *self.field_ptr(PREV_OFFSET) = raw };
    }

    fn bitmap_ptr(&self) -> *mut Word {
        unsafe { self.base.as_ptr().add(BITMAP_OFFSET).cast::<Word>() }
    }

    fn bitmap(&self, g: &Geometry) -> &[Word] {
        unsafe { slice::from_raw_parts(self.bitmap_ptr(), g.bitmap_words) }
    }

    #[allow(clippy::mut_from_ref)]
    fn bitmap_mut(&self, g: &Geometry) -> &mut [Word] {
        unsafe { slice::from_raw_parts_mut(self.bitmap_ptr(), g.bitmap_words) }
    }

    /// Lays out a freshly mapped page: detaches it, clears the bitmap, marks
    /// the header units and any bitmap padding bits past `units_per_page`
    /// permanently in use (so the tail padding of the last bitmap word, if
    /// any, is never handed out).
    pub(crate) fn init_header(&self, g: &Geometry) {
        self.set_bucket(DETACHED);
        self.set_next(None);
        self.set_prev(None);

        let bitmap = self.bitmap_mut(g);
        clear_bits(bitmap, 0, g.bitmap_words * WORD_BITS);
        set_bits(bitmap, 0, g.header_units);

        let total_bits = g.bitmap_words * WORD_BITS;
        if total_bits > g.units_per_page {
            set_bits(bitmap, g.units_per_page, total_bits - g.units_per_page);
        }
    }

    /// Lowest offset `>= header_units` at which `n` consecutive 0-bits
    /// begin, or 0 if none exists (0 can never be a legal small-block
    /// offset: the header occupies the prefix).
    pub(crate) fn find_free_block(&self, g: &Geometry, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let bitmap = self.bitmap(g);
        let mut offset = g.header_units;
        while offset < g.units_per_page {
            let zeros = count_zero_bits(bitmap, offset, n);
            if zeros >= n {
                return offset;
            }
            offset += zeros;
            if offset >= g.units_per_page {
                break;
            }
            offset += count_nonzero_bits(bitmap, offset, 1);
        }
        0
    }

    /// Maximum run of consecutive 0-bits anywhere in the data area.
    pub(crate) fn find_longest_free_block(&self, g: &Geometry) -> usize {
        let bitmap = self.bitmap(g);
        let mut offset = g.header_units;
        let mut longest = 0usize;
        while offset < g.units_per_page {
            let zeros = count_zero_bits(bitmap, offset, g.units_per_page - offset);
            longest = longest.max(zeros);
            offset += zeros;
            if offset >= g.units_per_page {
                break;
            }
            offset += count_nonzero_bits(bitmap, offset, 1);
        }
        longest
    }

    pub(crate) fn mark_allocated(&self, g: &Geometry, offset: usize, n: usize) {
        set_bits(self.bitmap_mut(g), offset, n);
    }

    pub(crate) fn mark_free(&self, g: &Geometry, offset: usize, n: usize) {
        clear_bits(self.bitmap_mut(g), offset, n);
    }

    /// Clears the tail `[offset+new_u, offset+old_u)`. Preconditions (caller
    /// enforced): `[offset, offset+old_u)` are all 1, `new_u < old_u`.
    pub(crate) fn shrink(&self, g: &Geometry, offset: usize, old_u: usize, new_u: usize) {
        debug_assert!(new_u < old_u);
        clear_bits(self.bitmap_mut(g), offset + new_u, old_u - new_u);
    }

    /// Attempts to extend an allocation in place. Succeeds only if the
    /// `new_u - old_u` units right after the block are all free, in which
    /// case they're marked in-use and `true` is returned; otherwise returns
    /// `false` without mutating anything.
    pub(crate) fn grow(&self, g: &Geometry, offset: usize, old_u: usize, new_u: usize) -> bool {
        debug_assert!(new_u > old_u);
        let extra = new_u - old_u;
        let available = count_zero_bits(self.bitmap(g), offset + old_u, extra);
        if available < extra {
            return false;
        }
        set_bits(self.bitmap_mut(g), offset + old_u, extra);
        true
    }

    /// Address of unit `offset` within this page's data area.
    pub(crate) fn unit_addr(&self, offset: usize) -> usize {
        self.addr() + offset * UNIT_SIZE
    }

    /// Renders the data-area bitmap as a `.`/`#` string for `dump()`.
    pub(crate) fn render(&self, g: &Geometry) -> String {
        let bitmap = self.bitmap(g);
        let mut s = String::with_capacity(g.units_per_page);
        let mut offset = g.header_units;
        while offset < g.units_per_page {
            let zeros = count_zero_bits(bitmap, offset, g.units_per_page - offset);
            for _ in 0..zeros {
                s.push('.');
            }
            offset += zeros;
            if offset >= g.units_per_page {
                break;
            }
            let ones = count_nonzero_bits(bitmap, offset, g.units_per_page - offset);
            for _ in 0..ones {
                s.push('#');
            }
            offset += ones;
        }
        s
    }
}
