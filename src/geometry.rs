//! Derives the per-page layout constants from the runtime OS page size.
//!
//! For a page size of 4096 and `UNIT_SIZE` 16 this works out to
//! `units_per_page = 256`, `header_units = 4`, `max_data_units = 252`; this
//! module computes the equivalent numbers for whatever page size `sysconf`
//! reports.

use crate::bitmap::{Word, WORD_BITS};
use crate::UNIT_SIZE;

/// Header fields stored ahead of the bitmap: bucket back-pointer, next, prev.
const HEADER_FIXED_WORDS: usize = 3;

#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    pub page_size: usize,
    pub units_per_page: usize,
    pub bitmap_words: usize,
    pub header_bytes: usize,
    pub header_units: usize,
    pub max_data_units: usize,
}

impl Geometry {
    pub(crate) fn compute(page_size: usize) -> Self {
        assert!(
            page_size % UNIT_SIZE == 0,
            "OS page size must be a multiple of UNIT_SIZE"
        );

        let units_per_page = page_size / UNIT_SIZE;
        let bitmap_words = units_per_page.div_ceil(WORD_BITS);
        let header_fixed_bytes = HEADER_FIXED_WORDS * core::mem::size_of::<usize>();
        let header_bytes = header_fixed_bytes + bitmap_words * core::mem::size_of::<Word>();
        let header_units = header_bytes.div_ceil(UNIT_SIZE);
        let max_data_units = units_per_page - header_units;

        Geometry {
            page_size,
            units_per_page,
            bitmap_words,
            header_bytes,
            header_units,
            max_data_units,
        }
    }
}
