use std::ops::Range;

use bitvec::prelude::{BitVec, Lsb0};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Dirty bitmap over fixed-size pages of a byte range.
///
/// The page table only grows: `accommodate` extends it, nothing shrinks it.
#[derive(Debug, Clone)]
pub struct PageManager {
    page_size: usize,
    // dirty_bits.len() == page count
    dirty_bits: BitVec<usize, Lsb0>,
    dirty_count: usize,
}

impl PageManager {
    pub fn new(page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be greater than zero");
        Self {
            page_size,
            dirty_bits: BitVec::new(),
            dirty_count: 0,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.dirty_bits.len()
    }

    /// Bytes covered by the current page table.
    pub fn covered_size(&self) -> usize {
        self.page_count() * self.page_size
    }

    pub fn pages_for_size(&self, size: usize) -> usize {
        size.div_ceil(self.page_size)
    }

    /// Grows the page table to cover `size` bytes and returns the covered size.
    pub fn accommodate(&mut self, size: usize) -> usize {
        let pages = self.pages_for_size(size);
        if pages > self.dirty_bits.len() {
            self.dirty_bits.resize(pages, false);
        }
        self.covered_size()
    }

    pub fn mark_region(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let end = offset + len;
        self.accommodate(end);
        let first_page = offset / self.page_size;
        let last_page = (end - 1) / self.page_size;
        for page in first_page..=last_page {
            self.mark_page(page);
        }
    }

    pub fn mark_pages(&mut self, pages: &[usize]) {
        for &page in pages {
            if page >= self.dirty_bits.len() {
                self.dirty_bits.resize(page + 1, false);
            }
            self.mark_page(page);
        }
    }

    fn mark_page(&mut self, page: usize) {
        let was_dirty = self.dirty_bits[page];
        self.dirty_bits.set(page, true);
        self.dirty_count += !was_dirty as usize;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_count > 0
    }

    pub fn is_page_dirty(&self, page: usize) -> bool {
        self.dirty_bits.get(page).is_some_and(|bit| *bit)
    }

    pub fn dirty_page_count(&self) -> usize {
        self.dirty_count
    }

    /// Sorted indices of dirty pages.
    pub fn marked_pages(&self) -> Vec<usize> {
        self.dirty_bits.iter_ones().collect()
    }

    /// Sorted indices of dirty pages; clears every mark.
    pub fn take_marked_pages(&mut self) -> Vec<usize> {
        let pages = self.marked_pages();
        self.clear();
        pages
    }

    pub fn clear(&mut self) {
        self.dirty_bits.fill(false);
        self.dirty_count = 0;
    }

    pub fn page_range(&self, page: usize) -> Range<usize> {
        let start = page * self.page_size;
        start..start + self.page_size
    }
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}
