/// Bitmap page layout and page-local bitmap scanning.
///
/// A bitmap page is one OS page: a fixed [`PageHeader`] (the `list`/`next`/
/// `prev` links into the superblock) immediately followed by the page's
/// bitmap, which covers every unit of the page including the header itself,
/// followed by the data area. The bitmap's length is a runtime quantity (it
/// depends on the queried page size), so it is addressed through raw pointer
/// arithmetic rather than a fixed-size Rust field, the same way the
/// reference layout uses a flexible array member.
use core::mem;
use core::slice;

use crate::bitmap;
use crate::units::{ceil_div, UNIT_SIZE, WORD_BITS};

/// Fixed prefix of every bitmap page: a backpointer to the superblock slot
/// currently indexing this page, plus the circular list links.
#[repr(C)]
pub struct PageHeader {
    /// Pointer to the superblock slot cell that currently indexes this page.
    pub list: *mut *mut PageHeader,
    pub next: *mut PageHeader,
    pub prev: *mut PageHeader,
}

// Safety: pages are only ever reachable by one thread at a time — either
// linked into the superblock (mutated only under the superblock lock) or
// detached and held exclusively by the thread that called
// `Superblock::find_available_page`.
unsafe impl Send for PageHeader {}
unsafe impl Sync for PageHeader {}

/// Layout geometry derived from the OS page size, computed once at init and
/// never recomputed afterward.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub page_size: usize,
    /// Total allocation units per page (`page_size / UNIT_SIZE`).
    pub units_per_page: usize,
    /// `H`: header units, pinned set from page construction onward.
    pub header_units: usize,
    /// `D`: usable data units (`units_per_page - header_units`).
    pub max_data_units: usize,
    /// Words needed to hold one bit per unit of the whole page.
    pub bitmap_words: usize,
}

impl Geometry {
    pub fn compute(page_size: usize) -> Self {
        let units_per_page = page_size / UNIT_SIZE;
        let bitmap_words = ceil_div(units_per_page, WORD_BITS);
        let bitmap_bytes = bitmap_words * mem::size_of::<u64>();
        let header_bytes = mem::size_of::<PageHeader>() + bitmap_bytes;
        let header_units = ceil_div(header_bytes, UNIT_SIZE);
        let max_data_units = units_per_page - header_units;
        Geometry {
            page_size,
            units_per_page,
            header_units,
            max_data_units,
            bitmap_words,
        }
    }
}

impl PageHeader {
    /// # Safety
    /// `page` must point to a live, page-sized mapping laid out per this
    /// module's doc comment, and `geometry` must be the geometry that
    /// mapping was constructed with.
    #[inline]
    unsafe fn bitmap_ptr(page: *mut PageHeader) -> *mut u64 {
        (page as *mut u8).add(mem::size_of::<PageHeader>()) as *mut u64
    }

    /// Borrow this page's bitmap as a word slice.
    ///
    /// # Safety
    /// Same preconditions as [`Self::bitmap_ptr`]; the caller must also
    /// ensure no other borrow of this page's bitmap is live (pages are
    /// exclusively owned once detached from the superblock, so this holds
    /// as long as callers respect that discipline).
    pub unsafe fn bitmap_mut<'a>(page: *mut PageHeader, geometry: &Geometry) -> &'a mut [u64] {
        slice::from_raw_parts_mut(Self::bitmap_ptr(page), geometry.bitmap_words)
    }

    /// # Safety
    /// Same as [`Self::bitmap_mut`], immutable borrow.
    pub unsafe fn bitmap<'a>(page: *mut PageHeader, geometry: &Geometry) -> &'a [u64] {
        slice::from_raw_parts(Self::bitmap_ptr(page), geometry.bitmap_words)
    }

    /// Initialize a freshly mapped page's header and pin its header bits set.
    ///
    /// # Safety
    /// `page` must point to a freshly mapped (zeroed), page-sized region.
    pub unsafe fn init(page: *mut PageHeader, geometry: &Geometry) {
        (*page).list = core::ptr::null_mut();
        (*page).next = core::ptr::null_mut();
        (*page).prev = core::ptr::null_mut();
        let bits = Self::bitmap_mut(page, geometry);
        bitmap::set_range(bits, 0, geometry.header_units);
    }
}

/// Scan from offset `H` for the first free run of at least `k` units.
/// Returns 0 if no such run exists in this page (0 can never be a
/// legitimate offset: the header bits are always set).
///
/// # Safety
/// `page` must be a live bitmap page laid out per `geometry`, exclusively
/// owned by the caller (detached from the superblock).
pub unsafe fn find_free_run(page: *mut PageHeader, geometry: &Geometry, k: usize) -> usize {
    let bits = PageHeader::bitmap(page, geometry);
    let mut pos = geometry.header_units;
    while pos < geometry.units_per_page {
        let zero_len = bitmap::count_zero_run(bits, geometry.units_per_page, pos, k);
        if zero_len >= k {
            return pos;
        }
        pos += zero_len;
        if pos >= geometry.units_per_page {
            break;
        }
        let one_len = bitmap::count_nonzero_run(bits, geometry.units_per_page, pos, k);
        pos += one_len;
    }
    0
}

/// Longest contiguous free run anywhere in the data area. Used to
/// re-index a page after any mutation of its bitmap.
///
/// # Safety
/// Same as [`find_free_run`].
pub unsafe fn find_longest_free_run(page: *mut PageHeader, geometry: &Geometry) -> usize {
    let bits = PageHeader::bitmap(page, geometry);
    let mut pos = geometry.header_units;
    let mut longest = 0usize;
    while pos < geometry.units_per_page {
        let zero_len = bitmap::count_zero_run(bits, geometry.units_per_page, pos, geometry.units_per_page);
        if zero_len > longest {
            longest = zero_len;
        }
        pos += zero_len;
        if pos >= geometry.units_per_page {
            break;
        }
        let one_len = bitmap::count_nonzero_run(bits, geometry.units_per_page, pos, geometry.units_per_page);
        pos += one_len;
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct TestPage {
        ptr: *mut PageHeader,
        geometry: Geometry,
        layout: Layout,
    }

    impl TestPage {
        fn new(page_size: usize) -> Self {
            let geometry = Geometry::compute(page_size);
            let layout = Layout::from_size_align(page_size, page_size).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) as *mut PageHeader };
            unsafe { PageHeader::init(ptr, &geometry) };
            TestPage { ptr, geometry, layout }
        }
    }

    impl Drop for TestPage {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr as *mut u8, self.layout) };
        }
    }

    #[test]
    fn fresh_page_geometry_matches_walkthrough() {
        let page = TestPage::new(4096);
        assert_eq!(page.geometry.units_per_page, 256);
        assert_eq!(page.geometry.header_units, 4);
        assert_eq!(page.geometry.max_data_units, 252);
    }

    #[test]
    fn find_free_run_on_fresh_page_starts_after_header() {
        let page = TestPage::new(4096);
        let offset = unsafe { find_free_run(page.ptr, &page.geometry, 1) };
        assert_eq!(offset, 4);
    }

    #[test]
    fn find_free_run_skips_occupied_prefix() {
        let page = TestPage::new(4096);
        unsafe {
            let bits = PageHeader::bitmap_mut(page.ptr, &page.geometry);
            bitmap::set_range(bits, 4, 6);
        }
        let offset = unsafe { find_free_run(page.ptr, &page.geometry, 1) };
        assert_eq!(offset, 10);
    }

    #[test]
    fn longest_free_run_on_fresh_page_is_whole_data_area() {
        let page = TestPage::new(4096);
        let lfr = unsafe { find_longest_free_run(page.ptr, &page.geometry) };
        assert_eq!(lfr, page.geometry.max_data_units);
    }

    #[test]
    fn longest_free_run_tracks_largest_gap() {
        let page = TestPage::new(4096);
        unsafe {
            let bits = PageHeader::bitmap_mut(page.ptr, &page.geometry);
            // Units 4..10 used, 10..20 free, 20..30 used, 30..256 free (226 units).
            bitmap::set_range(bits, 4, 6);
            bitmap::set_range(bits, 20, 10);
        }
        let lfr = unsafe { find_longest_free_run(page.ptr, &page.geometry) };
        assert_eq!(lfr, 226);
    }
}
