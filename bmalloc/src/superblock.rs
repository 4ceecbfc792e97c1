/// The longest-free-run index: one OS page of list-head pointers, one slot
/// per possible LFR value, threading together every bitmap page that
/// currently has that longest free run.
///
/// The lock guards only list link/unlink; it is never held across a bit
/// scan, set/clear, or the cleanse pass (see the crate's concurrency notes).
/// Because `UNIT_SIZE` (16) is twice the pointer width (8) on every hosted
/// target this crate supports, `D + 1` pointers always fit inside a single
/// page with room to spare.
use spin::Mutex;

use crate::page::PageHeader;

pub struct Superblock {
    lock: Mutex<()>,
    slots: *mut *mut PageHeader,
    num_slots: usize,
}

// Safety: `slots` points at a page this allocator owns exclusively for
// process lifetime; all access to it goes through `lock`.
unsafe impl Send for Superblock {}
unsafe impl Sync for Superblock {}

impl Superblock {
    /// # Safety
    /// `base` must point to a live, zeroed, page-sized mapping holding at
    /// least `num_slots` pointer-sized slots, owned by this allocator for
    /// the remainder of the process's lifetime.
    pub unsafe fn new(base: *mut u8, num_slots: usize) -> Self {
        Superblock {
            lock: Mutex::new(()),
            slots: base as *mut *mut PageHeader,
            num_slots,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    #[inline]
    unsafe fn slot(&self, k: usize) -> *mut *mut PageHeader {
        debug_assert!(k < self.num_slots);
        self.slots.add(k)
    }

    /// Link `page` into slot `k`.
    ///
    /// # Safety
    /// `page` must be a live, currently-unlinked bitmap page header.
    pub unsafe fn insert(&self, page: *mut PageHeader, k: usize) {
        let _guard = self.lock.lock();
        self.insert_locked(page, k);
    }

    unsafe fn insert_locked(&self, page: *mut PageHeader, k: usize) {
        let slot = self.slot(k);
        let head = *slot;
        if head.is_null() {
            (*page).next = page;
            (*page).prev = page;
            *slot = page;
        } else {
            let tail = (*head).prev;
            (*page).next = head;
            (*page).prev = tail;
            (*tail).next = page;
            (*head).prev = page;
        }
        (*page).list = slot;
    }

    /// Unlink `page` from whichever slot it currently heads or belongs to.
    ///
    /// # Safety
    /// `page` must currently be linked into this superblock.
    pub unsafe fn remove(&self, page: *mut PageHeader) {
        let _guard = self.lock.lock();
        self.remove_locked(page);
    }

    unsafe fn remove_locked(&self, page: *mut PageHeader) {
        let slot = (*page).list;
        debug_assert!(!slot.is_null(), "page not linked into any superblock slot");
        if (*page).next == page {
            *slot = core::ptr::null_mut();
        } else {
            let next = (*page).next;
            let prev = (*page).prev;
            (*prev).next = next;
            (*next).prev = prev;
            if *slot == page {
                *slot = next;
            }
        }
        (*page).next = core::ptr::null_mut();
        (*page).prev = core::ptr::null_mut();
        (*page).list = core::ptr::null_mut();
    }

    /// Find a page whose LFR is at least `k`, detach it from the
    /// superblock, and return it. The caller owns it exclusively until it
    /// re-inserts it (or unmaps it) via this same `Superblock`.
    ///
    /// Slots at or above `max_data_units` are never populated (such pages
    /// are unmapped instead of re-indexed), so the scan stops just below it.
    pub fn find_available_page(&self, k: usize, max_data_units: usize) -> Option<*mut PageHeader> {
        let _guard = self.lock.lock();
        let mut idx = k;
        while idx < max_data_units {
            let slot = unsafe { self.slot(idx) };
            let head = unsafe { *slot };
            if !head.is_null() {
                unsafe { self.remove_locked(head) };
                return Some(head);
            }
            idx += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Geometry;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    struct TestPage {
        ptr: *mut PageHeader,
        layout: Layout,
    }

    impl TestPage {
        fn new() -> Self {
            let layout = Layout::from_size_align(4096, 4096).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) as *mut PageHeader };
            let geometry = Geometry::compute(4096);
            unsafe { PageHeader::init(ptr, &geometry) };
            TestPage { ptr, layout }
        }
    }

    impl Drop for TestPage {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr as *mut u8, self.layout) };
        }
    }

    fn new_superblock(num_slots: usize) -> (Superblock, Layout) {
        let layout = Layout::from_size_align(4096, 4096).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        (unsafe { Superblock::new(base, num_slots) }, layout)
    }

    #[test]
    fn insert_then_find_returns_same_page() {
        let (sb, _layout) = new_superblock(253);
        let page = TestPage::new();
        unsafe { sb.insert(page.ptr, 100) };
        let found = sb.find_available_page(50, 252).unwrap();
        assert_eq!(found, page.ptr);
    }

    #[test]
    fn find_available_page_detaches_from_slot() {
        let (sb, _layout) = new_superblock(253);
        let page = TestPage::new();
        unsafe { sb.insert(page.ptr, 100) };
        sb.find_available_page(0, 252).unwrap();
        assert!(sb.find_available_page(0, 252).is_none());
    }

    #[test]
    fn find_available_page_searches_upward() {
        let (sb, _layout) = new_superblock(253);
        let page = TestPage::new();
        unsafe { sb.insert(page.ptr, 100) };
        assert!(sb.find_available_page(200, 252).is_none());
        let found = sb.find_available_page(10, 252).unwrap();
        assert_eq!(found, page.ptr);
    }

    #[test]
    fn multiple_pages_in_same_slot_form_a_ring() {
        let (sb, _layout) = new_superblock(253);
        let a = TestPage::new();
        let b = TestPage::new();
        unsafe {
            sb.insert(a.ptr, 5);
            sb.insert(b.ptr, 5);
        }
        let first = sb.find_available_page(5, 252).unwrap();
        let second = sb.find_available_page(5, 252).unwrap();
        assert_ne!(first, second);
        assert!(sb.find_available_page(5, 252).is_none());
    }

    #[test]
    fn reinserting_after_detach_is_findable_again() {
        let (sb, _layout) = new_superblock(253);
        let page = TestPage::new();
        unsafe { sb.insert(page.ptr, 5) };
        let found = sb.find_available_page(0, 252).unwrap();
        unsafe { sb.insert(found, 7) };
        let found_again = sb.find_available_page(6, 252).unwrap();
        assert_eq!(found_again, page.ptr);
    }
}
