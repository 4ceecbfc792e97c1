/// Top-level routing: decides between the bitmap path and the direct-map
/// path on allocate, and implements every reallocate case described for
/// this allocator.
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::lifecycle;
use crate::mapping::{self, MapError};
use crate::page::{Geometry, PageHeader};
use crate::superblock::Superblock;
use crate::units::{align_up, bytes_to_units, UNIT_SIZE};

#[derive(Debug)]
pub enum AllocatorError {
    InvalidArgument,
    OutOfMemory,
}

impl fmt::Display for AllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocatorError::InvalidArgument => write!(f, "invalid argument"),
            AllocatorError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for AllocatorError {}

impl From<MapError> for AllocatorError {
    fn from(_: MapError) -> Self {
        AllocatorError::OutOfMemory
    }
}

/// A snapshot of the allocator's observational counters. Updated with
/// relaxed atomics; they take no part in correctness.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    pub blocks_allocated: usize,
    pub num_bm_pages: usize,
    pub blocks_mapped: usize,
}

/// The bitmap sub-allocator. One instance owns one superblock and serves
/// both the small-block (bitmap) and large-block (direct-map) paths.
pub struct BitmapAllocator {
    geometry: Geometry,
    superblock: Superblock,
    blocks_allocated: AtomicUsize,
    num_bm_pages: AtomicUsize,
    blocks_mapped: AtomicUsize,
}

unsafe impl Send for BitmapAllocator {}
unsafe impl Sync for BitmapAllocator {}

impl BitmapAllocator {
    /// Query the page size, map the superblock page, and compute geometry.
    /// Must be called once, before any other operation.
    pub fn init() -> Result<Self, AllocatorError> {
        let page_size = mapping::page_size();
        let geometry = Geometry::compute(page_size);
        let sb_base = mapping::map(page_size)?;
        let superblock = unsafe { Superblock::new(sb_base, geometry.max_data_units + 1) };
        log::debug!(
            "bitmap allocator initialized: page_size={} units_per_page={} H={} D={}",
            geometry.page_size,
            geometry.units_per_page,
            geometry.header_units,
            geometry.max_data_units
        );
        Ok(BitmapAllocator {
            geometry,
            superblock,
            blocks_allocated: AtomicUsize::new(0),
            num_bm_pages: AtomicUsize::new(0),
            blocks_mapped: AtomicUsize::new(0),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn stats(&self) -> Stats {
        Stats {
            blocks_allocated: self.blocks_allocated.load(Ordering::Relaxed),
            num_bm_pages: self.num_bm_pages.load(Ordering::Relaxed),
            blocks_mapped: self.blocks_mapped.load(Ordering::Relaxed),
        }
    }

    /// Writes a short human-readable snapshot. Not required to be
    /// race-free: the counters are read independently of one another.
    pub fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        let s = self.stats();
        writeln!(
            w,
            "bmalloc: {} live small blocks, {} bitmap pages, {} direct-mapped blocks",
            s.blocks_allocated, s.num_bm_pages, s.blocks_mapped
        )
    }

    /// `nbytes == 0` is the only invalid-argument case; returns null.
    pub fn allocate(&self, nbytes: usize, clean: bool) -> *mut u8 {
        if nbytes == 0 {
            return ptr::null_mut();
        }
        let k = bytes_to_units(nbytes);
        if k < self.geometry.max_data_units {
            self.allocate_small(k, clean).unwrap_or(ptr::null_mut())
        } else {
            self.allocate_direct(nbytes, clean).unwrap_or(ptr::null_mut())
        }
    }

    fn allocate_small(&self, k: usize, clean: bool) -> Option<*mut u8> {
        let page = self
            .superblock
            .find_available_page(k, self.geometry.max_data_units)
            .or_else(|| self.new_bitmap_page())?;
        let offset = unsafe { lifecycle::allocate_in_page(page, &self.geometry, &self.superblock, k, clean) };
        self.blocks_allocated.fetch_add(1, Ordering::Relaxed);
        Some(unsafe { (page as *mut u8).add(offset * UNIT_SIZE) })
    }

    fn new_bitmap_page(&self) -> Option<*mut PageHeader> {
        let raw = mapping::map(self.geometry.page_size).ok()?;
        let page = raw as *mut PageHeader;
        unsafe { PageHeader::init(page, &self.geometry) };
        self.num_bm_pages.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    fn allocate_direct(&self, nbytes: usize, clean: bool) -> Option<*mut u8> {
        let len = align_up(nbytes, self.geometry.page_size);
        let addr = mapping::map(len).ok()?;
        // A fresh mapping is already zero on first touch; no cleanse needed
        // regardless of `clean` (only remap-following-unmap may come back
        // dirty, per the zeroing policy).
        let _ = clean;
        self.blocks_mapped.fetch_add(1, Ordering::Relaxed);
        Some(addr)
    }

    /// `addr == null` is a no-op. `nbytes` must match the most recent
    /// allocate/reallocate call for this address.
    pub fn release(&self, addr: *mut u8, nbytes: usize) {
        if addr.is_null() {
            return;
        }
        let page_size = self.geometry.page_size;
        let base = lifecycle::page_base(addr, page_size);
        if addr == base {
            let len = align_up(nbytes, page_size);
            unsafe { mapping::unmap(addr, len) };
            self.blocks_mapped.fetch_sub(1, Ordering::Relaxed);
        } else {
            let page = base as *mut PageHeader;
            let offset = lifecycle::unit_offset(addr, base);
            let k = bytes_to_units(nbytes);
            let emptied = unsafe { lifecycle::release_in_page(page, &self.geometry, &self.superblock, offset, k) };
            self.blocks_allocated.fetch_sub(1, Ordering::Relaxed);
            if emptied {
                self.num_bm_pages.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Implements every documented reallocate case. On failure, `*addr_slot`
    /// and `*addr_changed` are left untouched apart from `addr_changed`
    /// being set to `false`.
    pub fn reallocate(
        &self,
        addr_slot: &mut *mut u8,
        old_nbytes: usize,
        new_nbytes: usize,
        clean: bool,
        addr_changed: &mut bool,
    ) -> bool {
        *addr_changed = false;

        if addr_slot.is_null() {
            if old_nbytes != 0 {
                return false;
            }
            let new_addr = self.allocate(new_nbytes, clean);
            if new_addr.is_null() {
                return false;
            }
            *addr_slot = new_addr;
            *addr_changed = true;
            return true;
        }

        let addr = *addr_slot;
        let page_size = self.geometry.page_size;
        let old_is_small = (addr as usize) % page_size != 0;

        let k_old = bytes_to_units(old_nbytes);
        let k_new = bytes_to_units(new_nbytes);

        // Case 1: same unit count regardless of tier — no resize needed.
        if k_old == k_new {
            if clean && new_nbytes > old_nbytes {
                unsafe { mapping::cleanse(addr.add(old_nbytes), new_nbytes - old_nbytes) };
            }
            return true;
        }

        let new_is_small = k_new < self.geometry.max_data_units;

        if k_new < k_old {
            self.reallocate_shrink(addr_slot, addr, old_nbytes, new_nbytes, old_is_small, new_is_small, k_old, k_new, clean)
        } else {
            self.reallocate_grow(addr_slot, addr, old_nbytes, new_nbytes, old_is_small, new_is_small, k_old, k_new, clean, addr_changed)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reallocate_shrink(
        &self,
        addr_slot: &mut *mut u8,
        addr: *mut u8,
        old_nbytes: usize,
        new_nbytes: usize,
        old_is_small: bool,
        new_is_small: bool,
        k_old: usize,
        k_new: usize,
        clean: bool,
    ) -> bool {
        let page_size = self.geometry.page_size;

        if old_is_small {
            // Case 3: shrink, small -> small.
            let base = lifecycle::page_base(addr, page_size);
            let page = base as *mut PageHeader;
            let offset = lifecycle::unit_offset(addr, base);
            unsafe { lifecycle::shrink_in_page(page, &self.geometry, &self.superblock, offset, k_old, k_new) };
            return true;
        }

        if new_is_small {
            // Case 4: shrink, old direct-mapped, new small.
            if let Some(new_addr) = self.allocate_small(k_new, clean) {
                unsafe { ptr::copy_nonoverlapping(addr, new_addr, new_nbytes) };
                let old_len = align_up(old_nbytes, page_size);
                unsafe { mapping::unmap(addr, old_len) };
                self.blocks_mapped.fetch_sub(1, Ordering::Relaxed);
                *addr_slot = new_addr;
                return true;
            }
            // Falls through to the remap path below. Source quirk preserved:
            // `clean` is not honored on this fallback (shrink exposes no
            // new bytes regardless, so this has no observable effect).
        }

        // Case 5 (and case 4's fallback): shrink-remap a direct-mapped block.
        let old_len = align_up(old_nbytes, page_size);
        let new_len = align_up(new_nbytes, page_size);
        match unsafe { mapping::remap(addr, old_len, new_len, false) } {
            Ok(_) => true,
            Err(_) => {
                // Remap-failure on shrink is tolerated: the OS did not
                // release the tail, but the original mapping remains
                // valid at its old size, so this is not reported as
                // failure to the caller.
                log::debug!("shrink-remap of {:p} failed; retaining original mapping", addr);
                true
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn reallocate_grow(
        &self,
        addr_slot: &mut *mut u8,
        addr: *mut u8,
        old_nbytes: usize,
        new_nbytes: usize,
        old_is_small: bool,
        new_is_small: bool,
        k_old: usize,
        k_new: usize,
        clean: bool,
        addr_changed: &mut bool,
    ) -> bool {
        let page_size = self.geometry.page_size;

        if old_is_small && new_is_small {
            // Case 6: grow, both small.
            let base = lifecycle::page_base(addr, page_size);
            let page = base as *mut PageHeader;
            let offset = lifecycle::unit_offset(addr, base);
            let grew = unsafe {
                lifecycle::grow_in_page(page, &self.geometry, &self.superblock, offset, k_old, k_new)
            };
            if grew {
                if clean {
                    unsafe { mapping::cleanse(addr.add(old_nbytes), new_nbytes - old_nbytes) };
                }
                return true;
            }
            return self.relocate_grow(addr_slot, addr, old_nbytes, new_nbytes, clean, addr_changed);
        }

        if old_is_small {
            // Case 7: grow, crossing from small to direct-mapped.
            return self.relocate_grow(addr_slot, addr, old_nbytes, new_nbytes, clean, addr_changed);
        }

        // Case 8: grow, both direct-mapped.
        let old_len = align_up(old_nbytes, page_size);
        let new_len = align_up(new_nbytes, page_size);
        match unsafe { mapping::remap(addr, old_len, new_len, true) } {
            Ok(new_addr) => {
                if clean {
                    unsafe { mapping::cleanse(new_addr.add(old_nbytes), new_nbytes - old_nbytes) };
                }
                if new_addr != addr {
                    *addr_slot = new_addr;
                    *addr_changed = true;
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Allocate a new block, copy the old payload, release the old block,
    /// and optionally zero the newly exposed tail. Shared by the two grow
    /// cases that cross from small to direct-mapped or that were refused
    /// in-place growth.
    fn relocate_grow(
        &self,
        addr_slot: &mut *mut u8,
        old_addr: *mut u8,
        old_nbytes: usize,
        new_nbytes: usize,
        clean: bool,
        addr_changed: &mut bool,
    ) -> bool {
        let new_addr = self.allocate(new_nbytes, false);
        if new_addr.is_null() {
            return false;
        }
        unsafe {
            ptr::copy_nonoverlapping(old_addr, new_addr, old_nbytes);
            if clean {
                mapping::cleanse(new_addr.add(old_nbytes), new_nbytes - old_nbytes);
            }
        }
        self.release(old_addr, old_nbytes);
        *addr_slot = new_addr;
        *addr_changed = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tiny_allocation_round_trips() {
        let alloc = BitmapAllocator::init().unwrap();
        let p = alloc.allocate(1, true);
        assert!(!p.is_null());
        assert_ne!((p as usize) % alloc.geometry().page_size, 0);
        unsafe { assert_eq!(*p, 0) };
        alloc.release(p, 1);
    }

    #[test]
    fn exact_threshold_goes_direct_mapped() {
        let alloc = BitmapAllocator::init().unwrap();
        let nbytes = alloc.geometry().max_data_units * UNIT_SIZE;
        let p = alloc.allocate(nbytes, false);
        assert!(!p.is_null());
        assert_eq!((p as usize) % alloc.geometry().page_size, 0);
        alloc.release(p, nbytes);
    }

    #[test]
    fn below_threshold_goes_small() {
        let alloc = BitmapAllocator::init().unwrap();
        let nbytes = (alloc.geometry().max_data_units - 1) * UNIT_SIZE;
        let p = alloc.allocate(nbytes, false);
        assert!(!p.is_null());
        assert_ne!((p as usize) % alloc.geometry().page_size, 0);
        alloc.release(p, nbytes);
    }

    #[test]
    fn grow_small_to_direct_mapped_relocates() {
        let alloc = BitmapAllocator::init().unwrap();
        let mut addr = alloc.allocate(16, false);
        unsafe { *addr = 0x42 };
        let old_nbytes = 16;
        let new_nbytes = alloc.geometry().max_data_units * UNIT_SIZE;
        let mut changed = false;
        let ok = alloc.reallocate(&mut addr, old_nbytes, new_nbytes, false, &mut changed);
        assert!(ok);
        assert!(changed);
        assert_eq!((addr as usize) % alloc.geometry().page_size, 0);
        assert_eq!(unsafe { *addr }, 0x42);
        alloc.release(addr, new_nbytes);
    }

    #[test]
    fn shrink_direct_mapped_to_small_relocates() {
        let alloc = BitmapAllocator::init().unwrap();
        let old_nbytes = alloc.geometry().max_data_units * UNIT_SIZE;
        let mut addr = alloc.allocate(old_nbytes, false);
        unsafe { *addr = 0x99 };
        let new_nbytes = 16;
        let mut changed = false;
        let ok = alloc.reallocate(&mut addr, old_nbytes, new_nbytes, false, &mut changed);
        assert!(ok);
        assert_ne!((addr as usize) % alloc.geometry().page_size, 0);
        assert_eq!(unsafe { *addr }, 0x99);
        alloc.release(addr, new_nbytes);
    }

    #[test]
    fn page_is_reclaimed_once_emptied() {
        let alloc = BitmapAllocator::init().unwrap();
        let before = alloc.stats().num_bm_pages;
        let p = alloc.allocate(16, false);
        assert_eq!(alloc.stats().num_bm_pages, before + 1);
        alloc.release(p, 16);
        assert_eq!(alloc.stats().num_bm_pages, before);
    }

    #[test]
    fn fragmentation_aware_placement_reuses_freed_gap() {
        let alloc = BitmapAllocator::init().unwrap();
        let a = alloc.allocate(32, false);
        let b = alloc.allocate(32, false);
        let c = alloc.allocate(32, false);
        alloc.release(b, 32);
        let d = alloc.allocate(32, false);
        assert_eq!(d, b, "freed gap should be reused before extending the page");
        alloc.release(a, 32);
        alloc.release(c, 32);
        alloc.release(d, 32);
    }

    #[test]
    fn concurrent_allocate_release_yields_distinct_live_addresses() {
        let alloc = Arc::new(BitmapAllocator::init().unwrap());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let alloc = Arc::clone(&alloc);
            handles.push(thread::spawn(move || {
                let mut addrs = Vec::new();
                for _ in 0..64 {
                    addrs.push(alloc.allocate(32, false) as usize);
                }
                for &a in &addrs {
                    alloc.release(a as *mut u8, 32);
                }
                addrs
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for a in h.join().unwrap() {
                assert_ne!(a, 0);
                seen.insert(a);
            }
        }
    }
}
