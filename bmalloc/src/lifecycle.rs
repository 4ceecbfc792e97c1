/// Page-lifecycle operations: allocate, shrink, grow and release within one
/// bitmap page. Each of these (other than `allocate_in_page`) begins by
/// detaching the page from the superblock itself; `allocate_in_page`
/// instead requires its caller to have already detached the page (the
/// contract `Superblock::find_available_page` establishes).
use crate::mapping;
use crate::page::{self, Geometry, PageHeader};
use crate::superblock::Superblock;
use crate::units::UNIT_SIZE;
use crate::{bitmap, units};

#[inline]
unsafe fn unit_addr(page: *mut PageHeader, offset: usize) -> *mut u8 {
    (page as *mut u8).add(offset * UNIT_SIZE)
}

/// Claim `k` units on an already-detached page, re-link it under its new
/// LFR, and return the unit offset of the claimed run.
///
/// # Safety
/// `page` must be a live bitmap page, currently detached from `superblock`.
pub unsafe fn allocate_in_page(
    page: *mut PageHeader,
    geometry: &Geometry,
    superblock: &Superblock,
    k: usize,
    clean: bool,
) -> usize {
    let offset = page::find_free_run(page, geometry, k);
    assert_ne!(
        offset, 0,
        "page selected by find_available_page has no free run of {} units",
        k
    );

    let bits = PageHeader::bitmap_mut(page, geometry);
    bitmap::set_range(bits, offset, k);

    let lfr = page::find_longest_free_run(page, geometry);
    superblock.insert(page, lfr);

    if clean {
        mapping::cleanse(unit_addr(page, offset), k * UNIT_SIZE);
    }

    offset
}

/// Shrink an in-use run from `old_k` to `new_k` units, freeing the tail.
///
/// # Safety
/// `page` must be a live bitmap page currently linked into `superblock`,
/// and `[offset, offset + old_k)` must be the in-use run being resized.
pub unsafe fn shrink_in_page(
    page: *mut PageHeader,
    geometry: &Geometry,
    superblock: &Superblock,
    offset: usize,
    old_k: usize,
    new_k: usize,
) {
    superblock.remove(page);
    let bits = PageHeader::bitmap_mut(page, geometry);
    bitmap::clear_range(bits, offset + new_k, old_k - new_k);
    let lfr = page::find_longest_free_run(page, geometry);
    superblock.insert(page, lfr);
}

/// Attempt to grow an in-use run from `old_k` to `new_k` units in place.
/// Returns `false` if the trailing free run is too short; in that case the
/// page is re-inserted under its (unchanged) LFR before returning, and no
/// lock is left held or double-released regardless of outcome.
///
/// # Safety
/// Same preconditions as [`shrink_in_page`].
pub unsafe fn grow_in_page(
    page: *mut PageHeader,
    geometry: &Geometry,
    superblock: &Superblock,
    offset: usize,
    old_k: usize,
    new_k: usize,
) -> bool {
    superblock.remove(page);

    let needed = new_k - old_k;
    let available = {
        let bits = PageHeader::bitmap(page, geometry);
        bitmap::count_zero_run(bits, geometry.units_per_page, offset + old_k, needed)
    };

    if available < needed {
        let lfr = page::find_longest_free_run(page, geometry);
        superblock.insert(page, lfr);
        return false;
    }

    let bits = PageHeader::bitmap_mut(page, geometry);
    bitmap::set_range(bits, offset + old_k, needed);
    let lfr = page::find_longest_free_run(page, geometry);
    superblock.insert(page, lfr);
    true
}

/// Release an in-use run of `k` units at `offset`. Returns `true` if the
/// page became entirely empty and was unmapped as a result (invariant 4: a
/// page with LFR == D never persists).
///
/// # Safety
/// Same preconditions as [`shrink_in_page`]; `page` must not be touched by
/// any other thread after this call returns `true`.
pub unsafe fn release_in_page(
    page: *mut PageHeader,
    geometry: &Geometry,
    superblock: &Superblock,
    offset: usize,
    k: usize,
) -> bool {
    superblock.remove(page);
    let bits = PageHeader::bitmap_mut(page, geometry);
    bitmap::clear_range(bits, offset, k);

    let lfr = page::find_longest_free_run(page, geometry);
    if lfr == geometry.max_data_units {
        mapping::unmap(page as *mut u8, geometry.page_size);
        true
    } else {
        superblock.insert(page, lfr);
        false
    }
}

/// Address-to-offset helper shared by the top-level dispatch: computes the
/// containing page base for a small-block address.
pub fn page_base(addr: *mut u8, page_size: usize) -> *mut u8 {
    units::align_down(addr as usize, page_size) as *mut u8
}

pub fn unit_offset(addr: *mut u8, base: *mut u8) -> usize {
    (addr as usize - base as usize) / UNIT_SIZE
}
