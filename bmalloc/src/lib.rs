/// Page-backed bitmap sub-allocator.
///
/// Small requests are served out of bitmap pages indexed by longest-free-run
/// (`superblock`); large requests are satisfied by mapping whole OS pages
/// directly (`mapping`). There is no per-block header: callers are
/// obligated to pass back the byte count given to the most recent
/// allocate/reallocate call for a block, same as the bare dispatch-table
/// interface in `interface`.
#![allow(clippy::missing_safety_doc)]

pub mod bitmap;
pub mod dispatch;
pub mod interface;
pub mod lifecycle;
pub mod mapping;
pub mod page;
pub mod superblock;
pub mod units;

pub use dispatch::{AllocatorError, BitmapAllocator, Stats};
pub use interface::{default_allocator, Backend, DebugBackend, SystemBackend};

use core::ptr::NonNull;

/// Safe-Rust handle pairing an address with the byte count the bare
/// interface requires callers to remember themselves. This is the typed
/// `{address, byte_count}` wrapper this design calls for in place of a bare
/// pointer, one layer above the dispatch-table ABI in `interface`/`dispatch`.
pub struct Block {
    addr: NonNull<u8>,
    len: usize,
}

impl Block {
    /// Allocate a block of `len` bytes from the process-wide default
    /// allocator. `clean` requests the returned bytes be zeroed.
    pub fn alloc(len: usize, clean: bool) -> Option<Block> {
        let addr = default_allocator().allocate(len, clean);
        NonNull::new(addr).map(|addr| Block { addr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.addr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.addr.as_ptr(), self.len) }
    }

    /// Resize in place where possible, relocating otherwise. Returns
    /// `false` (leaving `self` unchanged) only on allocation failure.
    pub fn resize(&mut self, new_len: usize, clean: bool) -> bool {
        let mut addr = self.addr.as_ptr();
        let mut changed = false;
        let ok = default_allocator().reallocate(&mut addr, self.len, new_len, clean, &mut changed);
        if ok {
            self.addr = NonNull::new(addr).expect("reallocate reported success with a null address");
            self.len = new_len;
        }
        ok
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        default_allocator().release(self.addr.as_ptr(), self.len);
    }
}

unsafe impl Send for Block {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_alloc_release_round_trip() {
        let block = Block::alloc(64, true).expect("allocation should succeed");
        assert_eq!(block.len(), 64);
        assert!(block.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn block_resize_preserves_payload() {
        let mut block = Block::alloc(16, false).expect("allocation should succeed");
        block.as_mut_slice().copy_from_slice(&[7u8; 16]);
        assert!(block.resize(64, false));
        assert_eq!(&block.as_slice()[..16], &[7u8; 16]);
    }
}
