/// The pluggable allocator interface: a common `Backend` trait standing in
/// for the dispatch table, plus the two trivial backends that round out the
/// interface's generality (system pass-through, debug guard-byte wrapper).
///
/// A trait object (`&dyn Backend`) is this crate's expression of "a table of
/// operations chosen at process start and assigned to a process-wide
/// default slot" — the vtable behind a trait object is exactly that
/// dispatch table, just built by the compiler instead of by hand.
use core::fmt;
use core::ptr;
use spin::Once;

use crate::dispatch::{BitmapAllocator, Stats};

pub trait Backend: Send + Sync {
    fn allocate(&self, nbytes: usize, clean: bool) -> *mut u8;
    fn reallocate(&self, addr_slot: &mut *mut u8, old_nbytes: usize, new_nbytes: usize, clean: bool, addr_changed: &mut bool) -> bool;
    fn release(&self, addr: *mut u8, nbytes: usize);
    fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result;
    fn stats(&self) -> Stats;
}

impl Backend for BitmapAllocator {
    fn allocate(&self, nbytes: usize, clean: bool) -> *mut u8 {
        BitmapAllocator::allocate(self, nbytes, clean)
    }

    fn reallocate(&self, addr_slot: &mut *mut u8, old_nbytes: usize, new_nbytes: usize, clean: bool, addr_changed: &mut bool) -> bool {
        BitmapAllocator::reallocate(self, addr_slot, old_nbytes, new_nbytes, clean, addr_changed)
    }

    fn release(&self, addr: *mut u8, nbytes: usize) {
        BitmapAllocator::release(self, addr, nbytes)
    }

    fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        BitmapAllocator::dump(self, w)
    }

    fn stats(&self) -> Stats {
        BitmapAllocator::stats(self)
    }
}

/// Thin pass-through to the host C allocator. Illustrates the interface's
/// shape without the bitmap machinery; not the subject of this crate.
pub struct SystemBackend;

unsafe impl Send for SystemBackend {}
unsafe impl Sync for SystemBackend {}

impl Backend for SystemBackend {
    fn allocate(&self, nbytes: usize, _clean: bool) -> *mut u8 {
        if nbytes == 0 {
            return ptr::null_mut();
        }
        unsafe { libc::malloc(nbytes) as *mut u8 }
    }

    fn reallocate(&self, addr_slot: &mut *mut u8, _old_nbytes: usize, new_nbytes: usize, _clean: bool, addr_changed: &mut bool) -> bool {
        *addr_changed = false;
        if new_nbytes == 0 {
            return false;
        }
        let new_addr = unsafe { libc::realloc(addr_slot.cast(), new_nbytes) as *mut u8 };
        if new_addr.is_null() {
            return false;
        }
        if new_addr != *addr_slot {
            *addr_changed = true;
        }
        *addr_slot = new_addr;
        true
    }

    fn release(&self, addr: *mut u8, _nbytes: usize) {
        if !addr.is_null() {
            unsafe { libc::free(addr.cast()) };
        }
    }

    fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "system backend: pass-through to libc malloc/realloc/free")
    }

    fn stats(&self) -> Stats {
        Stats::default()
    }
}

const GUARD_LEN: usize = 16;
const GUARD_BYTE: u8 = 0xA5;

/// Wraps an inner backend, padding every block with `GUARD_LEN` guard
/// bytes on each side and verifying them before handing the block back to
/// the inner backend. A corrupted guard is an invariant violation and is
/// fatal, matching the error-handling design's treatment of invariant
/// violations elsewhere in this crate.
pub struct DebugBackend<B: Backend> {
    inner: B,
}

impl<B: Backend> DebugBackend<B> {
    pub fn new(inner: B) -> Self {
        DebugBackend { inner }
    }

    fn check_guards(&self, addr: *mut u8, nbytes: usize) {
        unsafe {
            let head = addr.sub(GUARD_LEN);
            for i in 0..GUARD_LEN {
                assert_eq!(*head.add(i), GUARD_BYTE, "guard corruption before block at {:p}", addr);
            }
            let tail = addr.add(nbytes);
            for i in 0..GUARD_LEN {
                assert_eq!(*tail.add(i), GUARD_BYTE, "guard corruption after block at {:p}", addr);
            }
        }
    }
}

impl<B: Backend> Backend for DebugBackend<B> {
    fn allocate(&self, nbytes: usize, clean: bool) -> *mut u8 {
        if nbytes == 0 {
            return ptr::null_mut();
        }
        let padded = self.inner.allocate(nbytes + 2 * GUARD_LEN, clean);
        if padded.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ptr::write_bytes(padded, GUARD_BYTE, GUARD_LEN);
            ptr::write_bytes(padded.add(GUARD_LEN + nbytes), GUARD_BYTE, GUARD_LEN);
            padded.add(GUARD_LEN)
        }
    }

    fn reallocate(&self, addr_slot: &mut *mut u8, old_nbytes: usize, new_nbytes: usize, clean: bool, addr_changed: &mut bool) -> bool {
        if !addr_slot.is_null() {
            self.check_guards(*addr_slot, old_nbytes);
        }
        let mut padded_slot = if addr_slot.is_null() {
            ptr::null_mut()
        } else {
            unsafe { addr_slot.sub(GUARD_LEN) }
        };
        let ok = self.inner.reallocate(
            &mut padded_slot,
            if old_nbytes == 0 { 0 } else { old_nbytes + 2 * GUARD_LEN },
            new_nbytes + 2 * GUARD_LEN,
            clean,
            addr_changed,
        );
        if ok {
            unsafe {
                ptr::write_bytes(padded_slot, GUARD_BYTE, GUARD_LEN);
                ptr::write_bytes(padded_slot.add(GUARD_LEN + new_nbytes), GUARD_BYTE, GUARD_LEN);
                *addr_slot = padded_slot.add(GUARD_LEN);
            }
        }
        ok
    }

    fn release(&self, addr: *mut u8, nbytes: usize) {
        if addr.is_null() {
            return;
        }
        self.check_guards(addr, nbytes);
        let padded = unsafe { addr.sub(GUARD_LEN) };
        self.inner.release(padded, nbytes + 2 * GUARD_LEN);
    }

    fn dump(&self, w: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(w, "debug backend (guard bytes = {} per side):", GUARD_LEN)?;
        self.inner.dump(w)
    }

    fn stats(&self) -> Stats {
        self.inner.stats()
    }
}

static DEFAULT: Once<BitmapAllocator> = Once::new();

/// The process-wide default allocator, lazily initialized on first use.
/// Stands in for "assigning one dispatch table to a process-wide default
/// slot at process start" (this crate has no init-order dependency on an
/// explicit startup call, so lazy-once is equivalent and simpler).
pub fn default_allocator() -> &'static BitmapAllocator {
    DEFAULT.call_once(|| BitmapAllocator::init().expect("failed to initialize bitmap allocator"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_backend_round_trip() {
        let backend = SystemBackend;
        let p = backend.allocate(64, false);
        assert!(!p.is_null());
        backend.release(p, 64);
    }

    #[test]
    fn debug_backend_catches_tail_overwrite() {
        let backend = DebugBackend::new(SystemBackend);
        let p = backend.allocate(16, false);
        assert!(!p.is_null());
        unsafe {
            *p.add(16) = 0x00; // corrupt the trailing guard
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            backend.release(p, 16);
        }));
        assert!(result.is_err(), "guard corruption should be fatal");
    }

    #[test]
    fn debug_backend_passes_through_clean_block() {
        let backend = DebugBackend::new(SystemBackend);
        let p = backend.allocate(32, false);
        assert!(!p.is_null());
        backend.release(p, 32);
    }
}
