/// Virtual-memory mapping wrappers (map / remap / unmap) and the
/// post-map zeroing pass.
///
/// OS pages are delivered zero on first touch, but a mapping that
/// immediately follows an unmap of the same region is permitted to come
/// back dirty; `cleanse` is how the allocator honors a `clean` request
/// regardless.
use core::fmt;
use core::ptr;
use spin::Once;

#[derive(Debug)]
pub enum MapError {
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::OutOfMemory => write!(f, "virtual memory mapping failed"),
        }
    }
}

impl std::error::Error for MapError {}

static PAGE_SIZE: Once<usize> = Once::new();

/// System page size, queried once via `sysconf(_SC_PAGESIZE)` and cached
/// for the remainder of the process's lifetime.
pub fn page_size() -> usize {
    *PAGE_SIZE.call_once(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// Map `len` bytes of fresh, zeroed, read+write private-anonymous memory.
pub fn map(len: usize) -> Result<*mut u8, MapError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        log::warn!("mmap({} bytes) failed", len);
        return Err(MapError::OutOfMemory);
    }
    Ok(ptr as *mut u8)
}

/// Unmap `len` bytes at `addr`.
///
/// # Safety
/// `addr`/`len` must describe a region previously returned by [`map`] or
/// [`remap`] and not already unmapped.
pub unsafe fn unmap(addr: *mut u8, len: usize) {
    if libc::munmap(addr as *mut libc::c_void, len) != 0 {
        log::error!("munmap({:p}, {} bytes) failed", addr, len);
    }
}

/// Resize a mapping, optionally allowing it to move. On Linux this is a
/// thin wrapper over `mremap(2)`, which natively supports `MREMAP_MAYMOVE`.
///
/// # Safety
/// `addr`/`old_len` must describe a live mapping previously returned by
/// [`map`] or [`remap`].
pub unsafe fn remap(addr: *mut u8, old_len: usize, new_len: usize, may_move: bool) -> Result<*mut u8, MapError> {
    let flags = if may_move { libc::MREMAP_MAYMOVE } else { 0 };
    let ptr = libc::mremap(addr as *mut libc::c_void, old_len, new_len, flags);
    if ptr == libc::MAP_FAILED {
        log::debug!(
            "mremap({:p}, {} -> {} bytes, may_move={}) failed",
            addr,
            old_len,
            new_len,
            may_move
        );
        return Err(MapError::OutOfMemory);
    }
    Ok(ptr as *mut u8)
}

/// Zero `len` bytes at `addr`: unaligned prologue byte by byte, aligned
/// interior by whole machine words, unaligned tail byte by byte.
///
/// # Safety
/// `[addr, addr + len)` must be valid for writes.
pub unsafe fn cleanse(addr: *mut u8, len: usize) {
    const WORD: usize = core::mem::size_of::<usize>();

    let mut p = addr;
    let mut remaining = len;

    let misalignment = (p as usize) % WORD;
    if misalignment != 0 {
        let prologue = (WORD - misalignment).min(remaining);
        ptr::write_bytes(p, 0, prologue);
        p = p.add(prologue);
        remaining -= prologue;
    }

    let whole_words = remaining / WORD;
    if whole_words > 0 {
        ptr::write_bytes(p as *mut usize, 0, whole_words);
        p = p.add(whole_words * WORD);
        remaining -= whole_words * WORD;
    }

    if remaining > 0 {
        ptr::write_bytes(p, 0, remaining);
    }
}
