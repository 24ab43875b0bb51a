use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::ptr;

use super::CriticalKind;
use crate::page::{align_down, align_up, page_size, MAPPING_ALIGNMENT};
use crate::protection::Protection;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_NORESERVE: libc::c_int = 0;

#[cfg(target_os = "linux")]
const MAP_FIXED_NOREPLACE: libc::c_int = libc::MAP_FIXED_NOREPLACE;
#[cfg(not(target_os = "linux"))]
const MAP_FIXED_NOREPLACE: libc::c_int = 0;

const ANON_FLAGS: libc::c_int = libc::MAP_ANON | libc::MAP_PRIVATE | MAP_NORESERVE;

fn native(prot: Protection) -> libc::c_int {
    match prot {
        Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Protection::ReadOnly => libc::PROT_READ,
        Protection::NoAccess => libc::PROT_NONE,
        Protection::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        Protection::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
    }
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn check_map(ptr: *mut c_void) -> io::Result<*mut u8> {
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr.cast())
    }
}

/// Expands `[ptr, ptr + size)` to whole pages.
fn page_span(ptr: *mut u8, size: usize) -> (*mut c_void, usize) {
    let addr = ptr as usize;
    let start = align_down(addr, page_size());
    (start as *mut c_void, size + (addr - start))
}

pub(crate) fn query_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        0x1000
    } else {
        size as usize
    }
}

/// Maps an inaccessible, unbacked range whose start is aligned to [`MAPPING_ALIGNMENT`].
fn reserve_aligned(size: usize) -> io::Result<*mut u8> {
    let padded = size
        .checked_add(MAPPING_ALIGNMENT)
        .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;

    // SAFETY: a fresh anonymous mapping does not alias anything.
    let raw = check_map(unsafe {
        libc::mmap(ptr::null_mut(), padded, libc::PROT_NONE, ANON_FLAGS, -1, 0)
    })?;

    let addr = raw as usize;
    let aligned = align_up(addr, MAPPING_ALIGNMENT);
    let head = aligned - addr;
    let tail = padded - head - size;

    // SAFETY: both trims lie inside the mapping created above.
    unsafe {
        if head != 0 {
            check(libc::munmap(raw.cast(), head))?;
        }
        if tail != 0 {
            check(libc::munmap((aligned + size) as *mut c_void, tail))?;
        }
    }
    Ok(aligned as *mut u8)
}

/// Reserves address space. A non-null `hint` is only a hint; the caller verifies placement.
pub(crate) fn reserve(size: usize, hint: *mut u8, _placeholder: bool) -> io::Result<*mut u8> {
    if hint.is_null() {
        return reserve_aligned(size);
    }
    // SAFETY: without MAP_FIXED the kernel never replaces existing mappings.
    check_map(unsafe { libc::mmap(hint.cast(), size, libc::PROT_NONE, ANON_FLAGS, -1, 0) })
}

pub(crate) unsafe fn commit(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
    let (start, len) = page_span(ptr, size);
    check(libc::mprotect(start, len, native(prot)))?;
    check(libc::madvise(start, len, libc::MADV_WILLNEED))
}

pub(crate) unsafe fn decommit(ptr: *mut u8, size: usize) -> io::Result<()> {
    check_map(libc::mmap(
        ptr.cast(),
        size,
        libc::PROT_NONE,
        libc::MAP_FIXED | ANON_FLAGS,
        -1,
        0,
    ))
    .map(drop)
}

pub(crate) unsafe fn reset(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
    check_map(libc::mmap(
        ptr.cast(),
        size,
        native(prot),
        libc::MAP_FIXED | ANON_FLAGS,
        -1,
        0,
    ))?;
    check(libc::madvise(ptr.cast(), size, libc::MADV_WILLNEED))
}

pub(crate) unsafe fn release(ptr: *mut u8, size: usize) -> io::Result<()> {
    check(libc::munmap(ptr.cast(), size))
}

pub(crate) unsafe fn protect(ptr: *mut u8, size: usize, prot: Protection) -> io::Result<()> {
    let (start, len) = page_span(ptr, size);
    check(libc::mprotect(start, len, native(prot)))
}

pub(crate) unsafe fn lock(ptr: *mut u8, size: usize) -> io::Result<()> {
    check(libc::mlock(ptr.cast(), size))
}

pub(crate) struct ShmHandle {
    file: File,
}

#[cfg(target_os = "linux")]
fn anonymous_file() -> io::Result<File> {
    use std::os::fd::{FromRawFd, OwnedFd};

    // SAFETY: the name is NUL-terminated and the returned descriptor is owned by us.
    let fd = unsafe { libc::memfd_create(b"aero-shm\0".as_ptr().cast(), libc::MFD_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just created and is not owned elsewhere.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

#[cfg(not(target_os = "linux"))]
fn anonymous_file() -> io::Result<File> {
    use std::ffi::CString;
    use std::os::fd::{FromRawFd, OwnedFd};
    use std::sync::atomic::{AtomicU64, Ordering};

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    let name = format!(
        "/aero-shm-{}-{}",
        std::process::id(),
        NEXT_ID.fetch_add(1, Ordering::Relaxed)
    );
    let name = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
    let flags = libc::O_RDWR | libc::O_CREAT | libc::O_EXCL;

    // SAFETY: `name` is a valid C string.
    #[cfg(target_vendor = "apple")]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::c_uint) };
    #[cfg(not(target_vendor = "apple"))]
    let fd = unsafe { libc::shm_open(name.as_ptr(), flags, 0o600 as libc::mode_t) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }

    // The object stays alive through the descriptor; drop the name immediately.
    // SAFETY: `name` is a valid C string.
    unsafe { libc::shm_unlink(name.as_ptr()) };
    // SAFETY: `fd` was just created and is not owned elsewhere.
    Ok(File::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

pub(crate) fn shm_create(size: usize, storage: Option<&Path>) -> io::Result<ShmHandle> {
    let file = match storage {
        Some(path) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            // Shrinking to zero first discards stale contents and leaves a sparse file.
            file.set_len(0)?;
            file
        }
        None => anonymous_file()?,
    };
    file.set_len(size as u64)?;
    Ok(ShmHandle { file })
}

unsafe fn map_view(
    handle: &ShmHandle,
    size: usize,
    addr: *mut u8,
    prot: Protection,
    cow: bool,
    extra_flags: libc::c_int,
) -> io::Result<*mut u8> {
    let sharing = if cow { libc::MAP_PRIVATE } else { libc::MAP_SHARED };
    check_map(libc::mmap(
        addr.cast(),
        size,
        native(prot),
        sharing | extra_flags,
        handle.file.as_raw_fd(),
        0,
    ))
}

/// Maps a full view. A null `hint` yields a [`MAPPING_ALIGNMENT`]-aligned address.
pub(crate) unsafe fn shm_map(
    handle: &ShmHandle,
    size: usize,
    hint: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<*mut u8> {
    if !hint.is_null() {
        return map_view(handle, size, hint, prot, cow, 0);
    }

    // mmap only guarantees page alignment: carve out an aligned hole first and map over it.
    let target = reserve_aligned(size)?;
    match map_view(handle, size, target, prot, cow, libc::MAP_FIXED) {
        Ok(ptr) => Ok(ptr),
        Err(err) => {
            let _ = release(target, size);
            Err(err)
        }
    }
}

pub(crate) unsafe fn shm_try_map(
    handle: &ShmHandle,
    size: usize,
    addr: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<*mut u8> {
    // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint; the caller compares.
    map_view(handle, size, addr, prot, cow, MAP_FIXED_NOREPLACE)
}

pub(crate) unsafe fn shm_map_critical(
    handle: &ShmHandle,
    size: usize,
    addr: *mut u8,
    prot: Protection,
    cow: bool,
) -> io::Result<CriticalKind> {
    // MAP_FIXED replaces whatever is mapped at `addr` in a single step.
    let ptr = map_view(handle, size, addr, prot, cow, libc::MAP_FIXED)?;
    debug_assert_eq!(ptr, addr);
    Ok(CriticalKind::Atomic)
}

pub(crate) unsafe fn shm_unmap(ptr: *mut u8, size: usize) -> io::Result<()> {
    release(ptr, size)
}

pub(crate) unsafe fn shm_unmap_critical(ptr: *mut u8, size: usize) -> io::Result<()> {
    // Turn the view back into an inaccessible reservation instead of freeing the range.
    decommit(ptr, size)
}
