use std::io;
use std::ptr::{self, NonNull};

use tracing::{debug, error, trace};

use crate::error::{VmError, VmResult};
use crate::page::{align_up, page_size};
use crate::protection::Protection;
use crate::sys;

/// Abort after an OS call on an established range failed. The address space is in an unknown
/// state at this point.
#[cold]
pub(crate) fn fatal(op: &'static str, err: io::Error, addr: usize, size: usize) -> ! {
    error!(
        op,
        addr = format_args!("{addr:#x}"),
        size = format_args!("{size:#x}"),
        error = %err,
        "host memory operation failed"
    );
    std::process::abort()
}

/// Reserve `size` bytes of inaccessible address space.
///
/// `size` is rounded up to the host page size. Without a hint the result is aligned to
/// [`crate::MAPPING_ALIGNMENT`]. With a hint, the reservation must land exactly at the hint or
/// [`VmError::AddressUnavailable`] is returned (and nothing stays reserved).
///
/// `is_memory_mapping` requests a range that [`crate::SharedMemory::map_critical`] can later
/// replace in place. It only changes behaviour on hosts with placeholder support.
pub fn memory_reserve(
    size: usize,
    hint: Option<NonNull<u8>>,
    is_memory_mapping: bool,
) -> VmResult<NonNull<u8>> {
    if size == 0 {
        return Err(VmError::InvalidSize { size });
    }
    let size = align_up(size, page_size());
    let requested = hint.map_or(ptr::null_mut(), NonNull::as_ptr);

    let raw = sys::reserve(size, requested, is_memory_mapping).map_err(|err| {
        debug!(size, error = %err, "memory_reserve failed");
        VmError::os("memory_reserve", err)
    })?;
    let ptr = NonNull::new(raw).ok_or_else(|| {
        VmError::os("memory_reserve", io::Error::from(io::ErrorKind::OutOfMemory))
    })?;

    if !requested.is_null() && raw != requested {
        // SAFETY: `raw` was reserved above with exactly `size` bytes and is not shared.
        if let Err(err) = unsafe { sys::release(raw, size) } {
            fatal("memory_release", err, raw as usize, size);
        }
        debug!(
            requested = format_args!("{:#x}", requested as usize),
            actual = format_args!("{:#x}", raw as usize),
            "memory_reserve hint not honoured"
        );
        return Err(VmError::AddressUnavailable {
            requested: requested as usize,
            actual: raw as usize,
        });
    }

    trace!(addr = format_args!("{:#x}", raw as usize), size, "reserved");
    Ok(ptr)
}

/// Back a reserved range with memory accessible as `prot`.
///
/// # Safety
///
/// `[ptr, ptr + size)` must lie inside a range obtained from [`memory_reserve`].
pub unsafe fn memory_commit(ptr: NonNull<u8>, size: usize, prot: Protection) {
    if let Err(err) = sys::commit(ptr.as_ptr(), size, prot) {
        fatal("memory_commit", err, ptr.as_ptr() as usize, size);
    }
}

/// Return a committed range to the reserved state. Contents are discarded.
///
/// # Safety
///
/// `[ptr, ptr + size)` must be page-aligned and lie inside a reservation. No live references may
/// point into it.
pub unsafe fn memory_decommit(ptr: NonNull<u8>, size: usize) {
    if let Err(err) = sys::decommit(ptr.as_ptr(), size) {
        fatal("memory_decommit", err, ptr.as_ptr() as usize, size);
    }
}

/// Discard the contents of a range and recommit it zeroed with `prot`.
///
/// # Safety
///
/// Same requirements as [`memory_decommit`].
pub unsafe fn memory_reset(ptr: NonNull<u8>, size: usize, prot: Protection) {
    if let Err(err) = sys::reset(ptr.as_ptr(), size, prot) {
        fatal("memory_reset", err, ptr.as_ptr() as usize, size);
    }
}

/// Release a whole reservation.
///
/// # Safety
///
/// `ptr` must be the start of a range returned by [`memory_reserve`] and `size` the size that was
/// requested. The range must not be used afterwards.
pub unsafe fn memory_release(ptr: NonNull<u8>, size: usize) {
    let size = align_up(size, page_size());
    if let Err(err) = sys::release(ptr.as_ptr(), size) {
        fatal("memory_release", err, ptr.as_ptr() as usize, size);
    }
}

/// Change the protection of the pages covering `[ptr, ptr + size)`.
///
/// # Safety
///
/// The range must be mapped (committed memory or a shared-memory view). Revoking access to
/// memory that Rust references still point into is undefined behaviour.
pub unsafe fn memory_protect(ptr: NonNull<u8>, size: usize, prot: Protection) {
    if let Err(err) = sys::protect(ptr.as_ptr(), size, prot) {
        fatal("memory_protect", err, ptr.as_ptr() as usize, size);
    }
}

/// Pin a range into physical memory. Returns `false` if the OS refused (e.g. lock limits).
///
/// # Safety
///
/// The range must be committed.
pub unsafe fn memory_lock(ptr: NonNull<u8>, size: usize) -> bool {
    match sys::lock(ptr.as_ptr(), size) {
        Ok(()) => true,
        Err(err) => {
            debug!(
                addr = format_args!("{:#x}", ptr.as_ptr() as usize),
                size,
                error = %err,
                "memory_lock refused"
            );
            false
        }
    }
}

/// An owned reserved range, released on drop.
///
/// Offsets passed to the range operations are relative to [`Reservation::as_ptr`] and are
/// bounds-checked against the reservation size.
#[derive(Debug)]
pub struct Reservation {
    ptr: NonNull<u8>,
    size: usize,
}

// SAFETY: a `Reservation` is just an owned address range; it exposes no interior references and
// every accessor that touches the contents is `unsafe`.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    pub fn new(size: usize, hint: Option<NonNull<u8>>) -> VmResult<Self> {
        let ptr = memory_reserve(size, hint, false)?;
        Ok(Self {
            ptr,
            size: align_up(size, page_size()),
        })
    }

    /// Reserve a range suitable as the target of [`crate::SharedMemory::map_critical`].
    pub fn placeholder(size: usize) -> VmResult<Self> {
        let ptr = memory_reserve(size, None, true)?;
        Ok(Self {
            ptr,
            size: align_up(size, page_size()),
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Reserved size, rounded up to the host page size.
    pub fn size(&self) -> usize {
        self.size
    }

    fn sub(&self, offset: usize, len: usize) -> NonNull<u8> {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.size),
            "range 0x{offset:x}+0x{len:x} exceeds reservation of 0x{:x} bytes",
            self.size
        );
        // SAFETY: bounds checked above; a reservation never starts at null.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    pub fn commit(&self, offset: usize, len: usize, prot: Protection) {
        // SAFETY: the subrange lies inside this reservation.
        unsafe { memory_commit(self.sub(offset, len), len, prot) }
    }

    /// # Safety
    ///
    /// No live references may point into the decommitted subrange.
    pub unsafe fn decommit(&self, offset: usize, len: usize) {
        memory_decommit(self.sub(offset, len), len)
    }

    /// # Safety
    ///
    /// No live references may point into the reset subrange.
    pub unsafe fn reset(&self, offset: usize, len: usize, prot: Protection) {
        memory_reset(self.sub(offset, len), len, prot)
    }

    /// # Safety
    ///
    /// See [`memory_protect`].
    pub unsafe fn protect(&self, offset: usize, len: usize, prot: Protection) {
        memory_protect(self.sub(offset, len), len, prot)
    }

    pub fn lock(&self, offset: usize, len: usize) -> bool {
        // SAFETY: the subrange lies inside this reservation; locking uncommitted pages fails
        // gracefully.
        unsafe { memory_lock(self.sub(offset, len), len) }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        // SAFETY: the reservation owns the range and nothing else refers to it anymore.
        unsafe { memory_release(self.ptr, self.size) }
    }
}
