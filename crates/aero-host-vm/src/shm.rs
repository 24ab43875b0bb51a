#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicPtr;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicPtr;

use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering;

use tracing::{debug, trace, warn};

use crate::error::{VmError, VmResult};
use crate::memory::fatal;
use crate::page::{align_down, align_up, MAPPING_ALIGNMENT};
use crate::protection::Protection;
use crate::sys::{self, CriticalKind};

/// Construction parameters for [`SharedMemory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryOptions {
    /// Requested size in bytes. Rounded up to [`MAPPING_ALIGNMENT`].
    pub size: usize,
    /// Back the object with this file instead of anonymous memory. The file is truncated and
    /// resized to `size` (sparse where the filesystem allows it).
    pub storage: Option<PathBuf>,
}

impl SharedMemoryOptions {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            storage: None,
        }
    }

    pub fn storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = Some(path.into());
        self
    }
}

/// How [`SharedMemory::map_critical`] replaced the target range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriticalMapping {
    /// The range never became unmapped.
    Atomic(NonNull<u8>),
    /// The host lacks in-place replacement; the range was briefly unmapped and another thread
    /// could have claimed it in between.
    WithGap(NonNull<u8>),
}

impl CriticalMapping {
    fn new(kind: CriticalKind, ptr: NonNull<u8>) -> Self {
        match kind {
            CriticalKind::Atomic => CriticalMapping::Atomic(ptr),
            CriticalKind::WithGap => CriticalMapping::WithGap(ptr),
        }
    }

    pub fn ptr(self) -> NonNull<u8> {
        match self {
            CriticalMapping::Atomic(ptr) | CriticalMapping::WithGap(ptr) => ptr,
        }
    }

    pub fn is_atomic(self) -> bool {
        matches!(self, CriticalMapping::Atomic(_))
    }
}

/// A memory object that can be mapped several times into the current process.
///
/// All views alias the same pages (except copy-on-write views, whose writes stay private). The
/// object additionally owns at most one lazily created read-write "self" view, see
/// [`SharedMemory::map_self`].
pub struct SharedMemory {
    handle: sys::ShmHandle,
    size: usize,
    storage: Option<PathBuf>,
    self_ptr: AtomicPtr<u8>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("size", &self.size)
            .field("storage", &self.storage)
            .field("self_ptr", &self.self_ptr.load(Ordering::Relaxed))
            .finish()
    }
}

impl SharedMemory {
    /// Create an anonymous object of at least `size` bytes.
    pub fn new(size: usize) -> VmResult<Self> {
        Self::with_options(SharedMemoryOptions::new(size))
    }

    pub fn with_options(options: SharedMemoryOptions) -> VmResult<Self> {
        if options.size == 0 {
            return Err(VmError::InvalidSize { size: 0 });
        }
        let size = align_up(options.size, MAPPING_ALIGNMENT);
        let handle = sys::shm_create(size, options.storage.as_deref()).map_err(|err| {
            debug!(size, storage = ?options.storage, error = %err, "shm_create failed");
            VmError::os("shm_create", err)
        })?;

        Ok(Self {
            handle,
            size,
            storage: options.storage,
            self_ptr: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Object size, a multiple of [`MAPPING_ALIGNMENT`].
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn storage_path(&self) -> Option<&Path> {
        self.storage.as_deref()
    }

    fn unavailable(&self, requested: *mut u8, actual: *mut u8) -> VmError {
        // SAFETY: `actual` is a view created by the caller that nobody else has seen.
        unsafe { self.unmap_raw(actual) };
        VmError::AddressUnavailable {
            requested: requested as usize,
            actual: actual as usize,
        }
    }

    /// Map a full view.
    ///
    /// The hint is rounded down to [`MAPPING_ALIGNMENT`]. If the OS places the view anywhere
    /// else, the view is unmapped again and [`VmError::AddressUnavailable`] is returned. Without
    /// a hint the view is [`MAPPING_ALIGNMENT`]-aligned.
    pub fn map(
        &self,
        hint: Option<NonNull<u8>>,
        prot: Protection,
        cow: bool,
    ) -> VmResult<NonNull<u8>> {
        let requested = hint.map_or(ptr::null_mut(), |p| {
            align_down(p.as_ptr() as usize, MAPPING_ALIGNMENT) as *mut u8
        });

        // SAFETY: a non-fixed mapping never replaces existing pages.
        let raw = unsafe { sys::shm_map(&self.handle, self.size, requested, prot, cow) }
            .map_err(|err| VmError::os("shm_map", err))?;

        if !requested.is_null() && raw != requested {
            return Err(self.unavailable(requested, raw));
        }
        let view = NonNull::new(raw).ok_or(VmError::AddressUnavailable {
            requested: requested as usize,
            actual: 0,
        })?;
        trace!(
            addr = format_args!("{:#x}", raw as usize),
            size = self.size,
            %prot,
            cow,
            "mapped view"
        );
        Ok(view)
    }

    /// Map a view exactly at `addr`, which must be [`MAPPING_ALIGNMENT`]-aligned and free.
    pub fn try_map(&self, addr: NonNull<u8>, prot: Protection, cow: bool) -> VmResult<NonNull<u8>> {
        let requested = addr.as_ptr();
        if requested as usize % MAPPING_ALIGNMENT != 0 {
            return Err(VmError::Unaligned {
                address: requested as usize,
                alignment: MAPPING_ALIGNMENT,
            });
        }

        // SAFETY: the backend refuses to replace existing pages.
        let raw = unsafe { sys::shm_try_map(&self.handle, self.size, requested, prot, cow) }
            .map_err(|err| VmError::os("shm_try_map", err))?;
        if raw != requested {
            return Err(self.unavailable(requested, raw));
        }
        trace!(
            addr = format_args!("{:#x}", raw as usize),
            size = self.size,
            %prot,
            cow,
            "mapped view at fixed address"
        );
        Ok(addr)
    }

    /// Map a view over a range previously reserved with `is_memory_mapping = true`, replacing the
    /// reservation in place.
    ///
    /// # Safety
    ///
    /// `[addr, addr + size())` must be a reserved, unused placeholder owned by the caller. On
    /// success the caller must later hand the range back with [`SharedMemory::unmap_critical`].
    pub unsafe fn map_critical(
        &self,
        addr: NonNull<u8>,
        prot: Protection,
        cow: bool,
    ) -> VmResult<CriticalMapping> {
        let target = addr.as_ptr();
        if target as usize % MAPPING_ALIGNMENT != 0 {
            return Err(VmError::Unaligned {
                address: target as usize,
                alignment: MAPPING_ALIGNMENT,
            });
        }

        let kind = sys::shm_map_critical(&self.handle, self.size, target, prot, cow)
            .map_err(|err| VmError::os("shm_map_critical", err))?;
        let mapping = CriticalMapping::new(kind, addr);
        if !mapping.is_atomic() {
            warn!(
                addr = format_args!("{:#x}", target as usize),
                size = self.size,
                "critical mapping was not atomic; the range was briefly unmapped"
            );
        }
        Ok(mapping)
    }

    /// The object's own view, created with `prot` on first use.
    ///
    /// Concurrent first calls race to publish their view; exactly one wins and the others unmap
    /// theirs, so every caller observes the same address. Once created, `prot` is ignored.
    pub fn map_self(&self, prot: Protection) -> VmResult<NonNull<u8>> {
        if let Some(ptr) = self.get() {
            return Ok(ptr);
        }

        let mine = self.map(None, prot, false)?;
        match publish_self(&self.self_ptr, mine.as_ptr()) {
            Ok(()) => Ok(mine),
            Err(winner) => {
                // SAFETY: `mine` was never published.
                unsafe { self.unmap_raw(mine.as_ptr()) };
                NonNull::new(winner).ok_or_else(|| VmError::AddressUnavailable {
                    requested: 0,
                    actual: 0,
                })
            }
        }
    }

    /// The self view, if [`SharedMemory::map_self`] has been called.
    pub fn get(&self) -> Option<NonNull<u8>> {
        NonNull::new(self.self_ptr.load(Ordering::Acquire))
    }

    unsafe fn unmap_raw(&self, ptr: *mut u8) {
        if let Err(err) = sys::shm_unmap(ptr, self.size) {
            fatal("shm_unmap", err, ptr as usize, self.size);
        }
        trace!(
            addr = format_args!("{:#x}", ptr as usize),
            size = self.size,
            "unmapped view"
        );
    }

    /// Remove a view created by [`SharedMemory::map`] or [`SharedMemory::try_map`].
    ///
    /// # Safety
    ///
    /// `ptr` must be such a view of this object, not the self view, and must not be accessed
    /// afterwards.
    pub unsafe fn unmap(&self, ptr: NonNull<u8>) {
        self.unmap_raw(ptr.as_ptr())
    }

    /// Turn a critical view back into a reservation of the same range.
    ///
    /// # Safety
    ///
    /// `ptr` must come from a successful [`SharedMemory::map_critical`] of this object and must
    /// not be accessed afterwards.
    pub unsafe fn unmap_critical(&self, ptr: NonNull<u8>) {
        if let Err(err) = sys::shm_unmap_critical(ptr.as_ptr(), self.size) {
            fatal("shm_unmap_critical", err, ptr.as_ptr() as usize, self.size);
        }
    }

    /// Drop the self view. A later [`SharedMemory::map_self`] creates a new one.
    ///
    /// # Safety
    ///
    /// No pointers obtained from [`SharedMemory::get`] or [`SharedMemory::map_self`] may be used
    /// afterwards.
    pub unsafe fn unmap_self(&self) {
        let ptr = self.self_ptr.swap(ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            self.unmap_raw(ptr);
        }
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        // SAFETY: `&mut self` proves no borrowed self-view pointers are in use through `self`.
        unsafe { self.unmap_self() }
    }
}

/// Publish `candidate` into an empty slot. Returns the already published pointer on loss.
fn publish_self(slot: &AtomicPtr<u8>, candidate: *mut u8) -> Result<(), *mut u8> {
    slot.compare_exchange(
        ptr::null_mut(),
        candidate,
        Ordering::AcqRel,
        Ordering::Acquire,
    )
    .map(drop)
}


#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn size_is_rounded_to_mapping_alignment() {
        let shm = SharedMemory::new(1).unwrap();
        assert_eq!(shm.size(), MAPPING_ALIGNMENT);
        assert!(shm.storage_path().is_none());
        assert!(matches!(
            SharedMemory::new(0),
            Err(VmError::InvalidSize { size: 0 })
        ));
    }

    #[test]
    fn views_alias_the_same_pages() {
        let shm = SharedMemory::new(0x10000).unwrap();
        let a = shm.map(None, Protection::ReadWrite, false).unwrap();
        let b = shm.map(None, Protection::ReadWrite, false).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_ptr() as usize % MAPPING_ALIGNMENT, 0);

        unsafe {
            a.as_ptr().add(0x123).write(0x5A);
            assert_eq!(b.as_ptr().add(0x123).read(), 0x5A);
            shm.unmap(a);
            shm.unmap(b);
        }
    }

    #[test]
    fn cow_view_keeps_writes_private() {
        let shm = SharedMemory::new(0x10000).unwrap();
        let shared = shm.map(None, Protection::ReadWrite, false).unwrap();
        let private = shm.map(None, Protection::ReadWrite, true).unwrap();

        unsafe {
            shared.as_ptr().write(1);
            private.as_ptr().add(8).write(2);
            assert_eq!(shared.as_ptr().add(8).read(), 0);
            shm.unmap(private);
            shm.unmap(shared);
        }
    }

    #[test]
    fn try_map_rejects_unaligned_address() {
        let shm = SharedMemory::new(0x10000).unwrap();
        let addr = NonNull::new(0x1000usize as *mut u8).unwrap();
        assert!(matches!(
            shm.try_map(addr, Protection::ReadWrite, false),
            Err(VmError::Unaligned { .. })
        ));
    }

    #[test]
    fn try_map_over_occupied_range_fails() {
        let shm = SharedMemory::new(0x10000).unwrap();
        let view = shm.map(None, Protection::ReadWrite, false).unwrap();
        assert!(shm.try_map(view, Protection::ReadWrite, false).is_err());
        unsafe { shm.unmap(view) };
    }

    #[test]
    fn map_self_is_idempotent_and_dropped_with_object() {
        let shm = SharedMemory::new(0x10000).unwrap();
        assert!(shm.get().is_none());
        let first = shm.map_self(Protection::ReadWrite).unwrap();
        assert_eq!(shm.map_self(Protection::ReadWrite).unwrap(), first);
        assert_eq!(shm.get(), Some(first));

        unsafe { shm.unmap_self() };
        assert!(shm.get().is_none());
    }

    #[test]
    fn concurrent_map_self_agrees_on_one_view() {
        const THREADS: usize = 8;
        let shm = Arc::new(SharedMemory::new(0x10000).unwrap());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let shm = shm.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    shm.map_self(Protection::ReadWrite).unwrap().as_ptr() as usize
                })
            })
            .collect();

        let seen: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(seen.iter().all(|&p| p == seen[0]));
        assert_eq!(shm.get().map(|p| p.as_ptr() as usize), Some(seen[0]));
    }
}
