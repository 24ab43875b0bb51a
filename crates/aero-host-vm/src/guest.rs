use std::path::PathBuf;
use std::ptr::{self, NonNull};

use tracing::debug;

use crate::error::{GuestMemoryError, GuestMemoryResult, VmError, VmResult};
use crate::memory::{memory_protect, Reservation};
use crate::page::page_size;
use crate::protection::Protection;
use crate::shm::{SharedMemory, SharedMemoryOptions};

/// Access to the host memory backing an emulated 32-bit guest address space.
pub trait GuestMemory {
    /// Size of the guest address space in bytes.
    fn size(&self) -> u64;

    /// Host pointer to the byte backing `addr`, through a view that ignores guest page
    /// protection. `None` if `addr` lies outside the address space.
    ///
    /// The pointer stays valid for as long as `self` lives. Callers must synchronise access to
    /// the pointed-to memory themselves.
    fn get_super_ptr(&self, addr: u32) -> Option<NonNull<u8>>;
}

/// Construction parameters for [`GuestAddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestAddressSpaceOptions {
    /// Size of the guest address space. Defaults to the full 32-bit domain.
    pub size: u64,
    /// Optional backing file, see [`SharedMemoryOptions::storage`].
    pub storage: Option<PathBuf>,
}

impl Default for GuestAddressSpaceOptions {
    fn default() -> Self {
        Self {
            size: 1 << 32,
            storage: None,
        }
    }
}

/// Guest RAM mapped twice: a *base* view whose page protection follows the guest, and a
/// *super* view that is always read-write.
pub struct GuestAddressSpace {
    shm: SharedMemory,
    base: Reservation,
    sudo: NonNull<u8>,
    size: u64,
}

// SAFETY: both views are owned by `self` and stay mapped until drop; the raw pointer is only an
// address. Synchronising accesses to guest memory is the caller's job.
unsafe impl Send for GuestAddressSpace {}
unsafe impl Sync for GuestAddressSpace {}

impl std::fmt::Debug for GuestAddressSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestAddressSpace")
            .field("size", &self.size)
            .field("base", &self.base.as_ptr())
            .field("sudo", &self.sudo)
            .finish()
    }
}

impl GuestAddressSpace {
    pub fn new(size: u64) -> VmResult<Self> {
        Self::with_options(GuestAddressSpaceOptions {
            size,
            ..Default::default()
        })
    }

    pub fn with_options(options: GuestAddressSpaceOptions) -> VmResult<Self> {
        let bytes = usize::try_from(options.size)
            .ok()
            .filter(|&b| b != 0 && options.size <= 1 << 32)
            .ok_or(VmError::InvalidSize {
                size: options.size.min(usize::MAX as u64) as usize,
            })?;

        let mut shm_options = SharedMemoryOptions::new(bytes);
        shm_options.storage = options.storage;
        let shm = SharedMemory::with_options(shm_options)?;

        let base = Reservation::placeholder(shm.size())?;
        // SAFETY: `base` is a fresh placeholder of exactly `shm.size()` bytes owned by us.
        unsafe { shm.map_critical(base.as_ptr(), Protection::ReadWrite, false) }?;
        let sudo = match shm.map_self(Protection::ReadWrite) {
            Ok(ptr) => ptr,
            Err(err) => {
                // SAFETY: the critical view was installed above and is not referenced yet.
                unsafe { shm.unmap_critical(base.as_ptr()) };
                return Err(err);
            }
        };

        debug!(
            size = options.size,
            base = format_args!("{:#x}", base.as_ptr().as_ptr() as usize),
            sudo = format_args!("{:#x}", sudo.as_ptr() as usize),
            "guest address space mapped"
        );
        Ok(Self {
            shm,
            base,
            sudo,
            size: options.size,
        })
    }

    /// Start of the protectable view. Guest address `a` lives at `base_ptr() + a`.
    pub fn base_ptr(&self) -> NonNull<u8> {
        self.base.as_ptr()
    }

    /// Change the protection of guest pages in the base view. The super view is unaffected.
    ///
    /// `[addr, addr + len)` must be a non-empty, page-aligned range inside the address space.
    ///
    /// # Safety
    ///
    /// Revoking access to pages that Rust references (obtained via [`Self::base_ptr`]) still
    /// point into is undefined behaviour.
    pub unsafe fn protect(&self, addr: u64, len: u64, prot: Protection) {
        let page = page_size() as u64;
        assert!(
            len != 0 && addr % page == 0 && len % page == 0,
            "protect range 0x{addr:x}+0x{len:x} is not a page range"
        );
        assert!(
            addr.checked_add(len).is_some_and(|end| end <= self.size),
            "protect range 0x{addr:x}+0x{len:x} exceeds guest size 0x{:x}",
            self.size
        );

        let ptr = NonNull::new_unchecked(self.base.as_ptr().as_ptr().add(addr as usize));
        memory_protect(ptr, len as usize, prot);
    }

    fn check_range(&self, addr: u64, len: usize) -> GuestMemoryResult<()> {
        let out_of_range = GuestMemoryError::OutOfRange {
            addr,
            len,
            size: self.size,
        };
        let end = addr.checked_add(len as u64).ok_or(out_of_range.clone())?;
        if end > self.size {
            return Err(out_of_range);
        }
        Ok(())
    }

    /// Copy guest memory into `dst` through the super view.
    pub fn read_into(&self, addr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        self.check_range(addr, dst.len())?;
        // SAFETY: bounds checked; the super view is always readable and does not overlap `dst`.
        unsafe {
            ptr::copy_nonoverlapping(
                self.sudo.as_ptr().add(addr as usize),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy `src` into guest memory through the super view.
    pub fn write_from(&self, addr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        self.check_range(addr, src.len())?;
        // SAFETY: bounds checked; the super view is always writable.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.sudo.as_ptr().add(addr as usize),
                src.len(),
            );
        }
        Ok(())
    }
}

impl GuestMemory for GuestAddressSpace {
    fn size(&self) -> u64 {
        self.size
    }

    fn get_super_ptr(&self, addr: u32) -> Option<NonNull<u8>> {
        if u64::from(addr) >= self.size {
            return None;
        }
        // SAFETY: `addr` is inside the super view.
        Some(unsafe { NonNull::new_unchecked(self.sudo.as_ptr().add(addr as usize)) })
    }
}

impl Drop for GuestAddressSpace {
    fn drop(&mut self) {
        // Hand the placeholder back before `base` releases it.
        // SAFETY: the base view was installed by `map_critical` in `with_options`.
        unsafe { self.shm.unmap_critical(self.base.as_ptr()) }
    }
}
