//! Host virtual-memory primitives used to back emulated guest address spaces.
//!
//! This crate owns every OS paging call the emulator makes:
//!
//! - [`memory_reserve`] / [`memory_commit`] / [`memory_decommit`] / [`memory_reset`] /
//!   [`memory_release`] / [`memory_protect`] / [`memory_lock`]: raw page-range primitives.
//!   [`Reservation`] wraps a reserved range and releases it on drop.
//! - [`SharedMemory`]: a shareable memory object that can be mapped several times (including
//!   copy-on-write views and in-place "critical" remaps over a reserved placeholder).
//! - [`GuestAddressSpace`]: guest RAM built from a [`SharedMemory`] mapped twice, exposing the
//!   [`GuestMemory::get_super_ptr`] capability used by DMA consumers.
//!
//! Platform branching lives in `sys/unix.rs` and `sys/windows.rs`; everything else is portable.
//!
//! Failure model: reservation and mapping requests may be refused by the OS and return
//! [`VmError`]. Once a range is reserved, every further call is expected to succeed; a failing
//! OS call aborts the process instead of leaving the address space half-updated.

mod error;
mod guest;
mod memory;
mod page;
mod protection;
mod shm;
mod sys;

pub use error::{GuestMemoryError, GuestMemoryResult, VmError, VmResult};
pub use guest::{GuestAddressSpace, GuestAddressSpaceOptions, GuestMemory};
pub use memory::{
    memory_commit, memory_decommit, memory_lock, memory_protect, memory_release, memory_reserve,
    memory_reset, Reservation,
};
pub use page::{align_down, align_up, page_size, MAPPING_ALIGNMENT};
pub use protection::Protection;
pub use shm::{CriticalMapping, SharedMemory, SharedMemoryOptions};
