//! Guest address-space bookkeeping and host virtual-memory primitives.
//!
//! This crate only re-exports the workspace members:
//!
//! - [`vm`] (`aero-host-vm`): page reservation/commit/protect, shared memory objects with
//!   copy-on-write and in-place critical mappings, and the guest address space with its
//!   protection-free super view.
//! - [`range`] (`aero-addr-range`): address ranges, range vectors and the block-sharded map.
//! - [`dma`] (`aero-surface-dma`): block-granular buffer-object storage for DMA consumers.

pub use aero_addr_range as range;
pub use aero_host_vm as vm;
pub use aero_surface_dma as dma;
