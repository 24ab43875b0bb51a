//! Block-granular buffer-object storage for guest memory regions accessed by DMA.
//!
//! Guest memory is split into `BLOCK_SIZE` blocks. A run of adjacent blocks is backed by one
//! [`BufferObject`] owned by the run's first block (the *head*); the other blocks point at the
//! head. [`SurfaceCacheDma::with_range`] makes sure a requested range is backed by a single
//! head, merging smaller runs through [`BufferObject::merge_bo_list`] when needed.
//!
//! Eviction policy is left to the caller: blocks are only stamped with generation tags
//! ([`SurfaceCacheDma::touch`]) and heads can be spilled, unspilled or evicted on request.

#![forbid(unsafe_code)]

mod buffer;
mod dma;
mod tag;

pub use buffer::BufferObject;
pub use dma::{DmaHead, SurfaceCacheDma};
pub use tag::next_shared_tag;
