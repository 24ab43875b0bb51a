//! Per-OS translation units. Each backend exposes the same set of `pub(crate)` functions; the
//! portable layer (`memory.rs`, `shm.rs`) never branches on the target itself.

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::*;

#[cfg(not(any(unix, windows)))]
compile_error!("aero-host-vm only supports unix and windows hosts");

/// How a backend installed a critical (in-place) mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CriticalKind {
    /// The placeholder was replaced without the address ever becoming unmapped.
    Atomic,
    /// The placeholder had to be released before the view was mapped.
    #[cfg_attr(not(windows), allow(dead_code))]
    WithGap,
}
