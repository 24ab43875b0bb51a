use thiserror::Error;

pub type VmResult<T> = std::result::Result<T, VmError>;

/// Recoverable failures of the reservation and mapping primitives.
///
/// Only requests that *create* address-space state can fail this way (`memory_reserve`,
/// `SharedMemory::{new, map, try_map, map_critical}`). Everything that operates on an
/// already-established range aborts on OS failure instead.
#[derive(Debug, Error)]
pub enum VmError {
    /// The requested address (or address hint) could not be honoured exactly.
    #[error("address 0x{requested:x} is unavailable (os chose 0x{actual:x})")]
    AddressUnavailable { requested: usize, actual: usize },

    #[error("address 0x{address:x} is not aligned to 0x{alignment:x}")]
    Unaligned { address: usize, alignment: usize },

    #[error("invalid size 0x{size:x}")]
    InvalidSize { size: usize },

    /// The OS refused the request (typically resource exhaustion).
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl VmError {
    pub(crate) fn os(op: &'static str, source: std::io::Error) -> Self {
        VmError::Os { op, source }
    }
}

pub type GuestMemoryResult<T> = std::result::Result<T, GuestMemoryError>;

/// Errors returned by the copy helpers of [`crate::GuestAddressSpace`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    #[error("guest memory access out of range: addr=0x{addr:x} len={len} size=0x{size:x}")]
    OutOfRange { addr: u64, len: usize, size: u64 },
}
