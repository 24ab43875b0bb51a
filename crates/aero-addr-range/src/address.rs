use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Unsigned integer width usable as an address domain (`u16`, `u32` or `u64`).
pub trait Address:
    sealed::Sealed
    + Copy
    + Ord
    + Hash
    + Default
    + fmt::Debug
    + fmt::LowerHex
    + Send
    + Sync
    + 'static
{
    const ZERO: Self;
    const ONE: Self;
    const MAX: Self;

    fn wrapping_add(self, rhs: Self) -> Self;
    fn wrapping_sub(self, rhs: Self) -> Self;
    fn checked_add(self, rhs: Self) -> Option<Self>;
    fn to_u64(self) -> u64;
    /// Truncates to the domain width.
    fn from_u64(value: u64) -> Self;
}

macro_rules! impl_address {
    ($($ty:ty),*) => {$(
        impl sealed::Sealed for $ty {}

        impl Address for $ty {
            const ZERO: Self = 0;
            const ONE: Self = 1;
            const MAX: Self = <$ty>::MAX;

            #[inline]
            fn wrapping_add(self, rhs: Self) -> Self {
                <$ty>::wrapping_add(self, rhs)
            }

            #[inline]
            fn wrapping_sub(self, rhs: Self) -> Self {
                <$ty>::wrapping_sub(self, rhs)
            }

            #[inline]
            fn checked_add(self, rhs: Self) -> Option<Self> {
                <$ty>::checked_add(self, rhs)
            }

            #[inline]
            fn to_u64(self) -> u64 {
                self as u64
            }

            #[inline]
            fn from_u64(value: u64) -> Self {
                value as $ty
            }
        }
    )*};
}

impl_address!(u16, u32, u64);
