//! Address representations shared by both reading backends.

use std::fmt;
use std::hash::Hash;

/// A location in a reading context's address space.
///
/// File-backed contexts use plain `u64` offsets; in-process contexts use
/// [`RawAddress`]. Arithmetic is defined identically for both so that pointer
/// resolution code never needs to know which backend it runs against.
pub trait Address:
    Copy + Eq + Ord + Hash + fmt::Debug + fmt::LowerHex + Send + Sync + 'static
{
    /// Returns this address moved by a signed byte delta.
    fn offset_by(self, delta: i64) -> Self;

    /// Returns `self - origin` in bytes.
    fn delta_from(self, origin: Self) -> i64;

    /// Returns the address as an integer, for diagnostics.
    fn as_u64(self) -> u64;

    /// Returns this address moved forward by `bytes`.
    #[inline]
    fn advanced(self, bytes: usize) -> Self {
        self.offset_by(bytes as i64)
    }
}

impl Address for u64 {
    #[inline]
    fn offset_by(self, delta: i64) -> Self {
        self.wrapping_add_signed(delta)
    }

    #[inline]
    fn delta_from(self, origin: Self) -> i64 {
        self.wrapping_sub(origin) as i64
    }

    #[inline]
    fn as_u64(self) -> u64 {
        self
    }
}

/// A raw pointer value inside the current process.
///
/// Stored as an integer so descriptors holding it stay `Send + Sync`; it is
/// only turned back into a pointer by the in-process reading context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawAddress(pub usize);

impl RawAddress {
    /// Wraps a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the pointer.
    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        self.0 as *const u8
    }
}

impl Address for RawAddress {
    #[inline]
    fn offset_by(self, delta: i64) -> Self {
        Self(self.0.wrapping_add_signed(delta as isize))
    }

    #[inline]
    fn delta_from(self, origin: Self) -> i64 {
        self.0.wrapping_sub(origin.0) as isize as i64
    }

    #[inline]
    fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::LowerHex for RawAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
