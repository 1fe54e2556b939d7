//! The reading-context abstraction.
//!
//! A reading context turns addresses into bytes. Everything above this layer
//! (relative pointers, locatable layouts, descriptors) is written against the
//! [`ReadingContext`] trait so that the same decoding code works on a file on
//! disk, an image inside a dyld shared cache and an image mapped into the
//! current process.

use std::mem::size_of;

use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::address::Address;
use super::fixups::FixupTable;
use crate::error::{Error, Result};
use crate::layout::{read_located, LocatableLayout, Located};

// =============================================================================
// Reading Context
// =============================================================================

/// Uniform typed reads over an immutable backing store.
///
/// Implementations must be safe to use from several threads at once; nothing
/// here mutates the backing store.
pub trait ReadingContext: Sync {
    /// The address representation of this context.
    type Address: Address;

    /// Returns `len` bytes starting at `at`.
    ///
    /// Short reads are an error, never a truncated slice.
    fn bytes_at(&self, at: Self::Address, len: usize) -> Result<&[u8]>;

    /// Returns the bytes of the null-terminated string at `at`, without the
    /// terminator.
    fn c_string_bytes(&self, at: Self::Address) -> Result<&[u8]>;

    /// Converts an offset from the start of the binary to an address.
    fn address_from_offset(&self, offset: u64) -> Self::Address;

    /// Converts an address back to an offset from the start of the binary.
    fn offset_from_address(&self, address: Self::Address) -> u64;

    /// Converts an unslid virtual address (as stored in pointer slots) to an
    /// address in this context.
    ///
    /// Pointer-authentication tags are stripped first.
    fn address_from_virtual_address(&self, vmaddr: u64) -> Result<Self::Address>;

    /// Removes pointer-authentication bits from a raw pointer value.
    fn strip_pointer_tags(&self, value: u64) -> u64;

    /// Bind/rebase tables for pointer slots, when the backing store has them.
    ///
    /// In-process images return `None`: the loader already applied every fixup.
    fn fixups(&self) -> Option<&dyn FixupTable> {
        None
    }

    // ==================== Provided reads ====================

    /// Reads a fixed-size element.
    fn read_element<T>(&self, at: Self::Address) -> Result<T>
    where
        T: FromBytes + KnownLayout + Immutable,
    {
        let bytes = self.bytes_at(at, size_of::<T>())?;
        Ok(T::read_from_prefix(bytes)
            .map_err(|_| Error::buffer_too_small(size_of::<T>(), bytes.len()))?
            .0)
    }

    /// Reads `count` consecutive fixed-size elements.
    fn read_elements<T>(&self, at: Self::Address, count: usize) -> Result<Vec<T>>
    where
        T: FromBytes + KnownLayout + Immutable,
    {
        let stride = size_of::<T>();
        let total = stride
            .checked_mul(count)
            .ok_or_else(|| Error::buffer_too_small(usize::MAX, 0))?;
        let bytes = self.bytes_at(at, total)?;

        let mut elements = Vec::with_capacity(count);
        for chunk in bytes.chunks_exact(stride.max(1)).take(count) {
            let element = T::read_from_prefix(chunk)
                .map_err(|_| Error::buffer_too_small(stride, chunk.len()))?
                .0;
            elements.push(element);
        }
        Ok(elements)
    }

    /// Reads a null-terminated UTF-8 string.
    fn read_c_string(&self, at: Self::Address) -> Result<String> {
        let bytes = self.c_string_bytes(at)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| Error::InvalidString {
                offset: self.offset_from_address(at),
            })
    }

    /// Reads the raw 64-bit value of a pointer slot.
    fn read_pointer(&self, at: Self::Address) -> Result<u64> {
        self.read_element::<u64>(at)
    }

    /// Reads a fixed layout and stamps it with its own address.
    fn read_locatable_layout<L>(&self, at: Self::Address) -> Result<Located<L, Self::Address>>
    where
        L: LocatableLayout,
        Self: Sized,
    {
        read_located(self, at)
    }

    /// Reads any [`Resolvable`] value.
    fn read_wrapper<T>(&self, at: Self::Address) -> Result<T>
    where
        T: Resolvable<Self::Address>,
        Self: Sized,
    {
        T::resolve(self, at)
    }

    /// Moves `address` by a signed byte offset.
    #[inline]
    fn advance(&self, address: Self::Address, by: i64) -> Self::Address {
        address.offset_by(by)
    }

    /// Moves `address` past one `T`.
    #[inline]
    fn advance_by_size_of<T>(&self, address: Self::Address) -> Self::Address {
        address.advanced(size_of::<T>())
    }
}

// =============================================================================
// Resolvable
// =============================================================================

/// A value that can be read at an address of a reading context.
///
/// This is what a relative pointer's pointee must implement: scalars read a
/// fixed number of bytes, strings scan to a terminator, descriptors decode
/// their header plus trailing blocks.
pub trait Resolvable<A: Address>: Sized {
    /// Reads `Self` at `at`.
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self>;
}

impl<A: Address> Resolvable<A> for String {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        ctx.read_c_string(at)
    }
}

macro_rules! resolvable_scalar {
    ($($ty:ty),*) => {
        $(
            impl<A: Address> Resolvable<A> for $ty {
                #[inline]
                fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
                    ctx.read_element::<$ty>(at)
                }
            }
        )*
    };
}

resolvable_scalar!(u8, u16, u32, u64, i32);

// =============================================================================
// Byte Buffer Context
// =============================================================================

/// A reading context over an in-memory byte buffer.
///
/// Offsets and virtual addresses coincide (the buffer is its own address
/// space). Useful for decoding metadata extracted from elsewhere and for
/// building fixtures.
#[derive(Debug, Clone, Default)]
pub struct BufferContext {
    data: Vec<u8>,
    fixups: Option<super::fixups::FixupTables>,
}

impl BufferContext {
    /// Wraps a byte buffer.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, fixups: None }
    }

    /// Attaches bind/rebase tables.
    pub fn with_fixups(mut self, fixups: super::fixups::FixupTables) -> Self {
        self.fixups = Some(fixups);
        self
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ReadingContext for BufferContext {
    type Address = u64;

    fn bytes_at(&self, at: u64, len: usize) -> Result<&[u8]> {
        window(&self.data, at, len)
    }

    fn c_string_bytes(&self, at: u64) -> Result<&[u8]> {
        c_string_in(&self.data, at)
    }

    #[inline]
    fn address_from_offset(&self, offset: u64) -> u64 {
        offset
    }

    #[inline]
    fn offset_from_address(&self, address: u64) -> u64 {
        address
    }

    fn address_from_virtual_address(&self, vmaddr: u64) -> Result<u64> {
        let address = self.strip_pointer_tags(vmaddr);
        if address as usize >= self.data.len() {
            return Err(Error::AddressOutOfRange { address });
        }
        Ok(address)
    }

    #[inline]
    fn strip_pointer_tags(&self, value: u64) -> u64 {
        value & crate::util::ADDR_MASK_48BIT
    }

    fn fixups(&self) -> Option<&dyn FixupTable> {
        self.fixups.as_ref().map(|f| f as &dyn FixupTable)
    }
}

/// Returns `data[at..at + len]`, or a bounds error.
#[inline]
pub(crate) fn window(data: &[u8], at: u64, len: usize) -> Result<&[u8]> {
    let start = usize::try_from(at).map_err(|_| Error::AddressOutOfRange { address: at })?;
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::buffer_too_small(usize::MAX, data.len()))?;
    if end > data.len() {
        return Err(Error::buffer_too_small(end, data.len()));
    }
    Ok(&data[start..end])
}

/// Returns the C string starting at `at` within `data`.
#[inline]
pub(crate) fn c_string_in(data: &[u8], at: u64) -> Result<&[u8]> {
    let start = usize::try_from(at).map_err(|_| Error::AddressOutOfRange { address: at })?;
    if start >= data.len() {
        return Err(Error::AddressOutOfRange { address: at });
    }
    let bytes = &data[start..];
    let end = crate::util::memchr_null(bytes);
    if end == bytes.len() {
        return Err(Error::buffer_too_small(start + end + 1, data.len()));
    }
    Ok(&bytes[..end])
}
