//! Low-level helpers for binary data processing.
//!
//! - Unaligned little-endian reads (byteorder)
//! - Null-terminator search (memchr)
//! - LEB128 decoding for export tries and bind opcodes
//! - Alignment arithmetic for trailing descriptor blocks

use byteorder::{ByteOrder, LittleEndian};

// =============================================================================
// Unaligned Reads
// =============================================================================

/// Reads a little-endian u64 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 8`.
#[inline(always)]
pub fn read_u64_le(data: &[u8]) -> u64 {
    LittleEndian::read_u64(data)
}

/// Reads a little-endian u32 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_u32_le(data: &[u8]) -> u32 {
    LittleEndian::read_u32(data)
}

/// Reads a little-endian i32 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 4`.
#[inline(always)]
pub fn read_i32_le(data: &[u8]) -> i32 {
    LittleEndian::read_i32(data)
}

/// Reads a little-endian u16 from an unaligned byte slice.
///
/// # Panics
///
/// Panics if `data.len() < 2`.
#[inline(always)]
pub fn read_u16_le(data: &[u8]) -> u16 {
    LittleEndian::read_u16(data)
}

/// Reads a little-endian u64 at `offset`, or `None` when out of bounds.
#[inline]
pub fn checked_u64_le(data: &[u8], offset: usize) -> Option<u64> {
    data.get(offset..offset.checked_add(8)?).map(read_u64_le)
}

/// Reads a little-endian u32 at `offset`, or `None` when out of bounds.
#[inline]
pub fn checked_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    data.get(offset..offset.checked_add(4)?).map(read_u32_le)
}

/// Reads a little-endian u16 at `offset`, or `None` when out of bounds.
#[inline]
pub fn checked_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset.checked_add(2)?).map(read_u16_le)
}

// =============================================================================
// Byte Search
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns `data.len()` when there is no terminator.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

// =============================================================================
// Pointer Tags
// =============================================================================

/// Address mask for stripping PAC/TBI bits from pointers.
/// Keeps lower 48 bits which is the actual address portion.
pub const ADDR_MASK_48BIT: u64 = 0x0000_FFFF_FFFF_FFFF;

/// Address mask for user-space pointers on Apple arm64 hosts (47-bit VA).
pub const ADDR_MASK_47BIT: u64 = 0x0000_7FFF_FFFF_FFFF;

// =============================================================================
// LEB128
// =============================================================================

/// Reads an unsigned LEB128 value with fast paths for common cases.
///
/// Returns `(value, bytes_consumed)` or `None` if invalid.
#[inline(always)]
pub fn read_uleb128_fast(data: &[u8]) -> Option<(u64, usize)> {
    let b0 = *data.first()?;

    if b0 < 0x80 {
        return Some((b0 as u64, 1));
    }

    let b1 = *data.get(1)?;

    if b1 < 0x80 {
        let value = ((b0 & 0x7F) as u64) | ((b1 as u64) << 7);
        return Some((value, 2));
    }

    let mut result: u64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }

        result |= ((byte & 0x7F) as u64) << shift;
        shift += 7;

        if byte < 0x80 {
            return Some((result, i + 1));
        }
    }

    None
}

/// Reads a signed LEB128 value.
#[inline(always)]
pub fn read_sleb128_fast(data: &[u8]) -> Option<(i64, usize)> {
    let b0 = *data.first()?;

    if b0 < 0x80 {
        let value = if (b0 & 0x40) != 0 {
            (b0 as i64) | !0x7F_i64
        } else {
            b0 as i64
        };
        return Some((value, 1));
    }

    let mut result: i64 = 0;
    let mut shift = 0u32;

    for (i, &byte) in data.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        result |= ((byte & 0x7F) as i64) << shift;
        shift += 7;

        if byte < 0x80 {
            if shift < 64 && (byte & 0x40) != 0 {
                result |= !0_i64 << shift;
            }
            return Some((result, i + 1));
        }
    }

    None
}

// =============================================================================
// Alignment Utilities
// =============================================================================

/// Aligns a value up to the given power-of-two alignment.
#[inline(always)]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Checks if a value is aligned to the given power-of-two alignment.
#[inline(always)]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    debug_assert!(alignment.is_power_of_two());
    (value & (alignment - 1)) == 0
}

/// Reads a null-padded fixed-width name field (segment/section names).
pub fn fixed_str(bytes: &[u8]) -> &str {
    let end = memchr_null(bytes);
    std::str::from_utf8(&bytes[..end]).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_u64_le() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_u64_le(&data), 0x0807060504030201);
    }

    #[test]
    fn test_read_i32_le() {
        assert_eq!(read_i32_le(&[0xFC, 0xFF, 0xFF, 0xFF]), -4);
        assert_eq!(read_i32_le(&[0x10, 0x00, 0x00, 0x00]), 16);
    }

    #[test]
    fn test_checked_reads() {
        let data = [0xAA, 0xBB, 0xCC, 0xDD];
        assert_eq!(checked_u32_le(&data, 0), Some(0xDDCCBBAA));
        assert_eq!(checked_u32_le(&data, 1), None);
        assert_eq!(checked_u16_le(&data, 2), Some(0xDDCC));
        assert_eq!(checked_u64_le(&data, usize::MAX), None);
    }

    #[test]
    fn test_memchr_null() {
        assert_eq!(memchr_null(b"hello\0world"), 5);
        assert_eq!(memchr_null(b"\0"), 0);
        assert_eq!(memchr_null(b"hello"), 5);
    }

    #[test]
    fn test_uleb128_fast() {
        assert_eq!(read_uleb128_fast(&[0x00]), Some((0, 1)));
        assert_eq!(read_uleb128_fast(&[0x7F]), Some((127, 1)));
        assert_eq!(read_uleb128_fast(&[0x80, 0x01]), Some((128, 2)));
        assert_eq!(read_uleb128_fast(&[0xE5, 0x8E, 0x26]), Some((624485, 3)));
        assert_eq!(read_uleb128_fast(&[0x80]), None);
        assert_eq!(read_uleb128_fast(&[]), None);
    }

    #[test]
    fn test_sleb128_fast() {
        assert_eq!(read_sleb128_fast(&[0x00]), Some((0, 1)));
        assert_eq!(read_sleb128_fast(&[0x7F]), Some((-1, 1)));
        assert_eq!(read_sleb128_fast(&[0x40]), Some((-64, 1)));
        assert_eq!(read_sleb128_fast(&[0x80, 0x7F]), Some((-128, 2)));
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(8, 4), 8);
        assert!(is_aligned(0x4000, 0x4000));
        assert!(!is_aligned(0x4001, 8));
    }

    #[test]
    fn test_fixed_str() {
        assert_eq!(fixed_str(b"__TEXT\0\0\0\0\0\0\0\0\0\0"), "__TEXT");
        assert_eq!(fixed_str(b"__swift5_types\0\0"), "__swift5_types");
    }
}
