//! Slide info decoding for cache-resident pointers.
//!
//! Pointers stored in a shared cache's data mappings are encoded for ASLR.
//! The encoding is self-describing per pointer, so a single slot can be turned
//! back into its unslid target without walking the page chains:
//!
//! - V2: value bits masked by `!delta_mask`, plus `value_add`
//! - V3: authenticated pointers are `auth_value_add + offset`, plain pointers
//!   carry the address with its top byte folded into bits 43..51
//! - V5: `value_add + runtime_offset`, high byte restored for plain pointers

use zerocopy::FromBytes;

use super::structs::{DyldCacheSlideInfo2, DyldCacheSlideInfo3, DyldCacheSlideInfo5};
use crate::error::{Error, Result};

/// A parsed slide info header for one mapping.
#[derive(Debug, Clone, Copy)]
pub enum SlideInfo {
    /// Version 2.
    V2(DyldCacheSlideInfo2),
    /// Version 3.
    V3(DyldCacheSlideInfo3),
    /// Version 5.
    V5(DyldCacheSlideInfo5),
}

impl SlideInfo {
    /// Parses the slide info header at `offset` of a cache file.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let bytes = data
            .get(offset..)
            .ok_or_else(|| Error::buffer_too_small(offset, data.len()))?;
        let version = crate::util::checked_u32_le(bytes, 0)
            .ok_or_else(|| Error::buffer_too_small(offset + 4, data.len()))?;

        let info = match version {
            2 => SlideInfo::V2(
                DyldCacheSlideInfo2::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "truncated slide info v2"))?
                    .0,
            ),
            3 => SlideInfo::V3(
                DyldCacheSlideInfo3::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "truncated slide info v3"))?
                    .0,
            ),
            5 => SlideInfo::V5(
                DyldCacheSlideInfo5::read_from_prefix(bytes)
                    .map_err(|_| Error::parse(offset, "truncated slide info v5"))?
                    .0,
            ),
            other => return Err(Error::UnsupportedSlideVersion(other)),
        };
        Ok(info)
    }

    /// Returns the slide info version.
    pub fn version(&self) -> u32 {
        match self {
            SlideInfo::V2(_) => 2,
            SlideInfo::V3(_) => 3,
            SlideInfo::V5(_) => 5,
        }
    }

    /// Decodes a stored pointer into its unslid target address.
    #[inline]
    pub fn decode(&self, raw: u64) -> u64 {
        match self {
            SlideInfo::V2(info) => info.decode(raw),
            SlideInfo::V3(info) => info.decode(raw),
            SlideInfo::V5(info) => info.decode(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v5_bytes(value_add: u64) -> Vec<u8> {
        let mut data = vec![0u8; 0x40];
        data[0x10..0x14].copy_from_slice(&5u32.to_le_bytes());
        data[0x14..0x18].copy_from_slice(&0x4000u32.to_le_bytes());
        data[0x20..0x28].copy_from_slice(&value_add.to_le_bytes());
        data
    }

    #[test]
    fn test_parse_v5() {
        let data = v5_bytes(0x1_8000_0000);
        let info = SlideInfo::parse(&data, 0x10).unwrap();
        assert_eq!(info.version(), 5);
        assert_eq!(info.decode(0x100), 0x1_8000_0100);
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = vec![0u8; 0x20];
        data[0..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(
            SlideInfo::parse(&data, 0),
            Err(Error::UnsupportedSlideVersion(4))
        ));
    }

    #[test]
    fn test_truncated() {
        let data = v5_bytes(0);
        assert!(SlideInfo::parse(&data, 0x30).is_err());
        assert!(SlideInfo::parse(&data, 0x100).is_err());
    }
}
