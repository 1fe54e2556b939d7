//! Fat (universal) binary slice selection.

use byteorder::{BigEndian, ByteOrder};

use super::constants::*;
use super::structs::FatArch;
use crate::error::{Error, Result};

/// Returns true if `data` starts with a fat header.
pub fn is_fat(data: &[u8]) -> bool {
    matches!(
        crate::util::checked_u32_le(data, 0).map(u32::swap_bytes),
        Some(FAT_MAGIC | FAT_MAGIC_64)
    )
}

/// Parses the slice table of a fat binary.
pub fn parse_fat_archs(data: &[u8]) -> Result<Vec<FatArch>> {
    if data.len() < 8 {
        return Err(Error::buffer_too_small(8, data.len()));
    }

    let magic = BigEndian::read_u32(data);
    let is_64 = match magic {
        FAT_MAGIC => false,
        FAT_MAGIC_64 => true,
        other => return Err(Error::InvalidMachoMagic(other)),
    };

    let count = BigEndian::read_u32(&data[4..]) as usize;
    let entry_size = if is_64 { FatArch::SIZE_64 } else { FatArch::SIZE };
    let needed = 8 + count * entry_size;
    if data.len() < needed {
        return Err(Error::buffer_too_small(needed, data.len()));
    }

    let archs = (0..count)
        .map(|i| {
            let entry = &data[8 + i * entry_size..];
            let (offset, size) = if is_64 {
                (BigEndian::read_u64(&entry[8..]), BigEndian::read_u64(&entry[16..]))
            } else {
                (
                    BigEndian::read_u32(&entry[8..]) as u64,
                    BigEndian::read_u32(&entry[12..]) as u64,
                )
            };
            FatArch {
                cputype: BigEndian::read_u32(entry),
                cpusubtype: BigEndian::read_u32(&entry[4..]),
                offset,
                size,
            }
        })
        .collect();
    Ok(archs)
}

/// Selects the Mach-O slice to open, returning its `(offset, size)` in `data`.
///
/// For fat binaries the first slice whose architecture name contains
/// `architecture` is chosen, or the first slice when no architecture is
/// requested. A thin binary is its own single slice.
pub fn select_slice(data: &[u8], architecture: Option<&str>) -> Result<(usize, usize)> {
    if !is_fat(data) {
        let header = crate::util::checked_u32_le(data, 0)
            .ok_or_else(|| Error::buffer_too_small(4, data.len()))?;
        if header != MH_MAGIC_64 {
            return Err(Error::InvalidMachoMagic(header));
        }
        if let Some(wanted) = architecture {
            let cputype = crate::util::checked_u32_le(data, 4).unwrap_or(0);
            let cpusubtype = crate::util::checked_u32_le(data, 8).unwrap_or(0);
            let name = arch_name(cputype, cpusubtype);
            if !name.contains(wanted) {
                return Err(Error::ArchitectureNotFound {
                    arch: wanted.to_string(),
                    available: name.to_string(),
                });
            }
        }
        return Ok((0, data.len()));
    }

    let archs = parse_fat_archs(data)?;
    let chosen = match architecture {
        Some(wanted) => archs.iter().find(|a| a.arch_name().contains(wanted)),
        None => archs.first(),
    };

    let Some(arch) = chosen else {
        let available: Vec<_> = archs.iter().map(FatArch::arch_name).collect();
        return Err(Error::ArchitectureNotFound {
            arch: architecture.unwrap_or("<any>").to_string(),
            available: available.join(", "),
        });
    };

    let start = arch.offset as usize;
    let end = start
        .checked_add(arch.size as usize)
        .filter(|&end| end <= data.len())
        .ok_or(Error::AddressOutOfRange {
            address: arch.offset + arch.size,
        })?;
    tracing::debug!(arch = arch.arch_name(), offset = start, "selected fat slice");
    Ok((start, end - start))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fat_binary() -> Vec<u8> {
        let mut data = vec![0u8; 0x3000];
        data[0..4].copy_from_slice(&FAT_MAGIC.to_be_bytes());
        data[4..8].copy_from_slice(&2u32.to_be_bytes());

        let slices = [
            (CPU_TYPE_X86_64, 3u32, 0x1000u32),
            (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E, 0x2000u32),
        ];
        for (i, (cputype, subtype, offset)) in slices.into_iter().enumerate() {
            let entry = 8 + i * FatArch::SIZE;
            data[entry..entry + 4].copy_from_slice(&cputype.to_be_bytes());
            data[entry + 4..entry + 8].copy_from_slice(&subtype.to_be_bytes());
            data[entry + 8..entry + 12].copy_from_slice(&offset.to_be_bytes());
            data[entry + 12..entry + 16].copy_from_slice(&0x1000u32.to_be_bytes());
            data[offset as usize..offset as usize + 4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        }
        data
    }

    #[test]
    fn test_parse_fat_archs() {
        let data = fat_binary();
        assert!(is_fat(&data));
        let archs = parse_fat_archs(&data).unwrap();
        assert_eq!(archs.len(), 2);
        assert_eq!(archs[0].arch_name(), "x86_64");
        assert_eq!(archs[1].arch_name(), "arm64e");
    }

    #[test]
    fn test_select_slice() {
        let data = fat_binary();
        assert_eq!(select_slice(&data, None).unwrap(), (0x1000, 0x1000));
        assert_eq!(select_slice(&data, Some("arm64")).unwrap(), (0x2000, 0x1000));
        assert!(matches!(
            select_slice(&data, Some("armv7")),
            Err(Error::ArchitectureNotFound { .. })
        ));
    }

    #[test]
    fn test_thin_binary() {
        let mut data = vec![0u8; 32];
        data[0..4].copy_from_slice(&MH_MAGIC_64.to_le_bytes());
        data[4..8].copy_from_slice(&CPU_TYPE_ARM64.to_le_bytes());
        assert!(!is_fat(&data));
        assert_eq!(select_slice(&data, Some("arm64")).unwrap(), (0, 32));
        assert!(select_slice(&data, Some("x86_64")).is_err());
    }
}
