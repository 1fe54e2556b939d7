//! Bind/rebase table construction for standalone images.
//!
//! Modern binaries describe their pointer fixups with `LC_DYLD_CHAINED_FIXUPS`:
//! every pointer-sized slot in a data page either binds to an import or
//! rebases to an address inside the image, and the slots of a page form a
//! linked chain. Older binaries use the `LC_DYLD_INFO` bind opcode stream,
//! and their rebased slots already hold the unslid target, so only binds are
//! recorded for them.
//!
//! Table keys are file offsets from the start of the Mach-O slice. Rebase
//! targets are unslid virtual addresses.

use zerocopy::FromBytes;

use super::constants::*;
use super::context::MachOContext;
use super::structs::{ChainedImport, DyldChainedFixupsHeader, DyldChainedStartsInSegment};
use super::trie::parse_bind_info;
use crate::error::{Error, Result};
use crate::reading::FixupTables;
use crate::util::{checked_u16_le, checked_u32_le, checked_u64_le};

// =============================================================================
// Chained Pointers
// =============================================================================

/// A decoded chained fixup slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainedPointer {
    /// Binds to the import at `ordinal`.
    Bind {
        /// Index into the import table
        ordinal: u32,
    },
    /// Rebases to an unslid virtual address.
    Rebase {
        /// Target virtual address
        target: u64,
    },
}

/// Returns the byte stride between chained slots for a pointer format.
pub fn chain_stride(format: u16) -> Result<u64> {
    match format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => Ok(8),
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => Ok(4),
        other => Err(Error::UnsupportedPointerFormat(other)),
    }
}

/// Decodes one chained slot.
///
/// `image_base` is the `__TEXT` vmaddr, added to formats whose rebase
/// targets are runtime offsets. Returns the decoded slot and the distance to
/// the next slot in strides (0 ends the chain).
pub fn decode_chained_pointer(
    format: u16,
    raw: u64,
    image_base: u64,
) -> Result<(ChainedPointer, u64)> {
    match format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
            let auth = (raw >> 63) & 1 != 0;
            let bind = (raw >> 62) & 1 != 0;
            let next = (raw >> 51) & 0x7FF;

            let pointer = if bind {
                let ordinal = if format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                    raw & 0xFF_FFFF
                } else {
                    raw & 0xFFFF
                };
                ChainedPointer::Bind {
                    ordinal: ordinal as u32,
                }
            } else if auth {
                ChainedPointer::Rebase {
                    target: image_base + (raw & 0xFFFF_FFFF),
                }
            } else {
                let low = raw & 0x7FF_FFFF_FFFF;
                let high8 = (raw >> 43) & 0xFF;
                let target = if format == DYLD_CHAINED_PTR_ARM64E {
                    low
                } else {
                    image_base + low
                };
                ChainedPointer::Rebase {
                    target: (high8 << 56) | target,
                }
            };
            Ok((pointer, next))
        }
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
            let bind = (raw >> 63) & 1 != 0;
            let next = (raw >> 51) & 0xFFF;

            let pointer = if bind {
                ChainedPointer::Bind {
                    ordinal: (raw & 0xFF_FFFF) as u32,
                }
            } else {
                let low = raw & 0xF_FFFF_FFFF;
                let high8 = (raw >> 36) & 0xFF;
                let target = if format == DYLD_CHAINED_PTR_64 {
                    low
                } else {
                    image_base + low
                };
                ChainedPointer::Rebase {
                    target: (high8 << 56) | target,
                }
            };
            Ok((pointer, next))
        }
        other => Err(Error::UnsupportedPointerFormat(other)),
    }
}

// =============================================================================
// Import Table
// =============================================================================

/// Reads the import names of a chained fixups payload, indexed by ordinal.
pub fn parse_chained_imports(payload: &[u8]) -> Result<Vec<String>> {
    let header = DyldChainedFixupsHeader::read_from_prefix(payload)
        .map_err(|_| Error::buffer_too_small(DyldChainedFixupsHeader::SIZE, payload.len()))?
        .0;

    let entry_size = match header.imports_format {
        DYLD_CHAINED_IMPORT => 4,
        DYLD_CHAINED_IMPORT_ADDEND => 8,
        DYLD_CHAINED_IMPORT_ADDEND64 => 16,
        other => return Err(Error::UnsupportedImportFormat(other)),
    };

    let symbols = payload
        .get(header.symbols_offset as usize..)
        .ok_or_else(|| Error::buffer_too_small(header.symbols_offset as usize, payload.len()))?;

    let mut names = Vec::with_capacity(header.imports_count as usize);
    for index in 0..header.imports_count as usize {
        let at = header.imports_offset as usize + index * entry_size;
        let truncated = || Error::buffer_too_small(at + entry_size, payload.len());

        let import = match header.imports_format {
            DYLD_CHAINED_IMPORT => {
                ChainedImport::from_import(checked_u32_le(payload, at).ok_or_else(truncated)?)
            }
            DYLD_CHAINED_IMPORT_ADDEND => ChainedImport::from_import_addend(
                checked_u32_le(payload, at).ok_or_else(truncated)?,
                checked_u32_le(payload, at + 4).ok_or_else(truncated)? as i32,
            ),
            _ => ChainedImport::from_import_addend64(
                checked_u64_le(payload, at).ok_or_else(truncated)?,
                checked_u64_le(payload, at + 8).ok_or_else(truncated)?,
            ),
        };

        let name = symbols
            .get(import.name_offset as usize..)
            .map(|bytes| String::from_utf8_lossy(&bytes[..crate::util::memchr_null(bytes)]))
            .unwrap_or_default();
        names.push(name.into_owned());
    }
    Ok(names)
}

// =============================================================================
// Table Construction
// =============================================================================

/// Builds the bind/rebase tables of a standalone image.
///
/// `data` is the Mach-O slice, starting at its header.
pub fn build_fixup_tables(ctx: &MachOContext, data: &[u8]) -> Result<FixupTables> {
    let mut tables = FixupTables::new();

    if let Some(cmd) = ctx.chained_fixups() {
        let start = cmd.dataoff as usize;
        let end = start + cmd.datasize as usize;
        let payload = data
            .get(start..end)
            .ok_or_else(|| Error::buffer_too_small(end, data.len()))?;
        apply_chained_fixups(ctx, data, payload, &mut tables)?;
    } else if let Some(info) = ctx.dyld_info() {
        let segments: Vec<u64> = ctx.segments().map(|seg| seg.command.fileoff).collect();
        let streams = [
            (info.bind_off, info.bind_size),
            (info.weak_bind_off, info.weak_bind_size),
            (info.lazy_bind_off, info.lazy_bind_size),
        ];
        for (off, size) in streams.into_iter().filter(|&(_, size)| size > 0) {
            let end = off as usize + size as usize;
            let stream = data
                .get(off as usize..end)
                .ok_or_else(|| Error::buffer_too_small(end, data.len()))?;

            for record in parse_bind_info(stream)? {
                let Some(&segment_start) = segments.get(record.segment_index as usize) else {
                    tracing::warn!(segment = record.segment_index, "bind in unknown segment");
                    continue;
                };
                tables.insert_bind(segment_start + record.segment_offset, record.symbol_name);
            }
        }
    }

    tracing::debug!(
        binds = tables.bind_count(),
        rebases = tables.rebase_count(),
        "built fixup tables"
    );
    Ok(tables)
}

fn apply_chained_fixups(
    ctx: &MachOContext,
    data: &[u8],
    payload: &[u8],
    tables: &mut FixupTables,
) -> Result<()> {
    let header = DyldChainedFixupsHeader::read_from_prefix(payload)
        .map_err(|_| Error::buffer_too_small(DyldChainedFixupsHeader::SIZE, payload.len()))?
        .0;
    let imports = parse_chained_imports(payload)?;
    let image_base = ctx.text_vmaddr();
    let segments: Vec<_> = ctx.segments().collect();

    let starts = header.starts_offset as usize;
    let seg_count = checked_u32_le(payload, starts)
        .ok_or_else(|| Error::buffer_too_small(starts + 4, payload.len()))?;

    for seg_index in 0..seg_count as usize {
        let info_offset = checked_u32_le(payload, starts + 4 + seg_index * 4)
            .ok_or_else(|| Error::parse(starts, "truncated chained starts"))?;
        if info_offset == 0 {
            continue;
        }

        let seg_at = starts + info_offset as usize;
        let seg = DyldChainedStartsInSegment::read_from_prefix(
            payload.get(seg_at..).unwrap_or(&[]),
        )
        .map_err(|_| Error::parse(seg_at, "truncated chained starts in segment"))?
        .0;
        let stride = chain_stride(seg.pointer_format)?;

        // chain offsets are VM offsets from the header; slots are keyed by file offset
        let Some(segment) = segments.get(seg_index) else {
            tracing::warn!(segment = seg_index, "chained starts for unknown segment");
            continue;
        };
        let segment_vm_offset = segment.command.vmaddr.wrapping_sub(image_base);
        let to_file_offset = |vm_offset: u64| {
            vm_offset
                .checked_sub(segment_vm_offset)
                .map(|delta| segment.command.fileoff + delta)
                .ok_or(Error::AddressOutOfRange { address: vm_offset })
        };

        for page in 0..seg.page_count as usize {
            let page_start = checked_u16_le(
                payload,
                seg_at + DyldChainedStartsInSegment::PAGE_STARTS_OFFSET + page * 2,
            )
            .ok_or_else(|| Error::parse(seg_at, "truncated page starts"))?;

            if page_start == DYLD_CHAINED_PTR_START_NONE {
                continue;
            }
            if page_start & DYLD_CHAINED_PTR_START_MULTI != 0 {
                tracing::warn!(page, "multi-start chains are not used by 64-bit formats");
                continue;
            }

            let mut vm_offset =
                seg.segment_offset + (page as u64 * seg.page_size as u64) + page_start as u64;
            loop {
                let offset = to_file_offset(vm_offset)?;
                let raw = checked_u64_le(data, offset as usize)
                    .ok_or(Error::AddressOutOfRange { address: offset })?;
                let (pointer, next) = decode_chained_pointer(seg.pointer_format, raw, image_base)?;

                match pointer {
                    ChainedPointer::Bind { ordinal } => match imports.get(ordinal as usize) {
                        Some(name) => tables.insert_bind(offset, name.as_str()),
                        None => tracing::warn!(ordinal, offset, "bind ordinal out of range"),
                    },
                    ChainedPointer::Rebase { target } => tables.insert_rebase(offset, target),
                }

                if next == 0 {
                    break;
                }
                vm_offset += next * stride;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_arm64e_userland() {
        let base = 0x1_0000_0000;

        // auth rebase to runtime offset 0x4000, next = 2
        let raw = (1u64 << 63) | (2 << 51) | 0x4000;
        let (ptr, next) = decode_chained_pointer(DYLD_CHAINED_PTR_ARM64E_USERLAND, raw, base).unwrap();
        assert_eq!(ptr, ChainedPointer::Rebase { target: 0x1_0000_4000 });
        assert_eq!(next, 2);

        // plain bind to ordinal 3
        let raw = (1u64 << 62) | 3;
        let (ptr, next) = decode_chained_pointer(DYLD_CHAINED_PTR_ARM64E_USERLAND, raw, base).unwrap();
        assert_eq!(ptr, ChainedPointer::Bind { ordinal: 3 });
        assert_eq!(next, 0);

        // 24-bit ordinals
        let raw = (1u64 << 62) | 0x12_3456;
        let (ptr, _) = decode_chained_pointer(DYLD_CHAINED_PTR_ARM64E_USERLAND24, raw, base).unwrap();
        assert_eq!(ptr, ChainedPointer::Bind { ordinal: 0x12_3456 });
    }

    #[test]
    fn test_decode_arm64e_vmaddr() {
        let raw = 0x1_0000_8000u64;
        let (ptr, _) = decode_chained_pointer(DYLD_CHAINED_PTR_ARM64E, raw, 0x1_0000_0000).unwrap();
        assert_eq!(ptr, ChainedPointer::Rebase { target: 0x1_0000_8000 });
    }

    #[test]
    fn test_decode_64_offset() {
        let raw = (1u64 << 51) | 0x3F00;
        let (ptr, next) = decode_chained_pointer(DYLD_CHAINED_PTR_64_OFFSET, raw, 0x1_0000_0000).unwrap();
        assert_eq!(ptr, ChainedPointer::Rebase { target: 0x1_0000_3F00 });
        assert_eq!(next, 1);
        assert_eq!(chain_stride(DYLD_CHAINED_PTR_64_OFFSET).unwrap(), 4);

        let raw = (1u64 << 63) | 7;
        let (ptr, _) = decode_chained_pointer(DYLD_CHAINED_PTR_64, raw, 0).unwrap();
        assert_eq!(ptr, ChainedPointer::Bind { ordinal: 7 });
    }

    #[test]
    fn test_unsupported_format() {
        assert!(matches!(
            decode_chained_pointer(3, 0, 0),
            Err(Error::UnsupportedPointerFormat(3))
        ));
    }

    /// __TEXT at file offset 0, __DATA at VM offset 0x4000 but file offset
    /// 0x1000, and a chained fixups payload in __LINKEDIT at 0x2000 with one
    /// bind followed by one rebase in __DATA.
    fn chained_image() -> Vec<u8> {
        use crate::macho::{LinkeditDataCommand, MachHeader64, SegmentCommand64};
        use zerocopy::IntoBytes;

        fn put_u16(data: &mut [u8], at: usize, v: u16) {
            data[at..at + 2].copy_from_slice(&v.to_le_bytes());
        }
        fn put_u32(data: &mut [u8], at: usize, v: u32) {
            data[at..at + 4].copy_from_slice(&v.to_le_bytes());
        }
        fn put_u64(data: &mut [u8], at: usize, v: u64) {
            data[at..at + 8].copy_from_slice(&v.to_le_bytes());
        }

        let base = 0x1_0000_0000u64;
        let mut data = vec![0u8; 0x3000];
        let mut cursor = MachHeader64::SIZE;
        let segments: [(&[u8], u64, u64); 3] = [
            (b"__TEXT", 0, 0),
            (b"__DATA", 0x4000, 0x1000),
            (b"__LINKEDIT", 0x8000, 0x2000),
        ];
        for (name, vm_offset, fileoff) in segments {
            let mut seg = SegmentCommand64::default();
            seg.segname[..name.len()].copy_from_slice(name);
            seg.vmaddr = base + vm_offset;
            seg.vmsize = 0x1000;
            seg.fileoff = fileoff;
            seg.filesize = 0x1000;
            data[cursor..cursor + SegmentCommand64::SIZE].copy_from_slice(seg.as_bytes());
            cursor += SegmentCommand64::SIZE;
        }
        let fixups = LinkeditDataCommand {
            cmd: LC_DYLD_CHAINED_FIXUPS,
            cmdsize: 16,
            dataoff: 0x2000,
            datasize: 0x100,
        };
        data[cursor..cursor + 16].copy_from_slice(fixups.as_bytes());
        cursor += 16;
        let header = MachHeader64 {
            ncmds: 4,
            sizeofcmds: (cursor - MachHeader64::SIZE) as u32,
            ..MachHeader64::default()
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());

        let payload = 0x2000;
        let fixups_header = DyldChainedFixupsHeader {
            starts_offset: 0x20,
            imports_offset: 0x60,
            symbols_offset: 0x68,
            imports_count: 1,
            imports_format: DYLD_CHAINED_IMPORT,
            ..Default::default()
        };
        data[payload..payload + DyldChainedFixupsHeader::SIZE]
            .copy_from_slice(fixups_header.as_bytes());

        // starts in image: three segments, only __DATA has chains
        put_u32(&mut data, payload + 0x20, 3);
        put_u32(&mut data, payload + 0x28, 0x10);
        let seg_at = payload + 0x30;
        put_u32(&mut data, seg_at, 24);
        put_u16(&mut data, seg_at + 4, 0x1000);
        put_u16(&mut data, seg_at + 6, DYLD_CHAINED_PTR_64_OFFSET);
        put_u64(&mut data, seg_at + 8, 0x4000);
        put_u16(&mut data, seg_at + 20, 1);
        put_u16(&mut data, seg_at + DyldChainedStartsInSegment::PAGE_STARTS_OFFSET, 0x10);

        // import 0 names "_ext"
        put_u32(&mut data, payload + 0x60, 1 | (1 << 9));
        data[payload + 0x68..payload + 0x6E].copy_from_slice(b"\0_ext\0");

        // VM 0x4010: bind to import 0, next slot two strides on
        put_u64(&mut data, 0x1010, (1 << 63) | (2 << 51));
        // VM 0x4018: rebase to runtime offset 0x3F00, end of chain
        put_u64(&mut data, 0x1018, 0x3F00);
        data
    }

    #[test]
    fn test_chained_fixups_keyed_by_file_offset() {
        use crate::reading::FixupTable;

        let data = chained_image();
        let ctx = MachOContext::parse(&data).unwrap();
        let tables = build_fixup_tables(&ctx, &data).unwrap();

        assert_eq!(tables.bind_count(), 1);
        assert_eq!(tables.rebase_count(), 1);
        assert_eq!(tables.bind_symbol(0x1010), Some("_ext"));
        assert_eq!(tables.rebase_target(0x1018), Some(0x1_0000_3F00));
        // nothing lands on the VM offsets
        assert_eq!(tables.bind_symbol(0x4010), None);
        assert_eq!(tables.rebase_target(0x4018), None);
    }

    #[test]
    fn test_parse_imports() {
        let mut payload = vec![0u8; 0x40];
        let header = DyldChainedFixupsHeader {
            imports_offset: 0x20,
            symbols_offset: 0x28,
            imports_count: 2,
            imports_format: DYLD_CHAINED_IMPORT,
            ..Default::default()
        };
        payload[..DyldChainedFixupsHeader::SIZE]
            .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        payload[0x20..0x24].copy_from_slice(&(1u32 | (1 << 9)).to_le_bytes());
        payload[0x24..0x28].copy_from_slice(&(1u32 | (4 << 9)).to_le_bytes());
        payload[0x28..0x31].copy_from_slice(b"\0_a\0_bcd\0");

        let names = parse_chained_imports(&payload).unwrap();
        assert_eq!(names, vec!["_a".to_string(), "_bcd".to_string()]);
    }
}
