//! Mach-O header and load command parsing.
//!
//! [`MachOContext`] parses the header and load commands of a single image from
//! a borrowed byte slice and keeps only the decoded commands; the image bytes
//! themselves stay in whatever backing store the caller owns (a memory-mapped
//! file, a shared cache mapping, or a test buffer).

use std::collections::HashMap;

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command
    pub command: SegmentCommand64,
    /// Sections in this segment
    pub sections: Vec<Section64>,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }

    /// Returns a section by name.
    pub fn section(&self, name: &str) -> Option<&Section64> {
        self.sections.iter().find(|s| s.name() == name)
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Symtab(SymtabCommand),
    DyldInfo(DyldInfoCommand),
    LinkeditData(LinkeditDataCommand),
    Dylib { command: DylibCommand, name: String },
    Uuid(UuidCommand),
    Other { cmd: u32, cmdsize: u32 },
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Decoded header and load commands of one Mach-O image.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The Mach-O header
    pub header: MachHeader64,
    /// Parsed load commands, in file order
    pub load_commands: Vec<LoadCommandInfo>,
    /// Segment lookup by name
    segment_indices: HashMap<String, usize>,
}

impl MachOContext {
    /// Parses the header and load commands at the start of `data`.
    ///
    /// `data` must start at the Mach-O header; it only needs to extend past
    /// the load commands.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = MachHeader64::read_from_prefix(data)
            .map_err(|_| Error::buffer_too_small(MachHeader64::SIZE, data.len()))?
            .0;

        if !header.is_valid() {
            return Err(Error::InvalidMachoMagic(header.magic));
        }

        let mut ctx = Self {
            header,
            load_commands: Vec::with_capacity(header.ncmds as usize),
            segment_indices: HashMap::new(),
        };
        ctx.parse_load_commands(data)?;
        Ok(ctx)
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = MachHeader64::SIZE;
        let end_offset = MachHeader64::SIZE + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            if offset + LoadCommand::SIZE > end_offset || offset + LoadCommand::SIZE > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let lc = LoadCommand::read_from_prefix(&data[offset..])
                .map_err(|_| Error::parse(offset, "failed to parse load command"))?
                .0;

            let cmdsize = lc.cmdsize as usize;
            if cmdsize < LoadCommand::SIZE || offset + cmdsize > data.len() {
                return Err(Error::LoadCommandOverflow { offset });
            }

            let info = Self::parse_load_command(lc, &data[offset..offset + cmdsize], offset)?;
            if let LoadCommandInfo::Segment(ref seg) = info {
                self.segment_indices
                    .insert(seg.name().to_string(), self.load_commands.len());
            }
            self.load_commands.push(info);
            offset += cmdsize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(lc: LoadCommand, data: &[u8], offset: usize) -> Result<LoadCommandInfo> {
        fn read<T: FromBytes + zerocopy::KnownLayout + zerocopy::Immutable>(
            data: &[u8],
            offset: usize,
            what: &str,
        ) -> Result<T> {
            Ok(T::read_from_prefix(data)
                .map_err(|_| Error::parse(offset, format!("failed to parse {what}")))?
                .0)
        }

        let info = match lc.cmd {
            LC_SEGMENT_64 => {
                let command: SegmentCommand64 = read(data, offset, "segment command")?;
                let mut sections = Vec::with_capacity(command.nsects as usize);
                let mut sect_offset = SegmentCommand64::SIZE;
                for _ in 0..command.nsects {
                    let section: Section64 = read(
                        data.get(sect_offset..).unwrap_or(&[]),
                        offset + sect_offset,
                        "section",
                    )?;
                    sections.push(section);
                    sect_offset += Section64::SIZE;
                }
                LoadCommandInfo::Segment(SegmentInfo { command, sections })
            }
            LC_SYMTAB => LoadCommandInfo::Symtab(read(data, offset, "symtab command")?),
            LC_DYLD_INFO | LC_DYLD_INFO_ONLY => {
                LoadCommandInfo::DyldInfo(read(data, offset, "dyld info command")?)
            }
            LC_DYLD_EXPORTS_TRIE | LC_DYLD_CHAINED_FIXUPS => {
                LoadCommandInfo::LinkeditData(read(data, offset, "linkedit data command")?)
            }
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB | LC_ID_DYLIB => {
                let command: DylibCommand = read(data, offset, "dylib command")?;
                let name = data
                    .get(command.dylib.name_offset as usize..)
                    .map(|bytes| crate::util::fixed_str(bytes).to_string())
                    .unwrap_or_default();
                LoadCommandInfo::Dylib { command, name }
            }
            LC_UUID => LoadCommandInfo::Uuid(read(data, offset, "uuid command")?),
            cmd => LoadCommandInfo::Other {
                cmd,
                cmdsize: lc.cmdsize,
            },
        };
        Ok(info)
    }

    // ==================== Segments & Sections ====================

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segment_indices.get(name).and_then(|&idx| {
            if let LoadCommandInfo::Segment(ref seg) = self.load_commands[idx] {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| {
            if let LoadCommandInfo::Segment(seg) = lc {
                Some(seg)
            } else {
                None
            }
        })
    }

    /// Returns a section by segment and section name.
    pub fn section(&self, segment: &str, section: &str) -> Option<&Section64> {
        self.segment(segment)?.section(section)
    }

    /// Finds a section by name in any segment.
    ///
    /// Swift metadata sections move between `__TEXT`, `__DATA_CONST` and
    /// `__AUTH_CONST` depending on the linker.
    pub fn find_section(&self, section: &str) -> Option<&Section64> {
        self.segments().find_map(|seg| seg.section(section))
    }

    /// Returns the vmaddr of the `__TEXT` segment, the image's base address.
    pub fn text_vmaddr(&self) -> u64 {
        self.segment("__TEXT")
            .map(|s| s.command.vmaddr)
            .unwrap_or(0)
    }

    // ==================== Linkedit Commands ====================

    /// Returns the symbol table command.
    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Symtab(command) => Some(command),
            _ => None,
        })
    }

    /// Returns the dyld info command.
    pub fn dyld_info(&self) -> Option<&DyldInfoCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::DyldInfo(command) => Some(command),
            _ => None,
        })
    }

    fn linkedit_data(&self, cmd: u32) -> Option<&LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::LinkeditData(command) if command.cmd == cmd => Some(command),
            _ => None,
        })
    }

    /// Returns the chained fixups command.
    pub fn chained_fixups(&self) -> Option<&LinkeditDataCommand> {
        self.linkedit_data(LC_DYLD_CHAINED_FIXUPS)
    }

    /// Returns the `(offset, size)` of the export trie, from either
    /// `LC_DYLD_EXPORTS_TRIE` or `LC_DYLD_INFO`.
    pub fn export_trie(&self) -> Option<(u32, u32)> {
        if let Some(cmd) = self.linkedit_data(LC_DYLD_EXPORTS_TRIE) {
            return Some((cmd.dataoff, cmd.datasize));
        }
        self.dyld_info()
            .filter(|info| info.export_size > 0)
            .map(|info| (info.export_off, info.export_size))
    }

    // ==================== Identity ====================

    /// Returns the install name from `LC_ID_DYLIB`.
    pub fn install_name(&self) -> Option<&str> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name } if command.cmd == LC_ID_DYLIB => {
                Some(name.as_str())
            }
            _ => None,
        })
    }

    /// Returns the dependent libraries in ordinal order (ordinal 1 first).
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Dylib { command, name } if command.cmd != LC_ID_DYLIB => {
                Some(name.as_str())
            }
            _ => None,
        })
    }

    /// Returns the image UUID.
    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Uuid(command) => Some(command.uuid),
            _ => None,
        })
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    pub fn is_arm64e(&self) -> bool {
        self.header.is_arm64e()
    }

    // ==================== Address Conversion ====================

    /// Converts a virtual address to a file offset within this image.
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.segments()
            .find(|seg| seg.command.contains_addr(addr))
            .map(|seg| seg.command.fileoff + (addr - seg.command.vmaddr))
    }

    /// Converts a file offset to a virtual address.
    pub fn offset_to_addr(&self, offset: u64) -> Option<u64> {
        self.segments()
            .find(|seg| {
                offset >= seg.command.fileoff && offset - seg.command.fileoff < seg.command.filesize
            })
            .map(|seg| seg.command.vmaddr + (offset - seg.command.fileoff))
    }

    /// Converts a linkedit file offset (as stored in `LC_SYMTAB` and friends)
    /// to a virtual address inside `__LINKEDIT`.
    ///
    /// Cache-resident images need this: their linkedit offsets refer to the
    /// cache file that holds the shared linkedit region.
    pub fn linkedit_vmaddr(&self, file_offset: u64) -> Option<u64> {
        let seg = self.segment("__LINKEDIT")?;
        file_offset
            .checked_sub(seg.command.fileoff)
            .map(|delta| seg.command.vmaddr + delta)
    }

    /// Converts a file offset to `(segment index, offset within segment)`.
    pub fn segment_index_for_offset(&self, offset: u64) -> Option<(usize, u64)> {
        self.segments().enumerate().find_map(|(index, seg)| {
            let start = seg.command.fileoff;
            (offset >= start && offset - start < seg.command.filesize)
                .then(|| (index, offset - start))
        })
    }
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;

    fn create_minimal_macho() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        let mut cursor = MachHeader64::SIZE;

        let mut text = SegmentCommand64::default();
        text.segname[..6].copy_from_slice(b"__TEXT");
        text.vmaddr = 0x1_0000_0000;
        text.vmsize = 0x1000;
        text.filesize = 0x1000;
        text.nsects = 1;
        text.cmdsize = (SegmentCommand64::SIZE + Section64::SIZE) as u32;
        data[cursor..cursor + SegmentCommand64::SIZE].copy_from_slice(text.as_bytes());
        cursor += SegmentCommand64::SIZE;

        let mut section = Section64 {
            sectname: [0; 16],
            segname: [0; 16],
            addr: 0x1_0000_0400,
            size: 0x20,
            offset: 0x400,
            align: 2,
            reloff: 0,
            nreloc: 0,
            flags: 0,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        };
        section.sectname[..14].copy_from_slice(b"__swift5_types");
        section.segname[..6].copy_from_slice(b"__TEXT");
        data[cursor..cursor + Section64::SIZE].copy_from_slice(section.as_bytes());
        cursor += Section64::SIZE;

        let id = DylibCommand {
            cmd: LC_ID_DYLIB,
            cmdsize: 48,
            dylib: Dylib {
                name_offset: 24,
                timestamp: 0,
                current_version: 0,
                compatibility_version: 0,
            },
        };
        data[cursor..cursor + DylibCommand::SIZE].copy_from_slice(id.as_bytes());
        data[cursor + 24..cursor + 24 + 15].copy_from_slice(b"/usr/lib/libFoo");
        cursor += 48;

        let header = MachHeader64 {
            ncmds: 2,
            sizeofcmds: (cursor - MachHeader64::SIZE) as u32,
            ..MachHeader64::default()
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data
    }

    #[test]
    fn test_parse_minimal_macho() {
        let data = create_minimal_macho();
        let ctx = MachOContext::parse(&data).unwrap();

        assert!(ctx.header.is_valid());
        assert_eq!(ctx.load_commands.len(), 2);
        assert!(ctx.segment("__TEXT").is_some());
        assert_eq!(ctx.text_vmaddr(), 0x1_0000_0000);
        assert_eq!(ctx.install_name(), Some("/usr/lib/libFoo"));
        assert_eq!(ctx.find_section(SWIFT5_TYPES).unwrap().offset, 0x400);
        assert!(ctx.section("__TEXT", SWIFT5_PROTOCOLS).is_none());
    }

    #[test]
    fn test_address_conversion() {
        let data = create_minimal_macho();
        let ctx = MachOContext::parse(&data).unwrap();
        assert_eq!(ctx.addr_to_offset(0x1_0000_0410), Some(0x410));
        assert_eq!(ctx.offset_to_addr(0x410), Some(0x1_0000_0410));
        assert_eq!(ctx.addr_to_offset(0x2_0000_0000), None);
        assert_eq!(ctx.segment_index_for_offset(0x10), Some((0, 0x10)));
    }

    #[test]
    fn test_bad_magic() {
        let data = vec![0u8; 64];
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::InvalidMachoMagic(0))
        ));
    }

    #[test]
    fn test_load_command_overflow() {
        let mut data = create_minimal_macho();
        let header = MachHeader64 {
            ncmds: 3,
            sizeofcmds: 8,
            ..MachHeader64::default()
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        assert!(matches!(
            MachOContext::parse(&data),
            Err(Error::LoadCommandOverflow { .. })
        ));
    }
}
