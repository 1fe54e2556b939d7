//! Mach-O binary structures.
//!
//! These structures match the on-disk format of Mach-O files.

use std::fmt;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::constants::*;
use crate::util::fixed_str;

// =============================================================================
// Header Structures
// =============================================================================

/// 64-bit Mach-O header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct MachHeader64 {
    /// Magic number (MH_MAGIC_64)
    pub magic: u32,
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// File type
    pub filetype: u32,
    /// Number of load commands
    pub ncmds: u32,
    /// Size of load commands
    pub sizeofcmds: u32,
    /// Flags
    pub flags: u32,
    /// Reserved
    pub reserved: u32,
}

impl MachHeader64 {
    /// Size of the header in bytes.
    pub const SIZE: usize = 32;

    /// Returns true if this is a valid 64-bit Mach-O header.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    /// Returns true if this is an ARM64 binary.
    #[inline]
    pub fn is_arm64(&self) -> bool {
        self.cputype == CPU_TYPE_ARM64
    }

    /// Returns true if this is an ARM64e binary (with pointer authentication).
    #[inline]
    pub fn is_arm64e(&self) -> bool {
        self.is_arm64() && (self.cpusubtype & 0xFF) == CPU_SUBTYPE_ARM64E
    }

    /// Returns the header flags.
    #[inline]
    pub fn flags(&self) -> MachOFlags {
        MachOFlags::from_bits_truncate(self.flags)
    }

    /// Returns the architecture as a string.
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.cputype, self.cpusubtype)
    }
}

impl Default for MachHeader64 {
    fn default() -> Self {
        Self {
            magic: MH_MAGIC_64,
            cputype: CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_DYLIB,
            ncmds: 0,
            sizeofcmds: 0,
            flags: 0,
            reserved: 0,
        }
    }
}

// =============================================================================
// Load Command Header
// =============================================================================

/// Generic load command header.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LoadCommand {
    /// Type of load command
    pub cmd: u32,
    /// Size of load command
    pub cmdsize: u32,
}

impl LoadCommand {
    /// Size of the load command header.
    pub const SIZE: usize = 8;
}

// =============================================================================
// Segment Command
// =============================================================================

/// 64-bit segment command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SegmentCommand64 {
    /// LC_SEGMENT_64
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub vmaddr: u64,
    /// Virtual memory size
    pub vmsize: u64,
    /// File offset
    pub fileoff: u64,
    /// Amount of file to map
    pub filesize: u64,
    /// Maximum VM protection
    pub maxprot: u32,
    /// Initial VM protection
    pub initprot: u32,
    /// Number of sections
    pub nsects: u32,
    /// Flags
    pub flags: u32,
}

impl SegmentCommand64 {
    /// Size of the segment command (without sections).
    pub const SIZE: usize = 72;

    /// Returns the segment name as a string.
    pub fn name(&self) -> &str {
        fixed_str(&self.segname)
    }

    /// Returns true if this is the __TEXT segment.
    #[inline]
    pub fn is_text(&self) -> bool {
        self.name() == "__TEXT"
    }

    /// Returns true if `vmaddr` falls inside this segment.
    #[inline]
    pub fn contains_addr(&self, vmaddr: u64) -> bool {
        vmaddr >= self.vmaddr && vmaddr - self.vmaddr < self.vmsize
    }
}

impl Default for SegmentCommand64 {
    fn default() -> Self {
        Self {
            cmd: LC_SEGMENT_64,
            cmdsize: Self::SIZE as u32,
            segname: [0u8; 16],
            vmaddr: 0,
            vmsize: 0,
            fileoff: 0,
            filesize: 0,
            maxprot: 0,
            initprot: 0,
            nsects: 0,
            flags: 0,
        }
    }
}

// =============================================================================
// Section
// =============================================================================

/// 64-bit section.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Section64 {
    /// Section name (16 bytes, null-padded)
    pub sectname: [u8; 16],
    /// Segment name (16 bytes, null-padded)
    pub segname: [u8; 16],
    /// Virtual memory address
    pub addr: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub offset: u32,
    /// Alignment (power of 2)
    pub align: u32,
    /// File offset of relocation entries
    pub reloff: u32,
    /// Number of relocation entries
    pub nreloc: u32,
    /// Flags
    pub flags: u32,
    /// Reserved (for runtime use)
    pub reserved1: u32,
    /// Reserved (for runtime use)
    pub reserved2: u32,
    /// Reserved
    pub reserved3: u32,
}

impl Section64 {
    /// Size of a section entry.
    pub const SIZE: usize = 80;

    /// Returns the section name as a string.
    pub fn name(&self) -> &str {
        fixed_str(&self.sectname)
    }

    /// Returns the segment name as a string.
    pub fn segment_name(&self) -> &str {
        fixed_str(&self.segname)
    }
}

// =============================================================================
// Symbol Table
// =============================================================================

/// Symbol table command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// Symbol table offset
    pub symoff: u32,
    /// Number of symbol table entries
    pub nsyms: u32,
    /// String table offset
    pub stroff: u32,
    /// String table size in bytes
    pub strsize: u32,
}

impl SymtabCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

/// 64-bit symbol table entry.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Nlist64 {
    /// Index into string table
    pub n_strx: u32,
    /// Type flag
    pub n_type: u8,
    /// Section number or NO_SECT
    pub n_sect: u8,
    /// Flags (see <mach-o/stab.h>)
    pub n_desc: u16,
    /// Value
    pub n_value: u64,
}

impl Nlist64 {
    /// Size of an nlist entry.
    pub const SIZE: usize = 16;

    /// Returns true if this is an external symbol.
    #[inline]
    pub fn is_external(&self) -> bool {
        (self.n_type & N_EXT) != 0
    }

    /// Returns true if this is an undefined symbol.
    #[inline]
    pub fn is_undefined(&self) -> bool {
        (self.n_type & N_TYPE) == N_UNDF
    }

    /// Returns true if this is a debugging symbol.
    #[inline]
    pub fn is_debug(&self) -> bool {
        (self.n_type & N_STAB) != 0
    }
}

// =============================================================================
// Dyld Info / Linkedit Data
// =============================================================================

/// Dyld info command (compressed LINKEDIT information).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset to rebase info
    pub rebase_off: u32,
    /// Size of rebase info
    pub rebase_size: u32,
    /// File offset to binding info
    pub bind_off: u32,
    /// Size of binding info
    pub bind_size: u32,
    /// File offset to weak binding info
    pub weak_bind_off: u32,
    /// Size of weak binding info
    pub weak_bind_size: u32,
    /// File offset to lazy binding info
    pub lazy_bind_off: u32,
    /// Size of lazy binding info
    pub lazy_bind_size: u32,
    /// File offset to export info
    pub export_off: u32,
    /// Size of export info
    pub export_size: u32,
}

impl DyldInfoCommand {
    /// Size of this command.
    pub const SIZE: usize = 48;
}

/// Generic linkedit data command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct LinkeditDataCommand {
    /// Command type (LC_DYLD_CHAINED_FIXUPS, LC_DYLD_EXPORTS_TRIE, etc.)
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// File offset
    pub dataoff: u32,
    /// Size
    pub datasize: u32,
}

impl LinkeditDataCommand {
    /// Size of this command.
    pub const SIZE: usize = 16;
}

// =============================================================================
// Dylib / UUID
// =============================================================================

/// Dylib reference (shared by several load commands).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct Dylib {
    /// Library's path name offset
    pub name_offset: u32,
    /// Library's build timestamp
    pub timestamp: u32,
    /// Library's current version number
    pub current_version: u32,
    /// Library's compatibility version number
    pub compatibility_version: u32,
}

/// Dylib load command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DylibCommand {
    /// LC_LOAD_DYLIB, LC_ID_DYLIB, etc.
    pub cmd: u32,
    /// Total size (includes path string)
    pub cmdsize: u32,
    /// Library identification
    pub dylib: Dylib,
}

impl DylibCommand {
    /// Minimum size of this command (without path string).
    pub const SIZE: usize = 24;
}

/// UUID command.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    /// Size of this load command
    pub cmdsize: u32,
    /// UUID
    pub uuid: [u8; 16],
}

impl UuidCommand {
    /// Size of this command.
    pub const SIZE: usize = 24;
}

// =============================================================================
// Chained Fixups
// =============================================================================

/// Header of the `LC_DYLD_CHAINED_FIXUPS` payload.
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldChainedFixupsHeader {
    /// Fixups format version (0)
    pub fixups_version: u32,
    /// Offset of `dyld_chained_starts_in_image`
    pub starts_offset: u32,
    /// Offset of the imports table
    pub imports_offset: u32,
    /// Offset of the symbol strings
    pub symbols_offset: u32,
    /// Number of imports
    pub imports_count: u32,
    /// Import table format (`DYLD_CHAINED_IMPORT*`)
    pub imports_format: u32,
    /// Symbol string format (0 = uncompressed)
    pub symbols_format: u32,
}

impl DyldChainedFixupsHeader {
    /// Size of the header.
    pub const SIZE: usize = 28;
}

/// Per-segment chain start information.
///
/// Followed by `page_count` little-endian u16 page starts.
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldChainedStartsInSegment {
    /// Size of this structure including page starts
    pub size: u32,
    /// Page size (0x1000 or 0x4000)
    pub page_size: u16,
    /// Pointer format (`DYLD_CHAINED_PTR_*`)
    pub pointer_format: u16,
    /// Offset of the segment from the mach header
    pub segment_offset: u64,
    /// Largest valid rebase target (32-bit formats only)
    pub max_valid_pointer: u32,
    /// Number of page starts
    pub page_count: u16,
}

impl DyldChainedStartsInSegment {
    /// Offset of the first page start.
    pub const PAGE_STARTS_OFFSET: usize = 22;
}

/// A decoded chained import entry (all three import formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainedImport {
    /// Library ordinal (signed for special ordinals)
    pub lib_ordinal: i32,
    /// Weak import
    pub weak_import: bool,
    /// Offset into the symbol string pool
    pub name_offset: u32,
    /// Addend applied to the bound value
    pub addend: i64,
}

impl ChainedImport {
    /// Decodes a `dyld_chained_import` word.
    pub fn from_import(raw: u32) -> Self {
        Self {
            lib_ordinal: (raw & 0xFF) as u8 as i8 as i32,
            weak_import: (raw >> 8) & 1 != 0,
            name_offset: raw >> 9,
            addend: 0,
        }
    }

    /// Decodes a `dyld_chained_import_addend` entry.
    pub fn from_import_addend(raw: u32, addend: i32) -> Self {
        Self {
            addend: addend as i64,
            ..Self::from_import(raw)
        }
    }

    /// Decodes a `dyld_chained_import_addend64` entry.
    pub fn from_import_addend64(raw: u64, addend: u64) -> Self {
        Self {
            lib_ordinal: (raw & 0xFFFF) as u16 as i16 as i32,
            weak_import: (raw >> 16) & 1 != 0,
            name_offset: (raw >> 32) as u32,
            addend: addend as i64,
        }
    }
}

// =============================================================================
// Fat Binaries
// =============================================================================

/// A slice of a fat/universal binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FatArch {
    /// CPU type
    pub cputype: u32,
    /// CPU subtype
    pub cpusubtype: u32,
    /// Offset of the slice in the file
    pub offset: u64,
    /// Size of the slice
    pub size: u64,
}

impl FatArch {
    /// Size of a 32-bit `fat_arch` entry.
    pub const SIZE: usize = 20;
    /// Size of a `fat_arch_64` entry.
    pub const SIZE_64: usize = 32;

    /// Returns the architecture name of this slice.
    pub fn arch_name(&self) -> &'static str {
        arch_name(self.cputype, self.cpusubtype)
    }
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for MachHeader64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MachHeader64 {{ arch: {}, filetype: {:#x}, ncmds: {}, flags: {:#x} }}",
            self.arch_name(),
            self.filetype,
            self.ncmds,
            self.flags
        )
    }
}

impl fmt::Display for Section64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{} {{ addr: {:#x}, size: {:#x}, offset: {:#x} }}",
            self.segment_name(),
            self.name(),
            self.addr,
            self.size,
            self.offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes() {
        assert_eq!(std::mem::size_of::<MachHeader64>(), MachHeader64::SIZE);
        assert_eq!(std::mem::size_of::<SegmentCommand64>(), SegmentCommand64::SIZE);
        assert_eq!(std::mem::size_of::<Section64>(), Section64::SIZE);
        assert_eq!(std::mem::size_of::<Nlist64>(), Nlist64::SIZE);
        assert_eq!(std::mem::size_of::<DyldInfoCommand>(), DyldInfoCommand::SIZE);
        assert_eq!(
            std::mem::size_of::<DyldChainedFixupsHeader>(),
            DyldChainedFixupsHeader::SIZE
        );
        assert_eq!(std::mem::size_of::<DyldChainedStartsInSegment>(), 24);
    }

    #[test]
    fn test_chained_import_formats() {
        // lib ordinal 2, weak, name offset 0x10
        let raw = 2 | (1 << 8) | (0x10 << 9);
        let import = ChainedImport::from_import(raw);
        assert_eq!(import.lib_ordinal, 2);
        assert!(import.weak_import);
        assert_eq!(import.name_offset, 0x10);
        assert_eq!(import.addend, 0);

        // special ordinal -2 (flat lookup)
        assert_eq!(ChainedImport::from_import(0xFE).lib_ordinal, -2);

        let import = ChainedImport::from_import_addend(3 | (0x20 << 9), -8);
        assert_eq!(import.name_offset, 0x20);
        assert_eq!(import.addend, -8);

        let import = ChainedImport::from_import_addend64(0xFFFF | (0x44u64 << 32), 16);
        assert_eq!(import.lib_ordinal, -1);
        assert!(!import.weak_import);
        assert_eq!(import.name_offset, 0x44);
        assert_eq!(import.addend, 16);
    }

    #[test]
    fn test_segment_contains() {
        let mut seg = SegmentCommand64::default();
        seg.segname[..6].copy_from_slice(b"__TEXT");
        seg.vmaddr = 0x1_0000_0000;
        seg.vmsize = 0x4000;
        assert!(seg.is_text());
        assert!(seg.contains_addr(0x1_0000_3FFF));
        assert!(!seg.contains_addr(0x1_0000_4000));
    }
}
