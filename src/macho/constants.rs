//! Mach-O constants and flags.

use bitflags::bitflags;

// =============================================================================
// Magic Numbers
// =============================================================================

/// 64-bit Mach-O magic (little-endian)
pub const MH_MAGIC_64: u32 = 0xFEEDFACF;

/// 64-bit Mach-O magic (big-endian, needs byte swap)
pub const MH_CIGAM_64: u32 = 0xCFFAEDFE;

/// 32-bit Mach-O magic (little-endian)
pub const MH_MAGIC: u32 = 0xFEEDFACE;

/// FAT binary magic (stored big-endian)
pub const FAT_MAGIC: u32 = 0xCAFEBABE;

/// FAT binary magic with 64-bit offsets (stored big-endian)
pub const FAT_MAGIC_64: u32 = 0xCAFEBABF;

// =============================================================================
// File Types
// =============================================================================

/// Executable
pub const MH_EXECUTE: u32 = 0x2;
/// Dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// Bundle
pub const MH_BUNDLE: u32 = 0x8;

// =============================================================================
// CPU Types
// =============================================================================

/// 64-bit architecture flag
pub const CPU_ARCH_ABI64: u32 = 0x0100_0000;

/// ARM CPU type
pub const CPU_TYPE_ARM: u32 = 12;
/// ARM64 CPU type
pub const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

/// x86 CPU type
pub const CPU_TYPE_X86: u32 = 7;
/// x86_64 CPU type
pub const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;

/// ARM64 all
pub const CPU_SUBTYPE_ARM64_ALL: u32 = 0;
/// ARM64e (pointer authentication)
pub const CPU_SUBTYPE_ARM64E: u32 = 2;
/// x86_64 Haswell
pub const CPU_SUBTYPE_X86_64_H: u32 = 8;

/// Returns the conventional name of a CPU type/subtype pair.
pub fn arch_name(cputype: u32, cpusubtype: u32) -> &'static str {
    match cputype {
        CPU_TYPE_ARM64 if (cpusubtype & 0xFF) == CPU_SUBTYPE_ARM64E => "arm64e",
        CPU_TYPE_ARM64 => "arm64",
        CPU_TYPE_X86_64 if (cpusubtype & 0xFF) == CPU_SUBTYPE_X86_64_H => "x86_64h",
        CPU_TYPE_X86_64 => "x86_64",
        CPU_TYPE_ARM => "arm",
        CPU_TYPE_X86 => "i386",
        _ => "unknown",
    }
}

// =============================================================================
// Load Commands
// =============================================================================

/// Load command requiring dynamic linker
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// Link-edit symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// Dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xB;
/// Load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xC;
/// Dynamically linked shared lib identification
pub const LC_ID_DYLIB: u32 = 0xD;
/// Load a weak dynamically linked shared library
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment
pub const LC_SEGMENT_64: u32 = 0x19;
/// UUID
pub const LC_UUID: u32 = 0x1B;
/// Load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1F | LC_REQ_DYLD;
/// Delay load of dylib
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// Compressed dyld info
pub const LC_DYLD_INFO: u32 = 0x22;
/// Compressed dyld info only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// Load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// Used with linkedit_data_command, payload is trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// Used with linkedit_data_command
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// =============================================================================
// Symbol Types
// =============================================================================

/// If any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xE0;
/// Mask for the type bits
pub const N_TYPE: u8 = 0x0E;
/// External symbol bit
pub const N_EXT: u8 = 0x01;

/// Undefined symbol
pub const N_UNDF: u8 = 0x0;
/// Defined in section number n_sect
pub const N_SECT: u8 = 0xE;

// =============================================================================
// Chained Fixups
// =============================================================================

/// Page has no fixups.
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xFFFF;
/// Page has multiple chain starts (32-bit formats only).
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;

/// arm64e pointers, vmaddr rebase targets.
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
/// Generic 64-bit pointers, vmaddr rebase targets.
pub const DYLD_CHAINED_PTR_64: u16 = 2;
/// Generic 64-bit pointers, runtime-offset rebase targets.
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
/// arm64e userland pointers, runtime-offset rebase targets.
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
/// arm64e userland pointers with 24-bit bind ordinals.
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

/// Import entries are `dyld_chained_import`.
pub const DYLD_CHAINED_IMPORT: u32 = 1;
/// Import entries are `dyld_chained_import_addend`.
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
/// Import entries are `dyld_chained_import_addend64`.
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

// =============================================================================
// Swift Sections
// =============================================================================

/// Nominal type descriptors.
pub const SWIFT5_TYPES: &str = "__swift5_types";
/// Protocol descriptors.
pub const SWIFT5_PROTOCOLS: &str = "__swift5_protos";
/// Protocol conformance descriptors.
pub const SWIFT5_PROTOCOL_CONFORMANCES: &str = "__swift5_proto";
/// Field descriptors.
pub const SWIFT5_FIELD_METADATA: &str = "__swift5_fieldmd";
/// Associated type descriptors.
pub const SWIFT5_ASSOCIATED_TYPES: &str = "__swift5_assocty";

// =============================================================================
// Header Flags
// =============================================================================

bitflags! {
    /// Mach-O header flags used when classifying an image.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MachOFlags: u32 {
        /// The object file has no undefined references
        const NOUNDEFS = 0x1;
        /// The object file is input for the dynamic linker
        const DYLDLINK = 0x4;
        /// The image is using two-level name space bindings
        const TWOLEVEL = 0x80;
        /// The OS will load the main executable at a random address
        const PIE = 0x200000;
        /// The dylib is part of the dyld shared cache
        const DYLIB_IN_CACHE = 0x80000000;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arch_name() {
        assert_eq!(arch_name(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E), "arm64e");
        assert_eq!(arch_name(CPU_TYPE_ARM64, 0x8000_0002), "arm64e");
        assert_eq!(arch_name(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL), "arm64");
        assert_eq!(arch_name(CPU_TYPE_X86_64, 3), "x86_64");
        assert_eq!(arch_name(CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H), "x86_64h");
        assert_eq!(arch_name(0x42, 0), "unknown");
    }
}
