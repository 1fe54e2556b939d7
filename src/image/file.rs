//! File-offset reading backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::OpenOptions;
use crate::dyld::{ImageEntry, SharedCache};
use crate::error::{Error, Result};
use crate::macho::{
    build_fixup_tables, parse_symbol_table, select_slice, ExportInfo, ExportTrieParser,
    MachHeader64, MachOContext, Nlist64, RawSymbol, Section64,
};
use crate::reading::{c_string_in, window, Backing, FixupTable, FixupTables, ReadingContext};
use crate::symbol::{BinaryIdentity, SymbolSource};
use crate::util::ADDR_MASK_48BIT;

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug)]
enum Storage {
    /// A standalone file; `base..base + len` is the selected Mach-O slice.
    Standalone {
        backing: Arc<Backing>,
        base: usize,
        len: usize,
        fixups: FixupTables,
    },
    /// An image inside a shared cache.
    Cached {
        cache: Arc<SharedCache>,
        image: ImageEntry,
    },
}

// =============================================================================
// Mach-O File
// =============================================================================

/// A Mach-O image read by file offset.
///
/// Addresses are `u64` offsets. For standalone files they count from the
/// start of the selected slice; for cache-resident images they count from the
/// main cache's shared region start, and every read is routed through the
/// cache's address translator.
#[derive(Debug)]
pub struct MachOFile {
    storage: Storage,
    path: PathBuf,
    /// Offset of the Mach-O header in this file's address space
    header_offset: u64,
    macho: MachOContext,
}

impl MachOFile {
    /// Opens a standalone (possibly fat) Mach-O file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &OpenOptions::default())
    }

    /// Opens a standalone Mach-O file with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let backing = Backing::map(&path)?;
        Self::from_backing(backing, path, options)
    }

    /// Builds a standalone file from bytes already in memory.
    pub fn from_bytes(bytes: Vec<u8>, options: &OpenOptions) -> Result<Self> {
        Self::from_backing(Backing::from(bytes), PathBuf::new(), options)
    }

    fn from_backing(backing: Backing, path: PathBuf, options: &OpenOptions) -> Result<Self> {
        let (base, len) = select_slice(&backing, options.architecture.as_deref())?;
        let slice = &backing[base..base + len];
        let macho = MachOContext::parse(slice)?;
        let fixups = build_fixup_tables(&macho, slice)?;

        debug!(
            path = %path.display(),
            arch = macho.header.arch_name(),
            slice = base,
            "opened Mach-O file"
        );

        Ok(Self {
            storage: Storage::Standalone {
                backing: Arc::new(backing),
                base,
                len,
                fixups,
            },
            path,
            header_offset: base as u64,
            macho,
        })
    }

    /// Opens the image named `name` (install path or basename) inside a
    /// shared cache.
    pub fn from_cache(cache: Arc<SharedCache>, name: &str) -> Result<Self> {
        let image = cache.image(name)?.clone();
        Self::from_cache_image(cache, image)
    }

    /// Opens a cache image entry.
    pub fn from_cache_image(cache: Arc<SharedCache>, image: ImageEntry) -> Result<Self> {
        let header_offset = image
            .address
            .checked_sub(cache.shared_region_start())
            .ok_or_else(|| Error::unmapped(image.address))?;

        let header = cache.bytes_at(image.address, MachHeader64::SIZE)?;
        let sizeofcmds = crate::util::checked_u32_le(header, 20).unwrap_or(0) as usize;
        let commands = cache.bytes_at(image.address, MachHeader64::SIZE + sizeofcmds)?;
        let macho = MachOContext::parse(commands)?;

        debug!(path = %image.path, address = format_args!("{:#x}", image.address), "opened cache image");

        Ok(Self {
            path: PathBuf::from(&image.path),
            storage: Storage::Cached { cache, image },
            header_offset,
            macho,
        })
    }

    // ==================== Accessors ====================

    /// Returns the file path, or the install path for cache images.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the parsed header and load commands.
    pub fn macho(&self) -> &MachOContext {
        &self.macho
    }

    /// Returns the offset of the Mach-O header: the fat slice offset for
    /// standalone files, the offset from the shared region start for cache
    /// images.
    pub fn header_offset(&self) -> u64 {
        self.header_offset
    }

    /// Returns the shared cache this image lives in.
    pub fn cache(&self) -> Option<&Arc<SharedCache>> {
        match &self.storage {
            Storage::Cached { cache, .. } => Some(cache),
            Storage::Standalone { .. } => None,
        }
    }

    /// Returns true if this image lives in a shared cache.
    pub fn is_cache_resident(&self) -> bool {
        self.cache().is_some()
    }

    /// Returns the address of the Mach-O header.
    pub fn header_address(&self) -> u64 {
        match self.storage {
            Storage::Standalone { .. } => 0,
            Storage::Cached { .. } => self.header_offset,
        }
    }

    /// Finds a section by name in any segment.
    pub fn section(&self, name: &str) -> Option<&Section64> {
        self.macho.find_section(name)
    }

    /// Returns the address and size of a section's contents.
    pub fn section_range(&self, name: &str) -> Result<Option<(u64, u64)>> {
        let Some(section) = self.section(name) else {
            return Ok(None);
        };
        let start = self.address_from_virtual_address(section.addr)?;
        Ok(Some((start, section.size)))
    }

    /// Reads `len` bytes at a linkedit file offset.
    fn linkedit_bytes(&self, file_offset: u64, len: usize) -> Result<&[u8]> {
        match &self.storage {
            Storage::Standalone { .. } => self.bytes_at(file_offset, len),
            Storage::Cached { .. } => {
                let vmaddr = self
                    .macho
                    .linkedit_vmaddr(file_offset)
                    .ok_or(Error::AddressOutOfRange {
                        address: file_offset,
                    })?;
                let at = self.address_from_virtual_address(vmaddr)?;
                self.bytes_at(at, len)
            }
        }
    }
}

// =============================================================================
// Reading Context
// =============================================================================

impl ReadingContext for MachOFile {
    type Address = u64;

    #[inline]
    fn bytes_at(&self, at: u64, len: usize) -> Result<&[u8]> {
        match &self.storage {
            Storage::Standalone {
                backing, base, len: slice_len, ..
            } => window(&backing[*base..*base + *slice_len], at, len),
            Storage::Cached { cache, .. } => {
                let (index, local) = cache.translator().translate_from_start(at)?;
                window(cache.data_for(index), local, len)
            }
        }
    }

    fn c_string_bytes(&self, at: u64) -> Result<&[u8]> {
        match &self.storage {
            Storage::Standalone {
                backing, base, len, ..
            } => c_string_in(&backing[*base..*base + *len], at),
            Storage::Cached { cache, .. } => {
                let (index, local) = cache.translator().translate_from_start(at)?;
                c_string_in(cache.data_for(index), local)
            }
        }
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
        let vmaddr = self.strip_pointer_tags(vmaddr);
        match &self.storage {
            Storage::Standalone { .. } => self
                .macho
                .addr_to_offset(vmaddr)
                .ok_or_else(|| Error::unmapped(vmaddr)),
            Storage::Cached { cache, .. } => vmaddr
                .checked_sub(cache.shared_region_start())
                .ok_or_else(|| Error::unmapped(vmaddr)),
        }
    }

    #[inline]
    fn strip_pointer_tags(&self, value: u64) -> u64 {
        match &self.storage {
            Storage::Cached { cache, .. } => cache.translator().strip_pointer_tags(value),
            Storage::Standalone { .. } if self.macho.header.is_arm64() => value & ADDR_MASK_48BIT,
            Storage::Standalone { .. } => value,
        }
    }

    fn fixups(&self) -> Option<&dyn FixupTable> {
        match &self.storage {
            Storage::Standalone { fixups, .. } => Some(fixups),
            Storage::Cached { cache, .. } => Some(&**cache),
        }
    }
}

// =============================================================================
// Symbol Source
// =============================================================================

impl SymbolSource for MachOFile {
    fn identity(&self) -> BinaryIdentity {
        BinaryIdentity::File {
            path: self.path.clone(),
            header_offset: self.header_offset,
        }
    }

    /// Symbol values are file offsets for standalone files and unslid
    /// virtual addresses for cache images.
    fn symbols(&self) -> Result<Vec<RawSymbol>> {
        let mut symbols = match self.macho.symtab() {
            Some(symtab) => {
                let count = symtab.nsyms as usize;
                let table = self.linkedit_bytes(symtab.symoff as u64, count * Nlist64::SIZE)?;
                let strings = self.linkedit_bytes(symtab.stroff as u64, symtab.strsize as usize)?;
                parse_symbol_table(table, count, strings)
            }
            None => Vec::new(),
        };

        match &self.storage {
            Storage::Standalone { .. } => {
                symbols.retain_mut(|symbol| match self.macho.addr_to_offset(symbol.value) {
                    Some(offset) => {
                        symbol.value = offset;
                        true
                    }
                    None => false,
                });
            }
            Storage::Cached { cache, image } => {
                symbols.extend(cache.local_symbols(image)?);
            }
        }
        Ok(symbols)
    }

    fn exported_symbols(&self) -> Result<Vec<ExportInfo>> {
        let Some((offset, size)) = self.macho.export_trie() else {
            return Ok(Vec::new());
        };
        let trie = self.linkedit_bytes(offset as u64, size as usize)?;
        let mut exports = ExportTrieParser::new(trie).parse_all()?;
        exports.retain(|export| !export.is_reexport());
        Ok(exports)
    }

    fn shared_region_start(&self) -> Option<u64> {
        self.cache().map(|cache| cache.shared_region_start())
    }

    fn start_offset(&self) -> u64 {
        self.header_offset
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zerocopy::IntoBytes;

    use super::*;
    use crate::macho::{SegmentCommand64, MH_MAGIC_64};

    /// A thin arm64 image: __TEXT at vmaddr 0x1_0000_0000 covering the first
    /// 0x1000 bytes, __DATA at 0x1_0000_1000 covering the next 0x1000.
    fn image_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 0x2000];
        let mut cursor = MachHeader64::SIZE;
        for (i, name) in [&b"__TEXT"[..], &b"__DATA"[..]].into_iter().enumerate() {
            let mut seg = SegmentCommand64::default();
            seg.segname[..name.len()].copy_from_slice(name);
            seg.vmaddr = 0x1_0000_0000 + i as u64 * 0x1000;
            seg.vmsize = 0x1000;
            seg.fileoff = i as u64 * 0x1000;
            seg.filesize = 0x1000;
            data[cursor..cursor + SegmentCommand64::SIZE].copy_from_slice(seg.as_bytes());
            cursor += SegmentCommand64::SIZE;
        }
        let header = MachHeader64 {
            ncmds: 2,
            sizeofcmds: (cursor - MachHeader64::SIZE) as u32,
            ..MachHeader64::default()
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data[0x800..0x805].copy_from_slice(b"Hello");
        data
    }

    #[test]
    fn test_from_bytes() {
        let file = MachOFile::from_bytes(image_bytes(), &OpenOptions::default()).unwrap();
        assert!(!file.is_cache_resident());
        assert_eq!(file.read_element::<u32>(0).unwrap(), MH_MAGIC_64);
        assert_eq!(file.read_c_string(0x800).unwrap(), "Hello");
        assert!(matches!(
            file.bytes_at(0x1FFC, 8),
            Err(Error::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn test_virtual_address_mapping() {
        let file = MachOFile::from_bytes(image_bytes(), &OpenOptions::default()).unwrap();
        assert_eq!(file.address_from_virtual_address(0x1_0000_1010).unwrap(), 0x1010);
        // arm64e tags are stripped before the segment lookup
        assert_eq!(
            file.address_from_virtual_address(0x8010_0001_0000_0800).unwrap(),
            0x800
        );
        assert!(matches!(
            file.address_from_virtual_address(0x2_0000_0000),
            Err(Error::UnmappedAddress { .. })
        ));
    }

    #[test]
    fn test_open_from_disk() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&image_bytes()).unwrap();
        tmp.flush().unwrap();

        let file = MachOFile::open(tmp.path()).unwrap();
        assert_eq!(file.path(), tmp.path());
        assert_eq!(
            file.identity(),
            BinaryIdentity::File {
                path: tmp.path().to_path_buf(),
                header_offset: 0
            }
        );
        assert!(file.symbols().unwrap().is_empty());
    }
}
