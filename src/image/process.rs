//! In-process reading backend.

use std::ffi::CStr;

use crate::error::{Error, Result};
use crate::macho::{
    parse_symbol_table, ExportInfo, ExportTrieParser, MachHeader64, MachOContext, Nlist64,
    RawSymbol,
};
use crate::reading::{Address, RawAddress, ReadingContext};
use crate::symbol::{BinaryIdentity, SymbolSource};

/// Mask applied to pointers loaded in this process.
#[cfg(all(target_arch = "aarch64", target_vendor = "apple"))]
const POINTER_MASK: u64 = crate::util::ADDR_MASK_47BIT;
#[cfg(all(target_arch = "aarch64", not(target_vendor = "apple")))]
const POINTER_MASK: u64 = crate::util::ADDR_MASK_48BIT;
#[cfg(not(target_arch = "aarch64"))]
const POINTER_MASK: u64 = u64::MAX;

/// A Mach-O image mapped into the current process.
///
/// Reads dereference raw pointers. The loader has already applied every
/// fixup, so pointer slots hold final addresses and no fixup tables exist.
#[derive(Debug)]
pub struct MachOImage {
    base: RawAddress,
    macho: MachOContext,
    /// `base - __TEXT.vmaddr`
    slide: i64,
}

impl MachOImage {
    /// Wraps the image whose Mach-O header is at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point to a complete Mach-O image that stays mapped and
    /// unmodified for the lifetime of the returned value, and every address
    /// later read through it must be mapped readable memory.
    pub unsafe fn from_header(header: *const u8) -> Result<Self> {
        if header.is_null() {
            return Err(Error::AddressOutOfRange { address: 0 });
        }
        // SAFETY: the caller guarantees a mapped header.
        let fixed = unsafe { std::slice::from_raw_parts(header, MachHeader64::SIZE) };
        let sizeofcmds = crate::util::checked_u32_le(fixed, 20).unwrap_or(0) as usize;
        // SAFETY: load commands directly follow the header in a mapped image.
        let commands =
            unsafe { std::slice::from_raw_parts(header, MachHeader64::SIZE + sizeofcmds) };
        let macho = MachOContext::parse(commands)?;

        let base = RawAddress::from_ptr(header);
        let slide = (base.0 as i64).wrapping_sub(macho.text_vmaddr() as i64);
        tracing::debug!(base = format_args!("{:#x}", base), "wrapped in-process image");
        Ok(Self { base, macho, slide })
    }

    /// Returns the address of the Mach-O header.
    pub fn base(&self) -> RawAddress {
        self.base
    }

    /// Returns the parsed header and load commands.
    pub fn macho(&self) -> &MachOContext {
        &self.macho
    }

    /// Returns the loaded address of an unslid vmaddr from the load commands.
    pub fn slid(&self, vmaddr: u64) -> RawAddress {
        RawAddress((vmaddr as i64).wrapping_add(self.slide) as usize)
    }

    /// Returns the loaded address and size of a section's contents.
    pub fn section_range(&self, name: &str) -> Option<(RawAddress, u64)> {
        self.macho
            .find_section(name)
            .map(|section| (self.slid(section.addr), section.size))
    }

    fn linkedit_bytes(&self, file_offset: u64, len: usize) -> Result<&[u8]> {
        let vmaddr = self
            .macho
            .linkedit_vmaddr(file_offset)
            .ok_or(Error::AddressOutOfRange {
                address: file_offset,
            })?;
        self.bytes_at(self.slid(vmaddr), len)
    }
}

impl ReadingContext for MachOImage {
    type Address = RawAddress;

    #[inline]
    fn bytes_at(&self, at: RawAddress, len: usize) -> Result<&[u8]> {
        if at.0 == 0 {
            return Err(Error::AddressOutOfRange { address: 0 });
        }
        // SAFETY: `from_header`'s contract covers every address read here.
        Ok(unsafe { std::slice::from_raw_parts(at.as_ptr(), len) })
    }

    fn c_string_bytes(&self, at: RawAddress) -> Result<&[u8]> {
        if at.0 == 0 {
            return Err(Error::AddressOutOfRange { address: 0 });
        }
        // SAFETY: as above; C strings in a mapped image are NUL-terminated.
        Ok(unsafe { CStr::from_ptr(at.as_ptr().cast()) }.to_bytes())
    }

    #[inline]
    fn address_from_offset(&self, offset: u64) -> RawAddress {
        self.base.advanced(offset as usize)
    }

    #[inline]
    fn offset_from_address(&self, address: RawAddress) -> u64 {
        address.delta_from(self.base) as u64
    }

    #[inline]
    fn address_from_virtual_address(&self, vmaddr: u64) -> Result<RawAddress> {
        Ok(RawAddress(self.strip_pointer_tags(vmaddr) as usize))
    }

    #[inline]
    fn strip_pointer_tags(&self, value: u64) -> u64 {
        value & POINTER_MASK
    }
}

impl SymbolSource for MachOImage {
    fn identity(&self) -> BinaryIdentity {
        BinaryIdentity::Image(self.base.0)
    }

    /// Symbol values are offsets from the Mach-O header.
    fn symbols(&self) -> Result<Vec<RawSymbol>> {
        let Some(symtab) = self.macho.symtab() else {
            return Ok(Vec::new());
        };
        let count = symtab.nsyms as usize;
        let table = self.linkedit_bytes(symtab.symoff as u64, count * Nlist64::SIZE)?;
        let strings = self.linkedit_bytes(symtab.stroff as u64, symtab.strsize as usize)?;

        let text = self.macho.text_vmaddr();
        let mut symbols = parse_symbol_table(table, count, strings);
        symbols.retain_mut(|symbol| match symbol.value.checked_sub(text) {
            Some(offset) => {
                symbol.value = offset;
                true
            }
            None => false,
        });
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
}

#[cfg(test)]
mod tests {
    use zerocopy::IntoBytes;

    use super::*;
    use crate::macho::{SegmentCommand64, MH_MAGIC_64};

    fn image_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 0x1000];
        let mut seg = SegmentCommand64::default();
        seg.segname[..6].copy_from_slice(b"__TEXT");
        seg.vmaddr = 0x1_0000_0000;
        seg.vmsize = 0x1000;
        seg.filesize = 0x1000;
        data[MachHeader64::SIZE..MachHeader64::SIZE + SegmentCommand64::SIZE]
            .copy_from_slice(seg.as_bytes());
        let header = MachHeader64 {
            ncmds: 1,
            sizeofcmds: SegmentCommand64::SIZE as u32,
            ..MachHeader64::default()
        };
        data[..MachHeader64::SIZE].copy_from_slice(header.as_bytes());
        data[0x200..0x204].copy_from_slice(b"abc\0");
        data
    }

    #[test]
    fn test_in_process_reads() {
        let data = image_bytes();
        let image = unsafe { MachOImage::from_header(data.as_ptr()) }.unwrap();

        let magic: u32 = image.read_element(image.base()).unwrap();
        assert_eq!(magic, MH_MAGIC_64);

        let at = image.address_from_offset(0x200);
        assert_eq!(at, RawAddress::from_ptr(data.as_ptr()).advanced(0x200));
        assert_eq!(image.offset_from_address(at), 0x200);
        assert_eq!(image.read_c_string(at).unwrap(), "abc");
        assert!(image.fixups().is_none());

        assert!(image.section_range("__text").is_none());
        assert_eq!(image.slid(0x1_0000_0200), at);
    }

    #[test]
    fn test_null_rejected() {
        assert!(unsafe { MachOImage::from_header(std::ptr::null()) }.is_err());
    }
}
