//! Address translation across a main cache and its sub-caches.
//!
//! Every cache file describes the virtual ranges it backs with mapping
//! entries. An unslid address is looked up in the main cache's mappings first,
//! then in each sub-cache in the order the main header lists them; the first
//! mapping that contains the address decides which file the bytes live in.

use super::slide::SlideInfo;
use super::structs::{DyldCacheMappingAndSlideInfo, DyldCacheMappingInfo, MappingFlags};
use crate::error::{Error, Result};
use crate::util::ADDR_MASK_48BIT;

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry covering both basic and extended mapping formats.
#[derive(Debug, Clone)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset within the owning cache file
    pub file_offset: u64,
    /// Initial protection
    pub init_prot: u32,
    /// Mapping flags
    pub flags: MappingFlags,
    /// Index of the cache file containing this mapping (0 = main cache)
    pub cache_index: usize,
    /// Decoded slide info header, when the mapping has one
    pub slide: Option<SlideInfo>,
}

impl MappingEntry {
    /// Creates a mapping entry from basic mapping info.
    pub fn from_basic(info: &DyldCacheMappingInfo, cache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            init_prot: info.init_prot,
            flags: MappingFlags::empty(),
            cache_index,
            slide: None,
        }
    }

    /// Creates a mapping entry from extended mapping info.
    ///
    /// Slide info is attached separately once the owning file is readable.
    pub fn from_extended(info: &DyldCacheMappingAndSlideInfo, cache_index: usize) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            init_prot: info.init_prot,
            flags: MappingFlags::from_bits_truncate(info.flags),
            cache_index,
            slide: None,
        }
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    /// Converts a virtual address inside this mapping to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    /// Returns true if pointers in this mapping are slid.
    #[inline]
    pub fn has_slide_info(&self) -> bool {
        self.slide.is_some()
    }
}

// =============================================================================
// Cache Address Translator
// =============================================================================

/// Maps unslid cache addresses to `(cache file index, local file offset)`.
#[derive(Debug, Clone)]
pub struct CacheAddressTranslator {
    shared_region_start: u64,
    mappings: Vec<MappingEntry>,
    regions: usize,
    tag_mask: u64,
}

impl CacheAddressTranslator {
    /// Creates a translator for a cache whose shared region starts at
    /// `shared_region_start`.
    ///
    /// `architecture` is the cache's architecture string; arm64 variants
    /// carry pointer-authentication bits that [`strip_pointer_tags`] removes.
    ///
    /// [`strip_pointer_tags`]: Self::strip_pointer_tags
    pub fn new(shared_region_start: u64, architecture: &str) -> Self {
        let tag_mask = if architecture.starts_with("arm64") {
            ADDR_MASK_48BIT
        } else {
            u64::MAX
        };
        Self {
            shared_region_start,
            mappings: Vec::new(),
            regions: 0,
            tag_mask,
        }
    }

    /// Registers the mappings of the next cache file and returns its index.
    ///
    /// The main cache must be registered first.
    pub fn add_region(&mut self, mappings: impl IntoIterator<Item = MappingEntry>) -> usize {
        let index = self.regions;
        self.mappings.extend(mappings.into_iter().map(|mut m| {
            m.cache_index = index;
            m
        }));
        self.regions += 1;
        index
    }

    /// Returns the main cache's shared region start.
    #[inline]
    pub fn shared_region_start(&self) -> u64 {
        self.shared_region_start
    }

    /// Number of registered cache files.
    #[inline]
    pub fn region_count(&self) -> usize {
        self.regions
    }

    /// Returns every registered mapping in lookup order.
    pub fn mappings(&self) -> &[MappingEntry] {
        &self.mappings
    }

    /// Returns the first mapping containing `address`.
    #[inline]
    pub fn mapping_for(&self, address: u64) -> Option<&MappingEntry> {
        self.mappings.iter().find(|m| m.contains_addr(address))
    }

    /// Translates an unslid address to `(cache_index, local_offset)`.
    #[inline]
    pub fn translate(&self, address: u64) -> Result<(usize, u64)> {
        self.mapping_for(address)
            .map(|m| (m.cache_index, m.addr_to_offset(address)))
            .ok_or_else(|| Error::unmapped(address))
    }

    /// Translates an offset from the main cache's shared region start.
    #[inline]
    pub fn translate_from_start(&self, offset: u64) -> Result<(usize, u64)> {
        self.translate(self.shared_region_start.wrapping_add(offset))
    }

    /// Removes pointer-authentication bits from a raw pointer value.
    #[inline]
    pub fn strip_pointer_tags(&self, value: u64) -> u64 {
        value & self.tag_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(address: u64, size: u64, file_offset: u64) -> MappingEntry {
        MappingEntry {
            address,
            size,
            file_offset,
            init_prot: 1,
            flags: MappingFlags::empty(),
            cache_index: 0,
            slide: None,
        }
    }

    fn translator() -> CacheAddressTranslator {
        let mut translator = CacheAddressTranslator::new(0x1_8000_0000, "arm64e");
        translator.add_region([
            mapping(0x1_8000_0000, 0x4000, 0),
            mapping(0x1_8000_8000, 0x1000, 0x4000),
        ]);
        translator.add_region([mapping(0x1_8001_0000, 0x2000, 0)]);
        translator
    }

    #[test]
    fn test_mapping_entry_contains() {
        let m = mapping(0x1000, 0x1000, 0);
        assert!(m.contains_addr(0x1000));
        assert!(m.contains_addr(0x1FFF));
        assert!(!m.contains_addr(0x2000));
        assert!(!m.contains_addr(0x0FFF));
        assert!(!mapping(u64::MAX - 0x10, 0x100, 0).contains_addr(0x10));
    }

    #[test]
    fn test_translate_main_cache() {
        let translator = translator();
        assert_eq!(translator.translate(0x1_8000_0010).unwrap(), (0, 0x10));
        assert_eq!(translator.translate(0x1_8000_8020).unwrap(), (0, 0x4020));
        assert_eq!(translator.translate_from_start(0x8020).unwrap(), (0, 0x4020));
    }

    #[test]
    fn test_translate_subcache() {
        let translator = translator();
        let sub_start = 0x1_8001_0000;
        let addr = sub_start + 0x123;
        assert_eq!(translator.translate(addr).unwrap(), (1, addr - sub_start));
        assert_eq!(translator.region_count(), 2);
    }

    #[test]
    fn test_unmapped() {
        let translator = translator();
        for addr in [0x1_8000_4000, 0x1_8001_2000, 0x1000] {
            assert!(matches!(
                translator.translate(addr),
                Err(Error::UnmappedAddress { addr: a }) if a == addr
            ));
        }
    }

    #[test]
    fn test_strip_pointer_tags() {
        let arm = CacheAddressTranslator::new(0, "arm64e");
        assert_eq!(arm.strip_pointer_tags(0x8010_0001_8000_1234), 0x0001_8000_1234);
        let intel = CacheAddressTranslator::new(0, "x86_64h");
        assert_eq!(intel.strip_pointer_tags(0x8010_0001_8000_1234), 0x8010_0001_8000_1234);
    }
}
