//! Dyld shared cache context and file handling.
//!
//! [`SharedCache`] owns the main cache file, its sub-caches and the optional
//! `.symbols` file, parses their mappings into a [`CacheAddressTranslator`]
//! and enumerates the images the main header lists.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use zerocopy::FromBytes;

use super::slide::SlideInfo;
use super::structs::*;
use super::translator::{CacheAddressTranslator, MappingEntry};
use crate::error::{Error, Result};
use crate::image::OpenOptions;
use crate::macho::{parse_symbol_table, Nlist64, RawSymbol};
use crate::reading::{c_string_in, window, Backing, FixupTable};

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Unslid virtual address of the Mach-O header
    pub address: u64,
    /// Path of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Index of the cache file holding the header (0 = main cache)
    pub cache_index: usize,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path matches the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Cache File
// =============================================================================

/// One file of a split cache.
#[derive(Debug)]
pub struct CacheFile {
    /// File contents
    pub backing: Backing,
    /// Path to the file (empty for in-memory caches)
    pub path: PathBuf,
    /// Parsed header
    pub header: DyldCacheHeader,
}

impl CacheFile {
    /// Parses the header of `backing`.
    pub fn new(backing: Backing, path: PathBuf) -> Result<Self> {
        let header = parse_header(&backing)?;
        Ok(Self {
            backing,
            path,
            header,
        })
    }
}

/// Parses and validates a cache header.
fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
    let header = DyldCacheHeader::read_from_prefix(data)
        .map_err(|_| Error::buffer_too_small(std::mem::size_of::<DyldCacheHeader>(), data.len()))?
        .0;

    if !header.is_valid() {
        return Err(Error::InvalidMagic([
            header.magic[0],
            header.magic[1],
            header.magic[2],
            header.magic[3],
        ]));
    }
    Ok(header)
}

/// Parses the mappings of one cache file, attaching decoded slide info.
fn parse_mappings(file: &CacheFile, cache_index: usize) -> Result<Vec<MappingEntry>> {
    let header = &file.header;
    let data = &file.backing[..];

    if header.has_extended_mappings() {
        let offset = header.mapping_with_slide_offset as usize;
        let entry_size = std::mem::size_of::<DyldCacheMappingAndSlideInfo>();
        (0..header.mapping_with_slide_count as usize)
            .map(|i| {
                let entry_offset = offset + i * entry_size;
                let info = DyldCacheMappingAndSlideInfo::read_from_prefix(
                    data.get(entry_offset..).unwrap_or(&[]),
                )
                .map_err(|_| Error::parse(entry_offset, "failed to parse extended mapping"))?
                .0;

                let mut mapping = MappingEntry::from_extended(&info, cache_index);
                if info.slide_info_file_size > 0 {
                    match SlideInfo::parse(data, info.slide_info_file_offset as usize) {
                        Ok(slide) => mapping.slide = Some(slide),
                        Err(e) => warn!(
                            address = format_args!("{:#x}", info.address),
                            error = %e,
                            "ignoring slide info"
                        ),
                    }
                }
                Ok(mapping)
            })
            .collect()
    } else {
        let offset = header.mapping_offset as usize;
        let entry_size = std::mem::size_of::<DyldCacheMappingInfo>();
        (0..header.mapping_count as usize)
            .map(|i| {
                let entry_offset = offset + i * entry_size;
                let info =
                    DyldCacheMappingInfo::read_from_prefix(data.get(entry_offset..).unwrap_or(&[]))
                        .map_err(|_| Error::parse(entry_offset, "failed to parse mapping"))?
                        .0;
                Ok(MappingEntry::from_basic(&info, cache_index))
            })
            .collect()
    }
}

// =============================================================================
// Local Symbols
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct LocalSymbols {
    /// Whether the info lives in the `.symbols` file rather than the main cache
    in_symbols_file: bool,
    /// File offset of the info header
    base: usize,
    info: DyldCacheLocalSymbolsInfo,
    /// Entries carry 64-bit VM offsets instead of 32-bit file offsets
    wide_entries: bool,
}

// =============================================================================
// Shared Cache
// =============================================================================

/// An opened dyld shared cache.
///
/// Addresses handed to [`bytes_at`](Self::bytes_at) are unslid virtual
/// addresses; images opened from the cache address their bytes as offsets
/// from [`shared_region_start`](Self::shared_region_start).
#[derive(Debug)]
pub struct SharedCache {
    files: Vec<CacheFile>,
    symbols_file: Option<CacheFile>,
    images: Vec<ImageEntry>,
    translator: CacheAddressTranslator,
    local_symbols: Option<LocalSymbols>,
}

impl SharedCache {
    /// Opens a dyld shared cache and its sub-caches from the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, &OpenOptions::default())
    }

    /// Opens a dyld shared cache with explicit options.
    pub fn open_with<P: AsRef<Path>>(path: P, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let main = CacheFile::new(Backing::map(&path)?, path.clone())?;
        debug!(path = %path.display(), header = %main.header, "opened shared cache");

        let mut files = vec![];
        let subcaches = Self::subcache_entries(&main)?;
        let parent_dir = path.parent().unwrap_or(Path::new("."));
        let main_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();

        for (uuid, suffix) in subcaches {
            let sub_path = parent_dir.join(format!("{main_name}{suffix}"));
            let backing = Backing::map(&sub_path).map_err(|_| Error::SubcacheNotFound {
                path: sub_path.clone(),
            })?;
            let sub = CacheFile::new(backing, sub_path.clone())?;
            if sub.header.uuid != uuid {
                return Err(Error::SubcacheUuidMismatch {
                    path: sub_path,
                    expected: uuid_to_string(&uuid),
                    actual: uuid_to_string(&sub.header.uuid),
                });
            }
            files.push(sub);
        }

        let mut symbols_file = None;
        if options.load_symbols_file && main.header.has_symbol_file() {
            let symbols_path = parent_dir.join(format!("{main_name}.symbols"));
            if symbols_path.exists() {
                let file = CacheFile::new(Backing::map(&symbols_path)?, symbols_path.clone())?;
                if file.header.uuid != main.header.symbol_file_uuid {
                    return Err(Error::SubcacheUuidMismatch {
                        path: symbols_path,
                        expected: uuid_to_string(&main.header.symbol_file_uuid),
                        actual: uuid_to_string(&file.header.uuid),
                    });
                }
                symbols_file = Some(file);
            }
        }

        files.insert(0, main);
        Self::assemble(files, symbols_file)
    }

    /// Builds a cache from in-memory files.
    ///
    /// `subcaches` must be in the order the main header lists them; their
    /// UUIDs are not checked.
    pub fn from_backings(
        main: Backing,
        subcaches: Vec<Backing>,
        symbols: Option<Backing>,
    ) -> Result<Self> {
        let mut files = Vec::with_capacity(subcaches.len() + 1);
        files.push(CacheFile::new(main, PathBuf::new())?);
        for sub in subcaches {
            files.push(CacheFile::new(sub, PathBuf::new())?);
        }
        let symbols_file = symbols
            .map(|backing| CacheFile::new(backing, PathBuf::new()))
            .transpose()?;
        Self::assemble(files, symbols_file)
    }

    /// Reads the `(uuid, file suffix)` of every sub-cache the main header lists.
    fn subcache_entries(main: &CacheFile) -> Result<Vec<([u8; 16], String)>> {
        if !main.header.has_subcaches() {
            return Ok(Vec::new());
        }

        let data = &main.backing[..];
        let count = main.header.sub_cache_array_count as usize;
        let offset = main.header.sub_cache_array_offset as usize;

        // V2 entries embed the file suffix, which always starts with '.'.
        let v2 = DyldSubcacheEntry2::read_from_prefix(data.get(offset..).unwrap_or(&[]))
            .map(|(entry, _)| entry.file_suffix[0] == b'.')
            .unwrap_or(false);
        let entry_size = if v2 {
            std::mem::size_of::<DyldSubcacheEntry2>()
        } else {
            std::mem::size_of::<DyldSubcacheEntry>()
        };

        (0..count)
            .map(|i| {
                let entry_offset = offset + i * entry_size;
                let bytes = data.get(entry_offset..).unwrap_or(&[]);
                if v2 {
                    let entry = DyldSubcacheEntry2::read_from_prefix(bytes)
                        .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry v2"))?
                        .0;
                    Ok((entry.uuid, entry.suffix_str().to_string()))
                } else {
                    let entry = DyldSubcacheEntry::read_from_prefix(bytes)
                        .map_err(|_| Error::parse(entry_offset, "failed to parse subcache entry"))?
                        .0;
                    Ok((entry.uuid, format!(".{}", i + 1)))
                }
            })
            .collect()
    }

    fn assemble(files: Vec<CacheFile>, symbols_file: Option<CacheFile>) -> Result<Self> {
        let main = &files[0];
        let mut translator = CacheAddressTranslator::new(
            main.header.shared_region_start(),
            main.header.architecture(),
        );
        for (index, file) in files.iter().enumerate() {
            let mappings = parse_mappings(file, index)?;
            if index == 0 && mappings.is_empty() {
                return Err(Error::CacheUnavailable {
                    reason: format!("{} has no mappings", file.path.display()),
                });
            }
            translator.add_region(mappings);
        }

        let images = Self::parse_images(main, &translator)?;
        let local_symbols = Self::parse_local_symbols(main, symbols_file.as_ref())?;

        debug!(
            files = files.len(),
            mappings = translator.mappings().len(),
            images = images.len(),
            local_symbols = local_symbols.is_some(),
            "assembled shared cache"
        );

        Ok(Self {
            files,
            symbols_file,
            images,
            translator,
            local_symbols,
        })
    }

    /// Parses the image list of the main cache.
    fn parse_images(main: &CacheFile, translator: &CacheAddressTranslator) -> Result<Vec<ImageEntry>> {
        let data = &main.backing[..];
        let count = main.header.actual_images_count() as usize;
        let offset = main.header.actual_images_offset() as usize;
        let entry_size = std::mem::size_of::<DyldCacheImageInfo>();

        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            let entry_offset = offset + i * entry_size;
            let info = DyldCacheImageInfo::read_from_prefix(data.get(entry_offset..).unwrap_or(&[]))
                .map_err(|_| Error::parse(entry_offset, "failed to parse image info"))?
                .0;

            let path = c_string_in(data, info.path_file_offset as u64)?;
            let path = String::from_utf8_lossy(path).into_owned();

            let cache_index = match translator.translate(info.address) {
                Ok((index, _)) => index,
                Err(_) => {
                    warn!(path, address = format_args!("{:#x}", info.address), "image outside all mappings");
                    continue;
                }
            };

            images.push(ImageEntry {
                index: i,
                address: info.address,
                path,
                cache_index,
            });
        }
        Ok(images)
    }

    /// Locates the local symbols info in the `.symbols` file or the main cache.
    fn parse_local_symbols(
        main: &CacheFile,
        symbols_file: Option<&CacheFile>,
    ) -> Result<Option<LocalSymbols>> {
        let (file, in_symbols_file) = match symbols_file {
            Some(file) if file.header.local_symbols_offset != 0 => (file, true),
            _ if main.header.local_symbols_offset != 0 && main.header.local_symbols_size != 0 => {
                (main, false)
            }
            _ => return Ok(None),
        };

        let base = file.header.local_symbols_offset as usize;
        let Ok((info, _)) =
            DyldCacheLocalSymbolsInfo::read_from_prefix(file.backing.get(base..).unwrap_or(&[]))
        else {
            warn!(offset = base, "local symbols info out of range");
            return Ok(None);
        };

        Ok(Some(LocalSymbols {
            in_symbols_file,
            base,
            info,
            wide_entries: main.header.has_symbol_file(),
        }))
    }

    // ==================== Accessors ====================

    /// Returns the main cache header.
    pub fn header(&self) -> &DyldCacheHeader {
        &self.files[0].header
    }

    /// Returns the path of the main cache file.
    pub fn path(&self) -> &Path {
        &self.files[0].path
    }

    /// Returns the cache architecture.
    pub fn architecture(&self) -> &str {
        self.header().architecture()
    }

    /// Returns the main cache's shared region start.
    #[inline]
    pub fn shared_region_start(&self) -> u64 {
        self.translator.shared_region_start()
    }

    /// Returns the address translator.
    #[inline]
    pub fn translator(&self) -> &CacheAddressTranslator {
        &self.translator
    }

    /// Returns the bytes of cache file `index`.
    #[inline]
    pub fn data_for(&self, index: usize) -> &[u8] {
        self.files.get(index).map(|f| &f.backing[..]).unwrap_or(&[])
    }

    // ==================== Reading ====================

    /// Returns `len` bytes at an unslid virtual address.
    #[inline]
    pub fn bytes_at(&self, address: u64, len: usize) -> Result<&[u8]> {
        let (index, local) = self.translator.translate(address)?;
        window(self.data_for(index), local, len)
    }

    /// Returns the bytes of the NUL-terminated string at an unslid address.
    pub fn c_string_at(&self, address: u64) -> Result<&[u8]> {
        let (index, local) = self.translator.translate(address)?;
        c_string_in(self.data_for(index), local)
    }

    // ==================== Images ====================

    /// Returns an iterator over all images.
    pub fn images(&self) -> impl Iterator<Item = &ImageEntry> {
        self.images.iter()
    }

    /// Number of images in the cache.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Finds an image by exact install path, falling back to a path or
    /// basename substring match.
    pub fn find_image(&self, name: &str) -> Option<&ImageEntry> {
        self.images
            .iter()
            .find(|img| img.path == name)
            .or_else(|| self.images.iter().find(|img| img.matches_filter(name)))
    }

    /// Like [`find_image`](Self::find_image), failing with
    /// [`Error::MissingImageIdentifier`].
    pub fn image(&self, name: &str) -> Result<&ImageEntry> {
        self.find_image(name)
            .ok_or_else(|| Error::MissingImageIdentifier {
                name: name.to_string(),
            })
    }

    /// Returns the local (non-exported) symbols of an image.
    ///
    /// Local symbols are stripped from the images themselves and kept in the
    /// main cache or the `.symbols` file; an empty list means the cache has
    /// none for this image.
    pub fn local_symbols(&self, image: &ImageEntry) -> Result<Vec<RawSymbol>> {
        let Some(local) = self.local_symbols else {
            return Ok(Vec::new());
        };
        let data: &[u8] = if local.in_symbols_file {
            self.symbols_file
                .as_ref()
                .map(|f| &f.backing[..])
                .unwrap_or(&[])
        } else {
            self.data_for(0)
        };

        let info = local.info;
        let entries_at = local.base + info.entries_offset as usize;

        let dylib_key = if local.wide_entries {
            match image.address.checked_sub(self.shared_region_start()) {
                Some(vm_offset) => vm_offset,
                None => return Ok(Vec::new()),
            }
        } else {
            match self.translator.translate(image.address) {
                Ok((0, local_offset)) => local_offset,
                _ => return Ok(Vec::new()),
            }
        };

        let mut range = None;
        for i in 0..info.entries_count as usize {
            let (dylib_offset, start, count) = if local.wide_entries {
                let at = entries_at + i * std::mem::size_of::<DyldCacheLocalSymbolsEntry64>();
                let entry = DyldCacheLocalSymbolsEntry64::read_from_prefix(data.get(at..).unwrap_or(&[]))
                    .map_err(|_| Error::parse(at, "failed to parse local symbols entry"))?
                    .0;
                (entry.dylib_offset, entry.nlist_start_index, entry.nlist_count)
            } else {
                let at = entries_at + i * std::mem::size_of::<DyldCacheLocalSymbolsEntry>();
                let entry = DyldCacheLocalSymbolsEntry::read_from_prefix(data.get(at..).unwrap_or(&[]))
                    .map_err(|_| Error::parse(at, "failed to parse local symbols entry"))?
                    .0;
                (entry.dylib_offset as u64, entry.nlist_start_index, entry.nlist_count)
            };
            if dylib_offset == dylib_key {
                range = Some((start as usize, count as usize));
                break;
            }
        }

        let Some((start, count)) = range else {
            return Ok(Vec::new());
        };

        let nlist_at = local.base + info.nlist_offset as usize + start * Nlist64::SIZE;
        let symbols = window(data, nlist_at as u64, count * Nlist64::SIZE)?;
        let strings_at = local.base + info.strings_offset as usize;
        let strings = window(data, strings_at as u64, info.strings_size as usize)?;
        Ok(parse_symbol_table(symbols, count, strings))
    }
}

// =============================================================================
// Slide-Info Rebases
// =============================================================================

/// The cache's fixups, keyed by offset from the shared region start.
///
/// Caches carry no bind table: every external reference was resolved when
/// the cache was built. A slot rebases when its mapping has slide info and
/// the stored value is non-zero.
impl FixupTable for SharedCache {
    fn bind_symbol(&self, _offset: u64) -> Option<&str> {
        None
    }

    fn rebase_target(&self, offset: u64) -> Option<u64> {
        let address = self.shared_region_start().checked_add(offset)?;
        let mapping = self.translator.mapping_for(address)?;
        let slide = mapping.slide.as_ref()?;
        let raw = crate::util::checked_u64_le(
            self.data_for(mapping.cache_index),
            mapping.addr_to_offset(address) as usize,
        )?;
        (raw != 0).then(|| slide.decode(raw))
    }
}
