//! Per-binary memoized symbol indices.
//!
//! Building the `offset -> names` index for a binary walks its whole symbol
//! table and export trie, so it is done once per [`BinaryIdentity`] and shared.
//! Entries live until a memory-pressure signal (or an explicit invalidation)
//! drops them; the next lookup rebuilds.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use once_cell::sync::{Lazy, OnceCell};
use tracing::debug;

use super::Symbol;
use crate::error::Result;
use crate::macho::{ExportInfo, RawSymbol};

// =============================================================================
// Symbol Source
// =============================================================================

/// Identifies a binary for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BinaryIdentity {
    /// A binary read from a file. For fat files and cache images,
    /// `header_offset` tells slices apart.
    File {
        /// Path the binary was opened from
        path: PathBuf,
        /// Offset of the Mach-O header
        header_offset: u64,
    },
    /// An image in the current process, by header address.
    Image(usize),
}

/// A binary whose symbols can be indexed.
pub trait SymbolSource {
    /// Returns the cache key.
    fn identity(&self) -> BinaryIdentity;

    /// Returns the defined symbols from the symbol table.
    fn symbols(&self) -> Result<Vec<RawSymbol>>;

    /// Returns the exported symbols, re-exports excluded.
    fn exported_symbols(&self) -> Result<Vec<ExportInfo>>;

    /// Start of the shared region when the binary lives in a shared cache.
    fn shared_region_start(&self) -> Option<u64> {
        None
    }

    /// Offset of this image's header in its reading context.
    fn start_offset(&self) -> u64 {
        0
    }
}

// =============================================================================
// Symbol Entry
// =============================================================================

/// The symbol index of one binary.
#[derive(Debug, Default)]
pub struct SymbolEntry {
    by_offset: HashMap<u64, Vec<String>>,
    by_name: HashMap<String, Vec<u64>>,
}

impl SymbolEntry {
    /// Builds the index for `source`.
    ///
    /// Symbol-table values are inserted as-is and, in a shared cache, also
    /// relative to the shared region start. Exports are inserted at their
    /// trie offset and at that offset plus the image's start offset.
    pub fn build<S: SymbolSource + ?Sized>(source: &S) -> Result<Self> {
        let mut entry = Self::default();
        let region_start = source.shared_region_start();

        let symbols = source.symbols()?;
        for symbol in &symbols {
            entry.insert(symbol.value, &symbol.name);
            if let Some(start) = region_start {
                if let Some(offset) = symbol.value.checked_sub(start) {
                    entry.insert(offset, &symbol.name);
                }
            }
        }

        let start_offset = source.start_offset();
        let exports = source.exported_symbols()?;
        for export in &exports {
            entry.insert(export.offset, &export.name);
            if start_offset != 0 {
                entry.insert(export.offset.wrapping_add(start_offset), &export.name);
            }
        }

        debug!(
            identity = ?source.identity(),
            symbols = symbols.len(),
            exports = exports.len(),
            offsets = entry.by_offset.len(),
            "built symbol index"
        );
        Ok(entry)
    }

    fn insert(&mut self, offset: u64, name: &str) {
        let names = self.by_offset.entry(offset).or_default();
        if names.iter().any(|existing| existing == name) {
            return;
        }
        names.push(name.to_owned());
        self.by_name.entry(name.to_owned()).or_default().push(offset);
    }

    /// Returns the symbols at `offset`, in insertion order.
    pub fn symbols_at(&self, offset: u64) -> Vec<Symbol> {
        self.by_offset
            .get(&offset)
            .map(|names| {
                names
                    .iter()
                    .map(|name| Symbol::new(name.clone(), offset))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns every offset a symbol name was inserted at.
    pub fn offsets_of(&self, name: &str) -> &[u64] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct offsets.
    pub fn len(&self) -> usize {
        self.by_offset.len()
    }

    /// Returns true if no symbol was indexed.
    pub fn is_empty(&self) -> bool {
        self.by_offset.is_empty()
    }
}

// =============================================================================
// Symbol Cache
// =============================================================================

type Slot = Arc<OnceCell<Arc<SymbolEntry>>>;

/// Memoized [`SymbolEntry`] per binary.
///
/// The first lookup for an identity builds its entry; concurrent first
/// lookups wait on that single build. Invalidation swaps the map out, so
/// readers already holding an entry keep using it.
#[derive(Debug, Default)]
pub struct SymbolCache {
    entries: Mutex<HashMap<BinaryIdentity, Slot>>,
}

impl SymbolCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide cache, registered with
    /// [`MemoryPressureMonitor::global`].
    pub fn shared() -> &'static Arc<SymbolCache> {
        &SHARED_SYMBOL_CACHE
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BinaryIdentity, Slot>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the entry for `source`, building it on first use.
    pub fn build_entry<S: SymbolSource + ?Sized>(&self, source: &S) -> Result<Arc<SymbolEntry>> {
        let slot = self.lock().entry(source.identity()).or_default().clone();
        slot.get_or_try_init(|| SymbolEntry::build(source).map(Arc::new))
            .cloned()
    }

    /// Returns the symbols at `offset` in `source`'s offset space.
    pub fn lookup<S: SymbolSource + ?Sized>(&self, source: &S, offset: u64) -> Result<Vec<Symbol>> {
        Ok(self.build_entry(source)?.symbols_at(offset))
    }

    /// Returns the offsets of `name` in `source`.
    pub fn offsets_of<S: SymbolSource + ?Sized>(&self, source: &S, name: &str) -> Result<Vec<u64>> {
        Ok(self.build_entry(source)?.offsets_of(name).to_vec())
    }

    /// Drops the entry of one binary.
    pub fn invalidate(&self, identity: &BinaryIdentity) {
        self.lock().remove(identity);
    }

    /// Drops every entry.
    pub fn invalidate_all(&self) {
        let dropped = std::mem::take(&mut *self.lock());
        debug!(entries = dropped.len(), "invalidated symbol cache");
    }

    /// Number of identities with an entry (built or being built).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// =============================================================================
// Memory Pressure
// =============================================================================

/// Receives memory-pressure notifications.
pub trait PressureListener: Send + Sync {
    /// Releases whatever can be rebuilt.
    fn on_memory_pressure(&self);
}

impl PressureListener for SymbolCache {
    fn on_memory_pressure(&self) {
        self.invalidate_all();
    }
}

/// Fans memory-pressure signals out to registered listeners.
///
/// Listeners are held weakly; dropped listeners are pruned on the next signal.
/// The embedding application decides when to call [`signal`](Self::signal),
/// e.g. from a platform memory-warning hook.
#[derive(Default)]
pub struct MemoryPressureMonitor {
    listeners: Mutex<Vec<Weak<dyn PressureListener>>>,
}

impl MemoryPressureMonitor {
    /// Creates a monitor with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide monitor.
    pub fn global() -> &'static MemoryPressureMonitor {
        &GLOBAL_PRESSURE_MONITOR
    }

    /// Registers a listener for as long as it is alive.
    pub fn register<L: PressureListener + 'static>(&self, listener: &Arc<L>) {
        let weak: Weak<dyn PressureListener> = Arc::downgrade(listener) as Weak<dyn PressureListener>;
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(weak);
    }

    /// Notifies every live listener. Returns how many were notified.
    pub fn signal(&self) -> usize {
        let live: Vec<Arc<dyn PressureListener>> = {
            let mut listeners = self
                .listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            listeners.retain(|listener| listener.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in &live {
            listener.on_memory_pressure();
        }
        debug!(listeners = live.len(), "memory pressure signalled");
        live.len()
    }
}

static GLOBAL_PRESSURE_MONITOR: Lazy<MemoryPressureMonitor> = Lazy::new(MemoryPressureMonitor::new);

static SHARED_SYMBOL_CACHE: Lazy<Arc<SymbolCache>> = Lazy::new(|| {
    let cache = Arc::new(SymbolCache::new());
    MemoryPressureMonitor::global().register(&cache);
    cache
});

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::macho::trie::EXPORT_SYMBOL_FLAGS_KIND_REGULAR;

    struct FakeSource {
        builds: AtomicUsize,
        region_start: Option<u64>,
        start_offset: u64,
    }

    impl FakeSource {
        fn new(region_start: Option<u64>, start_offset: u64) -> Self {
            Self {
                builds: AtomicUsize::new(0),
                region_start,
                start_offset,
            }
        }
    }

    impl SymbolSource for FakeSource {
        fn identity(&self) -> BinaryIdentity {
            BinaryIdentity::File {
                path: PathBuf::from("/usr/lib/swift/libswiftCore.dylib"),
                header_offset: self.start_offset,
            }
        }

        fn symbols(&self) -> Result<Vec<RawSymbol>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                RawSymbol {
                    name: "_$sSiN".into(),
                    value: 0x1_8000_4000,
                    external: true,
                },
                RawSymbol {
                    name: "_$sSiMn".into(),
                    value: 0x1_8000_4000,
                    external: true,
                },
            ])
        }

        fn exported_symbols(&self) -> Result<Vec<ExportInfo>> {
            Ok(vec![ExportInfo {
                name: "_$sSSN".into(),
                flags: EXPORT_SYMBOL_FLAGS_KIND_REGULAR,
                offset: 0x200,
                reexport_ordinal: None,
                reexport_name: None,
            }])
        }

        fn shared_region_start(&self) -> Option<u64> {
            self.region_start
        }

        fn start_offset(&self) -> u64 {
            self.start_offset
        }
    }

    #[test]
    fn test_cache_resident_offsets() {
        let source = FakeSource::new(Some(0x1_8000_0000), 0x3000);
        let entry = SymbolEntry::build(&source).unwrap();

        let names: Vec<_> = entry.symbols_at(0x4000).into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["_$sSiN", "_$sSiMn"]);
        assert_eq!(entry.symbols_at(0x1_8000_4000).len(), 2);
        assert_eq!(entry.symbols_at(0x200)[0].name, "_$sSSN");
        assert_eq!(entry.symbols_at(0x3200)[0].name, "_$sSSN");
        assert_eq!(entry.offsets_of("_$sSiN"), &[0x1_8000_4000, 0x4000]);
    }

    #[test]
    fn test_standalone_offsets() {
        let source = FakeSource::new(None, 0);
        let entry = SymbolEntry::build(&source).unwrap();
        assert!(entry.symbols_at(0x4000).is_empty());
        assert_eq!(entry.offsets_of("_$sSSN"), &[0x200]);
        assert!(entry.offsets_of("_missing").is_empty());
    }

    #[test]
    fn test_built_once_until_invalidated() {
        let cache = SymbolCache::new();
        let source = FakeSource::new(None, 0);

        let first = cache.lookup(&source, 0x200).unwrap();
        let second = cache.lookup(&source, 0x200).unwrap();
        assert_eq!(first, second);
        assert_eq!(source.builds.load(Ordering::SeqCst), 1);

        let held = cache.build_entry(&source).unwrap();
        cache.invalidate_all();
        assert!(cache.is_empty());
        // in-flight holders keep their entry
        assert_eq!(held.symbols_at(0x200).len(), 1);

        assert_eq!(cache.lookup(&source, 0x200).unwrap(), first);
        assert_eq!(source.builds.load(Ordering::SeqCst), 2);

        cache.invalidate(&source.identity());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_pressure_monitor() {
        let monitor = MemoryPressureMonitor::new();
        let cache = Arc::new(SymbolCache::new());
        monitor.register(&cache);

        let source = FakeSource::new(None, 0);
        cache.lookup(&source, 0).unwrap();
        assert_eq!(cache.len(), 1);

        assert_eq!(monitor.signal(), 1);
        assert!(cache.is_empty());

        drop(cache);
        assert_eq!(monitor.signal(), 0);
    }
}
