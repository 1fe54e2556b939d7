//! Bind and rebase lookups consulted when resolving pointer slots.

use std::collections::HashMap;

/// Dynamic-linker metadata for pointer-sized slots.
///
/// Offsets are in the owning context's offset space (see
/// [`ReadingContext::offset_from_address`](super::ReadingContext::offset_from_address)).
pub trait FixupTable: Send + Sync {
    /// Returns the external symbol bound to the slot at `offset`.
    fn bind_symbol(&self, offset: u64) -> Option<&str>;

    /// Returns the unslid virtual address the slot at `offset` is rebased to.
    fn rebase_target(&self, offset: u64) -> Option<u64>;
}

/// Eagerly decoded bind/rebase tables.
#[derive(Debug, Default, Clone)]
pub struct FixupTables {
    binds: HashMap<u64, String>,
    rebases: HashMap<u64, u64>,
}

impl FixupTables {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the slot at `offset` binds to `symbol`.
    pub fn insert_bind(&mut self, offset: u64, symbol: impl Into<String>) {
        self.binds.insert(offset, symbol.into());
    }

    /// Records that the slot at `offset` rebases to `target`.
    pub fn insert_rebase(&mut self, offset: u64, target: u64) {
        self.rebases.insert(offset, target);
    }

    /// Number of bind entries.
    pub fn bind_count(&self) -> usize {
        self.binds.len()
    }

    /// Number of rebase entries.
    pub fn rebase_count(&self) -> usize {
        self.rebases.len()
    }

    /// Returns true if neither table has entries.
    pub fn is_empty(&self) -> bool {
        self.binds.is_empty() && self.rebases.is_empty()
    }
}

impl FixupTable for FixupTables {
    #[inline]
    fn bind_symbol(&self, offset: u64) -> Option<&str> {
        self.binds.get(&offset).map(String::as_str)
    }

    #[inline]
    fn rebase_target(&self, offset: u64) -> Option<u64> {
        self.rebases.get(&offset).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables() {
        let mut tables = FixupTables::new();
        assert!(tables.is_empty());

        tables.insert_bind(0x4000, "_swift_getTypeByMangledNameInContext");
        tables.insert_rebase(0x4008, 0x1_0000_3F00);

        assert_eq!(
            tables.bind_symbol(0x4000),
            Some("_swift_getTypeByMangledNameInContext")
        );
        assert_eq!(tables.bind_symbol(0x4008), None);
        assert_eq!(tables.rebase_target(0x4008), Some(0x1_0000_3F00));
        assert_eq!(tables.bind_count(), 1);
        assert_eq!(tables.rebase_count(), 1);
    }
}
