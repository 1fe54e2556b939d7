//! Symbol table extraction.
//!
//! Reads `nlist_64` entries and their string pool into owned `(value, name)`
//! pairs. Callers decide what a symbol value means in their address space;
//! for linked images it is the symbol's virtual address.

use zerocopy::FromBytes;

use super::structs::Nlist64;

/// A defined symbol read from a symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSymbol {
    /// Symbol name
    pub name: String,
    /// Symbol value (`n_value`)
    pub value: u64,
    /// External visibility
    pub external: bool,
}

/// Parses `count` nlist entries from `symbols` against the string pool
/// `strings`.
///
/// Debug (stab) entries, undefined symbols and entries with an empty or
/// out-of-range name are skipped.
pub fn parse_symbol_table(symbols: &[u8], count: usize, strings: &[u8]) -> Vec<RawSymbol> {
    let available = symbols.len() / Nlist64::SIZE;
    if available < count {
        tracing::warn!(count, available, "symbol table truncated");
    }

    let mut out = Vec::with_capacity(count.min(available));
    for index in 0..count.min(available) {
        let Ok((nlist, _)) = Nlist64::read_from_prefix(&symbols[index * Nlist64::SIZE..]) else {
            break;
        };
        if nlist.is_debug() || nlist.is_undefined() {
            continue;
        }

        let Some(name_bytes) = strings.get(nlist.n_strx as usize..) else {
            tracing::warn!(index, strx = nlist.n_strx, "symbol name outside string table");
            continue;
        };
        let name = &name_bytes[..crate::util::memchr_null(name_bytes)];
        if name.is_empty() {
            continue;
        }

        out.push(RawSymbol {
            name: String::from_utf8_lossy(name).into_owned(),
            value: nlist.n_value,
            external: nlist.is_external(),
        });
    }
    out
}
