//! Export trie and bind opcode parsing.
//!
//! The export trie is a prefix tree of exported symbols. Each node can carry
//! terminal information (flags, offset from the image base, optional extra
//! value) followed by edges (label prefix + offset to the child node).
//!
//! Bind opcodes are the pre-chained-fixups encoding of external references,
//! found through `LC_DYLD_INFO`.

use crate::error::{Error, Result};

// =============================================================================
// Export Flags
// =============================================================================

/// Export symbol kind mask.
pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;

/// Regular export.
pub const EXPORT_SYMBOL_FLAGS_KIND_REGULAR: u64 = 0x00;

/// Thread-local variable.
pub const EXPORT_SYMBOL_FLAGS_KIND_THREAD_LOCAL: u64 = 0x01;

/// Absolute symbol (not relative to any section).
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;

/// Weak definition.
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;

/// Re-export from another dylib.
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;

/// Stub and resolver.
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

// =============================================================================
// LEB128 Decoding
// =============================================================================

/// Reads an unsigned LEB128 value at `offset`.
///
/// Returns the decoded value and the number of bytes consumed.
#[inline(always)]
pub fn read_uleb128(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    data.get(offset..)
        .and_then(crate::util::read_uleb128_fast)
        .ok_or(Error::InvalidUleb128 { offset })
}

/// Reads a signed LEB128 value at `offset`.
#[inline(always)]
pub fn read_sleb128(data: &[u8], offset: usize) -> Result<(i64, usize)> {
    data.get(offset..)
        .and_then(crate::util::read_sleb128_fast)
        .ok_or(Error::InvalidUleb128 { offset })
}

/// Reads a NUL-terminated label at `offset`, returning it and the offset
/// just past the terminator.
fn read_label(data: &[u8], offset: usize) -> (&[u8], usize) {
    let rest = data.get(offset..).unwrap_or(&[]);
    let len = crate::util::memchr_null(rest);
    (&rest[..len], offset + len + 1)
}

// =============================================================================
// Export Info
// =============================================================================

/// Information about an exported symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    /// Symbol name
    pub name: String,
    /// Export flags
    pub flags: u64,
    /// Symbol offset from the image base (zero for re-exports)
    pub offset: u64,
    /// For re-exports: ordinal of the source dylib
    pub reexport_ordinal: Option<u32>,
    /// For re-exports: imported symbol name (if different)
    pub reexport_name: Option<String>,
}

impl ExportInfo {
    /// Returns true if this is a re-export.
    #[inline]
    pub fn is_reexport(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0
    }

    /// Returns true if this is a weak definition.
    #[inline]
    pub fn is_weak(&self) -> bool {
        (self.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION) != 0
    }

    /// Returns the symbol kind.
    #[inline]
    pub fn kind(&self) -> u64 {
        self.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK
    }
}

// =============================================================================
// Export Trie Parser
// =============================================================================

/// Parser for export tries.
pub struct ExportTrieParser<'a> {
    data: &'a [u8],
}

impl<'a> ExportTrieParser<'a> {
    /// Creates a new parser for the given export trie data.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Parses all exports from the trie.
    ///
    /// Nodes are visited with an explicit stack; a node reached twice is
    /// malformed and rejected so that cyclic tries terminate.
    pub fn parse_all(&self) -> Result<Vec<ExportInfo>> {
        let mut exports = Vec::new();
        if self.data.is_empty() {
            return Ok(exports);
        }

        let mut visited = std::collections::HashSet::new();
        let mut stack = vec![(0usize, Vec::<u8>::new())];

        while let Some((offset, prefix)) = stack.pop() {
            if offset >= self.data.len() || !visited.insert(offset) {
                return Err(Error::InvalidExportTrie { offset });
            }

            let (terminal_size, bytes_read) = read_uleb128(self.data, offset)?;
            let mut cursor = offset + bytes_read;

            if terminal_size > 0 {
                let name = String::from_utf8_lossy(&prefix).into_owned();
                exports.push(self.parse_terminal_info(cursor, name)?);
            }
            cursor += terminal_size as usize;

            let Some(&child_count) = self.data.get(cursor) else {
                continue;
            };
            cursor += 1;

            let mut children = Vec::with_capacity(child_count as usize);
            for _ in 0..child_count {
                let (label, next) = read_label(self.data, cursor);
                let (child_offset, bytes) = read_uleb128(self.data, next)?;
                cursor = next + bytes;

                let mut child_prefix = prefix.clone();
                child_prefix.extend_from_slice(label);
                children.push((child_offset as usize, child_prefix));
            }
            // Keep edge order in the output.
            stack.extend(children.into_iter().rev());
        }

        Ok(exports)
    }

    /// Looks up a single symbol by name.
    pub fn lookup(&self, name: &str) -> Result<Option<ExportInfo>> {
        if self.data.is_empty() {
            return Ok(None);
        }

        let target = name.as_bytes();
        let mut offset = 0usize;
        let mut matched = 0usize;

        // Each step consumes at least one label byte or stops.
        for _ in 0..=target.len() {
            if offset >= self.data.len() {
                return Err(Error::InvalidExportTrie { offset });
            }

            let (terminal_size, bytes_read) = read_uleb128(self.data, offset)?;
            let mut cursor = offset + bytes_read;

            if matched == target.len() {
                if terminal_size == 0 {
                    return Ok(None);
                }
                return self.parse_terminal_info(cursor, name.to_string()).map(Some);
            }
            cursor += terminal_size as usize;

            let Some(&child_count) = self.data.get(cursor) else {
                return Ok(None);
            };
            cursor += 1;

            let remaining = &target[matched..];
            let mut next_node = None;
            for _ in 0..child_count {
                let (label, next) = read_label(self.data, cursor);
                let (child_offset, bytes) = read_uleb128(self.data, next)?;
                cursor = next + bytes;

                if !label.is_empty() && remaining.starts_with(label) {
                    next_node = Some((child_offset as usize, label.len()));
                    break;
                }
            }

            match next_node {
                Some((child, consumed)) => {
                    offset = child;
                    matched += consumed;
                }
                None => return Ok(None),
            }
        }

        Ok(None)
    }

    /// Parses terminal export info at `offset`.
    fn parse_terminal_info(&self, offset: usize, name: String) -> Result<ExportInfo> {
        let (flags, bytes) = read_uleb128(self.data, offset)?;
        let mut cursor = offset + bytes;

        let mut export = ExportInfo {
            name,
            flags,
            offset: 0,
            reexport_ordinal: None,
            reexport_name: None,
        };

        if (flags & EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
            let (ordinal, bytes) = read_uleb128(self.data, cursor)?;
            cursor += bytes;
            export.reexport_ordinal = Some(ordinal as u32);

            let (imported, _) = read_label(self.data, cursor);
            if !imported.is_empty() {
                export.reexport_name = Some(String::from_utf8_lossy(imported).into_owned());
            }
        } else {
            let (value, _) = read_uleb128(self.data, cursor)?;
            export.offset = value;
        }

        Ok(export)
    }
}

// =============================================================================
// Bind Opcode Parser
// =============================================================================

/// Bind opcodes used in the dyld bind info.
#[allow(missing_docs)] // Constants are self-documenting via names
pub mod bind_opcodes {
    /// Terminates a binding sequence.
    pub const BIND_OPCODE_DONE: u8 = 0x00;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
    pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
    pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
    pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
    pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
    pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
    pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
    pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
    pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
    pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xA0;
    pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xB0;
    pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xC0;
    pub const BIND_OPCODE_THREADED: u8 = 0xD0;

    pub const BIND_IMMEDIATE_MASK: u8 = 0x0F;
    pub const BIND_OPCODE_MASK: u8 = 0xF0;
}

/// A binding record from parsing bind opcodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRecord {
    /// Segment index
    pub segment_index: u8,
    /// Offset within segment
    pub segment_offset: u64,
    /// Symbol name
    pub symbol_name: String,
    /// Dylib ordinal
    pub ordinal: i64,
    /// Addend
    pub addend: i64,
}

/// Parses a bind opcode stream into bind records.
///
/// Threaded binds only appear alongside chained fixups, which are read
/// separately; their sub-opcodes are skipped here.
pub fn parse_bind_info(data: &[u8]) -> Result<Vec<BindRecord>> {
    use bind_opcodes::*;

    let mut records = Vec::new();
    let mut cursor = 0usize;

    let mut segment_index: u8 = 0;
    let mut segment_offset: u64 = 0;
    let mut symbol_name = String::new();
    let mut ordinal: i64 = 0;
    let mut addend: i64 = 0;

    macro_rules! bind {
        () => {
            records.push(BindRecord {
                segment_index,
                segment_offset,
                symbol_name: symbol_name.clone(),
                ordinal,
                addend,
            })
        };
    }

    while cursor < data.len() {
        let byte = data[cursor];
        let opcode = byte & BIND_OPCODE_MASK;
        let immediate = byte & BIND_IMMEDIATE_MASK;
        cursor += 1;

        match opcode {
            BIND_OPCODE_DONE => {
                // Lazy bind streams separate entries with DONE; keep going.
                ordinal = 0;
                addend = 0;
            }

            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                ordinal = immediate as i64;
            }

            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let (val, bytes) = read_uleb128(data, cursor)?;
                cursor += bytes;
                ordinal = val as i64;
            }

            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                ordinal = if immediate == 0 {
                    0
                } else {
                    (BIND_OPCODE_MASK | immediate) as i8 as i64
                };
            }

            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let (label, next) = read_label(data, cursor);
                symbol_name = String::from_utf8_lossy(label).into_owned();
                cursor = next;
            }

            BIND_OPCODE_SET_TYPE_IMM => {}

            BIND_OPCODE_SET_ADDEND_SLEB => {
                let (val, bytes) = read_sleb128(data, cursor)?;
                cursor += bytes;
                addend = val;
            }

            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                segment_index = immediate;
                let (val, bytes) = read_uleb128(data, cursor)?;
                cursor += bytes;
                segment_offset = val;
            }

            BIND_OPCODE_ADD_ADDR_ULEB => {
                let (val, bytes) = read_uleb128(data, cursor)?;
                cursor += bytes;
                segment_offset = segment_offset.wrapping_add(val);
            }

            BIND_OPCODE_DO_BIND => {
                bind!();
                segment_offset = segment_offset.wrapping_add(8);
            }

            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                bind!();
                let (val, bytes) = read_uleb128(data, cursor)?;
                cursor += bytes;
                segment_offset = segment_offset.wrapping_add(8).wrapping_add(val);
            }

            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                bind!();
                segment_offset = segment_offset.wrapping_add(8 + (immediate as u64 * 8));
            }

            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let (count, bytes1) = read_uleb128(data, cursor)?;
                cursor += bytes1;
                let (skip, bytes2) = read_uleb128(data, cursor)?;
                cursor += bytes2;

                for _ in 0..count {
                    bind!();
                    segment_offset = segment_offset.wrapping_add(8).wrapping_add(skip);
                }
            }

            BIND_OPCODE_THREADED => {
                // SET_BIND_ORDINAL_TABLE_SIZE_ULEB carries an operand; APPLY does not.
                if immediate == 0 {
                    let (_, bytes) = read_uleb128(data, cursor)?;
                    cursor += bytes;
                }
            }

            other => {
                return Err(Error::parse(
                    cursor - 1,
                    format!("unknown bind opcode {other:#x}"),
                ));
            }
        }
    }

    Ok(records)
}
