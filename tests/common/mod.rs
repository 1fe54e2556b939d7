//! Synthetic image builder shared by the integration tests.

#![allow(dead_code)]

use swiftdex::reading::{BufferContext, FixupTables};
use zerocopy::{Immutable, IntoBytes};

/// Lays out records at fixed offsets in a zero-filled buffer.
pub struct ImageBuilder {
    data: Vec<u8>,
    fixups: FixupTables,
}

impl ImageBuilder {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            fixups: FixupTables::new(),
        }
    }

    /// Writes a record at `at`.
    pub fn put<T: IntoBytes + Immutable>(&mut self, at: u64, value: &T) -> &mut Self {
        self.bytes(at, value.as_bytes())
    }

    pub fn bytes(&mut self, at: u64, bytes: &[u8]) -> &mut Self {
        let at = at as usize;
        self.data[at..at + bytes.len()].copy_from_slice(bytes);
        self
    }

    /// Writes a NUL-terminated string.
    pub fn c_string(&mut self, at: u64, s: &str) -> &mut Self {
        self.bytes(at, s.as_bytes());
        self.bytes(at + s.len() as u64, &[0])
    }

    /// Writes a relative offset at `field` pointing to `target`.
    pub fn relative(&mut self, field: u64, target: u64) -> &mut Self {
        let delta = relative(field, target);
        self.put(field, &delta)
    }

    /// Writes a pointer-sized value.
    pub fn pointer(&mut self, at: u64, value: u64) -> &mut Self {
        self.put(at, &value)
    }

    pub fn bind(&mut self, offset: u64, symbol: &str) -> &mut Self {
        self.fixups.insert_bind(offset, symbol);
        self
    }

    pub fn rebase(&mut self, offset: u64, target: u64) -> &mut Self {
        self.fixups.insert_rebase(offset, target);
        self
    }

    pub fn build(&mut self) -> BufferContext {
        let data = std::mem::take(&mut self.data);
        let fixups = std::mem::take(&mut self.fixups);
        BufferContext::new(data).with_fixups(fixups)
    }
}

/// Relative offset from `field` to `target`.
pub fn relative(field: u64, target: u64) -> i32 {
    (target as i64 - field as i64) as i32
}

/// Flag word of a unique context descriptor of `kind` with type flags.
pub fn context_flags(kind: u8, type_flags: u16) -> u32 {
    kind as u32 | 0x40 | ((type_flags as u32) << 16)
}
