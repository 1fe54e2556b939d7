//! Error types for Swift metadata resolution.
//!
//! Every leaf read fails fast with one of these variants; batch listings decide
//! at the call site whether an error becomes a placeholder (see
//! [`Error::is_recoverable`]).

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for metadata resolution.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Bounds Errors ====================
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("layout '{layout}' is {actual} bytes in memory but {expected} bytes on disk")]
    LayoutSizeMismatch {
        layout: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("address {address:#x} is outside the readable range")]
    AddressOutOfRange { address: u64 },

    // ==================== Cache Errors ====================
    #[error("invalid dyld cache magic: expected 'dyld', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("address {addr:#x} is not mapped by any loaded cache")]
    UnmappedAddress { addr: u64 },

    #[error("subcache file not found: {path}")]
    SubcacheNotFound { path: PathBuf },

    #[error("subcache UUID mismatch for '{path}': expected {expected}, got {actual}")]
    SubcacheUuidMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("unsupported slide info version: {0}")]
    UnsupportedSlideVersion(u32),

    #[error("shared cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("image not found in shared cache: {name}")]
    MissingImageIdentifier { name: String },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O magic: {0:#x}")]
    InvalidMachoMagic(u32),

    #[error("no slice for architecture '{arch}' (available: {available})")]
    ArchitectureNotFound { arch: String, available: String },

    #[error("load command at offset {offset:#x} extends beyond header")]
    LoadCommandOverflow { offset: usize },

    #[error("unsupported chained fixup pointer format: {0}")]
    UnsupportedPointerFormat(u16),

    #[error("unsupported chained import format: {0}")]
    UnsupportedImportFormat(u32),

    #[error("invalid export trie at offset {offset:#x}")]
    InvalidExportTrie { offset: usize },

    #[error("invalid ULEB128 at offset {offset:#x}")]
    InvalidUleb128 { offset: usize },

    // ==================== Descriptor Errors ====================
    #[error("unknown context descriptor kind {kind} at offset {offset:#x}")]
    UnknownDescriptorKind { kind: u8, offset: u64 },

    #[error("expected {expected} descriptor at offset {offset:#x}, found {found}")]
    UnexpectedDescriptorKind {
        expected: &'static str,
        found: &'static str,
        offset: u64,
    },

    #[error("slot at offset {offset:#x} is bound to external symbol '{name}'")]
    UnresolvedRequiredSymbol { name: String, offset: u64 },

    #[error("invalid UTF-8 string at offset {offset:#x}")]
    InvalidString { offset: u64 },

    // ==================== Parse Errors ====================
    #[error("parse error at offset {offset:#x}: {reason}")]
    Parse { offset: usize, reason: String },
}

/// A specialized Result type for metadata resolution.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error concerns a single element of a listing.
    ///
    /// Listings substitute a placeholder for these instead of aborting; the
    /// remaining errors mean the binary itself could not be read.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::UnknownDescriptorKind { .. }
                | Error::UnexpectedDescriptorKind { .. }
                | Error::UnresolvedRequiredSymbol { .. }
                | Error::UnmappedAddress { .. }
                | Error::AddressOutOfRange { .. }
                | Error::BufferTooSmall { .. }
                | Error::InvalidString { .. }
        )
    }

    /// Creates a parse error with a formatted message.
    #[inline]
    pub fn parse(offset: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an unmapped address error.
    #[inline]
    pub fn unmapped(addr: u64) -> Self {
        Error::UnmappedAddress { addr }
    }

    /// Creates a buffer too small error.
    #[inline]
    pub fn buffer_too_small(needed: usize, available: usize) -> Self {
        Error::BufferTooSmall { needed, available }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::UnknownDescriptorKind { kind: 9, offset: 0 }.is_recoverable());
        assert!(Error::unmapped(0x1000).is_recoverable());
        assert!(!Error::InvalidMachoMagic(0).is_recoverable());
        assert!(!Error::ArchitectureNotFound {
            arch: "arm64".into(),
            available: "x86_64".into(),
        }
        .is_recoverable());
    }

    #[test]
    fn test_messages() {
        let err = Error::UnresolvedRequiredSymbol {
            name: "_$sSQMp".into(),
            offset: 0x40,
        };
        assert_eq!(
            err.to_string(),
            "slot at offset 0x40 is bound to external symbol '_$sSQMp'"
        );
    }
}
