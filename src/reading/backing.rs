//! Immutable byte stores behind file-backed contexts.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Error, Result};

/// The bytes of an opened file: memory-mapped from disk or owned in memory.
#[derive(Debug)]
pub enum Backing {
    /// A read-only memory map.
    Mapped(Mmap),
    /// An owned buffer.
    Owned(Vec<u8>),
}

impl Backing {
    /// Memory-maps the file at `path`.
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;

        // SAFETY: read-only map; the file must not be truncated while mapped.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Backing::Mapped(mmap))
    }
}

impl Deref for Backing {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match self {
            Backing::Mapped(mmap) => mmap,
            Backing::Owned(bytes) => bytes,
        }
    }
}

impl From<Vec<u8>> for Backing {
    fn from(bytes: Vec<u8>) -> Self {
        Backing::Owned(bytes)
    }
}
