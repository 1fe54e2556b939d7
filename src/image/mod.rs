//! Opened binaries: the two [`ReadingContext`](crate::reading::ReadingContext)
//! backends.
//!
//! - [`MachOFile`] reads by file offset, from a standalone (possibly fat)
//!   Mach-O file or from an image inside a dyld shared cache
//! - [`MachOImage`] reads an image already mapped into the current process

mod file;
mod process;

pub use file::*;
pub use process::*;

/// Options for opening binaries.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Architecture to pick from a fat binary, matched as a substring of the
    /// slice's architecture name ("arm64" matches "arm64e"). `None` picks the
    /// first slice.
    pub architecture: Option<String>,
    /// Load the shared cache's `.symbols` file for local symbols.
    pub load_symbols_file: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            architecture: None,
            load_symbols_file: true,
        }
    }
}

impl OpenOptions {
    /// Selects a fat slice by architecture name.
    pub fn architecture(mut self, arch: impl Into<String>) -> Self {
        self.architecture = Some(arch.into());
        self
    }

    /// Enables or disables loading the `.symbols` file.
    pub fn load_symbols_file(mut self, load: bool) -> Self {
        self.load_symbols_file = load;
        self
    }
}
