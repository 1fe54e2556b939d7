//! swiftdex - Swift runtime metadata resolution for Mach-O binaries.
//!
//! This library reads the Swift metadata a compiler leaves in a Mach-O image
//! (type, protocol and conformance descriptors, field and associated type
//! records) and resolves the relative pointers that link them, either from a
//! file on disk, from an image inside a dyld shared cache, or from an image
//! already mapped into the current process.
//!
//! # Features
//!
//! - One decoding path for every backend through [`ReadingContext`]
//! - Relative direct, indirect and indirectable pointers, including pointers
//!   to external symbols ([`SymbolOrElement`])
//! - Chained fixups, bind opcodes and shared cache slide info
//! - Split shared caches with cross-cache address translation
//! - A process-wide symbol/offset cache with memory-pressure eviction
//!
//! # Example
//!
//! ```no_run
//! use swiftdex::{MachOFile, OpenOptions, SwiftSections};
//!
//! fn main() -> swiftdex::Result<()> {
//!     let file = MachOFile::open_with("/path/to/binary", &OpenOptions::default().architecture("arm64"))?;
//!
//!     for entry in file.types()? {
//!         if let Ok(swiftdex::SymbolOrElement::Element(descriptor)) = entry {
//!             println!("{}", descriptor.qualified_name(&file)?);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

pub mod descriptor;
pub mod dyld;
pub mod error;
pub mod image;
pub mod layout;
pub mod macho;
pub mod pointer;
pub mod reading;
pub mod symbol;
pub mod util;

// Re-export main types
pub use descriptor::{
    ClassDescriptor, ContextDescriptor, ContextDescriptorWrapper, MangledName, ProtocolDescriptor,
    ProtocolConformanceDescriptor, SwiftSections, TypeContextDescriptor,
};
pub use dyld::{CacheAddressTranslator, ImageEntry, SharedCache};
pub use error::{Error, Result};
pub use image::{MachOFile, MachOImage, OpenOptions};
pub use layout::Located;
pub use macho::MachOContext;
pub use pointer::{
    RelativeDirectPointer, RelativeIndirectPointer, RelativeIndirectablePointer,
    RelativeIndirectablePointerIntPair,
};
pub use reading::{Address, BufferContext, RawAddress, ReadingContext, Resolvable};
pub use symbol::{Symbol, SymbolCache, SymbolOrElement};
