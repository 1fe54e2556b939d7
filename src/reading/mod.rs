//! Byte-reading abstraction shared by file-backed and in-process binaries.
//!
//! # Address spaces
//!
//! - File contexts address bytes by `u64` offset from the start of the image
//!   (for cache-resident images, from the start of the shared region)
//! - In-process contexts address bytes by [`RawAddress`]
//!
//! Both expose the same [`ReadingContext`] operations.

mod address;
mod backing;
mod context;
mod fixups;

pub use address::*;
pub use backing::*;
pub use context::*;
pub use fixups::*;
