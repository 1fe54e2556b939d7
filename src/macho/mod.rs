//! Mach-O file format handling.
//!
//! Header and load-command parsing, fat slice selection, symbol tables,
//! export tries and the fixup metadata (chained fixups or bind opcodes) that
//! decides how pointer slots resolve.

mod constants;
mod context;
mod fat;
mod fixups;
mod structs;
mod symbols;
pub mod trie;

pub use constants::*;
pub use context::*;
pub use fat::*;
pub use fixups::*;
pub use structs::*;
pub use symbols::*;
pub use trie::{ExportInfo, ExportTrieParser};
