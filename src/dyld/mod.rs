//! Dyld shared cache handling.
//!
//! This module provides types and utilities for parsing and reading Apple's
//! dyld shared cache format. The cache is used on iOS and macOS to hold the
//! system frameworks pre-linked in one address range.
//!
//! # Cache Structure
//!
//! A dyld shared cache consists of:
//! - A header with metadata about the cache
//! - Mappings that describe how regions of the cache map to virtual memory
//! - Image information for each dylib in the cache
//! - Slide information for ASLR rebasing
//! - Local symbols (optionally in a separate `.symbols` file)
//!
//! # Sub-caches
//!
//! Starting with iOS 15 / macOS 12, caches can be split into multiple files:
//! - Main cache: `dyld_shared_cache_arm64e`
//! - Sub-caches: `dyld_shared_cache_arm64e.1`, `.2`, etc.
//! - Symbols: `dyld_shared_cache_arm64e.symbols`

mod context;
mod slide;
mod structs;
mod translator;

pub use context::*;
pub use slide::*;
pub use structs::*;
pub use translator::*;
