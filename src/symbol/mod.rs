//! Symbolic resolution of pointer slots.
//!
//! A pointer-sized slot in a binary either holds an address inside the binary
//! or is left for the dynamic linker to fill with an external symbol. Which
//! one is decided by the binary's fixup metadata at the slot's offset, never
//! by the slot's contents:
//!
//! 1. a bind entry makes the slot a [`Symbol`];
//! 2. a rebase entry gives the slot's unslid target;
//! 3. otherwise the stored value is the target, after stripping
//!    pointer-authentication tags.

mod cache;

pub use cache::*;

use std::fmt;

use tracing::trace;

use crate::error::{Error, Result};
use crate::reading::{Address, ReadingContext};

// =============================================================================
// Symbol
// =============================================================================

/// An external symbol a slot is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    /// Linker symbol name (mangled, with leading underscore)
    pub name: String,
    /// Offset of the slot that references the symbol
    pub offset: u64,
}

impl Symbol {
    /// Creates a symbol reference.
    pub fn new(name: impl Into<String>, offset: u64) -> Self {
        Self {
            name: name.into(),
            offset,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {:#x}", self.name, self.offset)
    }
}

// =============================================================================
// Symbol Or Element
// =============================================================================

/// The result of resolving a slot: an unbound external symbol, or content
/// present in the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOrElement<T> {
    /// The slot binds to an external symbol.
    Symbol(Symbol),
    /// The slot's target is in this binary.
    Element(T),
}

impl<T> SymbolOrElement<T> {
    /// Returns true if the slot is bound to a symbol.
    #[inline]
    pub fn is_symbol(&self) -> bool {
        matches!(self, SymbolOrElement::Symbol(_))
    }

    /// Returns the symbol, if any.
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            SymbolOrElement::Symbol(symbol) => Some(symbol),
            SymbolOrElement::Element(_) => None,
        }
    }

    /// Returns the element, if any.
    pub fn element(&self) -> Option<&T> {
        match self {
            SymbolOrElement::Symbol(_) => None,
            SymbolOrElement::Element(element) => Some(element),
        }
    }

    /// Consumes `self`, returning the element.
    pub fn into_element(self) -> Option<T> {
        match self {
            SymbolOrElement::Symbol(_) => None,
            SymbolOrElement::Element(element) => Some(element),
        }
    }

    /// Returns the element, or [`Error::UnresolvedRequiredSymbol`].
    pub fn require(self) -> Result<T> {
        match self {
            SymbolOrElement::Symbol(symbol) => Err(Error::UnresolvedRequiredSymbol {
                name: symbol.name,
                offset: symbol.offset,
            }),
            SymbolOrElement::Element(element) => Ok(element),
        }
    }

    /// Maps the element.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> SymbolOrElement<U> {
        match self {
            SymbolOrElement::Symbol(symbol) => SymbolOrElement::Symbol(symbol),
            SymbolOrElement::Element(element) => SymbolOrElement::Element(f(element)),
        }
    }

    /// Maps the element with a fallible function.
    pub fn try_map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<SymbolOrElement<U>> {
        Ok(match self {
            SymbolOrElement::Symbol(symbol) => SymbolOrElement::Symbol(symbol),
            SymbolOrElement::Element(element) => SymbolOrElement::Element(f(element)?),
        })
    }

    /// Borrows the element.
    pub fn as_ref(&self) -> SymbolOrElement<&T> {
        match self {
            SymbolOrElement::Symbol(symbol) => SymbolOrElement::Symbol(symbol.clone()),
            SymbolOrElement::Element(element) => SymbolOrElement::Element(element),
        }
    }
}

// =============================================================================
// Slot Resolution
// =============================================================================

/// Resolves the pointer-sized slot at `at`.
///
/// Bind entries take priority over rebase entries for the same slot.
pub fn resolve_slot<C: ReadingContext>(
    ctx: &C,
    at: C::Address,
) -> Result<SymbolOrElement<C::Address>> {
    let offset = ctx.offset_from_address(at);

    if let Some(fixups) = ctx.fixups() {
        if let Some(name) = fixups.bind_symbol(offset) {
            trace!(offset = format_args!("{offset:#x}"), name, "slot is bound");
            return Ok(SymbolOrElement::Symbol(Symbol::new(name, offset)));
        }
        if let Some(target) = fixups.rebase_target(offset) {
            let address = ctx.address_from_virtual_address(target)?;
            trace!(
                offset = format_args!("{offset:#x}"),
                target = format_args!("{target:#x}"),
                "slot is rebased"
            );
            return Ok(SymbolOrElement::Element(address));
        }
    }

    let raw = ctx.read_pointer(at)?;
    let address = ctx.address_from_virtual_address(raw)?;
    trace!(
        offset = format_args!("{offset:#x}"),
        raw = format_args!("{raw:#x}"),
        address = format_args!("{:#x}", address.as_u64()),
        "slot read raw"
    );
    Ok(SymbolOrElement::Element(address))
}
