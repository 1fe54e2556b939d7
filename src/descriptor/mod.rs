//! Swift context descriptors and the records around them.
//!
//! Every descriptor is a fixed header followed by trailing objects whose
//! presence depends on flag bits. Decoding reads the header, branches on the
//! kind in its flags, decodes the generic context when the descriptor is
//! generic, and then walks the kind's trailing blocks in ABI order with a
//! [`cursor::TrailingCursor`]. The cursor's final position is the descriptor's
//! [`actual_size`](ContextDescriptor::actual_size).
//!
//! Decoded descriptors hold only their own bytes and addresses. Links to other
//! metadata (parents, names, superclasses, protocols) are resolved on demand
//! from the stored field addresses and may come back as external symbols.
//!
//! # Kinds
//!
//! | Kind       | Type                        |
//! |------------|-----------------------------|
//! | module     | [`ModuleDescriptor`]        |
//! | extension  | [`ExtensionDescriptor`]     |
//! | anonymous  | [`AnonymousDescriptor`]     |
//! | protocol   | [`ProtocolDescriptor`]      |
//! | opaque     | [`OpaqueTypeDescriptor`]    |
//! | class      | [`ClassDescriptor`]         |
//! | struct     | [`StructDescriptor`]        |
//! | enum       | [`EnumDescriptor`]          |

mod associated_type;
mod class;
mod conformance;
mod context;
pub mod cursor;
mod field;
mod flags;
mod generic;
mod mangled;
mod protocol;
mod section;
mod types;

pub use associated_type::*;
pub use class::*;
pub use conformance::*;
pub use context::*;
pub use field::*;
pub use flags::*;
pub use generic::*;
pub use mangled::*;
pub use protocol::*;
pub use section::*;
pub use types::*;
