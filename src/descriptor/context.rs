//! Context descriptors common to every kind, and the non-type kinds.

use std::mem::offset_of;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::class::ClassDescriptor;
use super::cursor::TrailingCursor;
use super::flags::{AnonymousContextFlags, ContextDescriptorFlags, ContextDescriptorKind};
use super::generic::GenericContext;
use super::mangled::MangledName;
use super::protocol::ProtocolDescriptor;
use super::types::{EnumDescriptor, StructDescriptor, TypeContextDescriptor};
use crate::error::{Error, Result};
use crate::layout::{locatable, LocatableLayout, Located};
use crate::pointer::{RelativeDirectPointer, RelativeIndirectablePointer};
use crate::reading::{Address, ReadingContext, Resolvable};
use crate::symbol::SymbolOrElement;

// =============================================================================
// Shared Layouts
// =============================================================================

/// Fields shared by every context descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ContextDescriptorLayout {
    pub flags: u32,
    /// Indirectable relative pointer to the parent context
    pub parent: i32,
}
locatable!(ContextDescriptorLayout, 8);

/// A lone 32-bit relative offset, as found in trailing objects.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RelativeOffset {
    pub offset: i32,
}
locatable!(RelativeOffset, 4);

impl<A: Address> Located<RelativeOffset, A> {
    /// Views the offset as a direct pointer from its own address.
    pub fn direct<T>(&self) -> RelativeDirectPointer<T> {
        RelativeDirectPointer::new(self.layout.offset)
    }

    /// Target address.
    pub fn target(&self) -> A {
        self.address.offset_by(self.layout.offset as i64)
    }

    /// Resolves the offset as a direct pointer.
    pub fn resolve<C, T>(&self, ctx: &C) -> Result<T>
    where
        C: ReadingContext<Address = A>,
        T: Resolvable<A>,
    {
        self.direct::<T>().resolve(ctx, self.address)
    }
}

/// Parent pointer type: nullable and possibly indirect.
pub type RelativeContextPointer<A> = RelativeIndirectablePointer<ContextDescriptorWrapper<A>>;

// =============================================================================
// Context Descriptor Trait
// =============================================================================

/// Operations shared by every context descriptor.
pub trait ContextDescriptor<A: Address> {
    /// Address of the descriptor's first byte.
    fn address(&self) -> A;

    /// The shared leading fields.
    fn context_layout(&self) -> ContextDescriptorLayout;

    /// Bytes occupied by the header and every trailing object.
    fn actual_size(&self) -> usize;

    fn flags(&self) -> ContextDescriptorFlags {
        ContextDescriptorFlags::new(self.context_layout().flags)
    }

    /// Raw parent pointer.
    fn parent_pointer(&self) -> RelativeContextPointer<A> {
        RelativeIndirectablePointer::new(self.context_layout().parent)
    }

    /// Resolves the parent context. `None` for top-level contexts (modules).
    fn parent<C>(&self, ctx: &C) -> Result<Option<SymbolOrElement<ContextDescriptorWrapper<A>>>>
    where
        C: ReadingContext<Address = A>,
    {
        let field = self
            .address()
            .advanced(offset_of!(ContextDescriptorLayout, parent));
        self.parent_pointer().resolve_optional(ctx, field)
    }
}

/// Implements [`ContextDescriptor`] for a descriptor struct holding a
/// `header: Located<L, A>` and a `size: usize`.
macro_rules! context_descriptor {
    ($ty:ident) => {
        impl<A: $crate::reading::Address> $crate::descriptor::ContextDescriptor<A> for $ty<A> {
            #[inline]
            fn address(&self) -> A {
                self.header.address
            }

            #[inline]
            fn context_layout(&self) -> $crate::descriptor::ContextDescriptorLayout {
                $crate::descriptor::ContextDescriptorLayout {
                    flags: self.header.flags,
                    parent: self.header.parent,
                }
            }

            #[inline]
            fn actual_size(&self) -> usize {
                self.size
            }
        }
    };
}

pub(crate) use context_descriptor;

// =============================================================================
// Module
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ModuleDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    pub name: i32,
}
locatable!(ModuleDescriptorLayout, 12);

/// A module context.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor<A> {
    pub header: Located<ModuleDescriptorLayout, A>,
    pub size: usize,
}

context_descriptor!(ModuleDescriptor);

impl<A: Address> ModuleDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ModuleDescriptorLayout>(at)?;
        Ok(Self {
            header,
            size: ModuleDescriptorLayout::SIZE,
        })
    }

    pub fn name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<String> {
        RelativeDirectPointer::<String>::new(self.header.name)
            .resolve(ctx, self.header.field_address(offset_of!(ModuleDescriptorLayout, name)))
    }
}

// =============================================================================
// Extension
// =============================================================================

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ExtensionDescriptorLayout {
    pub flags: u32,
    pub parent: i32,
    /// Relative pointer to the mangled name of the extended type
    pub extended_context: i32,
}
locatable!(ExtensionDescriptorLayout, 12);

/// An extension context.
#[derive(Debug, Clone)]
pub struct ExtensionDescriptor<A> {
    pub header: Located<ExtensionDescriptorLayout, A>,
    pub generic_context: Option<GenericContext<A>>,
    pub size: usize,
}

context_descriptor!(ExtensionDescriptor);

impl<A: Address> ExtensionDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ExtensionDescriptorLayout>(at)?;
        let mut cursor = TrailingCursor::after(&header);
        let generic_context = if ContextDescriptorFlags::new(header.flags).is_generic() {
            Some(GenericContext::decode(ctx, &mut cursor, false)?)
        } else {
            None
        };
        Ok(Self {
            header,
            generic_context,
            size: cursor.consumed(),
        })
    }

    /// Mangled name of the extended type.
    pub fn extended_context<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        RelativeDirectPointer::<MangledName<A>>::new(self.header.extended_context)
            .resolve_optional(
                ctx,
                self.header
                    .field_address(offset_of!(ExtensionDescriptorLayout, extended_context)),
            )
    }
}

// =============================================================================
// Anonymous
// =============================================================================

/// An anonymous context (e.g. a function body or private declaration scope).
#[derive(Debug, Clone)]
pub struct AnonymousDescriptor<A> {
    pub header: Located<ContextDescriptorLayout, A>,
    pub generic_context: Option<GenericContext<A>>,
    /// Relative pointer to the context's mangled name
    pub mangled_name: Option<Located<RelativeOffset, A>>,
    pub size: usize,
}

context_descriptor!(AnonymousDescriptor);

impl<A: Address> AnonymousDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ContextDescriptorLayout>(at)?;
        let flags = ContextDescriptorFlags::new(header.flags);
        let mut cursor = TrailingCursor::after(&header);

        let generic_context = if flags.is_generic() {
            Some(GenericContext::decode(ctx, &mut cursor, false)?)
        } else {
            None
        };
        let anonymous = AnonymousContextFlags::from_bits_retain(flags.kind_specific_flags());
        let mangled_name = if anonymous.contains(AnonymousContextFlags::HAS_MANGLED_NAME) {
            Some(cursor.take_located(ctx)?)
        } else {
            None
        };

        Ok(Self {
            header,
            generic_context,
            mangled_name,
            size: cursor.consumed(),
        })
    }

    pub fn mangled_name<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Option<MangledName<A>>> {
        self.mangled_name
            .as_ref()
            .map(|pointer| pointer.resolve(ctx))
            .transpose()
    }
}

// =============================================================================
// Opaque Type
// =============================================================================

/// An opaque result type (`some P`).
#[derive(Debug, Clone)]
pub struct OpaqueTypeDescriptor<A> {
    pub header: Located<ContextDescriptorLayout, A>,
    pub generic_context: Option<GenericContext<A>>,
    /// One mangled-name pointer per underlying type argument
    pub underlying_types: Vec<Located<RelativeOffset, A>>,
    pub invertible_protocols: Option<u16>,
    pub size: usize,
}

context_descriptor!(OpaqueTypeDescriptor);

impl<A: Address> OpaqueTypeDescriptor<A> {
    pub fn decode<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let header = ctx.read_locatable_layout::<ContextDescriptorLayout>(at)?;
        let flags = ContextDescriptorFlags::new(header.flags);
        let mut cursor = TrailingCursor::after(&header);

        let generic_context = if flags.is_generic() {
            Some(GenericContext::decode(ctx, &mut cursor, false)?)
        } else {
            None
        };
        // the kind-specific bits hold the underlying type count
        let underlying_types =
            cursor.take_located_array(ctx, flags.kind_specific_flags() as usize)?;
        let invertible_protocols = if flags.has_invertible_protocols() {
            Some(cursor.take(ctx)?)
        } else {
            None
        };

        Ok(Self {
            header,
            generic_context,
            underlying_types,
            invertible_protocols,
            size: cursor.consumed(),
        })
    }

    pub fn underlying_type_names<C: ReadingContext<Address = A>>(
        &self,
        ctx: &C,
    ) -> Result<Vec<MangledName<A>>> {
        self.underlying_types
            .iter()
            .map(|pointer| pointer.resolve(ctx))
            .collect()
    }
}

// =============================================================================
// Context Descriptor Wrapper
// =============================================================================

/// Any context descriptor, dispatched on its kind.
#[derive(Debug, Clone)]
pub enum ContextDescriptorWrapper<A> {
    Module(ModuleDescriptor<A>),
    Extension(ExtensionDescriptor<A>),
    Anonymous(AnonymousDescriptor<A>),
    Protocol(ProtocolDescriptor<A>),
    OpaqueType(OpaqueTypeDescriptor<A>),
    Class(ClassDescriptor<A>),
    Struct(StructDescriptor<A>),
    Enum(EnumDescriptor<A>),
}

macro_rules! dispatch {
    ($self:expr, $d:ident => $body:expr) => {
        match $self {
            ContextDescriptorWrapper::Module($d) => $body,
            ContextDescriptorWrapper::Extension($d) => $body,
            ContextDescriptorWrapper::Anonymous($d) => $body,
            ContextDescriptorWrapper::Protocol($d) => $body,
            ContextDescriptorWrapper::OpaqueType($d) => $body,
            ContextDescriptorWrapper::Class($d) => $body,
            ContextDescriptorWrapper::Struct($d) => $body,
            ContextDescriptorWrapper::Enum($d) => $body,
        }
    };
}

/// Upper bound on parent-chain walks.
const MAX_CONTEXT_DEPTH: usize = 64;

impl<A: Address> ContextDescriptorWrapper<A> {
    /// Decodes the descriptor at `at`, dispatching on its kind.
    pub fn read<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let flags = ContextDescriptorFlags::new(ctx.read_element::<u32>(at)?);
        let Some(kind) = flags.kind() else {
            return Err(Error::UnknownDescriptorKind {
                kind: flags.kind_raw(),
                offset: ctx.offset_from_address(at),
            });
        };
        Ok(match kind {
            ContextDescriptorKind::Module => Self::Module(ModuleDescriptor::decode(ctx, at)?),
            ContextDescriptorKind::Extension => {
                Self::Extension(ExtensionDescriptor::decode(ctx, at)?)
            }
            ContextDescriptorKind::Anonymous => {
                Self::Anonymous(AnonymousDescriptor::decode(ctx, at)?)
            }
            ContextDescriptorKind::Protocol => Self::Protocol(ProtocolDescriptor::decode(ctx, at)?),
            ContextDescriptorKind::OpaqueType => {
                Self::OpaqueType(OpaqueTypeDescriptor::decode(ctx, at)?)
            }
            ContextDescriptorKind::Class => Self::Class(ClassDescriptor::decode(ctx, at)?),
            ContextDescriptorKind::Struct => Self::Struct(StructDescriptor::decode(ctx, at)?),
            ContextDescriptorKind::Enum => Self::Enum(EnumDescriptor::decode(ctx, at)?),
        })
    }

    pub fn kind(&self) -> ContextDescriptorKind {
        match self {
            Self::Module(_) => ContextDescriptorKind::Module,
            Self::Extension(_) => ContextDescriptorKind::Extension,
            Self::Anonymous(_) => ContextDescriptorKind::Anonymous,
            Self::Protocol(_) => ContextDescriptorKind::Protocol,
            Self::OpaqueType(_) => ContextDescriptorKind::OpaqueType,
            Self::Class(_) => ContextDescriptorKind::Class,
            Self::Struct(_) => ContextDescriptorKind::Struct,
            Self::Enum(_) => ContextDescriptorKind::Enum,
        }
    }

    /// Name of named contexts (modules, protocols and types).
    pub fn name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<Option<String>> {
        Ok(match self {
            Self::Module(d) => Some(d.name(ctx)?),
            Self::Protocol(d) => Some(d.name(ctx)?),
            Self::Class(d) => Some(d.name(ctx)?),
            Self::Struct(d) => Some(d.name(ctx)?),
            Self::Enum(d) => Some(d.name(ctx)?),
            Self::Extension(_) | Self::Anonymous(_) | Self::OpaqueType(_) => None,
        })
    }

    /// Generic context, for kinds that can have one.
    pub fn generic_context(&self) -> Option<&GenericContext<A>> {
        match self {
            Self::Module(_) | Self::Protocol(_) => None,
            Self::Extension(d) => d.generic_context.as_ref(),
            Self::Anonymous(d) => d.generic_context.as_ref(),
            Self::OpaqueType(d) => d.generic_context.as_ref(),
            Self::Class(d) => d.generic_context.as_ref(),
            Self::Struct(d) => d.generic_context.as_ref(),
            Self::Enum(d) => d.generic_context.as_ref(),
        }
    }

    /// Dot-joined names from the outermost module down to this context.
    ///
    /// Extensions and anonymous contexts contribute no component; a parent
    /// bound to an external symbol contributes the symbol name and ends the
    /// walk.
    pub fn qualified_name<C: ReadingContext<Address = A>>(&self, ctx: &C) -> Result<String> {
        let mut components = Vec::new();
        if let Some(name) = self.name(ctx)? {
            components.push(name);
        }

        let mut parent = self.parent(ctx)?;
        for _ in 0..MAX_CONTEXT_DEPTH {
            match parent {
                None => break,
                Some(SymbolOrElement::Symbol(symbol)) => {
                    components.push(symbol.name);
                    break;
                }
                Some(SymbolOrElement::Element(context)) => {
                    if let Some(name) = context.name(ctx)? {
                        components.push(name);
                    }
                    parent = context.parent(ctx)?;
                }
            }
        }

        components.reverse();
        Ok(components.join("."))
    }

    pub fn as_class(&self) -> Option<&ClassDescriptor<A>> {
        match self {
            Self::Class(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructDescriptor<A>> {
        match self {
            Self::Struct(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&EnumDescriptor<A>> {
        match self {
            Self::Enum(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_protocol(&self) -> Option<&ProtocolDescriptor<A>> {
        match self {
            Self::Protocol(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the protocol, or [`Error::UnexpectedDescriptorKind`].
    pub fn into_protocol(self, offset: u64) -> Result<ProtocolDescriptor<A>> {
        match self {
            Self::Protocol(d) => Ok(d),
            other => Err(Error::UnexpectedDescriptorKind {
                expected: ContextDescriptorKind::Protocol.name(),
                found: other.kind().name(),
                offset,
            }),
        }
    }
}

impl<A: Address> ContextDescriptor<A> for ContextDescriptorWrapper<A> {
    fn address(&self) -> A {
        dispatch!(self, d => d.address())
    }

    fn context_layout(&self) -> ContextDescriptorLayout {
        dispatch!(self, d => d.context_layout())
    }

    fn actual_size(&self) -> usize {
        dispatch!(self, d => d.actual_size())
    }
}

impl<A: Address> Resolvable<A> for ContextDescriptorWrapper<A> {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        Self::read(ctx, at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::BufferContext;

    fn put<T: IntoBytes + Immutable>(data: &mut [u8], at: usize, value: &T) {
        let bytes = value.as_bytes();
        data[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// 0x00 module "Demo"; 0x20 extension of it; 0x40 anonymous with a
    /// mangled name; strings at 0x80.
    fn context() -> BufferContext {
        let mut data = vec![0u8; 0x100];
        put(
            &mut data,
            0x00,
            &ModuleDescriptorLayout {
                flags: 0,
                parent: 0,
                name: 0x80 - 0x08,
            },
        );
        put(
            &mut data,
            0x20,
            &ExtensionDescriptorLayout {
                flags: 1,
                parent: 0x00 - 0x24,
                extended_context: 0x88 - 0x28,
            },
        );
        put(
            &mut data,
            0x40,
            &ContextDescriptorLayout {
                flags: 2 | (1 << 16),
                parent: 0x20 - 0x44,
            },
        );
        put(&mut data, 0x48, &RelativeOffset { offset: 0x90 - 0x48 });
        data[0x80..0x85].copy_from_slice(b"Demo\0");
        data[0x88..0x8D].copy_from_slice(b"4Demo");
        data[0x90..0x93].copy_from_slice(b"XY\0");
        BufferContext::new(data)
    }

    #[test]
    fn test_dispatch_and_parents() {
        let ctx = context();

        let module = ContextDescriptorWrapper::read(&ctx, 0).unwrap();
        assert_eq!(module.kind(), ContextDescriptorKind::Module);
        assert_eq!(module.name(&ctx).unwrap().as_deref(), Some("Demo"));
        assert!(module.parent(&ctx).unwrap().is_none());
        assert_eq!(module.actual_size(), 12);

        let anonymous = ContextDescriptorWrapper::read(&ctx, 0x40).unwrap();
        assert_eq!(anonymous.actual_size(), 12);
        let ContextDescriptorWrapper::Anonymous(ref d) = anonymous else {
            panic!("expected anonymous");
        };
        assert_eq!(
            d.mangled_name(&ctx).unwrap().unwrap().as_plain_str(),
            Some("XY")
        );

        let parent = anonymous.parent(&ctx).unwrap().unwrap().into_element().unwrap();
        assert_eq!(parent.kind(), ContextDescriptorKind::Extension);
        assert_eq!(parent.address(), 0x20);
        assert_eq!(anonymous.qualified_name(&ctx).unwrap(), "Demo");
    }

    #[test]
    fn test_extension_extended_context() {
        let ctx = context();
        let ContextDescriptorWrapper::Extension(extension) =
            ContextDescriptorWrapper::read(&ctx, 0x20).unwrap()
        else {
            panic!("expected extension");
        };
        let name = extension.extended_context(&ctx).unwrap().unwrap();
        assert_eq!(name.as_plain_str(), Some("4Demo"));
    }

    #[test]
    fn test_unknown_kind() {
        let mut data = vec![0u8; 16];
        data[0] = 9;
        let ctx = BufferContext::new(data);
        assert!(matches!(
            ContextDescriptorWrapper::read(&ctx, 0),
            Err(Error::UnknownDescriptorKind { kind: 9, offset: 0 })
        ));
    }
}
