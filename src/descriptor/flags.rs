//! Flag words of Swift metadata records.

use bitflags::bitflags;

// =============================================================================
// Context Descriptor Flags
// =============================================================================

/// Kind of a context descriptor (`flags & 0x1F`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextDescriptorKind {
    Module = 0,
    Extension = 1,
    Anonymous = 2,
    Protocol = 3,
    OpaqueType = 4,
    Class = 16,
    Struct = 17,
    Enum = 18,
}

impl ContextDescriptorKind {
    /// Decodes a kind tag; unknown tags yield `None`.
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Module,
            1 => Self::Extension,
            2 => Self::Anonymous,
            3 => Self::Protocol,
            4 => Self::OpaqueType,
            16 => Self::Class,
            17 => Self::Struct,
            18 => Self::Enum,
            _ => return None,
        })
    }

    /// Returns true for class, struct and enum.
    pub fn is_type(self) -> bool {
        matches!(self, Self::Class | Self::Struct | Self::Enum)
    }

    /// Lowercase name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Module => "module",
            Self::Extension => "extension",
            Self::Anonymous => "anonymous",
            Self::Protocol => "protocol",
            Self::OpaqueType => "opaque type",
            Self::Class => "class",
            Self::Struct => "struct",
            Self::Enum => "enum",
        }
    }
}

bitflags! {
    /// The 32-bit flag word heading every context descriptor.
    ///
    /// Besides the named bits it carries the kind (bits 0-4), a version byte
    /// (bits 8-15) and 16 kind-specific bits (bits 16-31).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextDescriptorFlags: u32 {
        /// An invertible protocol set follows the kind's trailing objects
        const HAS_INVERTIBLE_PROTOCOLS = 0x20;
        /// The context is uniqued
        const IS_UNIQUE = 0x40;
        /// A generic context follows the fixed header
        const IS_GENERIC = 0x80;
    }
}

impl ContextDescriptorFlags {
    /// Wraps a raw flag word, keeping every bit.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// Raw kind tag.
    #[inline]
    pub const fn kind_raw(self) -> u8 {
        (self.bits() & 0x1F) as u8
    }

    /// Decoded kind, if known.
    #[inline]
    pub fn kind(self) -> Option<ContextDescriptorKind> {
        ContextDescriptorKind::from_raw(self.kind_raw())
    }

    #[inline]
    pub const fn is_generic(self) -> bool {
        self.bits() & Self::IS_GENERIC.bits() != 0
    }

    #[inline]
    pub const fn is_unique(self) -> bool {
        self.bits() & Self::IS_UNIQUE.bits() != 0
    }

    #[inline]
    pub const fn has_invertible_protocols(self) -> bool {
        self.bits() & Self::HAS_INVERTIBLE_PROTOCOLS.bits() != 0
    }

    /// Format version of the descriptor.
    #[inline]
    pub const fn version(self) -> u8 {
        ((self.bits() >> 8) & 0xFF) as u8
    }

    /// The upper 16 bits, interpreted per kind.
    #[inline]
    pub const fn kind_specific_flags(self) -> u16 {
        (self.bits() >> 16) as u16
    }

    /// Kind-specific bits of a type descriptor.
    #[inline]
    pub const fn type_flags(self) -> TypeContextFlags {
        TypeContextFlags::from_bits_retain(self.kind_specific_flags())
    }
}

// =============================================================================
// Type Context Flags
// =============================================================================

/// How a type's metadata is initialized (kind-specific bits 0-1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataInitialization {
    None,
    Singleton,
    Foreign,
    Reserved,
}

/// How a type or superclass is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeReferenceKind {
    /// Relative pointer to a context descriptor
    DirectTypeDescriptor,
    /// Relative pointer to a slot holding a context descriptor
    IndirectTypeDescriptor,
    /// Relative pointer to an Objective-C class name
    DirectObjCClassName,
    /// Relative pointer to a slot holding an Objective-C class
    IndirectObjCClass,
    /// A value this decoder does not know
    Unknown(u8),
}

impl TypeReferenceKind {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::DirectTypeDescriptor,
            1 => Self::IndirectTypeDescriptor,
            2 => Self::DirectObjCClassName,
            3 => Self::IndirectObjCClass,
            other => Self::Unknown(other),
        }
    }
}

bitflags! {
    /// Kind-specific flags of class, struct and enum descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeContextFlags: u16 {
        const HAS_IMPORT_INFO = 1 << 2;
        const HAS_CANONICAL_METADATA_PRESPECIALIZATIONS_OR_SINGLETON_METADATA_POINTER = 1 << 3;
        const HAS_LAYOUT_STRING = 1 << 4;
        const CLASS_HAS_DEFAULT_OVERRIDE_TABLE = 1 << 6;
        const CLASS_IS_ACTOR = 1 << 7;
        const CLASS_IS_DEFAULT_ACTOR = 1 << 8;
        const CLASS_ARE_IMMEDIATE_MEMBERS_NEGATIVE = 1 << 12;
        const CLASS_HAS_RESILIENT_SUPERCLASS = 1 << 13;
        const CLASS_HAS_OVERRIDE_TABLE = 1 << 14;
        const CLASS_HAS_VTABLE = 1 << 15;
    }
}

impl TypeContextFlags {
    pub fn metadata_initialization(self) -> MetadataInitialization {
        match self.bits() & 0b11 {
            0 => MetadataInitialization::None,
            1 => MetadataInitialization::Singleton,
            2 => MetadataInitialization::Foreign,
            _ => MetadataInitialization::Reserved,
        }
    }

    /// How a resilient superclass is referenced (bits 9-11).
    pub fn resilient_superclass_reference_kind(self) -> TypeReferenceKind {
        TypeReferenceKind::from_raw(((self.bits() >> 9) & 0b111) as u8)
    }

    #[inline]
    pub fn has_prespecializations_or_singleton_pointer(self) -> bool {
        self.contains(Self::HAS_CANONICAL_METADATA_PRESPECIALIZATIONS_OR_SINGLETON_METADATA_POINTER)
    }
}

bitflags! {
    /// Extra class flags, stored in place of the positive metadata size when
    /// the class has a resilient superclass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtraClassFlags: u32 {
        const HAS_OBJC_RESILIENT_CLASS_STUB = 1 << 0;
    }
}

bitflags! {
    /// Kind-specific flags of anonymous context descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AnonymousContextFlags: u16 {
        /// A mangled-name pointer follows the generic context
        const HAS_MANGLED_NAME = 1 << 0;
    }
}

bitflags! {
    /// Kind-specific flags of protocol descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolContextFlags: u16 {
        /// Clear when the protocol is class-constrained
        const HAS_CLASS_CONSTRAINT = 1 << 0;
        const IS_RESILIENT = 1 << 1;
    }
}

impl ProtocolContextFlags {
    /// Returns true for `AnyObject`-constrained protocols.
    pub fn is_class_constrained(self) -> bool {
        !self.contains(Self::HAS_CLASS_CONSTRAINT)
    }

    /// Special-protocol tag (bits 2-7), zero for ordinary protocols.
    pub fn special_protocol(self) -> u8 {
        ((self.bits() >> 2) & 0x3F) as u8
    }
}

// =============================================================================
// Generic Context Flags
// =============================================================================

bitflags! {
    /// Flags of a generic context header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GenericContextFlags: u16 {
        const HAS_TYPE_PACKS = 1 << 0;
        const HAS_CONDITIONAL_INVERTED_PROTOCOLS = 1 << 1;
        const HAS_VALUES = 1 << 2;
    }
}

/// Kind of a generic requirement (`flags & 0x1F`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenericRequirementKind {
    Protocol,
    SameType,
    BaseClass,
    SameConformance,
    SameShape,
    InvertedProtocols,
    Layout,
    Unknown(u8),
}

bitflags! {
    /// Flags of a generic requirement descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GenericRequirementFlags: u32 {
        const IS_PACK_REQUIREMENT = 0x20;
        const HAS_KEY_ARGUMENT = 0x80;
        const IS_VALUE_REQUIREMENT = 0x100;
    }
}

impl GenericRequirementFlags {
    pub fn kind(self) -> GenericRequirementKind {
        match (self.bits() & 0x1F) as u8 {
            0 => GenericRequirementKind::Protocol,
            1 => GenericRequirementKind::SameType,
            2 => GenericRequirementKind::BaseClass,
            3 => GenericRequirementKind::SameConformance,
            4 => GenericRequirementKind::SameShape,
            5 => GenericRequirementKind::InvertedProtocols,
            0x1F => GenericRequirementKind::Layout,
            other => GenericRequirementKind::Unknown(other),
        }
    }
}

// =============================================================================
// Method And Requirement Flags
// =============================================================================

/// Kind of a v-table method or protocol requirement implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Method,
    Init,
    Getter,
    Setter,
    ModifyCoroutine,
    ReadCoroutine,
    Unknown(u8),
}

bitflags! {
    /// Flags of a v-table method descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodDescriptorFlags: u32 {
        const IS_INSTANCE = 0x10;
        const IS_DYNAMIC = 0x20;
        const IS_ASYNC = 0x40;
    }
}

impl MethodDescriptorFlags {
    pub fn kind(self) -> MethodKind {
        match (self.bits() & 0x0F) as u8 {
            0 => MethodKind::Method,
            1 => MethodKind::Init,
            2 => MethodKind::Getter,
            3 => MethodKind::Setter,
            4 => MethodKind::ModifyCoroutine,
            5 => MethodKind::ReadCoroutine,
            other => MethodKind::Unknown(other),
        }
    }

    /// Pointer-authentication discriminator for the implementation.
    pub fn extra_discriminator(self) -> u16 {
        (self.bits() >> 16) as u16
    }
}

/// Kind of a protocol requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolRequirementKind {
    BaseProtocol,
    Method,
    Init,
    Getter,
    Setter,
    ReadCoroutine,
    ModifyCoroutine,
    AssociatedTypeAccessFunction,
    AssociatedConformanceAccessFunction,
    Unknown(u8),
}

bitflags! {
    /// Flags of a protocol requirement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtocolRequirementFlags: u32 {
        const IS_INSTANCE = 0x10;
        const IS_ASYNC = 0x20;
    }
}

impl ProtocolRequirementFlags {
    pub fn kind(self) -> ProtocolRequirementKind {
        match (self.bits() & 0x0F) as u8 {
            0 => ProtocolRequirementKind::BaseProtocol,
            1 => ProtocolRequirementKind::Method,
            2 => ProtocolRequirementKind::Init,
            3 => ProtocolRequirementKind::Getter,
            4 => ProtocolRequirementKind::Setter,
            5 => ProtocolRequirementKind::ReadCoroutine,
            6 => ProtocolRequirementKind::ModifyCoroutine,
            7 => ProtocolRequirementKind::AssociatedTypeAccessFunction,
            8 => ProtocolRequirementKind::AssociatedConformanceAccessFunction,
            other => ProtocolRequirementKind::Unknown(other),
        }
    }
}

// =============================================================================
// Conformance Flags
// =============================================================================

bitflags! {
    /// Flags of a protocol conformance descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ConformanceFlags: u32 {
        const IS_RETROACTIVE = 1 << 6;
        const IS_SYNTHESIZED_NON_UNIQUE = 1 << 7;
        const HAS_RESILIENT_WITNESSES = 1 << 16;
        const HAS_GENERIC_WITNESS_TABLE = 1 << 17;
        const IS_CONFORMANCE_OF_PROTOCOL = 1 << 18;
        const HAS_GLOBAL_ACTOR_ISOLATION = 1 << 19;
    }
}

impl ConformanceFlags {
    /// Wraps a raw flag word, keeping every bit.
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self::from_bits_retain(raw)
    }

    /// How the conforming type is referenced (bits 3-5).
    pub fn type_reference_kind(self) -> TypeReferenceKind {
        TypeReferenceKind::from_raw(((self.bits() >> 3) & 0b111) as u8)
    }

    /// Number of conditional requirements (bits 8-15).
    pub fn num_conditional_requirements(self) -> u32 {
        (self.bits() >> 8) & 0xFF
    }

    /// Number of conditional pack shape descriptors (bits 24-31).
    pub fn num_conditional_pack_shape_descriptors(self) -> u32 {
        self.bits() >> 24
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_flags() {
        // generic unique class, version 2, vtable
        let flags = ContextDescriptorFlags::new(0x8000_02D0);
        assert_eq!(flags.kind(), Some(ContextDescriptorKind::Class));
        assert!(flags.is_generic());
        assert!(flags.is_unique());
        assert!(!flags.has_invertible_protocols());
        assert_eq!(flags.version(), 2);
        assert_eq!(flags.kind_specific_flags(), 0x8000);
        assert!(flags.type_flags().contains(TypeContextFlags::CLASS_HAS_VTABLE));
    }

    #[test]
    fn test_unknown_kind() {
        assert_eq!(ContextDescriptorFlags::new(0x05).kind(), None);
        assert_eq!(ContextDescriptorFlags::new(0x1F).kind_raw(), 0x1F);
    }

    #[test]
    fn test_type_flags_fields() {
        let flags = TypeContextFlags::from_bits_retain(0b0010_0010_0000_0001);
        assert_eq!(flags.metadata_initialization(), MetadataInitialization::Singleton);
        assert_eq!(
            flags.resilient_superclass_reference_kind(),
            TypeReferenceKind::IndirectTypeDescriptor
        );
        assert!(flags.contains(TypeContextFlags::CLASS_HAS_RESILIENT_SUPERCLASS));
    }

    #[test]
    fn test_conformance_flags() {
        let flags = ConformanceFlags::new((2 << 24) | (1 << 17) | (3 << 8) | (1 << 3) | (1 << 6));
        assert_eq!(flags.type_reference_kind(), TypeReferenceKind::IndirectTypeDescriptor);
        assert!(flags.contains(ConformanceFlags::IS_RETROACTIVE));
        assert_eq!(flags.num_conditional_requirements(), 3);
        assert!(flags.contains(ConformanceFlags::HAS_GENERIC_WITNESS_TABLE));
        assert!(!flags.contains(ConformanceFlags::HAS_RESILIENT_WITNESSES));
        assert_eq!(flags.num_conditional_pack_shape_descriptors(), 2);
    }

    #[test]
    fn test_method_flags() {
        let flags = MethodDescriptorFlags::from_bits_retain(0xABCD_0012);
        assert_eq!(flags.kind(), MethodKind::Getter);
        assert!(flags.contains(MethodDescriptorFlags::IS_INSTANCE));
        assert_eq!(flags.extra_discriminator(), 0xABCD);
    }
}
