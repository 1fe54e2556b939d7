//! Scans of the Swift metadata sections.
//!
//! `__swift5_types`, `__swift5_protos` and `__swift5_proto` are arrays of
//! 32-bit relative pointers; `__swift5_assocty` and `__swift5_fieldmd` are
//! packed records whose sizes come from their own headers.
//!
//! A malformed entry yields an `Err` in its slot and the scan continues with
//! the next pointer. Packed record scans stop at the first malformed record,
//! since its size is unknown.

use tracing::{debug, warn};

use super::associated_type::AssociatedTypeDescriptor;
use super::conformance::ProtocolConformanceDescriptor;
use super::field::FieldDescriptor;
use super::protocol::ProtocolDescriptor;
use super::ContextDescriptorWrapper;
use crate::error::Result;
use crate::image::{MachOFile, MachOImage};
use crate::macho::{
    SWIFT5_ASSOCIATED_TYPES, SWIFT5_FIELD_METADATA, SWIFT5_PROTOCOLS, SWIFT5_PROTOCOL_CONFORMANCES,
    SWIFT5_TYPES,
};
use crate::pointer::{RelativeIndirectablePointer, RelativeIndirectablePointerIntPair};
use crate::reading::{Address, ReadingContext};
use crate::symbol::SymbolOrElement;

/// A Swift metadata section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwiftSection {
    Types,
    Protocols,
    Conformances,
    AssociatedTypes,
    FieldMetadata,
}

impl SwiftSection {
    pub fn name(self) -> &'static str {
        match self {
            Self::Types => SWIFT5_TYPES,
            Self::Protocols => SWIFT5_PROTOCOLS,
            Self::Conformances => SWIFT5_PROTOCOL_CONFORMANCES,
            Self::AssociatedTypes => SWIFT5_ASSOCIATED_TYPES,
            Self::FieldMetadata => SWIFT5_FIELD_METADATA,
        }
    }
}

/// Start and size of a section's contents.
pub type SectionRange<A> = (A, u64);

/// Per-entry scan results.
pub type Entries<T> = Vec<Result<T>>;

// =============================================================================
// Scans
// =============================================================================

/// Resolves every 4-byte entry of a pointer section with `resolve`.
fn scan_pointers<C, T, F>(ctx: &C, section: &str, range: SectionRange<C::Address>, resolve: F) -> Entries<T>
where
    C: ReadingContext,
    F: Fn(&C, C::Address) -> Result<T>,
{
    let (start, size) = range;
    let count = (size / 4) as usize;
    debug!(section, count, "scanning pointer section");

    (0..count)
        .map(|i| {
            let field = start.advanced(i * 4);
            let entry = resolve(ctx, field);
            if let Err(err) = &entry {
                warn!(
                    section,
                    entry = format_args!("{:#x}", ctx.offset_from_address(field)),
                    %err,
                    "skipping malformed entry"
                );
            }
            entry
        })
        .collect()
}

/// Decodes packed records until the range is exhausted or a record fails.
fn scan_records<C, T, F, S>(
    ctx: &C,
    section: &str,
    range: SectionRange<C::Address>,
    decode: F,
    size_of: S,
) -> Entries<T>
where
    C: ReadingContext,
    F: Fn(&C, C::Address) -> Result<T>,
    S: Fn(&T) -> usize,
{
    let (start, size) = range;
    let end = start.advanced(size as usize);
    let mut at = start;
    let mut entries = Vec::new();

    while at < end {
        match decode(ctx, at) {
            Ok(record) => {
                at = at.advanced(size_of(&record));
                entries.push(Ok(record));
            }
            Err(err) => {
                warn!(
                    section,
                    entry = format_args!("{:#x}", ctx.offset_from_address(at)),
                    %err,
                    "stopping at malformed record"
                );
                entries.push(Err(err));
                break;
            }
        }
    }
    debug!(section, count = entries.len(), "scanned record section");
    entries
}

/// Type descriptors listed in `__swift5_types`.
///
/// The low two bits of each entry hold the type reference kind; only the
/// indirect bit changes how the entry resolves.
pub fn scan_types<C: ReadingContext>(
    ctx: &C,
    range: SectionRange<C::Address>,
) -> Entries<SymbolOrElement<ContextDescriptorWrapper<C::Address>>> {
    scan_pointers(ctx, SwiftSection::Types.name(), range, |ctx, field| {
        RelativeIndirectablePointerIntPair::<ContextDescriptorWrapper<_>, bool>::read(ctx, field)?
            .resolve(ctx, field)
    })
}

/// Protocol descriptors listed in `__swift5_protos`.
pub fn scan_protocols<C: ReadingContext>(
    ctx: &C,
    range: SectionRange<C::Address>,
) -> Entries<SymbolOrElement<ProtocolDescriptor<C::Address>>> {
    scan_pointers(ctx, SwiftSection::Protocols.name(), range, |ctx, field| {
        RelativeIndirectablePointerIntPair::<ProtocolDescriptor<_>, bool>::read(ctx, field)?
            .resolve(ctx, field)
    })
}

/// Conformance descriptors listed in `__swift5_proto`.
pub fn scan_conformances<C: ReadingContext>(
    ctx: &C,
    range: SectionRange<C::Address>,
) -> Entries<SymbolOrElement<ProtocolConformanceDescriptor<C::Address>>> {
    scan_pointers(ctx, SwiftSection::Conformances.name(), range, |ctx, field| {
        RelativeIndirectablePointer::<ProtocolConformanceDescriptor<_>>::read(ctx, field)?
            .resolve(ctx, field)
    })
}

/// Records of `__swift5_assocty`.
pub fn scan_associated_types<C: ReadingContext>(
    ctx: &C,
    range: SectionRange<C::Address>,
) -> Entries<AssociatedTypeDescriptor<C::Address>> {
    scan_records(
        ctx,
        SwiftSection::AssociatedTypes.name(),
        range,
        AssociatedTypeDescriptor::decode,
        AssociatedTypeDescriptor::actual_size,
    )
}

/// Records of `__swift5_fieldmd`.
pub fn scan_field_descriptors<C: ReadingContext>(
    ctx: &C,
    range: SectionRange<C::Address>,
) -> Entries<FieldDescriptor<C::Address>> {
    scan_records(
        ctx,
        SwiftSection::FieldMetadata.name(),
        range,
        FieldDescriptor::decode,
        FieldDescriptor::actual_size,
    )
}

// =============================================================================
// Backends
// =============================================================================

/// Contexts that can locate the Swift metadata sections.
///
/// A missing section scans as empty.
pub trait SwiftSections: ReadingContext + Sized {
    /// Address and size of a section, `None` if the binary lacks it.
    fn swift_section(&self, section: SwiftSection) -> Result<Option<SectionRange<Self::Address>>>;

    fn types(&self) -> Result<Entries<SymbolOrElement<ContextDescriptorWrapper<Self::Address>>>> {
        Ok(self
            .swift_section(SwiftSection::Types)?
            .map(|range| scan_types(self, range))
            .unwrap_or_default())
    }

    fn protocols(&self) -> Result<Entries<SymbolOrElement<ProtocolDescriptor<Self::Address>>>> {
        Ok(self
            .swift_section(SwiftSection::Protocols)?
            .map(|range| scan_protocols(self, range))
            .unwrap_or_default())
    }

    fn conformances(
        &self,
    ) -> Result<Entries<SymbolOrElement<ProtocolConformanceDescriptor<Self::Address>>>> {
        Ok(self
            .swift_section(SwiftSection::Conformances)?
            .map(|range| scan_conformances(self, range))
            .unwrap_or_default())
    }

    fn associated_types(&self) -> Result<Entries<AssociatedTypeDescriptor<Self::Address>>> {
        Ok(self
            .swift_section(SwiftSection::AssociatedTypes)?
            .map(|range| scan_associated_types(self, range))
            .unwrap_or_default())
    }

    fn field_descriptors(&self) -> Result<Entries<FieldDescriptor<Self::Address>>> {
        Ok(self
            .swift_section(SwiftSection::FieldMetadata)?
            .map(|range| scan_field_descriptors(self, range))
            .unwrap_or_default())
    }
}

impl SwiftSections for MachOFile {
    fn swift_section(&self, section: SwiftSection) -> Result<Option<SectionRange<u64>>> {
        self.section_range(section.name())
    }
}

impl SwiftSections for MachOImage {
    fn swift_section(
        &self,
        section: SwiftSection,
    ) -> Result<Option<SectionRange<crate::reading::RawAddress>>> {
        Ok(self.section_range(section.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::associated_type::{AssociatedTypeDescriptorLayout, AssociatedTypeRecord};
    use crate::descriptor::ContextDescriptor;
    use crate::reading::{BufferContext, FixupTables};
    use zerocopy::IntoBytes;

    #[test]
    fn test_types_section_with_bad_entry() {
        let mut data = vec![0u8; 0x100];
        // module descriptor at 0x40 with name at 0x60
        data[0x48..0x4C].copy_from_slice(&(0x60i32 - 0x48).to_le_bytes());
        data[0x60..0x64].copy_from_slice(b"Mod\0");
        // unknown kind 0x1F at 0x50
        data[0x50] = 0x1F;
        // section at 0x10: direct to 0x40, direct to 0x50, indirect via bound slot 0x80
        data[0x10..0x14].copy_from_slice(&(0x40i32 - 0x10).to_le_bytes());
        data[0x14..0x18].copy_from_slice(&(0x50i32 - 0x14).to_le_bytes());
        data[0x18..0x1C].copy_from_slice(&((0x80i32 - 0x18) | 1).to_le_bytes());
        let mut fixups = FixupTables::new();
        fixups.insert_bind(0x80, "_$s3Ext4TypeVMn");
        let ctx = BufferContext::new(data).with_fixups(fixups);

        let entries = scan_types(&ctx, (0x10, 12));
        assert_eq!(entries.len(), 3);

        let first = entries[0].as_ref().unwrap().element().unwrap();
        assert_eq!(first.address(), 0x40);
        assert_eq!(first.name(&ctx).unwrap().as_deref(), Some("Mod"));
        assert!(entries[1].is_err());
        assert!(entries[1].as_ref().unwrap_err().is_recoverable());
        assert!(entries[2].as_ref().unwrap().is_symbol());
    }

    #[test]
    fn test_types_entry_kind_bits_masked() {
        let mut data = vec![0u8; 0x80];
        data[0x48..0x4C].copy_from_slice(&(0x60i32 - 0x48).to_le_bytes());
        data[0x60..0x64].copy_from_slice(b"Mod\0");
        // direct reference with the second kind bit set
        data[0x10..0x14].copy_from_slice(&((0x40i32 - 0x10) | 2).to_le_bytes());
        let ctx = BufferContext::new(data);

        let entries = scan_types(&ctx, (0x10, 4));
        assert_eq!(entries.len(), 1);
        let descriptor = entries[0].as_ref().unwrap().element().unwrap();
        assert_eq!(descriptor.address(), 0x40);
        assert_eq!(descriptor.name(&ctx).unwrap().as_deref(), Some("Mod"));
    }

    #[test]
    fn test_assocty_records_stride() {
        let mut data = vec![0u8; 0x80];
        let header = AssociatedTypeDescriptorLayout {
            num_associated_types: 2,
            associated_type_record_size: 8,
            ..Default::default()
        };
        data[0..16].copy_from_slice(header.as_bytes());
        data[16..24].copy_from_slice(AssociatedTypeRecord::default().as_bytes());
        data[24..32].copy_from_slice(AssociatedTypeRecord::default().as_bytes());
        let single = AssociatedTypeDescriptorLayout {
            num_associated_types: 1,
            associated_type_record_size: 8,
            ..Default::default()
        };
        data[32..48].copy_from_slice(single.as_bytes());
        let ctx = BufferContext::new(data);

        let entries = scan_associated_types(&ctx, (0, 56));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].as_ref().unwrap().records.len(), 2);
        assert_eq!(entries[1].as_ref().unwrap().address(), 32);
    }

    #[test]
    fn test_record_scan_stops_on_error() {
        let mut data = vec![0u8; 0x20];
        let header = AssociatedTypeDescriptorLayout {
            num_associated_types: 50,
            associated_type_record_size: 8,
            ..Default::default()
        };
        data[0..16].copy_from_slice(header.as_bytes());
        let ctx = BufferContext::new(data);

        let entries = scan_associated_types(&ctx, (0, 0x20));
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_err());
    }
}
