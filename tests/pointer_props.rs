//! Property-based tests for the relative pointer encodings.

use proptest::prelude::*;

use swiftdex::pointer::{RelativeIndirectablePointer, RelativeIndirectablePointerIntPair};
use swiftdex::reading::BufferContext;
use swiftdex::RelativeDirectPointer;

// =============================================================================
// Indirectable Int Pair
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2000))]

    /// Bit 0 is the indirect flag, bit 1 the packed value, and the rest the
    /// offset, for every raw pattern.
    #[test]
    fn int_pair_bits_are_independent(raw in any::<i32>()) {
        let pointer = RelativeIndirectablePointerIntPair::<(), bool>::new(raw);
        prop_assert_eq!(pointer.is_indirect(), raw & 1 != 0);
        prop_assert_eq!(pointer.value(), raw & 2 != 0);
        prop_assert_eq!(pointer.offset(), raw & !3);
        prop_assert_eq!(pointer.offset() & 3, 0);
        prop_assert_eq!(pointer.is_null(), raw & !3 == 0);
    }

    /// The int pair and plain indirectable pointer agree on the indirect bit
    /// and, for 4-aligned offsets, on the target.
    #[test]
    fn int_pair_matches_indirectable(offset in -0x1000_0000i32..0x1000_0000, flags in 0i32..4) {
        let raw = (offset & !3) | flags;
        let pair = RelativeIndirectablePointerIntPair::<(), u8>::new(raw);
        let plain = RelativeIndirectablePointer::<()>::new(raw & !2);
        let field = 0x1_0000_0000u64;

        prop_assert_eq!(pair.is_indirect(), plain.is_indirect());
        prop_assert_eq!(pair.target(field), plain.target(field));
        prop_assert_eq!(pair.value(), (flags >> 1) as u8);
    }

    /// Encoding a target as a relative offset and resolving it lands on the
    /// target again.
    #[test]
    fn direct_pointer_round_trip(field in 0u64..0x4000_0000, target in 0u64..0x4000_0000) {
        let pointer = RelativeDirectPointer::<()>::from_target(field, target);
        prop_assert!(pointer.is_some());
        let pointer = pointer.unwrap();
        prop_assert_eq!(pointer.target(field), target);
        prop_assert_eq!(pointer.is_null(), field == target);
    }

    /// Resolving a stored offset reads the string it designates.
    #[test]
    fn direct_pointer_resolves_stored_offset(field in 0usize..0x3C, target in 0x40usize..0x80) {
        let mut data = vec![0u8; 0x100];
        let delta = target as i32 - field as i32;
        data[field..field + 4].copy_from_slice(&delta.to_le_bytes());
        data[target] = b'A';
        let ctx = BufferContext::new(data);

        let pointer = RelativeDirectPointer::<String>::read(&ctx, field as u64).unwrap();
        prop_assert_eq!(pointer.resolve(&ctx, field as u64).unwrap(), "A");
    }
}
