//! Cursor over the variable-length trailing objects of a descriptor.
//!
//! Descriptors are a fixed header followed by optional blocks whose presence
//! depends on flag bits and whose sizes depend on counts read along the way.
//! Each kind lists its blocks in ABI order as a table of [`TrailingBlock`]s;
//! [`decode_trailing`] walks the table, and every present block consumes its
//! bytes from the shared [`TrailingCursor`].

use std::mem::size_of;

use tracing::trace;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::error::Result;
use crate::layout::{LocatableLayout, Located};
use crate::reading::{Address, ReadingContext};

/// Read position within a descriptor's trailing objects.
#[derive(Debug, Clone, Copy)]
pub struct TrailingCursor<A> {
    start: A,
    position: A,
}

impl<A: Address> TrailingCursor<A> {
    /// Starts a cursor at `start` (the descriptor's own address).
    pub fn new(start: A, position: A) -> Self {
        Self { start, position }
    }

    /// Starts a cursor just past a located header.
    pub fn after<L: LocatableLayout>(header: &Located<L, A>) -> Self {
        Self::new(header.address, header.end())
    }

    /// Current read position.
    #[inline]
    pub fn position(&self) -> A {
        self.position
    }

    /// Bytes consumed since the descriptor start, header included.
    #[inline]
    pub fn consumed(&self) -> usize {
        self.position.delta_from(self.start) as usize
    }

    /// Moves forward by `bytes`.
    #[inline]
    pub fn skip(&mut self, bytes: usize) {
        self.position = self.position.advanced(bytes);
    }

    /// Aligns the position (relative to the descriptor start) up to `alignment`.
    pub fn align(&mut self, alignment: usize) {
        let consumed = self.consumed() as u64;
        let aligned = crate::util::align_up(consumed, alignment as u64);
        self.skip((aligned - consumed) as usize);
    }

    /// Reads one element and moves past it.
    pub fn take<C, T>(&mut self, ctx: &C) -> Result<T>
    where
        C: ReadingContext<Address = A>,
        T: FromBytes + KnownLayout + Immutable,
    {
        let value = ctx.read_element::<T>(self.position)?;
        self.skip(size_of::<T>());
        Ok(value)
    }

    /// Reads one located layout and moves past it.
    pub fn take_located<C, L>(&mut self, ctx: &C) -> Result<Located<L, A>>
    where
        C: ReadingContext<Address = A>,
        L: LocatableLayout,
    {
        let located = ctx.read_locatable_layout::<L>(self.position)?;
        self.skip(L::SIZE);
        Ok(located)
    }

    /// Reads `count` located layouts and moves past them.
    pub fn take_located_array<C, L>(&mut self, ctx: &C, count: usize) -> Result<Vec<Located<L, A>>>
    where
        C: ReadingContext<Address = A>,
        L: LocatableLayout,
    {
        // bounds-check the whole block before decoding any element
        let total = L::SIZE
            .checked_mul(count)
            .ok_or_else(|| crate::error::Error::buffer_too_small(usize::MAX, 0))?;
        ctx.bytes_at(self.position, total)?;

        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.take_located::<C, L>(ctx)?);
        }
        Ok(items)
    }
}

// =============================================================================
// Trailing Block Tables
// =============================================================================

/// One optional trailing object: when `present` holds for the descriptor
/// decoded so far, `decode` consumes it.
pub struct TrailingBlock<D, C: ReadingContext> {
    /// Name used in trace output
    pub name: &'static str,
    /// Whether the block is present
    pub present: fn(&D) -> bool,
    /// Consumes the block and stores it into the descriptor
    pub decode: fn(&C, &mut TrailingCursor<C::Address>, &mut D) -> Result<()>,
}

/// Decodes every present block of `table` in order.
pub fn decode_trailing<D, C: ReadingContext>(
    ctx: &C,
    cursor: &mut TrailingCursor<C::Address>,
    descriptor: &mut D,
    table: &[TrailingBlock<D, C>],
) -> Result<()> {
    for block in table {
        if !(block.present)(descriptor) {
            continue;
        }
        trace!(
            block = block.name,
            at = format_args!("{:#x}", cursor.position().as_u64()),
            "decoding trailing block"
        );
        (block.decode)(ctx, cursor, descriptor)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::BufferContext;

    #[derive(Default)]
    struct Sample {
        flags: u32,
        first: Option<u32>,
        second: Vec<u16>,
    }

    fn blocks() -> Vec<TrailingBlock<Sample, BufferContext>> {
        vec![
            TrailingBlock {
                name: "first",
                present: |d| d.flags & 1 != 0,
                decode: |ctx, cursor, d| {
                    d.first = Some(cursor.take(ctx)?);
                    Ok(())
                },
            },
            TrailingBlock {
                name: "second",
                present: |d| d.flags & 2 != 0,
                decode: |ctx, cursor, d| {
                    let count = d.first.unwrap_or(0) as usize;
                    for _ in 0..count {
                        d.second.push(cursor.take(ctx)?);
                    }
                    cursor.align(4);
                    Ok(())
                },
            },
        ]
    }

    fn context() -> BufferContext {
        let mut data = vec![0u8; 32];
        data[8..12].copy_from_slice(&3u32.to_le_bytes());
        data[12..14].copy_from_slice(&7u16.to_le_bytes());
        data[14..16].copy_from_slice(&8u16.to_le_bytes());
        data[16..18].copy_from_slice(&9u16.to_le_bytes());
        BufferContext::new(data)
    }

    #[test]
    fn test_blocks_in_order() {
        let ctx = context();
        let mut sample = Sample {
            flags: 3,
            ..Sample::default()
        };
        let mut cursor = TrailingCursor::new(4u64, 8);
        decode_trailing(&ctx, &mut cursor, &mut sample, &blocks()).unwrap();

        assert_eq!(sample.first, Some(3));
        assert_eq!(sample.second, vec![7, 8, 9]);
        // 4 header bytes + 4 + 6, aligned to 4
        assert_eq!(cursor.consumed(), 16);
        assert_eq!(cursor.position(), 20);
    }

    #[test]
    fn test_absent_blocks_consume_nothing() {
        let ctx = context();
        let mut sample = Sample {
            flags: 2,
            ..Sample::default()
        };
        let mut cursor = TrailingCursor::new(8u64, 8);
        decode_trailing(&ctx, &mut cursor, &mut sample, &blocks()).unwrap();
        assert_eq!(sample.first, None);
        assert!(sample.second.is_empty());
        assert_eq!(cursor.consumed(), 0);
    }

    #[test]
    fn test_overlong_block_fails() {
        let ctx = context();
        let mut cursor = TrailingCursor::new(0u64, 28);
        assert!(cursor.take::<_, u64>(&ctx).is_err());
    }
}
