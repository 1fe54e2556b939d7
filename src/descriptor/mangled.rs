//! Mangled names with embedded symbolic references.
//!
//! Swift stores type names in metadata as mangled strings in which control
//! bytes introduce references to other metadata instead of spelling the name
//! out:
//!
//! - `0x01..=0x17`: followed by a 32-bit relative offset
//! - `0x18..=0x1F`: followed by a pointer-sized absolute address
//!
//! A name ends at the first NUL that is not part of a reference payload.
//! Demangling is left to the consumer; this module only delimits the bytes and
//! locates the references.

use std::fmt;

use super::ContextDescriptorWrapper;
use crate::error::Result;
use crate::reading::{Address, ReadingContext, Resolvable};
use crate::symbol::{resolve_slot, SymbolOrElement};

/// Reference to a context descriptor by relative offset.
pub const SYMBOLIC_DIRECT_CONTEXT: u8 = 0x01;
/// Reference to a slot holding a context descriptor.
pub const SYMBOLIC_INDIRECT_CONTEXT: u8 = 0x02;

const RELATIVE_RANGE: std::ops::RangeInclusive<u8> = 0x01..=0x17;
const ABSOLUTE_RANGE: std::ops::RangeInclusive<u8> = 0x18..=0x1F;

/// Target of a symbolic reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolicTarget<A> {
    /// Relative reference, already applied to the payload's address.
    Relative(A),
    /// Absolute reference, tags stripped but not translated.
    Absolute(u64),
}

/// A symbolic reference inside a mangled name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolicReference<A> {
    /// The control byte
    pub kind: u8,
    /// Index of the control byte within the name
    pub position: usize,
    /// Where the reference points
    pub target: SymbolicTarget<A>,
}

impl<A: Address> SymbolicReference<A> {
    /// Resolves a context-descriptor reference.
    ///
    /// Returns `None` for reference kinds that do not designate a context
    /// descriptor.
    pub fn resolve_context<C>(&self, ctx: &C) -> Result<Option<SymbolOrElement<ContextDescriptorWrapper<A>>>>
    where
        C: ReadingContext<Address = A>,
    {
        let SymbolicTarget::Relative(target) = self.target else {
            return Ok(None);
        };
        let address = match self.kind {
            SYMBOLIC_DIRECT_CONTEXT => SymbolOrElement::Element(target),
            SYMBOLIC_INDIRECT_CONTEXT => resolve_slot(ctx, target)?,
            _ => return Ok(None),
        };
        address
            .try_map(|at| ContextDescriptorWrapper::resolve(ctx, at))
            .map(Some)
    }
}

/// A mangled name as stored in the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MangledName<A> {
    /// Address of the first byte
    pub address: A,
    /// Raw bytes without the terminator, reference payloads included
    pub bytes: Vec<u8>,
    /// Symbolic references in order of appearance
    pub references: Vec<SymbolicReference<A>>,
}

impl<A: Address> MangledName<A> {
    /// Byte length, reference payloads included.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Address range `[start, end)` of the name's bytes.
    pub fn range(&self) -> (A, A) {
        (self.address, self.address.advanced(self.bytes.len()))
    }

    pub fn has_symbolic_references(&self) -> bool {
        !self.references.is_empty()
    }

    /// Returns the name as text if it contains no symbolic references.
    pub fn as_plain_str(&self) -> Option<&str> {
        if self.has_symbolic_references() {
            return None;
        }
        std::str::from_utf8(&self.bytes).ok()
    }
}

impl<A: Address> Resolvable<A> for MangledName<A> {
    fn resolve<C: ReadingContext<Address = A>>(ctx: &C, at: A) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut references = Vec::new();
        let mut cursor = at;

        loop {
            let byte = ctx.read_element::<u8>(cursor)?;
            if byte == 0 {
                break;
            }

            if RELATIVE_RANGE.contains(&byte) {
                let payload = cursor.advanced(1);
                let raw = ctx.bytes_at(payload, 4)?;
                let offset = crate::util::read_i32_le(raw);
                references.push(SymbolicReference {
                    kind: byte,
                    position: bytes.len(),
                    target: SymbolicTarget::Relative(payload.offset_by(offset as i64)),
                });
                bytes.push(byte);
                bytes.extend_from_slice(raw);
                cursor = payload.advanced(4);
            } else if ABSOLUTE_RANGE.contains(&byte) {
                let payload = cursor.advanced(1);
                let raw = ctx.bytes_at(payload, 8)?;
                let value = ctx.strip_pointer_tags(crate::util::read_u64_le(raw));
                references.push(SymbolicReference {
                    kind: byte,
                    position: bytes.len(),
                    target: SymbolicTarget::Absolute(value),
                });
                bytes.push(byte);
                bytes.extend_from_slice(raw);
                cursor = payload.advanced(8);
            } else {
                bytes.push(byte);
                cursor = cursor.advanced(1);
            }
        }

        Ok(Self {
            address: at,
            bytes,
            references,
        })
    }
}

impl<A: Address> fmt::Display for MangledName<A> {
    /// Prints the text with each reference as `{kind:target}`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut index = 0;
        for reference in &self.references {
            f.write_str(&String::from_utf8_lossy(&self.bytes[index..reference.position]))?;
            match reference.target {
                SymbolicTarget::Relative(target) => {
                    write!(f, "{{{:#04x}:{:#x}}}", reference.kind, target)?;
                    index = reference.position + 5;
                }
                SymbolicTarget::Absolute(target) => {
                    write!(f, "{{{:#04x}:{:#x}}}", reference.kind, target)?;
                    index = reference.position + 9;
                }
            }
        }
        f.write_str(&String::from_utf8_lossy(&self.bytes[index.min(self.bytes.len())..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::BufferContext;

    #[test]
    fn test_plain_name() {
        let mut data = b"Si\0".to_vec();
        data.resize(8, 0);
        let ctx = BufferContext::new(data);
        let name: MangledName<u64> = ctx.read_wrapper(0).unwrap();
        assert_eq!(name.as_plain_str(), Some("Si"));
        assert_eq!(name.range(), (0, 2));
    }

    #[test]
    fn test_symbolic_references() {
        let mut data = vec![0u8; 0x40];
        // 0x10: 0x01 <rel to 0x30> "Sg" 0x18 <abs 0x20> NUL
        data[0x10] = SYMBOLIC_DIRECT_CONTEXT;
        // payload at 0x11, offset 0x1F -> 0x30; 0x00 inside the payload
        data[0x11..0x15].copy_from_slice(&0x1Fi32.to_le_bytes());
        data[0x15..0x17].copy_from_slice(b"Sg");
        data[0x17] = 0x18;
        data[0x18..0x20].copy_from_slice(&0x8000_0000_0000_0020u64.to_le_bytes());
        let ctx = BufferContext::new(data);

        let name: MangledName<u64> = ctx.read_wrapper(0x10).unwrap();
        assert_eq!(name.len(), 5 + 2 + 9);
        assert_eq!(name.references.len(), 2);
        assert_eq!(name.references[0].target, SymbolicTarget::Relative(0x30));
        assert_eq!(name.references[0].position, 0);
        assert_eq!(name.references[1].kind, 0x18);
        assert_eq!(name.references[1].position, 7);
        assert_eq!(name.references[1].target, SymbolicTarget::Absolute(0x20));
        assert_eq!(name.as_plain_str(), None);
        assert_eq!(name.to_string(), "{0x01:0x30}Sg{0x18:0x20}");
    }

    #[test]
    fn test_truncated_payload() {
        let ctx = BufferContext::new(vec![0x01, 0x00, 0x00]);
        assert!(ctx.read_wrapper::<MangledName<u64>>(0).is_err());
    }
}
