//! A compiled code block (spec §3, §4.3).

use bytes::Bytes;

use crate::value::Value;

/// Constants, bytecode, line info, and declared local-slot count for one
/// function body or the top-level script. Chunks are created once by the
/// loader and are immutable and append-only-by-construction afterward
/// (spec: "Chunks are owned by the VM ... immutable after loading").
pub struct Chunk {
    /// Code bytes. A `Bytes` slice into the original image buffer -- cloning
    /// it is O(1) and shares the underlying allocation, which is how this
    /// implementation honors the wire-format loader's "zero-copy" contract
    /// (spec §4.3) in safe Rust instead of via raw borrowed pointers.
    code: Bytes,
    /// One entry per code byte (spec: "parallel array of 16-bit source line
    /// numbers, one entry per byte for fast blame").
    lines: Vec<u16>,
    constants: Vec<Value>,
    local_count: u8,
}

impl Chunk {
    pub fn new(code: Bytes, lines: Vec<u16>, constants: Vec<Value>, local_count: u8) -> Self {
        debug_assert_eq!(code.len(), lines.len(), "code and lines must be parallel arrays");
        Chunk { code, lines, constants, local_count }
    }

    #[inline]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    #[inline]
    pub fn byte_at(&self, offset: usize) -> u8 {
        self.code[offset]
    }

    #[inline]
    pub fn line_at(&self, offset: usize) -> u16 {
        self.lines[offset]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Constant pool is indexed by a one-byte operand (spec: "0-255
    /// constants per chunk").
    pub fn constant(&self, index: u8) -> Option<Value> {
        self.constants.get(index as usize).copied()
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn local_count(&self) -> u8 {
        self.local_count
    }
}
