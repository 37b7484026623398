//! A minimal bytecode assembler for integration tests. There is no
//! compiler in this crate (it only consumes the wire format, per
//! `src/loader.rs`), so tests hand-assemble the literal byte streams the
//! end-to-end scenarios specify.

use std::sync::{Arc, Mutex};

pub const NIL: u8 = 0x00;
pub const CONST_L: u8 = 0x01;
pub const CONST_D: u8 = 0x02;
pub const CONST_STR: u8 = 0x03;
pub const BOOLTRUE: u8 = 0x04;
pub const BOOLFALSE: u8 = 0x05;
pub const POP: u8 = 0x06;
pub const ADD: u8 = 0x07;
pub const SUB: u8 = 0x08;
pub const MUL: u8 = 0x09;
#[allow(dead_code)]
pub const DIV: u8 = 0x0A;
#[allow(dead_code)]
pub const MOD: u8 = 0x0B;
#[allow(dead_code)]
pub const NEG: u8 = 0x0C;
#[allow(dead_code)]
pub const EQ: u8 = 0x0D;
#[allow(dead_code)]
pub const NE: u8 = 0x0E;
pub const LT: u8 = 0x0F;
#[allow(dead_code)]
pub const LE: u8 = 0x10;
#[allow(dead_code)]
pub const GT: u8 = 0x11;
#[allow(dead_code)]
pub const GE: u8 = 0x12;
#[allow(dead_code)]
pub const NOT: u8 = 0x13;
#[allow(dead_code)]
pub const TOSTRING: u8 = 0x14;
#[allow(dead_code)]
pub const TOINT: u8 = 0x15;
#[allow(dead_code)]
pub const TOFLOAT: u8 = 0x16;
pub const DEFGLOBAL: u8 = 0x17;
pub const GETGLOBAL: u8 = 0x18;
#[allow(dead_code)]
pub const SETGLOBAL: u8 = 0x19;
pub const DEFLOCAL: u8 = 0x1A;
pub const GETLOCAL: u8 = 0x1B;
pub const SETLOCAL: u8 = 0x1C;
pub const JUMP: u8 = 0x1D;
pub const LOOP: u8 = 0x1E;
pub const JUMP_IF_FALSE: u8 = 0x1F;
#[allow(dead_code)]
pub const JUMP_IF_TRUE: u8 = 0x20;
pub const CALL: u8 = 0x21;
pub const CALL_NATIVE: u8 = 0x22;
pub const LFUNC: u8 = 0x23;
pub const RETURN: u8 = 0x24;
pub const EXITVM: u8 = 0x25;

const TAG_INT: u8 = 1;
#[allow(dead_code)]
const TAG_BOOL: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_OBJECT: u8 = 4;
const OBJ_STRING: u8 = 0;

/// Assembles one chunk's constant pool and code, tracking the
/// one-entry-per-instruction line table the wire format expects.
#[derive(Default)]
pub struct ChunkBuilder {
    constants: Vec<u8>,
    constant_count: u8,
    code: Vec<u8>,
    line_entries: u32,
    locals_count: u8,
}

impl ChunkBuilder {
    pub fn new(locals_count: u8) -> Self {
        ChunkBuilder { locals_count, ..Default::default() }
    }

    pub fn const_int(&mut self, value: i64) -> u8 {
        self.constants.push(TAG_INT);
        self.constants.extend_from_slice(&value.to_le_bytes());
        self.next_constant_index()
    }

    #[allow(dead_code)]
    pub fn const_float(&mut self, value: f64) -> u8 {
        self.constants.push(TAG_FLOAT);
        self.constants.extend_from_slice(&value.to_le_bytes());
        self.next_constant_index()
    }

    pub fn const_str(&mut self, value: &str) -> u8 {
        self.constants.push(TAG_OBJECT);
        self.constants.push(OBJ_STRING);
        self.constants.extend_from_slice(&(value.len() as u64).to_le_bytes());
        self.constants.extend_from_slice(value.as_bytes());
        self.next_constant_index()
    }

    fn next_constant_index(&mut self) -> u8 {
        let idx = self.constant_count;
        self.constant_count = self.constant_count.checked_add(1).expect("test chunk exceeded 255 constants");
        idx
    }

    /// Appends a 0-operand instruction.
    pub fn op(&mut self, opcode: u8) -> &mut Self {
        self.code.push(opcode);
        self.line_entries += 1;
        self
    }

    /// Appends a 1-operand-byte instruction.
    pub fn op1(&mut self, opcode: u8, operand: u8) -> &mut Self {
        self.code.push(opcode);
        self.code.push(operand);
        self.line_entries += 1;
        self
    }

    /// Appends a jump/loop instruction with a placeholder 2-byte operand
    /// and returns the code offset of the operand's first byte, to be
    /// resolved later via [`ChunkBuilder::patch_jump`]/[`patch_loop`].
    pub fn op_jump_placeholder(&mut self, opcode: u8) -> usize {
        self.code.push(opcode);
        let operand_at = self.code.len();
        self.code.extend_from_slice(&[0u8, 0u8]);
        self.line_entries += 1;
        operand_at
    }

    /// The offset the *next* instruction will be emitted at -- used as a
    /// jump/loop target.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Resolves a forward `JUMP`/`JUMP_IF_*` operand so that the jump lands
    /// at `target` (spec §4.4: `ip = operand_at + offset + 2`).
    pub fn patch_jump(&mut self, operand_at: usize, target: usize) {
        let offset = (target - operand_at - 2) as u16;
        self.code[operand_at..operand_at + 2].copy_from_slice(&offset.to_le_bytes());
    }

    /// Resolves a `LOOP` operand so that the jump lands at `target` (spec
    /// §4.4: `ip = operand_at + 2 - offset - 1`).
    pub fn patch_loop(&mut self, operand_at: usize, target: usize) {
        let offset = (operand_at + 1 - target) as u16;
        self.code[operand_at..operand_at + 2].copy_from_slice(&offset.to_le_bytes());
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.constant_count);
        out.extend_from_slice(&self.constants);
        out.push(self.locals_count);
        out.extend_from_slice(&self.line_entries.to_le_bytes());
        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.code);
        for _ in 0..self.line_entries {
            out.extend_from_slice(&1u16.to_le_bytes());
        }
        out
    }
}

/// Assembles a complete image: a version header plus an ordered sequence
/// of chunks (spec §4.3/§6). Chunk 0 is the implicit top-level script.
#[derive(Default)]
pub struct ImageBuilder {
    chunks: Vec<ChunkBuilder>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_chunk(&mut self, chunk: ChunkBuilder) -> usize {
        self.chunks.push(chunk);
        self.chunks.len() - 1
    }

    pub fn build(self) -> Vec<u8> {
        let mut out = vec![1u8, 0u8, 0u8];
        out.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());
        for chunk in &self.chunks {
            out.extend_from_slice(&chunk.encode());
        }
        out
    }
}

/// A `Write` sink over a shared buffer, so a test can both hand ownership
/// of a writer to `run_with_output` and read back what was written.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents_as_string(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("test output is valid UTF-8")
    }
}

impl std::io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
