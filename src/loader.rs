//! Decodes a bytecode image into `Chunk`s, interning every string constant
//! along the way (spec §4.3, §6).
//!
//! The image is a `bytes::Bytes`, so `Chunk::code` slices share the
//! caller's buffer instead of copying it -- the "zero-copy" contract the
//! wire format calls for, expressed in safe Rust via reference-counted
//! slicing rather than raw borrowed pointers.

use bytes::{Buf, Bytes};

use crate::chunk::Chunk;
use crate::error::{VmError, VmResult};
use crate::value::Value;
use crate::vm::Vm;

const TAG_NIL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_OBJECT: u8 = 4;

const OBJ_STRING: u8 = 0;

fn need(cursor: &Bytes, bytes: usize, what: &'static str) -> VmResult<()> {
    if cursor.remaining() < bytes {
        return Err(VmError::load(format!("truncated image: need {bytes} more bytes for {what}, have {}", cursor.remaining())));
    }
    Ok(())
}

/// Parses the header and every chunk, installing each into `vm.chunks` in
/// order (spec: "Chunks are owned by the VM ... an ordered sequence indexed
/// by integer").
pub(crate) fn load(vm: &mut Vm, image: Bytes) -> VmResult<()> {
    let mut cursor = image;
    need(&cursor, 3, "version header")?;
    cursor.advance(3);
    need(&cursor, 4, "chunk count")?;
    let chunk_count = cursor.get_u32_le();
    for _ in 0..chunk_count {
        let chunk = load_chunk(vm, &mut cursor)?;
        vm.chunks.push(chunk);
    }
    Ok(())
}

fn load_chunk(vm: &mut Vm, cursor: &mut Bytes) -> VmResult<Chunk> {
    need(cursor, 1, "constant_count")?;
    let constant_count = cursor.get_u8();
    let mut constants = Vec::with_capacity(constant_count as usize);
    for _ in 0..constant_count {
        constants.push(load_constant(vm, cursor)?);
    }

    need(cursor, 1, "locals_count")?;
    let locals_count = cursor.get_u8();

    need(cursor, 8, "ops_count/ops_length")?;
    let ops_count = cursor.get_u32_le() as usize;
    let ops_length = cursor.get_u32_le() as usize;

    need(cursor, ops_length, "code bytes")?;
    let code = cursor.split_to(ops_length);

    let lines_bytes = ops_count.checked_mul(2).ok_or_else(|| VmError::load("ops_count overflow"))?;
    need(cursor, lines_bytes, "line table")?;
    let mut lines = Vec::with_capacity(code.len());
    for _ in 0..ops_count {
        lines.push(cursor.get_u16_le());
    }
    // The line table has one entry per logical instruction, but `Chunk`
    // wants one entry per *byte* (spec §4.3: "parallel array ... one entry
    // per byte for fast blame"). Expand by repeating each instruction's
    // line across the bytes its encoding occupies.
    let expanded = expand_lines(code.as_ref(), &lines)?;

    Ok(Chunk::new(code, expanded, constants, locals_count))
}

/// Repeats each per-instruction line number across the opcode byte and its
/// operand bytes, producing the one-entry-per-byte array `Chunk` expects.
fn expand_lines(code: &[u8], lines: &[u16]) -> VmResult<Vec<u16>> {
    let mut expanded = Vec::with_capacity(code.len());
    let mut offset = 0;
    for &line in lines {
        if offset >= code.len() {
            return Err(VmError::load("line table has more entries than instructions fit in code"));
        }
        let opcode = crate::opcode::OpCode::try_from_byte(code[offset])
            .ok_or(VmError::InvalidOpcode { opcode: code[offset], offset })?;
        let width = 1 + opcode.operand_len();
        if offset + width > code.len() {
            return Err(VmError::load("instruction operand runs past the end of code"));
        }
        for _ in 0..width {
            expanded.push(line);
        }
        offset += width;
    }
    if offset != code.len() {
        return Err(VmError::load("code bytes left over after decoding every line-table instruction"));
    }
    Ok(expanded)
}

fn load_constant(vm: &mut Vm, cursor: &mut Bytes) -> VmResult<Value> {
    need(cursor, 1, "constant type tag")?;
    let tag = cursor.get_u8();
    match tag {
        TAG_NIL => Ok(Value::Nil),
        TAG_INT => {
            need(cursor, 8, "Int constant")?;
            Ok(Value::Int(cursor.get_i64_le()))
        }
        TAG_BOOL => {
            need(cursor, 1, "Bool constant")?;
            Ok(Value::Bool(cursor.get_u8() != 0))
        }
        TAG_FLOAT => {
            need(cursor, 8, "Float constant")?;
            Ok(Value::Float(cursor.get_f64_le()))
        }
        TAG_OBJECT => {
            need(cursor, 1, "object type tag")?;
            let obj_tag = cursor.get_u8();
            match obj_tag {
                OBJ_STRING => {
                    need(cursor, 8, "String length")?;
                    let len = cursor.get_u64_le() as usize;
                    need(cursor, len, "String bytes")?;
                    let bytes = cursor.split_to(len);
                    let ptr = vm.intern_string(&bytes);
                    Ok(Value::Object(ptr))
                }
                other => Err(VmError::load(format!("unrecognised object constant tag {other:#04x}"))),
            }
        }
        other => Err(VmError::load(format!("unrecognised constant type tag {other:#04x}"))),
    }
}
