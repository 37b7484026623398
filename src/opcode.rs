//! The full opcode set (spec §4.4).
//!
//! Each opcode is a single byte optionally followed by 0, 1, or 2 operand
//! bytes (`operand_len`). Byte values are assigned once here and are the
//! wire format every bytecode image must agree with (there is no separate
//! "compiler" in this repo to keep them in sync with automatically).

/// Number of opcode byte values (dispatch table size, spec §9 "256-entry
/// function-pointer jump table").
pub const OPCODE_COUNT: usize = 256;

macro_rules! opcodes {
    ($($name:ident = $value:expr => $operand_len:expr,)+) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum OpCode {
            $($name = $value,)+
        }

        impl OpCode {
            pub fn operand_len(self) -> usize {
                match self {
                    $(OpCode::$name => $operand_len,)+
                }
            }

            pub fn try_from_byte(byte: u8) -> Option<OpCode> {
                match byte {
                    $($value => Some(OpCode::$name),)+
                    _ => None,
                }
            }
        }
    };
}

opcodes! {
    NIL          = 0x00 => 0,
    CONST_L      = 0x01 => 1,
    CONST_D      = 0x02 => 1,
    CONST_STR    = 0x03 => 1,
    BOOLTRUE     = 0x04 => 0,
    BOOLFALSE    = 0x05 => 0,
    POP          = 0x06 => 0,
    ADD          = 0x07 => 0,
    SUB          = 0x08 => 0,
    MUL          = 0x09 => 0,
    DIV          = 0x0A => 0,
    MOD          = 0x0B => 0,
    NEG          = 0x0C => 0,
    EQ           = 0x0D => 0,
    NE           = 0x0E => 0,
    LT           = 0x0F => 0,
    LE           = 0x10 => 0,
    GT           = 0x11 => 0,
    GE           = 0x12 => 0,
    NOT          = 0x13 => 0,
    TOSTRING     = 0x14 => 0,
    TOINT        = 0x15 => 0,
    TOFLOAT      = 0x16 => 0,
    DEFGLOBAL    = 0x17 => 1,
    GETGLOBAL    = 0x18 => 1,
    SETGLOBAL    = 0x19 => 1,
    DEFLOCAL     = 0x1A => 1,
    GETLOCAL     = 0x1B => 1,
    SETLOCAL     = 0x1C => 1,
    JUMP         = 0x1D => 2,
    LOOP         = 0x1E => 2,
    JUMP_IF_FALSE = 0x1F => 2,
    JUMP_IF_TRUE  = 0x20 => 2,
    CALL         = 0x21 => 0,
    CALL_NATIVE  = 0x22 => 1,
    LFUNC        = 0x23 => 1,
    RETURN       = 0x24 => 0,
    EXITVM       = 0x25 => 0,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_assigned_byte() {
        for byte in 0u8..=0x25 {
            assert!(OpCode::try_from_byte(byte).is_some(), "byte {byte:#04x} should decode");
        }
        assert!(OpCode::try_from_byte(0xFF).is_none());
    }

    #[test]
    fn jump_operands_are_two_bytes() {
        assert_eq!(OpCode::JUMP.operand_len(), 2);
        assert_eq!(OpCode::LOOP.operand_len(), 2);
    }
}
