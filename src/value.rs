//! The tagged runtime value (spec §3, §4.1).

use std::fmt;
use std::ptr::NonNull;

use crate::error::VmError;
use crate::object::{Obj, ObjKind};

/// A VM value. `Copy` because an `Object` variant is just a non-owning
/// pointer; ownership of the pointee lives on the VM's allocation list.
#[derive(Clone, Copy, Debug)]
pub enum Value {
    Nil,
    Int(i64),
    Float(f64),
    Bool(bool),
    Object(NonNull<Obj>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "Nil",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Bool(_) => "Bool",
            // SAFETY: every live Value::Object points at an Obj owned by the
            // VM's allocation list; reachable values are never swept mid-use.
            Value::Object(ptr) => unsafe { ptr.as_ref() }.kind.type_name(),
        }
    }

    /// Borrows the pointee `Obj`, if this is an `Object` value.
    pub fn as_obj(&self) -> Option<&Obj> {
        match self {
            // SAFETY: see `type_name`.
            Value::Object(ptr) => Some(unsafe { ptr.as_ref() }),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        self.as_obj().map(|o| o.as_string().is_some()).unwrap_or(false)
    }

    /// Pointer identity for object values, structural equality otherwise.
    /// Two interned strings with equal contents are the *same* pointer
    /// (spec invariant 1), so this single rule implements both "value
    /// equality" for scalars and "identity equality" for strings.
    fn object_identity_eq(a: NonNull<Obj>, b: NonNull<Obj>) -> bool {
        a == b
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Value::object_identity_eq(*a, *b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    /// Spec §4.1 Print: `Nil`->"nil", `Int`->decimal, `Float`->fixed 3
    /// decimals, `Bool`->"true"/"false", `String`->raw bytes,
    /// `Function`->"func[<name>]", `List`->"[v1, v2, ...]" recursively.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v:.3}"),
            Value::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            Value::Object(ptr) => {
                // SAFETY: see `Value::as_obj`.
                let obj = unsafe { ptr.as_ref() };
                match &obj.kind {
                    ObjKind::String(s) => write!(f, "{}", s.as_str_lossy()),
                    ObjKind::Function(func) => {
                        let name = unsafe { func.name.as_ref() }
                            .as_string()
                            .map(|s| s.as_str_lossy())
                            .unwrap_or_default();
                        write!(f, "func[{name}]")
                    }
                    ObjKind::List(list) => {
                        write!(f, "[")?;
                        let items = list.items.borrow();
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{item}")?;
                        }
                        write!(f, "]")
                    }
                }
            }
        }
    }
}

/// Result of promoting two numeric operands per spec §4.1: if either is a
/// `Float` the other is widened and the result is `Float`; otherwise both
/// are `Int` and the result is `Int`.
pub enum Promoted {
    Int(i64, i64),
    Float(f64, f64),
}

pub fn promote(op: &'static str, lhs: Value, rhs: Value) -> Result<Promoted, VmError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok(Promoted::Int(a, b)),
        (Value::Float(a), Value::Float(b)) => Ok(Promoted::Float(a, b)),
        (Value::Int(a), Value::Float(b)) => Ok(Promoted::Float(a as f64, b)),
        (Value::Float(a), Value::Int(b)) => Ok(Promoted::Float(a, b as f64)),
        (a, b) => Err(VmError::invalid_type(
            op,
            format!("expected numeric operands, got {} and {}", a.type_name(), b.type_name()),
        )),
    }
}

/// `+ - * /` with promotion (spec §4.1, §9 for the division-by-zero
/// resolution). `op_name` selects the arithmetic operator and is also used
/// for error messages.
pub fn arithmetic(op_name: &'static str, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    let promoted = promote(op_name, lhs, rhs)?;
    Ok(match (op_name, promoted) {
        ("add", Promoted::Int(a, b)) => Value::Int(a.wrapping_add(b)),
        ("add", Promoted::Float(a, b)) => Value::Float(a + b),
        ("sub", Promoted::Int(a, b)) => Value::Int(a.wrapping_sub(b)),
        ("sub", Promoted::Float(a, b)) => Value::Float(a - b),
        ("mul", Promoted::Int(a, b)) => Value::Int(a.wrapping_mul(b)),
        ("mul", Promoted::Float(a, b)) => Value::Float(a * b),
        ("div", Promoted::Int(a, b)) => {
            if b == 0 {
                return Err(VmError::DivisionByZero { operation: "div" });
            }
            Value::Int(a.wrapping_div(b))
        }
        ("div", Promoted::Float(a, b)) => Value::Float(a / b),
        _ => unreachable!("arithmetic called with unknown op {op_name}"),
    })
}

/// Integer-only remainder (spec §4.1: "Modulo: integer-only").
pub fn modulo(lhs: Value, rhs: Value) -> Result<Value, VmError> {
    match (lhs, rhs) {
        (Value::Int(_), Value::Int(0)) => Err(VmError::DivisionByZero { operation: "mod" }),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(b))),
        (a, b) => Err(VmError::invalid_type(
            "mod",
            format!("expected two Ints, got {} and {}", a.type_name(), b.type_name()),
        )),
    }
}

/// Preserves variant: `Int -> Int`, `Float -> Float` (spec §4.1).
/// `abs(Int::MIN)` wraps back to `Int::MIN` rather than panicking or
/// saturating (spec §9 resolution of the Open Question).
pub fn negate(v: Value) -> Result<Value, VmError> {
    match v {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(VmError::invalid_type("neg", format!("cannot negate {}", other.type_name()))),
    }
}

/// `!` on `Bool` only (spec §4.4 NOT opcode).
pub fn not(v: Value) -> Result<Value, VmError> {
    match v {
        Value::Bool(b) => Ok(Value::Bool(!b)),
        other => Err(VmError::invalid_type("not", format!("cannot negate {}", other.type_name()))),
    }
}

/// `< <= > >=` with the same promotion rule as arithmetic (spec §4.1).
pub fn compare_ordered(op_name: &'static str, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    let promoted = promote(op_name, lhs, rhs)?;
    let ordering = match promoted {
        Promoted::Int(a, b) => a.cmp(&b),
        Promoted::Float(a, b) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Less),
    };
    use std::cmp::Ordering::*;
    Ok(Value::Bool(match (op_name, ordering) {
        ("lt", Less) => true,
        ("le", Less | Equal) => true,
        ("gt", Greater) => true,
        ("ge", Greater | Equal) => true,
        _ => false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn display_matches_fixed_formats() {
        assert_eq!(Value::Nil.to_string(), "nil");
        assert_eq!(Value::Int(-7).to_string(), "-7");
        assert_eq!(Value::Float(1.5).to_string(), "1.500");
        assert_eq!(Value::Bool(true).to_string(), "true");
        assert_eq!(Value::Bool(false).to_string(), "false");
    }

    proptest! {
        /// Arithmetic promotion (spec §8 property 3): Int+Int wraps with
        /// two's-complement semantics; Int+Float promotes to Float equal to
        /// float(a)+b.
        #[test]
        fn int_addition_wraps(a: i64, b: i64) {
            let result = arithmetic("add", Value::Int(a), Value::Int(b)).unwrap();
            prop_assert_eq!(result, Value::Int(a.wrapping_add(b)));
        }

        #[test]
        fn mixed_addition_promotes_to_float(a: i64, b in -1.0e12f64..1.0e12f64) {
            let result = arithmetic("add", Value::Int(a), Value::Float(b)).unwrap();
            prop_assert_eq!(result, Value::Float(a as f64 + b));
        }

        #[test]
        fn comparisons_are_consistent_with_cmp(a: i64, b: i64) {
            let lt = compare_ordered("lt", Value::Int(a), Value::Int(b)).unwrap();
            prop_assert_eq!(lt, Value::Bool(a < b));
            let ge = compare_ordered("ge", Value::Int(a), Value::Int(b)).unwrap();
            prop_assert_eq!(ge, Value::Bool(a >= b));
        }

        #[test]
        fn negate_int_wraps_abs_min_to_itself(a: i64) {
            let negated = negate(Value::Int(a)).unwrap();
            prop_assert_eq!(negated, Value::Int(a.wrapping_neg()));
        }
    }
}
