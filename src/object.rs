//! Heap-object model (spec §3, §4.2).
//!
//! Objects are allocated with `Box::into_raw` and linked into the VM's
//! intrusive allocation list via `Obj::next`. The VM is the sole owner of
//! every `Obj`; every other pointer to one (stack slots, globals, the
//! interning table, a function's captured name) is a non-owning `NonNull`.
//! Objects are only ever freed by the sweep phase in `crate::gc`.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use crate::value::Value;

/// A function's executable body: either a reference into the VM's chunk
/// sequence, or a native callable (spec §4.7/§4.8).
#[derive(Clone, Copy)]
pub enum FunctionBody {
    /// Index into `Vm::chunks`.
    Chunk(usize),
    /// A builtin implemented in Rust.
    Native(crate::natives::NativeFn),
}

/// `ObjectFunction` (spec §3): an arity, a body, and a name.
pub struct ObjFunction {
    pub arity: u8,
    pub body: FunctionBody,
    pub name: NonNull<Obj>,
}

impl ObjFunction {
    /// `true` for the `NativeFunction` sub-variant described in spec §3/§4.7.
    pub fn is_native(&self) -> bool {
        matches!(self.body, FunctionBody::Native(_))
    }
}

/// `ObjectString` (spec §4.2): immutable bytes plus a precomputed hash and
/// the OP_CALL resolution cache.
pub struct ObjString {
    pub bytes: Box<[u8]>,
    pub hash: u32,
    /// Caches the resolved function the first time this string is used as
    /// an OP_CALL callee name; cleared only when the function it points to
    /// is swept.
    pub cached_function: Cell<Option<NonNull<Obj>>>,
}

impl ObjString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_str_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// `ObjectList` (spec §3): a growable, in-place-mutable sequence of Values.
/// `RefCell` gives every `Value::Object` handle to the same list shared
/// mutable access, since the list is a single heap allocation referenced
/// by (possibly several) stack/local/global slots.
pub struct ObjList {
    pub items: RefCell<Vec<Value>>,
}

/// The payload carried by a heap object, tagged by `ObjKind`.
pub enum ObjKind {
    String(ObjString),
    Function(ObjFunction),
    List(ObjList),
}

impl ObjKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ObjKind::String(_) => "String",
            ObjKind::Function(_) => "Function",
            ObjKind::List(_) => "List",
        }
    }
}

/// A heap-allocated object: GC header plus payload.
///
/// `next` forms the VM's intrusive allocation list (spec invariant 4);
/// `marked` is the GC's per-object mark bit (spec §4.6), reset after every
/// sweep.
pub struct Obj {
    pub marked: Cell<bool>,
    pub next: Option<NonNull<Obj>>,
    pub kind: ObjKind,
    /// Approximate byte size charged to the GC's allocation counter (spec
    /// §4.2 step 4) and refunded when this object is swept.
    pub size: usize,
}

impl Obj {
    /// Allocates a new object on the heap and returns an owning raw pointer.
    /// The caller (the VM allocator in `crate::vm`) is responsible for
    /// linking it into the allocation list.
    pub fn alloc(kind: ObjKind, size: usize) -> NonNull<Obj> {
        let boxed = Box::new(Obj { marked: Cell::new(false), next: None, kind, size });
        // SAFETY: Box::into_raw never returns null.
        unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
    }

    pub fn as_string(&self) -> Option<&ObjString> {
        match &self.kind {
            ObjKind::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&ObjFunction> {
        match &self.kind {
            ObjKind::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ObjList> {
        match &self.kind {
            ObjKind::List(l) => Some(l),
            _ => None,
        }
    }
}
