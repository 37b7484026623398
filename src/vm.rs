//! The VM: owns every piece of runtime state and drives the dispatch loop
//! (spec §3 "VM owns...", §4.4 Dispatch contract).

use std::io::{self, Write};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::chunk::Chunk;
use crate::dispatch;
use crate::error::{VmError, VmResult};
use crate::frame::{Frame, Stack, FRAMES_MAX};
use crate::gc::MIN_THRESHOLD;
use crate::loader;
use crate::natives::{self, NativeFn};
use crate::object::{FunctionBody, Obj, ObjFunction, ObjKind, ObjString};
use crate::table::{fnv1a_hash, Table};
use crate::value::Value;
use crate::vm_state::VMState;

/// The name given to the implicit top-level frame (spec: "Frame ... never
/// outlive their owning call"; the top-level script is modelled as an
/// ordinary call frame over chunk 0 so CALL/RETURN need no special case).
const SCRIPT_NAME: &[u8] = b"<script>";

pub struct Vm {
    pub(crate) chunks: Vec<Chunk>,
    pub(crate) stack: Stack,
    pub(crate) frames: Vec<Frame>,
    pub(crate) objects: Option<NonNull<Obj>>,
    pub(crate) strings: Table,
    pub(crate) globals: Table,
    pub(crate) gray_stack: Vec<NonNull<Obj>>,
    pub(crate) bytes_allocated: usize,
    pub(crate) next_gc: usize,
    pub(crate) gc_enabled: bool,
    state: VMState,
    interrupted: Arc<AtomicBool>,
    out: Box<dyn Write>,
    /// Reference point for `timeNs`/`timeMs` (spec §4.7: a monotonic clock).
    /// `Instant` never jumps backward the way `SystemTime` can under an NTP
    /// or manual clock adjustment, so elapsed-since-start is monotonic.
    start: Instant,
}

impl Vm {
    /// Loads `image` and installs the mandatory builtins, writing program
    /// output to stdout (spec §6 `run` entry point).
    pub fn from_bytes(image: impl Into<Bytes>) -> VmResult<Self> {
        Self::from_bytes_with_output(image, Box::new(io::stdout()))
    }

    /// Same as [`Vm::from_bytes`] but directs `print`/`println` output to
    /// `out` instead of stdout -- used by embedders that want to capture or
    /// redirect program output, and by this crate's own integration tests.
    pub fn from_bytes_with_output(image: impl Into<Bytes>, out: Box<dyn Write>) -> VmResult<Self> {
        let mut vm = Vm {
            chunks: Vec::new(),
            stack: Stack::new(),
            frames: Vec::new(),
            objects: None,
            strings: Table::new(),
            globals: Table::new(),
            gray_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: MIN_THRESHOLD,
            gc_enabled: false,
            state: VMState::NONE,
            interrupted: Arc::new(AtomicBool::new(false)),
            out,
            start: Instant::now(),
        };
        loader::load(&mut vm, image.into())?;
        natives::install_builtins(&mut vm);
        vm.push_initial_frame()?;
        Ok(vm)
    }

    fn push_initial_frame(&mut self) -> VmResult<()> {
        if self.chunks.is_empty() {
            return Err(VmError::load("bytecode image declares no chunks"));
        }
        let name_ptr = self.intern_string(SCRIPT_NAME);
        let locals_count = self.chunks[0].local_count();
        let size = std::mem::size_of::<ObjFunction>();
        let func_ptr = self.alloc_object(
            ObjKind::Function(ObjFunction { arity: 0, body: FunctionBody::Chunk(0), name: name_ptr }),
            size,
        );
        self.stack.extend_to(locals_count as usize)?;
        self.frames.push(Frame { function: func_ptr, ip: 0, locals_base: 0, locals_count });
        Ok(())
    }

    /// A clonable handle the embedder's signal handler flips to request
    /// early termination (spec §5 "asynchronous interrupt flag set by the
    /// host"). The dispatch loop polls this between instructions.
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn state(&self) -> VMState {
        self.state
    }

    fn set_state(&mut self, state: VMState) {
        self.state = state;
    }

    /// Runs the dispatch loop to completion (spec §4.4, §6). GC is enabled
    /// on entry, matching "disabled until vm_init completes".
    pub fn run(&mut self) -> VmResult<i32> {
        self.gc_enabled = true;
        let table = dispatch::build_jump_table();
        loop {
            if self.interrupted.load(Ordering::Relaxed) {
                log::error!("interpreter interrupted");
                self.set_state(VMState::INTERRUPTED);
                return Ok(1);
            }

            let offset = self.current_frame().ip;
            let opcode_byte = self.fetch_byte()?;
            let opcode = crate::opcode::OpCode::try_from_byte(opcode_byte)
                .ok_or(VmError::InvalidOpcode { opcode: opcode_byte, offset })?;

            #[cfg(feature = "trace")]
            log::trace!("ip={offset:04} op={opcode:?}");

            let handler = table[opcode_byte as usize].expect("opcode byte validated above");
            match handler(self) {
                Ok(dispatch::Signal::Continue) => {}
                Ok(dispatch::Signal::Halt(code)) => {
                    self.set_state(VMState::HALT);
                    self.flush_out();
                    return Ok(code);
                }
                Err(err) => {
                    log::error!("{err} (ip={offset})");
                    self.set_state(VMState::FAULT);
                    self.flush_out();
                    return Err(err);
                }
            }
        }
    }

    // -- frame / chunk access, shared by the dispatch handlers --

    pub(crate) fn current_frame(&self) -> &Frame {
        self.frames.last().expect("interpreter always has an active frame while running")
    }

    pub(crate) fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("interpreter always has an active frame while running")
    }

    pub(crate) fn current_chunk_index(&self) -> usize {
        // SAFETY: a frame's `function` always references a live ObjFunction
        // (frames are GC roots, spec §4.6).
        let func = unsafe { self.current_frame().function.as_ref() }
            .as_function()
            .expect("frame function pointer always references an ObjFunction");
        match func.body {
            FunctionBody::Chunk(idx) => idx,
            FunctionBody::Native(_) => unreachable!("a call frame never targets a native function"),
        }
    }

    pub(crate) fn current_chunk(&self) -> &Chunk {
        &self.chunks[self.current_chunk_index()]
    }

    /// Reads the byte at the current instruction pointer and advances it by
    /// one; used for both the opcode byte itself and 1-byte operands.
    pub(crate) fn fetch_byte(&mut self) -> VmResult<u8> {
        let ip = self.current_frame().ip;
        let chunk = self.current_chunk();
        if ip >= chunk.len() {
            return Err(VmError::load("instruction pointer ran past the end of the chunk"));
        }
        let byte = chunk.byte_at(ip);
        self.current_frame_mut().ip = ip + 1;
        Ok(byte)
    }

    /// Reads a little-endian `u16` at `at` *without* advancing the
    /// instruction pointer -- JUMP/LOOP/JUMP_IF_* compute their new `ip`
    /// directly from this value (spec §4.4's asymmetric `+2`/`+1` offsets).
    pub(crate) fn peek_u16(&self, at: usize) -> VmResult<u16> {
        let chunk = self.current_chunk();
        if at + 1 >= chunk.len() {
            return Err(VmError::load("jump offset read past the end of the chunk"));
        }
        Ok(u16::from_le_bytes([chunk.byte_at(at), chunk.byte_at(at + 1)]))
    }

    pub(crate) fn local_slot(&self, slot: u8) -> usize {
        self.current_frame().locals_base + slot as usize
    }

    // -- stack/frame helpers used by the dispatch handlers --

    pub(crate) fn stack_top(&self) -> usize {
        self.stack.top()
    }

    pub(crate) fn stack_get(&self, index: usize) -> Value {
        self.stack.get(index)
    }

    pub(crate) fn stack_set(&mut self, index: usize, value: Value) {
        self.stack.set(index, value)
    }

    pub(crate) fn stack_peek(&self, depth_from_top: usize) -> VmResult<Value> {
        self.stack.peek(depth_from_top)
    }

    pub(crate) fn stack_truncate(&mut self, new_top: usize) {
        self.stack.truncate(new_top)
    }

    pub(crate) fn stack_extend_to(&mut self, new_top: usize) -> VmResult<()> {
        self.stack.extend_to(new_top)
    }

    pub(crate) fn globals_get(&self, key: NonNull<Obj>) -> Option<Value> {
        self.globals.get(key)
    }

    pub(crate) fn globals_set(&mut self, key: NonNull<Obj>, value: Value) {
        self.globals.set(key, value);
    }

    pub(crate) fn globals_contains(&self, key: NonNull<Obj>) -> bool {
        self.globals.contains(key)
    }

    pub(crate) fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Pushes a new call frame, enforcing `FRAMES_MAX` (spec §4.4 "Stack
    /// overflow": depth exceeding the maximum is fatal).
    pub(crate) fn push_frame(&mut self, frame: Frame) -> VmResult<()> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(VmError::FrameOverflow { max: FRAMES_MAX });
        }
        self.frames.push(frame);
        Ok(())
    }

    /// Pops the current frame. The caller is responsible for truncating the
    /// stack back to the popped frame's locals base.
    pub(crate) fn pop_frame(&mut self) -> VmResult<Frame> {
        self.frames.pop().ok_or_else(|| VmError::load("RETURN with no active call frame"))
    }

    /// Resolves a 1-byte constant-pool operand to an interned String
    /// pointer, used by DEFGLOBAL/GETGLOBAL/SETGLOBAL/CALL_NATIVE (spec
    /// §4.4: these all take "1 B const_idx (String name)").
    pub(crate) fn constant_string(&self, idx: u8, op: &'static str) -> VmResult<NonNull<Obj>> {
        let value = self
            .current_chunk()
            .constant(idx)
            .ok_or_else(|| VmError::load(format!("{op}: constant index {idx} out of range")))?;
        match value {
            // SAFETY: every Object constant loaded into a chunk's pool is a
            // String (spec §4.3: "All strings discovered in constant pools
            // are immediately interned"; the loader rejects any other
            // object tag).
            Value::Object(ptr) if unsafe { ptr.as_ref() }.as_string().is_some() => Ok(ptr),
            other => {
                Err(VmError::invalid_type(op, format!("constant {idx} is not a String, got {}", other.type_name())))
            }
        }
    }

    // -- allocation --

    /// Allocates a heap object, charging `size` to the GC byte counter and
    /// possibly collecting *before* the object is linked into the
    /// allocation list (spec §4.6 Safety: a just-allocated object is never
    /// itself at risk because it isn't examined by that collection).
    pub fn alloc_object(&mut self, kind: ObjKind, size: usize) -> NonNull<Obj> {
        self.maybe_collect(size);
        let mut ptr = Obj::alloc(kind, size);
        // SAFETY: `ptr` was just allocated and is not yet reachable from
        // anywhere else.
        unsafe { ptr.as_mut() }.next = self.objects.take();
        self.objects = Some(ptr);
        ptr
    }

    /// "Intern or allocate" (spec §4.2): returns the canonical `ObjString`
    /// for `bytes`, allocating one only if no equal string exists yet.
    pub fn intern_string(&mut self, bytes: &[u8]) -> NonNull<Obj> {
        let hash = fnv1a_hash(bytes);
        if let Some(existing) = self.strings.find_string(bytes, hash) {
            return existing;
        }
        let obj_string =
            ObjString { bytes: bytes.to_vec().into_boxed_slice(), hash, cached_function: std::cell::Cell::new(None) };
        let size = std::mem::size_of::<ObjString>() + bytes.len();
        let ptr = self.alloc_object(ObjKind::String(obj_string), size);
        self.strings.set(ptr, Value::Nil);
        ptr
    }

    /// Registers a native beyond the mandatory set (spec §4.8). Roots the
    /// interned name in `globals` immediately, before allocating the
    /// wrapping `ObjFunction`, so a collection triggered by that allocation
    /// can never sweep a name that hasn't been published yet.
    pub fn register_native(&mut self, name: &str, arity: u8, func: NativeFn) {
        let name_ptr = self.intern_string(name.as_bytes());
        self.globals.set(name_ptr, Value::Nil);
        let func_ptr = natives::make_native_function(self, name_ptr, arity, func);
        self.globals.set(name_ptr, Value::Object(func_ptr));
    }

    // -- native-facing stack API (spec §4.7: "consumes its arguments from
    // the top, then pushes exactly one result") --

    pub fn pop_arg(&mut self) -> VmResult<Value> {
        self.stack.pop()
    }

    pub fn push_result(&mut self, value: Value) -> VmResult<()> {
        self.stack.push(value)
    }

    /// Time elapsed since this VM was created, per a monotonic clock (spec
    /// §4.7 `timeNs`/`timeMs`).
    pub fn monotonic_elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }

    pub fn write_out(&mut self, args: std::fmt::Arguments<'_>) {
        if self.out.write_fmt(args).is_err() {
            log::warn!("write to program output failed");
        }
    }

    pub fn flush_out(&mut self) {
        if self.out.flush().is_err() {
            log::warn!("flush of program output failed");
        }
    }
}

impl Drop for Vm {
    /// Deterministic teardown order (spec §5 Resource lifetimes): frames,
    /// then chunks, then the globals/strings tables, then every remaining
    /// heap object, then the gray worklist and operand stack (the last two
    /// fall out of ordinary field drop once this body returns).
    fn drop(&mut self) {
        self.frames.clear();
        self.chunks.clear();
        self.globals = Table::new();
        self.strings = Table::new();
        let mut current = self.objects.take();
        while let Some(ptr) = current {
            // SAFETY: every node on this list was linked exactly once by
            // `alloc_object` and is freed at most once, here.
            let boxed = unsafe { Box::from_raw(ptr.as_ptr()) };
            current = boxed.next;
            drop(boxed);
        }
        self.gray_stack.clear();
    }
}
