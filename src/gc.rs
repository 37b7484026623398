//! Mark-and-sweep collection (spec §4.6).
//!
//! Lives as `impl Vm` methods rather than a standalone collector type: the
//! collector needs simultaneous access to the stack, the frame vector, the
//! globals table, and the allocation list, all of which are `Vm` fields, so
//! splitting it into a separate struct would just mean threading five
//! `&mut` borrows through every call.

use std::ptr::NonNull;

use crate::object::{Obj, ObjKind};
use crate::value::Value;
use crate::vm::Vm;

/// `nextGC = bytesAllocated * HEAP_GROW_FACTOR` (spec §4.6 Post-collection).
pub const HEAP_GROW_FACTOR: usize = 2;

/// Clamp for the initial/post-collection threshold (spec: "clamped below to
/// a minimum, e.g. 1 MiB").
pub const MIN_THRESHOLD: usize = 1 << 20;

impl Vm {
    /// Called after every allocation (spec §4.2 step 4): grows the byte
    /// counter, and if it has crossed `next_gc`, runs a full collection.
    pub(crate) fn maybe_collect(&mut self, allocated: usize) {
        self.bytes_allocated += allocated;
        if self.gc_enabled && self.bytes_allocated > self.next_gc {
            self.collect_garbage();
        }
    }

    /// Runs one full mark/trace/weak-cleanup/sweep cycle unconditionally.
    /// Exposed so embedders (and tests) can force a collection outside the
    /// normal threshold trigger.
    pub fn collect_garbage(&mut self) {
        log::trace!("gc: begin, {} bytes allocated", self.bytes_allocated);
        self.mark_roots();
        self.trace_references();
        self.strings.remove_white();
        let freed = self.sweep();
        self.next_gc = (self.bytes_allocated * HEAP_GROW_FACTOR).max(MIN_THRESHOLD);
        log::trace!("gc: end, freed {freed} objects, next threshold {}", self.next_gc);
    }

    fn mark_roots(&mut self) {
        for value in self.stack.live_slice().to_vec() {
            self.mark_value(value);
        }
        let frame_functions: Vec<_> = self.frames.iter().map(|f| f.function).collect();
        for function in frame_functions {
            self.gray_stack_push(function);
        }
        let globals: Vec<_> = self.globals.iter().collect();
        for (key, value) in globals {
            self.gray_stack_push(key);
            self.mark_value(value);
        }
    }

    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Value::Object(ptr) = value {
            self.gray_stack_push(ptr);
        }
    }

    fn gray_stack_push(&mut self, ptr: NonNull<Obj>) {
        // SAFETY: every pointer reachable from a root is still a live Obj.
        let already_marked = unsafe { ptr.as_ref() }.marked.replace(true);
        if !already_marked {
            self.gray_stack.push(ptr);
        }
    }

    fn trace_references(&mut self) {
        while let Some(ptr) = self.gray_stack.pop() {
            self.blacken(ptr);
        }
    }

    /// Marks every reference an object holds (spec §4.6 Trace phase).
    fn blacken(&mut self, ptr: NonNull<Obj>) {
        // SAFETY: objects on the gray stack are always live.
        let obj = unsafe { ptr.as_ref() };
        match &obj.kind {
            ObjKind::String(_) => {}
            ObjKind::Function(func) => {
                self.gray_stack_push(func.name);
                if let crate::object::FunctionBody::Chunk(idx) = func.body {
                    if let Some(chunk) = self.chunks.get(idx) {
                        for constant in chunk.constants().to_vec() {
                            self.mark_value(constant);
                        }
                    }
                }
            }
            ObjKind::List(list) => {
                for item in list.items.borrow().iter() {
                    self.mark_value(*item);
                }
            }
        }
    }

    /// Walks the intrusive allocation list, freeing unmarked objects and
    /// clearing the mark bit on survivors. Returns the number freed.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut current = self.objects;
        let mut previous: Option<NonNull<Obj>> = None;
        while let Some(ptr) = current {
            // SAFETY: every node on this list was linked by `Vm::link_object`
            // and is freed at most once, here.
            let marked = unsafe { ptr.as_ref() }.marked.replace(false);
            let next = unsafe { ptr.as_ref() }.next;
            if marked {
                previous = Some(ptr);
                current = next;
            } else {
                match previous {
                    Some(mut prev) => unsafe { prev.as_mut() }.next = next,
                    None => self.objects = next,
                }
                let boxed = unsafe { Box::from_raw(ptr.as_ptr()) };
                self.bytes_allocated = self.bytes_allocated.saturating_sub(boxed.size);
                drop(boxed);
                freed += 1;
                current = next;
            }
        }
        freed
    }
}
