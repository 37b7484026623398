//! Core runtime for a stack-based bytecode virtual machine: tagged values,
//! an interned heap-object model, a zero-copy bytecode loader, a
//! mark-and-sweep collector, and the instruction dispatch loop.
//!
//! The crate's only public entry points are [`run`] / [`run_with_output`]
//! and the [`Vm`] type itself for embedders that need finer control (e.g.
//! registering additional natives before calling [`Vm::run`]).

mod chunk;
mod dispatch;
mod error;
mod frame;
mod gc;
mod loader;
mod natives;
mod object;
mod opcode;
mod table;
mod value;
mod vm;
mod vm_state;

use std::io::Write;

use bytes::Bytes;

pub use error::{VmError, VmResult};
pub use natives::NativeFn;
pub use value::Value;
pub use vm::Vm;
pub use vm_state::VMState;

/// Initialises a VM from `image`, runs it to completion, and returns the
/// process exit code (spec §6: "0 on EXITVM or RETURN from top frame; 1 on
/// interrupt or fatal runtime error"). Program output goes to stdout.
///
/// `impl Into<Bytes>` is the safe-Rust expression of the embedder contract's
/// `run(bytes, len)`: a `Vec<u8>`, a `&'static [u8]`, or an existing
/// `Bytes` all convert for free, and the loader slices `Chunk` code out of
/// the same buffer without copying it.
pub fn run(image: impl Into<Bytes>) -> i32 {
    run_with_output(image, Box::new(std::io::stdout()))
}

/// Same as [`run`], but directs `print`/`println` output to `out`.
pub fn run_with_output(image: impl Into<Bytes>, out: Box<dyn Write>) -> i32 {
    match Vm::from_bytes_with_output(image, out) {
        Ok(mut vm) => match vm.run() {
            Ok(code) => code,
            Err(_) => 1,
        },
        Err(err) => {
            log::error!("{err}");
            1
        }
    }
}
