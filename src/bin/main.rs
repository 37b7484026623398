//! Thin CLI host around the `uza_vm` library: reads a bytecode image from
//! disk and runs it. Not part of the library's public API surface (spec
//! §6: "the wrapper is a thin shell around `run`").

use std::fs;
use std::process::ExitCode;

use clap::Parser;

/// Runs a compiled uza bytecode image.
#[derive(Parser, Debug)]
#[command(name = "uza-vm", about = "Runs a compiled uza bytecode image")]
struct Args {
    /// Expected size of the bytecode file, in bytes.
    byte_count: u64,

    /// Path to the bytecode file.
    path: std::path::PathBuf,

    /// Enables per-instruction execution tracing (requires the `trace`
    /// feature to print anything; otherwise the flag is accepted but inert).
    #[arg(long)]
    trace: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if args.trace {
        log::info!("tracing requested; build with `--features trace` to see per-instruction logs");
    }

    let bytes = match fs::read(&args.path) {
        Ok(bytes) => bytes,
        Err(err) => {
            log::error!("failed to read {:?}: {err}", args.path);
            return ExitCode::from(1);
        }
    };

    if bytes.len() as u64 != args.byte_count {
        log::error!("expected {} bytes but {:?} contains {}", args.byte_count, args.path, bytes.len());
        return ExitCode::from(1);
    }

    let code = uza_vm::run(bytes);
    ExitCode::from(code as u8)
}
