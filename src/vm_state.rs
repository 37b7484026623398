//! VM execution state flags (spec §10 ambient stack: "the VM's run state is
//! a `bitflags!`-derived type").

use bitflags::bitflags;

bitflags! {
    /// Tracks why the interpreter loop last stopped, mirroring the fatal /
    /// normal / interrupted distinction in spec §7.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct VMState: u8 {
        /// Execution has not started, or is currently running.
        const NONE = 0;
        /// Execution completed successfully (EXITVM or top-frame RETURN).
        const HALT = 1 << 0;
        /// Execution terminated because of a fatal runtime or loader error.
        const FAULT = 1 << 1;
        /// Execution is paused (reserved for an embedder-driven debugger;
        /// the core dispatch loop never sets this on its own).
        const BREAK = 1 << 2;
        /// The host's interrupt flag was observed between instructions.
        const INTERRUPTED = 1 << 3;
    }
}

impl VMState {
    pub fn is_halt(self) -> bool {
        self.contains(VMState::HALT)
    }

    pub fn is_fault(self) -> bool {
        self.contains(VMState::FAULT)
    }

    pub fn is_interrupted(self) -> bool {
        self.contains(VMState::INTERRUPTED)
    }
}
