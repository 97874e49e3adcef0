// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! MiniVM: the HSX bytecode interpreter.
//!
//! The VM executes a fixed-width 32-bit ISA against a flat byte-addressed
//! RAM. It holds no task state of its own: everything a task needs to run
//! lives in a [`TaskContext`] owned by the executive, and a context switch
//! is nothing more than handing a different context to [`step`]. Registers
//! are not copied anywhere on switch either -- R0..R15 live in RAM at
//! `reg_base + 4*i`, so rebinding `reg_base` rebinds the whole window.
//!
//! One call to [`step`] retires exactly one instruction and reports what
//! happened as a [`StepOutcome`]. Suspension, scheduling, and system call
//! semantics are the executive's problem; the VM's contract ends at the
//! trap boundary.

pub mod asm;
pub mod disasm;
mod float;
pub mod isa;
mod psw;
mod ram;
mod step;

pub use psw::Psw;
pub use ram::{MemFault, MemFaultKind, Ram};
pub use step::{step, TaskContext};

use hsx_abi::FaultKind;

/// Result of executing one instruction (or, after SVC resolution in the
/// executive, one logical step).
///
/// The VM itself produces `Ok`, `SvcTrap` (pc already advanced past the
/// trap), `BrkTrap` (pc still at the BRK), and `Fault`. `Blocked` and
/// `Halt` are produced by SVC handlers when a trap defers or terminates.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum StepOutcome {
    Ok,
    SvcTrap { module: u8, function: u8 },
    BrkTrap,
    Blocked { reason: BlockReason },
    Halt { status: i32 },
    Fault(FaultKind),
}

/// Why a task suspended at an SVC.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlockReason {
    MailboxRecv,
    MailboxSend,
    Sleep,
}
