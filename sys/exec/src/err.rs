// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for the executive.
//!
//! Three distinct failure planes, kept as separate types on purpose:
//! guest-visible SVC results ([`SvcError`], negative R0), task-fatal
//! faults (`hsx_abi::FaultKind`, which terminate the task), and host API
//! errors ([`ExecError`], surfaced through RPC responses and never to
//! the guest).

use hsx_abi::{FaultKind, Pid};

/// Errors in the SVC calling convention itself, before a module handler
/// gets involved. Delivered to the guest as negative small integers in
/// R0, numbered apart from `MailboxStatus` codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum SvcError {
    BadModule = 32,
    BadFunction = 33,
    BadArg = 34,
    Permission = 35,
}

impl SvcError {
    pub fn to_guest(self) -> i32 {
        -(self as i32)
    }
}

/// Outcome of one SVC handler invocation, applied by the scheduler.
///
/// Handlers that complete immediately have already written R0/R1; the
/// other variants carry the state transition the executive must make.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum SvcDisposition {
    /// Call finished; results are in the task's registers.
    Done,
    /// Call deferred; the task has been moved to a wait state and its
    /// resume bookkeeping recorded.
    Blocked(hsx_minivm::BlockReason),
    /// EXIT was invoked.
    Exit(i32),
    /// The call itself was malformed in a way that is a fault, not an
    /// error return (e.g. an argument pointer outside RAM).
    Fault(FaultKind),
}

/// Errors reported to the host control plane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExecError {
    PidUnknown(Pid),
    /// Another session holds exclusive control of the pid.
    PidLocked(Pid),
    /// Operation needs the task in a specific state (e.g. resuming a
    /// task that is not paused).
    BadState { pid: Pid, state: &'static str },
    Load(hsx_hxe::HxeError),
    /// Name collision without `allow_multiple_instances`.
    AppExists(String),
    /// Image requires capabilities this executive does not provide.
    MissingCapabilities(u32),
    /// Register bank, stack, or image region could not be allocated.
    OutOfMemory,
    BadRequest(String),
    UnknownSubscription(u64),
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExecError::PidUnknown(pid) => write!(f, "no such pid {pid}"),
            ExecError::PidLocked(pid) => {
                write!(f, "pid {pid} is locked by another session")
            }
            ExecError::BadState { pid, state } => {
                write!(f, "pid {pid} is not {state}")
            }
            ExecError::Load(e) => write!(f, "image rejected: {e}"),
            ExecError::AppExists(name) => {
                write!(f, "app instance '{name}' already loaded")
            }
            ExecError::MissingCapabilities(bits) => {
                write!(f, "image requires unsupported capabilities {bits:#x}")
            }
            ExecError::OutOfMemory => write!(f, "out of guest memory"),
            ExecError::BadRequest(msg) => write!(f, "{msg}"),
            ExecError::UnknownSubscription(id) => {
                write!(f, "no such subscription {id}")
            }
        }
    }
}

impl std::error::Error for ExecError {}

impl From<hsx_hxe::HxeError> for ExecError {
    fn from(e: hsx_hxe::HxeError) -> Self {
        ExecError::Load(e)
    }
}
