// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HSX ABI definitions, shared between the executive and the toolchain.
//!
//! This crate is the single authoritative table for the numbers that cross
//! the guest/host boundary: SVC module and function ids, mailbox status
//! codes and namespaces, PSW flag bits, the message-info structure layout,
//! and the HXE header constants. The toolchain embeds these values into
//! emitted assembly; the executive decodes them at trap time. Keeping them
//! in one crate means a renumbering is a compile error on both sides
//! rather than a silent protocol skew.

use serde::{Deserialize, Serialize};

/// Executive version reported by `EXEC.GET_VERSION`, `major << 16 | minor`.
pub const EXEC_VERSION: u32 = 0x0001_0000;

/// Names a task for the lifetime of the executive.
///
/// Pids are assigned monotonically starting from 1 and are never reused,
/// so a stale pid held by a debugger or a peer task can only ever name a
/// dead task, not a recycled one.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Pid(pub u32);

impl Pid {
    /// Pid 0 is reserved for the host: messages injected through the RPC
    /// mailbox helpers carry it as their source.
    pub const HOST: Self = Pid(0);

    /// First pid handed to a loaded task.
    pub const FIRST: Self = Pid(1);
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling state of a task, as visible to `ps` and the event stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Eligible for the round-robin rotation.
    Ready,
    /// Currently bound to the VM. Only ever observed mid-step.
    Running,
    /// Blocked on a mailbox operation (send or receive).
    WaitMbx,
    /// Blocked on the timebase (SLEEP_MS or a receive deadline).
    WaitTime,
    /// Stopped by a debug break; not scheduled until resumed.
    Paused,
    /// Terminated voluntarily with the given exit status.
    Exited(i32),
    /// Terminated by a fault.
    Faulted(FaultKind),
}

impl TaskState {
    /// True for states that will never be scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Exited(_) | TaskState::Faulted(_))
    }
}

/// A record describing a fault taken by a task.
///
/// Faults are local to the task: the executive records the fault, emits a
/// diagnostic event, and keeps scheduling everyone else.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The program counter left the code section.
    PcOutOfRange { pc: u32 },
    /// A push (or call) would have crossed the stack guard.
    StackOverflow { addr: u32 },
    /// A pop (or return) with nothing on the stack.
    StackUnderflow,
    /// Fetched a word whose opcode field is unassigned.
    UnknownOpcode { opcode: u8 },
    DivideByZero,
    /// Load or store outside RAM, or a store into a read-only image region.
    BadMemory { addr: u32 },
    /// Word access at a non-word-aligned address.
    UnalignedAccess { addr: u32 },
}

/// PSW flag bits. Bits 4..31 are reserved and read as zero.
pub const PSW_Z: u32 = 1 << 0;
pub const PSW_N: u32 = 1 << 1;
pub const PSW_C: u32 = 1 << 2;
pub const PSW_V: u32 = 1 << 3;

//
// SVC numbering
//

/// Module ids routed by the SVC dispatcher.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SvcModule {
    Mailbox = 0x05,
    Exec = 0x06,
    Stdio = 0x0A,
}

impl core::convert::TryFrom<u8> for SvcModule {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0x05 => Ok(Self::Mailbox),
            0x06 => Ok(Self::Exec),
            0x0A => Ok(Self::Stdio),
            _ => Err(()),
        }
    }
}

/// Function ids within `SvcModule::Mailbox`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum MailboxFn {
    Open = 0,
    Bind = 1,
    Send = 2,
    Recv = 3,
    Peek = 4,
    Tap = 5,
    Close = 6,
}

impl core::convert::TryFrom<u8> for MailboxFn {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Open),
            1 => Ok(Self::Bind),
            2 => Ok(Self::Send),
            3 => Ok(Self::Recv),
            4 => Ok(Self::Peek),
            5 => Ok(Self::Tap),
            6 => Ok(Self::Close),
            _ => Err(()),
        }
    }
}

/// Function ids within `SvcModule::Exec`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExecFn {
    GetVersion = 0,
    Exit = 1,
    Yield = 2,
    SleepMs = 3,
    GetTick = 4,
    Log = 5,
    GetPid = 6,
}

impl core::convert::TryFrom<u8> for ExecFn {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::GetVersion),
            1 => Ok(Self::Exit),
            2 => Ok(Self::Yield),
            3 => Ok(Self::SleepMs),
            4 => Ok(Self::GetTick),
            5 => Ok(Self::Log),
            6 => Ok(Self::GetPid),
            _ => Err(()),
        }
    }
}

/// Function ids within `SvcModule::Stdio`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum StdioFn {
    Read = 0,
    Write = 1,
    Ewrite = 2,
}

impl core::convert::TryFrom<u8> for StdioFn {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Ewrite),
            _ => Err(()),
        }
    }
}

/// Packs `(module, function)` into the 12-bit immediate of an SVC
/// instruction: module in bits 6..11, function in bits 0..5.
pub const fn svc_imm(module: u8, function: u8) -> u16 {
    ((module as u16 & 0x3F) << 6) | (function as u16 & 0x3F)
}

/// Splits an SVC immediate back into `(module, function)`.
pub const fn svc_split(imm: u16) -> (u8, u8) {
    (((imm >> 6) & 0x3F) as u8, (imm & 0x3F) as u8)
}

/// SVC arguments are carried in R1..R4; arguments past the fourth are
/// read from the guest stack at `[sp + SVC_STACK_ARG_BASE]`,
/// `[sp + SVC_STACK_ARG_BASE + 4]`, and so on, in declared order.
pub const SVC_STACK_ARG_BASE: u32 = 12;

//
// Mailbox subsystem
//

/// Status codes for mailbox operations.
///
/// The guest sees `0` in R0 for `Ok` and the *negated* code for anything
/// else; the message-info struct and the host protocol carry the positive
/// value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum MailboxStatus {
    Ok = 0,
    Empty = 1,
    Full = 2,
    Timeout = 3,
    Overrun = 4,
    NoDescriptor = 5,
    Permission = 6,
    Internal = 7,
}

impl MailboxStatus {
    /// Value delivered in guest R0.
    pub fn to_guest(self) -> i32 {
        -(self as i32)
    }
}

/// Mailbox namespaces. `Pid` and `Svc` targets default to the caller's
/// own pid when no owner suffix is given; `App` without an owner and
/// `Shared` are global.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Namespace {
    Pid = 0x00,
    Svc = 0x01,
    App = 0x02,
    Shared = 0x03,
}

impl core::convert::TryFrom<u8> for Namespace {
    type Error = ();

    fn try_from(x: u8) -> Result<Self, Self::Error> {
        match x {
            0x00 => Ok(Self::Pid),
            0x01 => Ok(Self::Svc),
            0x02 => Ok(Self::App),
            0x03 => Ok(Self::Shared),
            _ => Err(()),
        }
    }
}

bitflags::bitflags! {
    /// Descriptor mode bits, passed to OPEN and BIND.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct ModeFlags: u32 {
        const RDONLY = 1 << 0;
        const RDWR = 1 << 1;
        /// Non-destructive observation; never affects consumption.
        const TAP = 1 << 2;
        /// Every subscriber receives its own copy of each message.
        const FANOUT = 1 << 3;
        /// On overflow, discard the oldest retained message.
        const FANOUT_DROP = 1 << 4;
        /// On overflow, suspend the sender until space is available.
        const FANOUT_BLOCK = 1 << 5;
        /// OPEN may create the descriptor if the caller owns the namespace.
        const O_CREATE = 1 << 6;
    }
}

/// RECV timeout encodings. Values between these two are finite deadlines
/// in ticks.
pub const TIMEOUT_POLL: u32 = 0;
pub const TIMEOUT_INFINITE: u32 = 0xFFFF_FFFF;

/// The SEND flags argument carries user flags in its low byte and the
/// message channel in bits 8..15.
pub const MSG_FLAGS_MASK: u32 = 0xFF;
pub const MSG_CHANNEL_SHIFT: u32 = 8;

/// Completion record written to a caller-supplied info-out pointer by
/// RECV and PEEK. Serialized little-endian, field order as declared,
/// [`MsgInfo::SIZE`] bytes total.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct MsgInfo {
    /// Positive `MailboxStatus` code.
    pub status: i32,
    pub length: u32,
    pub flags: u32,
    pub channel: u32,
    pub src_pid: u32,
}

impl MsgInfo {
    pub const SIZE: u32 = 20;

    pub fn to_le_bytes(&self) -> [u8; Self::SIZE as usize] {
        let mut out = [0; Self::SIZE as usize];
        out[0..4].copy_from_slice(&self.status.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.flags.to_le_bytes());
        out[12..16].copy_from_slice(&self.channel.to_le_bytes());
        out[16..20].copy_from_slice(&self.src_pid.to_le_bytes());
        out
    }
}

/// Logical file descriptors wired to the per-task stdio mailboxes.
pub const FD_STDIN: usize = 0;
pub const FD_STDOUT: usize = 1;
pub const FD_STDERR: usize = 2;

/// Names of the per-task stdio service mailboxes, created at load time in
/// the task's own SVC namespace.
pub const STDIO_IN: &str = "stdio.in";
pub const STDIO_OUT: &str = "stdio.out";
pub const STDIO_ERR: &str = "stdio.err";

//
// HXE image format
//

/// ASCII "HSXE", the first four bytes of every image.
pub const HXE_MAGIC: [u8; 4] = *b"HSXE";

/// Current image format version, little-endian at offset 4.
pub const HXE_VERSION: u16 = 0x0001;

/// Total header size; code begins immediately after.
pub const HXE_HEADER_LEN: usize = 64;

/// Offset of the CRC-32 field within the header.
pub const HXE_CRC_OFFSET: usize = 28;

/// Offset and capacity of the null-terminated app name.
pub const HXE_NAME_OFFSET: usize = 32;
pub const HXE_NAME_LEN: usize = 32;
pub const HXE_NAME_MAX: usize = 31;

bitflags::bitflags! {
    /// Image header flags (bytes 6..7).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct HxeFlags: u16 {
        /// Several instances of this app may be loaded at once; the
        /// executive suffixes the instance name to keep it unique.
        const ALLOW_MULTIPLE_INSTANCES = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Capability bits an image may require (header bytes 24..27). The
    /// loader rejects images requiring capabilities this executive does
    /// not provide.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Capabilities: u32 {
        const MAILBOX = 1 << 0;
        const STDIO = 1 << 1;
        const TIMER = 1 << 2;
        const FLOAT = 1 << 3;
    }
}

impl Capabilities {
    /// Everything this executive implements.
    pub const SUPPORTED: Self = Self::all();
}
