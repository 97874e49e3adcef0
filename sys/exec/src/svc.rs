// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SVC dispatch.
//!
//! Traps route through a fixed table indexed by module id; handlers are
//! uniform function pointers over `(executive, task, function)`. With
//! only a couple of exceptions, calls are implemented by functions with
//! the signature:
//!
//! ```ignore
//! fn call(exec: &mut Executive, pid: Pid) -> SvcDisposition;
//! ```
//!
//! Arguments arrive in R1..R4 (overflow on the guest stack), results go
//! out in R0/R1. A handler either finishes the call in place (`Done`,
//! with R0/R1 already written), blocks the task after pre-saving its
//! resume bookkeeping, exits it, or faults it for a malformed pointer.

use core::convert::TryFrom;

use hsx_abi::{
    ExecFn, FaultKind, MailboxFn, MailboxStatus, ModeFlags, MsgInfo, Pid,
    StdioFn, SvcModule, EXEC_VERSION, FD_STDERR, FD_STDIN, FD_STDOUT,
    MSG_CHANNEL_SHIFT, MSG_FLAGS_MASK, TIMEOUT_INFINITE, TIMEOUT_POLL,
};
use hsx_minivm::BlockReason;

use crate::err::{SvcDisposition, SvcError};
use crate::mailbox::{may_create, parse_target, SendOutcome};
use crate::task::WaitKey;
use crate::{EventKind, Executive};

/// Handlers take the whole executive: blocking a task or waking peers
/// touches the task table, RAM, and the mailbox table at once.
type SvcHandler = fn(&mut Executive, Pid, u8) -> SvcDisposition;

const MODULE_SLOTS: usize = 64;

/// Longest accepted target string / log line, in bytes.
const MAX_NAME_ARG: u32 = 256;
const MAX_LOG_ARG: u32 = 1024;
/// Longest accepted message payload.
const MAX_PAYLOAD: u32 = 65536;

pub(crate) struct SvcTable {
    handlers: [Option<SvcHandler>; MODULE_SLOTS],
}

impl SvcTable {
    pub(crate) fn new() -> Self {
        let mut handlers: [Option<SvcHandler>; MODULE_SLOTS] =
            [None; MODULE_SLOTS];
        handlers[SvcModule::Mailbox as usize] = Some(mailbox_module);
        handlers[SvcModule::Exec as usize] = Some(exec_module);
        handlers[SvcModule::Stdio as usize] = Some(stdio_module);
        SvcTable { handlers }
    }

    fn handler(&self, module: u8) -> Option<SvcHandler> {
        self.handlers.get(module as usize).copied().flatten()
    }
}

impl std::fmt::Debug for SvcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvcTable").finish_non_exhaustive()
    }
}

/// Entry point from the scheduler for a `TRAP_SVC`.
pub(crate) fn dispatch(
    exec: &mut Executive,
    pid: Pid,
    module: u8,
    function: u8,
) -> SvcDisposition {
    // Copy the fn pointer out so the table borrow ends before the call.
    let handler = exec.svc_table.handler(module);
    match handler {
        Some(handler) => handler(exec, pid, function),
        None => svc_error(exec, pid, SvcError::BadModule),
    }
}

//
// Common helpers
//

/// Failure modes shared by argument readers.
enum SvcFail {
    Error(SvcError),
    Fault(FaultKind),
}

fn apply_fail(exec: &mut Executive, pid: Pid, fail: SvcFail) -> SvcDisposition {
    match fail {
        SvcFail::Error(e) => svc_error(exec, pid, e),
        SvcFail::Fault(f) => SvcDisposition::Fault(f),
    }
}

fn svc_error(exec: &mut Executive, pid: Pid, e: SvcError) -> SvcDisposition {
    exec.write_result(pid, e.to_guest(), 0);
    SvcDisposition::Done
}

fn status_done(
    exec: &mut Executive,
    pid: Pid,
    status: MailboxStatus,
) -> SvcDisposition {
    exec.write_result(pid, status.to_guest(), 0);
    SvcDisposition::Done
}

fn args(exec: &Executive, pid: Pid) -> [u32; 4] {
    [
        exec.read_reg(pid, 1),
        exec.read_reg(pid, 2),
        exec.read_reg(pid, 3),
        exec.read_reg(pid, 4),
    ]
}

fn read_guest_bytes(
    exec: &Executive,
    ptr: u32,
    len: u32,
    cap: u32,
) -> Result<Vec<u8>, SvcFail> {
    if len > cap {
        return Err(SvcFail::Error(SvcError::BadArg));
    }
    exec.ram
        .read_bytes(ptr, len)
        .map(|b| b.to_vec())
        .map_err(|_| SvcFail::Fault(FaultKind::BadMemory { addr: ptr }))
}

fn read_guest_str(
    exec: &Executive,
    ptr: u32,
    len: u32,
    cap: u32,
) -> Result<String, SvcFail> {
    let bytes = read_guest_bytes(exec, ptr, len, cap)?;
    String::from_utf8(bytes).map_err(|_| SvcFail::Error(SvcError::BadArg))
}

//
// 0x05 MAILBOX
//

fn mailbox_module(exec: &mut Executive, pid: Pid, function: u8) -> SvcDisposition {
    let Ok(f) = MailboxFn::try_from(function) else {
        return svc_error(exec, pid, SvcError::BadFunction);
    };
    match f {
        MailboxFn::Open => mbx_open(exec, pid),
        MailboxFn::Bind => mbx_bind(exec, pid),
        MailboxFn::Send => mbx_send(exec, pid),
        MailboxFn::Recv => mbx_recv(exec, pid),
        MailboxFn::Peek => mbx_peek(exec, pid),
        MailboxFn::Tap => mbx_tap(exec, pid),
        MailboxFn::Close => mbx_close(exec, pid),
    }
}

/// OPEN(target, target_len, mode) -> R0 handle, R1 descriptor id.
fn mbx_open(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [tptr, tlen, mode_raw, _] = args(exec, pid);
    let target = match read_guest_str(exec, tptr, tlen, MAX_NAME_ARG) {
        Ok(s) => s,
        Err(fail) => return apply_fail(exec, pid, fail),
    };
    let mode = ModeFlags::from_bits_truncate(mode_raw);
    let key = match parse_target(&target, pid) {
        Ok(k) => k,
        Err(status) => return status_done(exec, pid, status),
    };
    let default_capacity = exec.stdio_capacity();
    let id = match exec.mailboxes.lookup(&key) {
        Some(id) => id,
        None => {
            if !mode.contains(ModeFlags::O_CREATE) {
                return status_done(exec, pid, MailboxStatus::NoDescriptor);
            }
            if !may_create(&key, pid) {
                return status_done(exec, pid, MailboxStatus::Permission);
            }
            exec.mailboxes.bind(key, default_capacity, mode - ModeFlags::O_CREATE)
        }
    };
    finish_open(exec, pid, id, mode)
}

/// BIND(target, target_len, capacity, mode) -> R0 handle, R1 id.
fn mbx_bind(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [tptr, tlen, capacity, mode_raw] = args(exec, pid);
    let target = match read_guest_str(exec, tptr, tlen, MAX_NAME_ARG) {
        Ok(s) => s,
        Err(fail) => return apply_fail(exec, pid, fail),
    };
    if capacity == 0 || capacity > 1 << 20 {
        return svc_error(exec, pid, SvcError::BadArg);
    }
    let mode = ModeFlags::from_bits_truncate(mode_raw);
    let key = match parse_target(&target, pid) {
        Ok(k) => k,
        Err(status) => return status_done(exec, pid, status),
    };
    if exec.mailboxes.lookup(&key).is_none() && !may_create(&key, pid) {
        return status_done(exec, pid, MailboxStatus::Permission);
    }
    let id = exec.mailboxes.bind(key, capacity, mode - ModeFlags::O_CREATE);
    finish_open(exec, pid, id, mode)
}

fn finish_open(
    exec: &mut Executive,
    pid: Pid,
    id: u32,
    mode: ModeFlags,
) -> SvcDisposition {
    let handle = exec.task_mut(pid).alloc_handle(id, mode);
    exec.mailboxes
        .subscribe(id, (pid, handle), mode.contains(ModeFlags::TAP));
    exec.write_result(pid, handle as i32, id);
    SvcDisposition::Done
}

/// SEND(handle, buf, len, flags) -> R0 status, R1 seq.
fn mbx_send(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [handle, buf, len, flags_arg] = args(exec, pid);
    let Some(entry) = exec.task(pid).handle(handle) else {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    };
    if entry.mode.contains(ModeFlags::RDONLY)
        && !entry.mode.contains(ModeFlags::RDWR)
    {
        return status_done(exec, pid, MailboxStatus::Permission);
    }
    if exec.mailboxes.get(entry.desc).is_none() {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    }
    let payload = match read_guest_bytes(exec, buf, len, MAX_PAYLOAD) {
        Ok(p) => p,
        Err(fail) => return apply_fail(exec, pid, fail),
    };
    let channel = (flags_arg >> MSG_CHANNEL_SHIFT) & 0xFF;
    let flags = flags_arg & MSG_FLAGS_MASK;
    match exec.mailboxes.send(entry.desc, pid, channel, flags, payload) {
        SendOutcome::Sent(delivery) => {
            exec.write_result(pid, 0, delivery.seq as u32);
            let wakes = delivery.wake_recv;
            exec.complete_recv_wakes(entry.desc, wakes);
            SvcDisposition::Done
        }
        SendOutcome::Full => status_done(exec, pid, MailboxStatus::Full),
        SendOutcome::BlockSender { payload } => {
            if let Some(d) = exec.mailboxes.get_mut(entry.desc) {
                d.send_waiters.push_back(pid);
            }
            exec.task_mut(pid).block(WaitKey::MbxSend {
                desc: entry.desc,
                handle,
                channel,
                flags,
                payload,
            });
            SvcDisposition::Blocked(BlockReason::MailboxSend)
        }
    }
}

/// RECV(handle, buf, max_len, timeout, [sp+12] info_out)
///   -> R0 status, R1 length.
fn mbx_recv(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [handle, buf, max_len, timeout] = args(exec, pid);
    let Some(info_out) = exec.stack_arg(pid, 0) else {
        return svc_error(exec, pid, SvcError::BadArg);
    };
    do_recv(exec, pid, handle, buf, max_len, timeout, info_out)
}

/// Shared by MAILBOX.RECV and STDIO.READ.
fn do_recv(
    exec: &mut Executive,
    pid: Pid,
    handle: u32,
    buf: u32,
    max_len: u32,
    timeout: u32,
    info_out: u32,
) -> SvcDisposition {
    let Some(entry) = exec.task(pid).handle(handle) else {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    };
    // The handle may outlive its descriptor (owner died, transient
    // reclaim); never park a task on a descriptor that is gone.
    if exec.mailboxes.get(entry.desc).is_none() {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    }
    if let Some(msg) = exec.mailboxes.recv(entry.desc, (pid, handle)) {
        exec.deliver_message(pid, &msg, buf, max_len, info_out);
        exec.complete_send_wakes(entry.desc);
        return SvcDisposition::Done;
    }
    if timeout == TIMEOUT_POLL {
        let info = MsgInfo {
            status: MailboxStatus::Empty as i32,
            ..Default::default()
        };
        exec.finish_recv(pid, MailboxStatus::Empty, 0, info_out, info);
        return SvcDisposition::Done;
    }
    let deadline = if timeout == TIMEOUT_INFINITE {
        None
    } else {
        let d = exec.tick() + u64::from(timeout);
        exec.arm_timer(pid, d);
        Some(d)
    };
    if let Some(d) = exec.mailboxes.get_mut(entry.desc) {
        d.recv_waiters.push_back(pid);
    }
    exec.task_mut(pid).block(WaitKey::MbxRecv {
        desc: entry.desc,
        handle,
        buf,
        buf_max: max_len,
        info_out,
        deadline,
    });
    SvcDisposition::Blocked(BlockReason::MailboxRecv)
}

/// PEEK(handle, info_out) -> R0 status, R1 next message length.
fn mbx_peek(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [handle, info_out, _, _] = args(exec, pid);
    let Some(entry) = exec.task(pid).handle(handle) else {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    };
    match exec.mailboxes.peek(entry.desc, (pid, handle)) {
        Some(msg) => {
            let info = MsgInfo {
                status: MailboxStatus::Ok as i32,
                length: msg.payload.len() as u32,
                flags: msg.flags,
                channel: msg.channel,
                src_pid: msg.src_pid.0,
            };
            exec.finish_recv(
                pid,
                MailboxStatus::Ok,
                msg.payload.len() as u32,
                info_out,
                info,
            );
        }
        None => {
            let info = MsgInfo {
                status: MailboxStatus::Empty as i32,
                ..Default::default()
            };
            exec.finish_recv(pid, MailboxStatus::Empty, 0, info_out, info);
        }
    }
    SvcDisposition::Done
}

/// TAP(handle, on) -> R0 status.
fn mbx_tap(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [handle, on, _, _] = args(exec, pid);
    let Some(entry) = exec.task(pid).handle(handle) else {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    };
    if exec.mailboxes.set_tap(entry.desc, (pid, handle), on != 0) {
        status_done(exec, pid, MailboxStatus::Ok)
    } else {
        status_done(exec, pid, MailboxStatus::NoDescriptor)
    }
}

/// CLOSE(handle) -> R0 status.
fn mbx_close(exec: &mut Executive, pid: Pid) -> SvcDisposition {
    let [handle, _, _, _] = args(exec, pid);
    let Some(entry) = exec.task_mut(pid).close_handle(handle) else {
        return status_done(exec, pid, MailboxStatus::NoDescriptor);
    };
    exec.mailboxes.unsubscribe(entry.desc, (pid, handle));
    exec.mailboxes.maybe_reclaim(entry.desc);
    exec.complete_send_wakes(entry.desc);
    status_done(exec, pid, MailboxStatus::Ok)
}

//
// 0x06 EXEC
//

fn exec_module(exec: &mut Executive, pid: Pid, function: u8) -> SvcDisposition {
    let Ok(f) = ExecFn::try_from(function) else {
        return svc_error(exec, pid, SvcError::BadFunction);
    };
    match f {
        ExecFn::GetVersion => {
            exec.write_result(pid, EXEC_VERSION as i32, 0);
            SvcDisposition::Done
        }
        ExecFn::Exit => {
            let status = exec.read_reg(pid, 1) as i32;
            SvcDisposition::Exit(status)
        }
        ExecFn::Yield => {
            exec.write_result(pid, 0, 0);
            SvcDisposition::Done
        }
        ExecFn::SleepMs => {
            let ms = exec.read_reg(pid, 1);
            if ms == 0 {
                exec.write_result(pid, 0, 0);
                return SvcDisposition::Done;
            }
            let deadline = exec.tick() + u64::from(ms);
            exec.arm_timer(pid, deadline);
            exec.task_mut(pid).block(WaitKey::Sleep { deadline });
            SvcDisposition::Blocked(BlockReason::Sleep)
        }
        ExecFn::GetTick => {
            let tick = exec.tick();
            exec.write_result(pid, tick as u32 as i32, (tick >> 32) as u32);
            SvcDisposition::Done
        }
        ExecFn::Log => {
            let [ptr, len, _, _] = args(exec, pid);
            let text = match read_guest_str(exec, ptr, len, MAX_LOG_ARG) {
                Ok(s) => s,
                Err(fail) => return apply_fail(exec, pid, fail),
            };
            exec.emit(
                EventKind::Log,
                Some(pid),
                serde_json::json!({ "message": text }),
            );
            exec.write_result(pid, 0, 0);
            SvcDisposition::Done
        }
        ExecFn::GetPid => {
            exec.write_result(pid, pid.0 as i32, 0);
            SvcDisposition::Done
        }
    }
}

//
// 0x0A STDIO
//

fn stdio_module(exec: &mut Executive, pid: Pid, function: u8) -> SvcDisposition {
    let Ok(f) = StdioFn::try_from(function) else {
        return svc_error(exec, pid, SvcError::BadFunction);
    };
    match f {
        StdioFn::Read => {
            let [buf, max_len, timeout, _] = args(exec, pid);
            let Some(handle) = exec.task(pid).fd(FD_STDIN) else {
                return svc_error(exec, pid, SvcError::BadArg);
            };
            do_recv(exec, pid, handle, buf, max_len, timeout, 0)
        }
        StdioFn::Write => stdio_write(exec, pid, FD_STDOUT, EventKind::Stdout),
        StdioFn::Ewrite => stdio_write(exec, pid, FD_STDERR, EventKind::Stderr),
    }
}

/// WRITE/EWRITE(buf, len) -> R0 status, R1 bytes accepted.
///
/// Stdio output mirrors onto the event bus so attached sessions see it
/// even when nothing is draining the mailbox.
fn stdio_write(
    exec: &mut Executive,
    pid: Pid,
    fd: usize,
    kind: EventKind,
) -> SvcDisposition {
    let [buf, len, _, _] = args(exec, pid);
    let Some(handle) = exec.task(pid).fd(fd) else {
        return svc_error(exec, pid, SvcError::BadArg);
    };
    let Some(entry) = exec.task(pid).handle(handle) else {
        return status_done(exec, pid, MailboxStatus::Internal);
    };
    let payload = match read_guest_bytes(exec, buf, len, MAX_PAYLOAD) {
        Ok(p) => p,
        Err(fail) => return apply_fail(exec, pid, fail),
    };
    let text = String::from_utf8_lossy(&payload).into_owned();
    match exec.mailboxes.send(entry.desc, pid, 0, 0, payload) {
        SendOutcome::Sent(delivery) => {
            exec.emit(kind, Some(pid), serde_json::json!({ "text": text }));
            exec.write_result(pid, 0, len);
            let wakes = delivery.wake_recv;
            exec.complete_recv_wakes(entry.desc, wakes);
            SvcDisposition::Done
        }
        // Stdio descriptors are drop-oldest; Full only for oversized
        // writes.
        SendOutcome::Full | SendOutcome::BlockSender { .. } => {
            status_done(exec, pid, MailboxStatus::Full)
        }
    }
}
