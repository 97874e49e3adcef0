// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Task control blocks.
//!
//! A `Task` owns everything the executive knows about one loaded program:
//! the VM context (whose register window and stack live in guest RAM, not
//! here), the scheduling state, the handle table, and accounting. Fields
//! are private so state transitions all funnel through methods that keep
//! the scheduler's invariants intact.

use std::collections::HashMap;
use std::sync::Arc;

use hsx_abi::{FaultKind, ModeFlags, Pid, TaskState};
use hsx_minivm::TaskContext;

use crate::alloc::Region;

/// A loaded, validated image shared by every instance of the app.
///
/// The VM fetches instructions from `code` here (host memory); the copy
/// in guest RAM exists so the guest can LD constants out of its own
/// image, and is write-protected so both copies stay identical.
#[derive(Debug)]
pub struct LoadedImage {
    pub name: String,
    pub code: Vec<u8>,
    pub rodata_len: u32,
    pub bss_len: u32,
    pub entry: u32,
    pub allow_multiple: bool,
}

/// Resume bookkeeping for a blocked task, written by the SVC handler
/// that blocked it and consumed by the wake path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WaitKey {
    /// Blocked in mailbox RECV.
    MbxRecv {
        desc: u32,
        handle: u32,
        buf: u32,
        buf_max: u32,
        /// Guest address of the info-out struct, 0 for none.
        info_out: u32,
        /// Absolute tick deadline; `None` means INFINITE.
        deadline: Option<u64>,
    },
    /// Blocked in mailbox SEND (FANOUT_BLOCK overflow). The message is
    /// pre-saved here so the wake path can deliver it even if the guest
    /// buffer has since been reused.
    MbxSend {
        desc: u32,
        handle: u32,
        channel: u32,
        flags: u32,
        payload: Vec<u8>,
    },
    /// Blocked in SLEEP_MS.
    Sleep { deadline: u64 },
}

/// What a paused task is stopped on, so resume knows whether to step
/// over anything.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PauseKind {
    /// A BRK instruction; pc is still at the BRK and resume skips it.
    BrkInstr,
    /// An address breakpoint; the instruction has not executed yet and
    /// resume must run it without re-trapping.
    AddrBp,
}

/// Per-handle access record in a task's handle table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HandleEntry {
    pub desc: u32,
    pub mode: ModeFlags,
}

/// Scheduler and IPC activity counters, served by `sched` and `info`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Accounting {
    pub steps: u64,
    pub rotates: u64,
    pub blocks: u64,
    pub wakes: u64,
}

#[derive(Debug)]
pub struct Task {
    pid: Pid,
    ctx: TaskContext,
    state: TaskState,
    wait: Option<WaitKey>,
    pause: Option<PauseKind>,
    /// One-shot latch: the next dispatch skips the address-breakpoint
    /// check so a resumed task can get off its breakpoint.
    bp_skip: bool,
    handles: HashMap<u32, HandleEntry>,
    next_handle: u32,
    /// FDs 0..2 -> handles on the stdio descriptors.
    fd_table: [Option<u32>; 3],
    image: Arc<LoadedImage>,
    /// Unique instance name (`app` or `app_#k`).
    instance: String,
    reg_region: Region,
    stack_region: Region,
    image_region: Region,
    acct: Accounting,
    fault: Option<FaultKind>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pid: Pid,
        image: Arc<LoadedImage>,
        instance: String,
        reg_region: Region,
        stack_region: Region,
        image_region: Region,
    ) -> Self {
        let ctx = TaskContext {
            pc: image.entry,
            psw: Default::default(),
            sp16: 0,
            reg_base: reg_region.base,
            stack_base: stack_region.base + stack_region.len,
            stack_limit: stack_region.base,
        };
        Task {
            pid,
            ctx,
            state: TaskState::Ready,
            wait: None,
            pause: None,
            bp_skip: false,
            handles: HashMap::new(),
            next_handle: 1,
            fd_table: [None; 3],
            image,
            instance,
            reg_region,
            stack_region,
            image_region,
            acct: Accounting::default(),
            fault: None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn image(&self) -> &Arc<LoadedImage> {
        &self.image
    }

    pub fn ctx(&self) -> &TaskContext {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut TaskContext {
        &mut self.ctx
    }

    pub fn regions(&self) -> (Region, Region, Region) {
        (self.reg_region, self.stack_region, self.image_region)
    }

    pub fn image_region(&self) -> Region {
        self.image_region
    }

    pub fn acct(&self) -> Accounting {
        self.acct
    }

    pub fn acct_mut(&mut self) -> &mut Accounting {
        &mut self.acct
    }

    pub fn fault(&self) -> Option<FaultKind> {
        self.fault
    }

    pub fn is_runnable(&self) -> bool {
        self.state == TaskState::Ready
    }

    pub fn wait(&self) -> Option<&WaitKey> {
        self.wait.as_ref()
    }

    pub fn pause_kind(&self) -> Option<PauseKind> {
        self.pause
    }

    /// Takes and clears the breakpoint-resume latch.
    pub fn take_bp_skip(&mut self) -> bool {
        std::mem::replace(&mut self.bp_skip, false)
    }

    //
    // State transitions. These are the only paths that change `state`,
    // mirroring the invariant that a transition always maintains the
    // associated bookkeeping (wait keys, pause kinds, counters).
    //

    /// READY -> RUNNING, at the top of a scheduler step.
    pub fn begin_step(&mut self) {
        debug_assert_eq!(self.state, TaskState::Ready);
        self.state = TaskState::Running;
        self.acct.steps += 1;
    }

    /// RUNNING -> READY, the common rotation path.
    pub fn rotate(&mut self) {
        debug_assert_eq!(self.state, TaskState::Running);
        self.state = TaskState::Ready;
        self.acct.rotates += 1;
    }

    /// RUNNING -> WAIT_MBX / WAIT_TIME with resume bookkeeping.
    pub fn block(&mut self, key: WaitKey) {
        debug_assert_eq!(self.state, TaskState::Running);
        self.state = match key {
            WaitKey::Sleep { .. } => TaskState::WaitTime,
            _ => TaskState::WaitMbx,
        };
        self.wait = Some(key);
        self.acct.blocks += 1;
    }

    /// WAIT_* -> READY; returns the wait key for completion write-back.
    pub fn wake(&mut self) -> Option<WaitKey> {
        debug_assert!(matches!(
            self.state,
            TaskState::WaitMbx | TaskState::WaitTime
        ));
        self.state = TaskState::Ready;
        self.acct.wakes += 1;
        self.wait.take()
    }

    /// RUNNING (or READY, for address breakpoints hit pre-dispatch) ->
    /// PAUSED.
    pub fn pause(&mut self, kind: PauseKind) {
        self.state = TaskState::Paused;
        self.pause = Some(kind);
    }

    /// PAUSED -> READY. Steps over a BRK; arms the skip latch for an
    /// address breakpoint.
    pub fn resume(&mut self) {
        debug_assert_eq!(self.state, TaskState::Paused);
        match self.pause.take() {
            Some(PauseKind::BrkInstr) => self.ctx.pc += 4,
            Some(PauseKind::AddrBp) => self.bp_skip = true,
            None => {}
        }
        self.state = TaskState::Ready;
    }

    /// Any state -> EXIT.
    pub fn exit(&mut self, status: i32) {
        self.state = TaskState::Exited(status);
        self.wait = None;
    }

    /// Any state -> FAULT, retaining the diagnostic for `info`.
    pub fn force_fault(&mut self, fault: FaultKind) {
        self.fault = Some(fault);
        self.state = TaskState::Faulted(fault);
        self.wait = None;
    }

    //
    // Handle table
    //

    pub fn alloc_handle(&mut self, desc: u32, mode: ModeFlags) -> u32 {
        let h = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(h, HandleEntry { desc, mode });
        h
    }

    pub fn handle(&self, h: u32) -> Option<HandleEntry> {
        self.handles.get(&h).copied()
    }

    pub fn close_handle(&mut self, h: u32) -> Option<HandleEntry> {
        self.handles.remove(&h)
    }

    /// Drains the handle table at exit; caller unsubscribes each from
    /// its descriptor.
    pub fn drain_handles(&mut self) -> Vec<(u32, HandleEntry)> {
        self.fd_table = [None; 3];
        let mut out: Vec<_> = self.handles.drain().collect();
        out.sort_by_key(|(h, _)| *h);
        out
    }

    pub fn set_fd(&mut self, fd: usize, handle: u32) {
        self.fd_table[fd] = Some(handle);
    }

    pub fn fd(&self, fd: usize) -> Option<u32> {
        self.fd_table.get(fd).copied().flatten()
    }
}
