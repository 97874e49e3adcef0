// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The HSX executive.
//!
//! One `Executive` value owns every piece of mutable runtime state: guest
//! RAM, the task table, the mailbox descriptor table, the event bus, the
//! timer heap, and the debug surface (breakpoints, watches, pid locks).
//! There are no globals; the RPC layer holds a reference and calls in
//! from a single thread.
//!
//! # Design principles
//!
//! 1. One call to the VM retires exactly one instruction; suspension
//!    exists only at SVC, BRK, fault, and exit.
//! 2. Scheduling is strict round-robin over the READY deque, one
//!    instruction per rotation slot.
//! 3. Context switch is pointer reassignment. Register banks live in
//!    guest RAM; binding a task means handing its `TaskContext` to the
//!    interpreter.
//! 4. A preference for simple and clear algorithms over fast and clever
//!    algorithms.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use hsx_abi::{
    Capabilities, FaultKind, MailboxStatus, ModeFlags, MsgInfo, Namespace,
    Pid, TaskState, FD_STDERR, FD_STDIN, FD_STDOUT, STDIO_ERR, STDIO_IN,
    STDIO_OUT,
};
use hsx_hxe::HxeImage;
use hsx_minivm::{BlockReason, Ram, StepOutcome};
use log::{debug, info, warn};
use seqring::SeqRing;
use serde::Serialize;

mod alloc;
mod err;
mod events;
mod mailbox;
mod svc;
mod task;

pub use err::{ExecError, SvcDisposition, SvcError};
pub use events::{EventBus, EventKind, EventRecord, Filters, SubscriptionStats};
pub use mailbox::{parse_target, DescKey, Message, SubId, HOST_SUB};
pub use task::{Accounting, LoadedImage, PauseKind, Task, WaitKey};

use alloc::RegionAlloc;
use mailbox::{MailboxTable, SendOutcome};
use svc::SvcTable;

/// Tunables, all with serviceable defaults.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    pub ram_size: u32,
    /// Stack bytes per task unless the load request overrides.
    pub default_stack: u32,
    /// Capacity of the auto-created pid and stdio mailboxes.
    pub stdio_capacity: u32,
    pub retained_events: usize,
    pub sub_queue_depth: usize,
    pub ack_window: usize,
    pub trace_depth: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            ram_size: 1024 * 1024,
            default_stack: 4096,
            stdio_capacity: 4096,
            retained_events: 1024,
            sub_queue_depth: 256,
            ack_window: 256,
            trace_depth: 256,
        }
    }
}

/// Per-load options beyond the image itself.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    pub stack_size: Option<u32>,
}

/// One entry in the scheduler trace ring.
#[derive(Clone, Debug, Serialize)]
pub struct SchedTrace {
    pub tick: u64,
    pub pid: Pid,
    pub what: &'static str,
}

/// Row returned by `ps`.
#[derive(Clone, Debug, Serialize)]
pub struct TaskSnapshot {
    pub pid: Pid,
    pub app: String,
    pub instance: String,
    pub state: TaskState,
    pub pc: u32,
    pub steps: u64,
}

/// Full record returned by `info`.
#[derive(Clone, Debug, Serialize)]
pub struct TaskInfo {
    pub pid: Pid,
    pub app: String,
    pub instance: String,
    pub state: TaskState,
    pub pc: u32,
    pub psw: u32,
    pub sp: u32,
    pub reg_base: u32,
    pub stack_base: u32,
    pub stack_limit: u32,
    pub image_base: u32,
    pub fault: Option<FaultKind>,
    pub steps: u64,
    pub rotates: u64,
    pub blocks: u64,
    pub wakes: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegSnapshot {
    pub pid: Pid,
    pub pc: u32,
    pub psw: u32,
    pub sp16: u16,
    pub regs: [u32; 16],
}

#[derive(Clone, Debug, Serialize)]
pub struct StackFrame {
    pub addr: u32,
    pub value: u32,
    /// Word-aligned value inside the code section: a plausible return
    /// address pushed by CALL.
    pub return_candidate: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct StackInfo {
    pub pid: Pid,
    pub sp: u32,
    pub stack_base: u32,
    pub stack_limit: u32,
    pub used_bytes: u32,
    pub frames: Vec<StackFrame>,
}

#[derive(Clone, Debug, Serialize)]
pub struct MailboxSnapshot {
    pub id: u32,
    pub namespace: Namespace,
    pub name: String,
    pub owner: Option<Pid>,
    pub capacity: u32,
    pub mode: u32,
    pub queue_depth: usize,
    pub bytes_used: u32,
    pub head_seq: u64,
    pub next_seq: u64,
    pub subscribers: usize,
    pub taps: usize,
    pub recv_waiters: usize,
    pub send_waiters: usize,
    pub overruns: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct SchedStats {
    pub tick: u64,
    pub running: bool,
    pub counters: Vec<PidCounters>,
    pub trace: Vec<SchedTrace>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PidCounters {
    pub pid: Pid,
    pub steps: u64,
    pub rotates: u64,
    pub blocks: u64,
    pub wakes: u64,
}

/// Result of a `clock step` batch.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StepReport {
    /// Instructions retired across the batch.
    pub executed: u64,
    /// Rotation slots consumed, including empty ones.
    pub slots: u64,
}

#[derive(Debug, Default)]
struct LockState {
    exclusive: Option<u64>,
    observers: HashSet<u64>,
}

#[derive(Copy, Clone, Debug)]
struct Watch {
    pid: Pid,
    addr: u32,
    last: u32,
}

pub struct Executive {
    cfg: ExecConfig,
    pub(crate) ram: Ram,
    alloc: RegionAlloc,
    pub(crate) tasks: BTreeMap<Pid, Task>,
    ready: VecDeque<Pid>,
    next_pid: u32,
    pub(crate) mailboxes: MailboxTable,
    pub(crate) events: EventBus,
    /// Min-heap of `(deadline, pid)`; entries are validated lazily
    /// against the task's current wait key when they pop.
    timers: BinaryHeap<Reverse<(u64, Pid)>>,
    pub(crate) tick: u64,
    /// Steps remaining in the current round-robin round.
    round_left: usize,
    running: bool,
    pub(crate) svc_table: SvcTable,
    breakpoints: HashMap<Pid, Vec<u32>>,
    watches: Vec<Watch>,
    trace: SeqRing<SchedTrace>,
    locks: HashMap<Pid, LockState>,
    /// Instance names in use (for EEXIST and `_#k` suffixing).
    instances: HashSet<String>,
}

impl Executive {
    pub fn new(cfg: ExecConfig) -> Self {
        assert!(cfg.ram_size >= 4096);
        let ram = Ram::new(cfg.ram_size as usize);
        // The low guard keeps reg_base != 0 structural.
        let alloc = RegionAlloc::new(cfg.ram_size, 64);
        Executive {
            ram,
            alloc,
            tasks: BTreeMap::new(),
            ready: VecDeque::new(),
            next_pid: Pid::FIRST.0,
            mailboxes: MailboxTable::new(),
            events: EventBus::new(
                cfg.retained_events,
                cfg.sub_queue_depth,
                cfg.ack_window,
            ),
            timers: BinaryHeap::new(),
            tick: 0,
            round_left: 0,
            running: false,
            svc_table: SvcTable::new(),
            breakpoints: HashMap::new(),
            watches: Vec::new(),
            trace: SeqRing::new(cfg.trace_depth),
            locks: HashMap::new(),
            instances: HashSet::new(),
            cfg,
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn clock_run(&mut self) {
        self.running = true;
    }

    pub fn clock_pause(&mut self) {
        self.running = false;
    }

    /// True when a `clock run` loop has something to do right now.
    pub fn has_ready_tasks(&self) -> bool {
        !self.ready.is_empty()
    }

    //
    // Loading
    //

    /// Validates and loads an HXE image, returning the new pid and the
    /// unique instance name.
    pub fn load(
        &mut self,
        bytes: &[u8],
        opts: LoadOptions,
    ) -> Result<(Pid, String), ExecError> {
        let image = HxeImage::parse(bytes)?;

        let unsupported = image.capabilities - Capabilities::SUPPORTED;
        if !unsupported.is_empty() {
            return Err(ExecError::MissingCapabilities(unsupported.bits()));
        }

        let instance = self.instance_name(&image)?;

        let stack_size = opts.stack_size.unwrap_or(self.cfg.default_stack);
        if stack_size == 0 || stack_size % 4 != 0 || stack_size > 32768 {
            return Err(ExecError::BadRequest(format!(
                "stack size {stack_size} must be a multiple of 4 in 4..=32768"
            )));
        }

        let code_len = image.code.len() as u32;
        let rodata_len = image.rodata.len() as u32;
        let image_len = code_len + rodata_len + image.bss_len;

        // Three disjoint regions: registers low, image, stack high.
        let reg_region = self
            .alloc
            .alloc(64, 4)
            .ok_or(ExecError::OutOfMemory)?;
        let image_region = match self.alloc.alloc(image_len.max(4), 4) {
            Some(r) => r,
            None => {
                self.alloc.free(reg_region);
                return Err(ExecError::OutOfMemory);
            }
        };
        let stack_region = match self.alloc.alloc(stack_size, 4) {
            Some(r) => r,
            None => {
                self.alloc.free(reg_region);
                self.alloc.free(image_region);
                return Err(ExecError::OutOfMemory);
            }
        };

        // Copy sections in, zero bss, then seal code+rodata.
        self.ram
            .load_bytes(image_region.base, &image.code)
            .expect("image region unmapped");
        self.ram
            .load_bytes(image_region.base + code_len, &image.rodata)
            .expect("image region unmapped");
        self.ram
            .clear(image_region.base + code_len + rodata_len, image.bss_len)
            .expect("image region unmapped");
        self.ram.protect(image_region.base, code_len + rodata_len);

        // Fresh register window and stack. R15 carries the image base at
        // entry, the one address a task cannot compute for itself; the
        // toolchain resolves rodata/bss references off it.
        self.ram
            .clear(reg_region.base, reg_region.len)
            .expect("register bank unmapped");
        self.ram
            .clear(stack_region.base, stack_region.len)
            .expect("stack region unmapped");
        self.ram
            .write_u32(reg_region.base + 4 * 15, image_region.base)
            .expect("register bank unmapped");

        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let allow_multiple = image.allow_multiple_instances();
        let loaded = Arc::new(LoadedImage {
            name: image.name.clone(),
            code: image.code,
            rodata_len,
            bss_len: image.bss_len,
            entry: image.entry,
            allow_multiple,
        });
        let mut task = Task::new(
            pid,
            loaded,
            instance.clone(),
            reg_region,
            stack_region,
            image_region,
        );

        // The task's own pid-namespace mailbox, then stdio, wired to
        // FDs 0..2. Descriptor ids for a fresh executive therefore run
        // pid:4k+1, in:4k+2, out:4k+3, err:4k+4.
        self.mailboxes.bind(
            DescKey {
                ns: Namespace::Pid,
                name: format!("pid:{pid}"),
                owner: Some(pid),
            },
            self.cfg.stdio_capacity,
            ModeFlags::RDWR,
        );
        for (fd, name, mode) in [
            (FD_STDIN, STDIO_IN, ModeFlags::RDWR),
            (FD_STDOUT, STDIO_OUT, ModeFlags::RDWR | ModeFlags::FANOUT_DROP),
            (FD_STDERR, STDIO_ERR, ModeFlags::RDWR | ModeFlags::FANOUT_DROP),
        ] {
            let desc = self.mailboxes.bind(
                DescKey {
                    ns: Namespace::Svc,
                    name: name.to_string(),
                    owner: Some(pid),
                },
                self.cfg.stdio_capacity,
                mode,
            );
            let handle = task.alloc_handle(desc, mode);
            self.mailboxes.subscribe(desc, (pid, handle), false);
            task.set_fd(fd, handle);
        }

        self.instances.insert(instance.clone());
        self.tasks.insert(pid, task);
        self.ready.push_back(pid);
        info!("loaded '{instance}' as pid {pid} (entry {:#x})", image.entry);
        self.emit_task_state(pid);
        Ok((pid, instance))
    }

    fn instance_name(&self, image: &HxeImage) -> Result<String, ExecError> {
        if !self.instances.contains(&image.name) {
            return Ok(image.name.clone());
        }
        if !image.allow_multiple_instances() {
            return Err(ExecError::AppExists(image.name.clone()));
        }
        for k in 2.. {
            let candidate = format!("{}_#{k}", image.name);
            if !self.instances.contains(&candidate) {
                return Ok(candidate);
            }
        }
        unreachable!()
    }

    /// Terminates a live task, or reaps the record of a terminal one.
    pub fn kill(&mut self, pid: Pid) -> Result<(), ExecError> {
        let task = self.tasks.get(&pid).ok_or(ExecError::PidUnknown(pid))?;
        if task.state().is_terminal() {
            let task = self.tasks.remove(&pid).unwrap();
            self.instances.remove(task.instance());
            return Ok(());
        }
        info!("killing pid {pid}");
        self.terminate_exit(pid, -9);
        Ok(())
    }

    //
    // Clock / scheduler
    //

    /// Runs `n` single-instruction rotation slots. With `only`, steps
    /// one specific pid instead of rotating.
    pub fn clock_step(
        &mut self,
        n: u64,
        only: Option<Pid>,
    ) -> Result<StepReport, ExecError> {
        if let Some(pid) = only {
            let task =
                self.tasks.get(&pid).ok_or(ExecError::PidUnknown(pid))?;
            if !matches!(task.state(), TaskState::Ready) {
                return Err(ExecError::BadState { pid, state: "ready" });
            }
        }
        let mut report = StepReport::default();
        for _ in 0..n {
            report.slots += 1;
            if self.step_slot(only) {
                report.executed += 1;
            }
            if let Some(pid) = only {
                // Stop early if the pinned task left READY.
                let live = self
                    .tasks
                    .get(&pid)
                    .map(|t| t.state() == TaskState::Ready)
                    .unwrap_or(false);
                if !live {
                    break;
                }
            }
        }
        Ok(report)
    }

    /// One rotation slot. Returns true if an instruction retired.
    fn step_slot(&mut self, only: Option<Pid>) -> bool {
        self.expire_timers();

        let pid = match only {
            Some(pid) => {
                self.ready.retain(|&p| p != pid);
                self.tick += 1;
                self.round_left = 0;
                pid
            }
            None => {
                if self.round_left == 0 {
                    self.round_left = self.ready.len().max(1);
                }
                self.round_left -= 1;
                let popped = self.ready.pop_front();
                if self.round_left == 0 {
                    self.tick += 1;
                }
                match popped {
                    Some(pid) => pid,
                    None => return false, // empty slot; tick still moved
                }
            }
        };

        // Address breakpoints fire before the instruction runs.
        let task = self.tasks.get_mut(&pid).expect("ready pid without task");
        let pc = task.ctx().pc;
        if self
            .breakpoints
            .get(&pid)
            .map(|bps| bps.contains(&pc))
            .unwrap_or(false)
            && !task.take_bp_skip()
        {
            task.pause(PauseKind::AddrBp);
            self.trace_push(pid, "break");
            self.emit(
                EventKind::DebugBreak,
                Some(pid),
                serde_json::json!({ "pc": pc, "reason": "breakpoint" }),
            );
            self.emit_task_state(pid);
            return false;
        }

        task.begin_step();
        let image = task.image().clone();
        let outcome =
            hsx_minivm::step(task.ctx_mut(), &mut self.ram, &image.code);

        self.trace_push(pid, "step");
        self.emit(
            EventKind::TraceStep,
            Some(pid),
            serde_json::json!({ "pc": pc }),
        );
        self.emit(
            EventKind::Scheduler,
            Some(pid),
            serde_json::json!({ "tick": self.tick }),
        );

        match outcome {
            StepOutcome::Ok => {
                self.rotate(pid);
            }
            StepOutcome::SvcTrap { module, function } => {
                match svc::dispatch(self, pid, module, function) {
                    // The handler may have faulted the task while
                    // delivering into a bad guest pointer; only rotate
                    // tasks that are still running.
                    SvcDisposition::Done => {
                        let alive = self
                            .tasks
                            .get(&pid)
                            .map(|t| t.state() == TaskState::Running)
                            .unwrap_or(false);
                        if alive {
                            self.rotate(pid);
                        }
                    }
                    SvcDisposition::Blocked(reason) => {
                        self.trace_push(pid, "block");
                        if !matches!(reason, BlockReason::Sleep) {
                            self.emit(
                                EventKind::MailboxWait,
                                Some(pid),
                                serde_json::json!({
                                    "reason": block_reason_name(reason)
                                }),
                            );
                        }
                        self.emit_task_state(pid);
                    }
                    SvcDisposition::Exit(status) => {
                        self.terminate_exit(pid, status)
                    }
                    SvcDisposition::Fault(fault) => {
                        self.terminate_fault(pid, fault)
                    }
                }
            }
            StepOutcome::BrkTrap => {
                let task = self.tasks.get_mut(&pid).unwrap();
                task.pause(PauseKind::BrkInstr);
                self.trace_push(pid, "brk");
                self.emit(
                    EventKind::DebugBreak,
                    Some(pid),
                    serde_json::json!({ "pc": pc, "reason": "brk" }),
                );
                self.emit_task_state(pid);
            }
            StepOutcome::Fault(fault) => self.terminate_fault(pid, fault),
            // The VM itself never produces these; they exist for SVC
            // resolution.
            StepOutcome::Halt { status } => self.terminate_exit(pid, status),
            StepOutcome::Blocked { .. } => {
                unreachable!("VM returned an executive-level outcome")
            }
        }

        self.check_watches();
        true
    }

    fn rotate(&mut self, pid: Pid) {
        let task = self.tasks.get_mut(&pid).expect("rotating dead task");
        task.rotate();
        self.ready.push_back(pid);
    }

    /// Wakes expired sleepers and times out expired mailbox waits.
    fn expire_timers(&mut self) {
        enum Expiry {
            Sleep,
            RecvTimeout { desc: u32, info_out: u32 },
            Stale,
        }
        while let Some(&Reverse((deadline, pid))) = self.timers.peek() {
            if deadline > self.tick {
                break;
            }
            self.timers.pop();
            let Some(task) = self.tasks.get_mut(&pid) else {
                continue; // task died while sleeping
            };
            let expiry = match task.wait() {
                Some(WaitKey::Sleep { deadline: d }) if *d == deadline => {
                    Expiry::Sleep
                }
                Some(WaitKey::MbxRecv {
                    desc,
                    info_out,
                    deadline: Some(d),
                    ..
                }) if *d == deadline => Expiry::RecvTimeout {
                    desc: *desc,
                    info_out: *info_out,
                },
                // Stale entry: the task was woken by other means.
                _ => Expiry::Stale,
            };
            match expiry {
                Expiry::Sleep => {
                    task.wake();
                    self.write_result(pid, 0, 0);
                    self.ready.push_back(pid);
                    self.trace_push(pid, "wake");
                    self.emit_task_state(pid);
                }
                Expiry::RecvTimeout { desc, info_out } => {
                    task.wake();
                    if let Some(d) = self.mailboxes.get_mut(desc) {
                        d.recv_waiters.retain(|&p| p != pid);
                    }
                    let info = MsgInfo {
                        status: MailboxStatus::Timeout as i32,
                        ..Default::default()
                    };
                    self.finish_recv(
                        pid,
                        MailboxStatus::Timeout,
                        0,
                        info_out,
                        info,
                    );
                    self.ready.push_back(pid);
                    self.trace_push(pid, "timeout");
                    self.emit(
                        EventKind::MailboxTimeout,
                        Some(pid),
                        serde_json::json!({ "descriptor": desc }),
                    );
                    self.emit_task_state(pid);
                }
                Expiry::Stale => {}
            }
        }
    }

    /// Arms a timer; called by SVC handlers when a deadline exists.
    pub(crate) fn arm_timer(&mut self, pid: Pid, deadline: u64) {
        self.timers.push(Reverse((deadline, pid)));
    }

    //
    // Wake completion paths
    //

    /// Delivers a completed RECV into a woken task: status registers and
    /// the optional info-out struct.
    pub(crate) fn finish_recv(
        &mut self,
        pid: Pid,
        status: MailboxStatus,
        length: u32,
        info_out: u32,
        info: MsgInfo,
    ) {
        if info_out != 0 {
            if self.ram.write_bytes(info_out, &info.to_le_bytes()).is_err() {
                self.terminate_fault(
                    pid,
                    FaultKind::BadMemory { addr: info_out },
                );
                return;
            }
        }
        self.write_result(pid, status.to_guest(), length);
    }

    /// Completes the RECVs of tasks woken by a delivery, in FIFO order.
    pub(crate) fn complete_recv_wakes(&mut self, desc: u32, wakes: Vec<Pid>) {
        for pid in wakes {
            let Some(task) = self.tasks.get_mut(&pid) else { continue };
            let Some(WaitKey::MbxRecv {
                desc: wdesc,
                handle,
                buf,
                buf_max,
                info_out,
                ..
            }) = task.wait().cloned()
            else {
                continue;
            };
            if wdesc != desc {
                continue;
            }
            let Some(msg) = self.mailboxes.recv(desc, (pid, handle)) else {
                // Someone else consumed it first; keep waiting.
                if let Some(d) = self.mailboxes.get_mut(desc) {
                    if !d.recv_waiters.contains(&pid) {
                        d.recv_waiters.push_back(pid);
                    }
                }
                continue;
            };
            let task = self.tasks.get_mut(&pid).unwrap();
            task.wake();
            self.deliver_message(pid, &msg, buf, buf_max, info_out);
            self.ready.push_back(pid);
            self.trace_push(pid, "wake");
            self.emit(
                EventKind::MailboxWake,
                Some(pid),
                serde_json::json!({ "descriptor": desc, "seq": msg.seq }),
            );
            self.emit_task_state(pid);
        }
        // Consumption may have freed space for blocked senders.
        self.complete_send_wakes(desc);
    }

    /// Copies a received message into the guest and writes completion.
    pub(crate) fn deliver_message(
        &mut self,
        pid: Pid,
        msg: &Message,
        buf: u32,
        buf_max: u32,
        info_out: u32,
    ) {
        let copied = msg.payload.len().min(buf_max as usize);
        if copied > 0 {
            if self
                .ram
                .write_bytes(buf, &msg.payload[..copied])
                .is_err()
            {
                self.terminate_fault(pid, FaultKind::BadMemory { addr: buf });
                return;
            }
        }
        let info = MsgInfo {
            status: MailboxStatus::Ok as i32,
            length: copied as u32,
            flags: msg.flags,
            channel: msg.channel,
            src_pid: msg.src_pid.0,
        };
        self.finish_recv(pid, MailboxStatus::Ok, copied as u32, info_out, info);
    }

    /// Retries the sends of tasks blocked on a full descriptor.
    pub(crate) fn complete_send_wakes(&mut self, desc: u32) {
        let senders = self.mailboxes.pending_send_wakes(desc);
        for pid in senders {
            let Some(task) = self.tasks.get_mut(&pid) else { continue };
            let Some(WaitKey::MbxSend {
                desc: wdesc,
                channel,
                flags,
                payload,
                ..
            }) = task.wait().cloned()
            else {
                continue;
            };
            if wdesc != desc {
                continue;
            }
            match self.mailboxes.send(desc, pid, channel, flags, payload) {
                SendOutcome::Sent(delivery) => {
                    let task = self.tasks.get_mut(&pid).unwrap();
                    task.wake();
                    self.write_result(pid, 0, delivery.seq as u32);
                    self.ready.push_back(pid);
                    self.trace_push(pid, "wake");
                    self.emit(
                        EventKind::MailboxWake,
                        Some(pid),
                        serde_json::json!({ "descriptor": desc, "seq": delivery.seq }),
                    );
                    self.emit_task_state(pid);
                    let wakes = delivery.wake_recv;
                    self.complete_recv_wakes(desc, wakes);
                }
                SendOutcome::BlockSender { .. } => {
                    // Still full; stay blocked.
                    if let Some(d) = self.mailboxes.get_mut(desc) {
                        d.send_waiters.push_back(pid);
                    }
                }
                SendOutcome::Full => {
                    let task = self.tasks.get_mut(&pid).unwrap();
                    task.wake();
                    self.write_result(
                        pid,
                        MailboxStatus::Full.to_guest(),
                        0,
                    );
                    self.ready.push_back(pid);
                    self.emit_task_state(pid);
                }
            }
        }
    }

    //
    // Termination
    //

    fn terminate_exit(&mut self, pid: Pid, status: i32) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.exit(status);
        }
        self.trace_push(pid, "exit");
        self.release_resources(pid);
        self.emit_task_state(pid);
        debug!("pid {pid} exited with status {status}");
    }

    pub(crate) fn terminate_fault(&mut self, pid: Pid, fault: FaultKind) {
        if let Some(task) = self.tasks.get_mut(&pid) {
            task.force_fault(fault);
        }
        self.trace_push(pid, "fault");
        self.release_resources(pid);
        self.emit(
            EventKind::TaskState,
            Some(pid),
            serde_json::json!({
                "state": "faulted",
                "fault": fault,
            }),
        );
        warn!("pid {pid} faulted: {fault:?}");
    }

    /// Releases everything a terminal task owned: mailbox references and
    /// owned descriptors, memory regions, queue slots, debug state.
    fn release_resources(&mut self, pid: Pid) {
        self.ready.retain(|&p| p != pid);

        // Tasks blocked on descriptors this pid owned must not hang
        // forever once those descriptors are reclaimed.
        let mut orphaned: Vec<Pid> = Vec::new();
        for desc in self.mailboxes.iter() {
            if desc.key.owner == Some(pid) {
                orphaned.extend(
                    desc.recv_waiters.iter().chain(desc.send_waiters.iter()),
                );
            }
        }
        orphaned.retain(|&p| p != pid);

        let reclaimed = self.mailboxes.reap_pid(pid);
        for desc in reclaimed {
            debug!("reclaimed descriptor {desc} of pid {pid}");
        }

        for waiter in orphaned {
            let Some(task) = self.tasks.get_mut(&waiter) else { continue };
            if !matches!(task.state(), TaskState::WaitMbx) {
                continue;
            }
            let info_out = match task.wait() {
                Some(WaitKey::MbxRecv { info_out, .. }) => *info_out,
                Some(WaitKey::MbxSend { .. }) => 0,
                _ => continue,
            };
            task.wake();
            let info = MsgInfo {
                status: MailboxStatus::NoDescriptor as i32,
                ..Default::default()
            };
            self.finish_recv(
                waiter,
                MailboxStatus::NoDescriptor,
                0,
                info_out,
                info,
            );
            self.ready.push_back(waiter);
            self.emit_task_state(waiter);
        }

        // The pid's unconsumed fan-out copies are gone; senders may fit
        // their messages now.
        let ids: Vec<u32> = self.mailboxes.iter().map(|d| d.id).collect();
        for id in ids {
            self.complete_send_wakes(id);
        }

        if let Some(task) = self.tasks.get_mut(&pid) {
            task.drain_handles();
            let (reg, stack, image) = task.regions();
            let code_ro = {
                let img = task.image();
                img.code.len() as u32 + img.rodata_len
            };
            self.ram.unprotect(image.base, code_ro);
            let _ = self.ram.clear(reg.base, reg.len);
            let _ = self.ram.clear(stack.base, stack.len);
            self.alloc.free(reg);
            self.alloc.free(stack);
            self.alloc.free(image);
        }

        self.breakpoints.remove(&pid);
        self.watches.retain(|w| w.pid != pid);
    }

    //
    // Register access (the window lives in RAM)
    //

    pub(crate) fn read_reg(&self, pid: Pid, r: u8) -> u32 {
        let task = self.tasks.get(&pid).expect("register read on dead task");
        self.ram
            .read_u32(task.ctx().reg_addr(r))
            .expect("register bank unmapped")
    }

    pub(crate) fn write_reg(&mut self, pid: Pid, r: u8, value: u32) {
        let addr = {
            let task =
                self.tasks.get(&pid).expect("register write on dead task");
            task.ctx().reg_addr(r)
        };
        self.ram.write_u32(addr, value).expect("register bank unmapped");
    }

    /// Writes the standard result pair: R0 (status) and R1 (length or
    /// secondary value).
    pub(crate) fn write_result(&mut self, pid: Pid, r0: i32, r1: u32) {
        if self.tasks.contains_key(&pid) {
            self.write_reg(pid, 0, r0 as u32);
            self.write_reg(pid, 1, r1);
        }
    }

    /// Reads an overflow SVC argument from the guest stack.
    pub(crate) fn stack_arg(&self, pid: Pid, index: u32) -> Option<u32> {
        let task = self.tasks.get(&pid)?;
        let addr = task
            .ctx()
            .sp_abs()
            .checked_add(hsx_abi::SVC_STACK_ARG_BASE + 4 * index)?;
        self.ram.read_u32(addr).ok()
    }

    //
    // Debug surface
    //

    pub fn ps(&self) -> Vec<TaskSnapshot> {
        self.tasks
            .values()
            .map(|t| TaskSnapshot {
                pid: t.pid(),
                app: t.image().name.clone(),
                instance: t.instance().to_string(),
                state: t.state(),
                pc: t.ctx().pc,
                steps: t.acct().steps,
            })
            .collect()
    }

    pub fn info(&self, pid: Pid) -> Result<TaskInfo, ExecError> {
        let t = self.tasks.get(&pid).ok_or(ExecError::PidUnknown(pid))?;
        let acct = t.acct();
        Ok(TaskInfo {
            pid,
            app: t.image().name.clone(),
            instance: t.instance().to_string(),
            state: t.state(),
            pc: t.ctx().pc,
            psw: t.ctx().psw.bits(),
            sp: t.ctx().sp_abs(),
            reg_base: t.ctx().reg_base,
            stack_base: t.ctx().stack_base,
            stack_limit: t.ctx().stack_limit,
            image_base: t.image_region().base,
            fault: t.fault(),
            steps: acct.steps,
            rotates: acct.rotates,
            blocks: acct.blocks,
            wakes: acct.wakes,
        })
    }

    pub fn regs(&self, pid: Pid) -> Result<RegSnapshot, ExecError> {
        let t = self.tasks.get(&pid).ok_or(ExecError::PidUnknown(pid))?;
        let mut regs = [0u32; 16];
        for (i, slot) in regs.iter_mut().enumerate() {
            *slot = self.read_reg(pid, i as u8);
        }
        Ok(RegSnapshot {
            pid,
            pc: t.ctx().pc,
            psw: t.ctx().psw.bits(),
            sp16: t.ctx().sp16,
            regs,
        })
    }

    pub fn mem_read(&self, addr: u32, len: u32) -> Result<Vec<u8>, ExecError> {
        if len > 65536 {
            return Err(ExecError::BadRequest("read larger than 64KiB".into()));
        }
        self.ram
            .read_bytes(addr, len)
            .map(|b| b.to_vec())
            .map_err(|_| {
                ExecError::BadRequest(format!(
                    "address range {addr:#x}+{len} outside RAM"
                ))
            })
    }

    /// Debugger memory write; deliberately ignores image write
    /// protection so code can be patched.
    pub fn mem_write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), ExecError> {
        self.ram.load_bytes(addr, bytes).map_err(|_| {
            ExecError::BadRequest(format!(
                "address range {addr:#x}+{} outside RAM",
                bytes.len()
            ))
        })
    }

    pub fn bp_set(&mut self, pid: Pid, addr: u32) -> Result<(), ExecError> {
        if !self.tasks.contains_key(&pid) {
            return Err(ExecError::PidUnknown(pid));
        }
        let bps = self.breakpoints.entry(pid).or_default();
        if !bps.contains(&addr) {
            bps.push(addr);
        }
        Ok(())
    }

    pub fn bp_clear(&mut self, pid: Pid, addr: u32) -> Result<(), ExecError> {
        if !self.tasks.contains_key(&pid) {
            return Err(ExecError::PidUnknown(pid));
        }
        if let Some(bps) = self.breakpoints.get_mut(&pid) {
            bps.retain(|&a| a != addr);
        }
        Ok(())
    }

    pub fn bp_list(&self, pid: Pid) -> Result<Vec<u32>, ExecError> {
        if !self.tasks.contains_key(&pid) {
            return Err(ExecError::PidUnknown(pid));
        }
        Ok(self.breakpoints.get(&pid).cloned().unwrap_or_default())
    }

    /// Resumes a task paused by BRK or a breakpoint.
    pub fn resume(&mut self, pid: Pid) -> Result<(), ExecError> {
        let task = self.tasks.get_mut(&pid).ok_or(ExecError::PidUnknown(pid))?;
        if task.state() != TaskState::Paused {
            return Err(ExecError::BadState { pid, state: "paused" });
        }
        task.resume();
        self.ready.push_back(pid);
        self.emit_task_state(pid);
        Ok(())
    }

    pub fn watch_set(&mut self, pid: Pid, addr: u32) -> Result<(), ExecError> {
        if !self.tasks.contains_key(&pid) {
            return Err(ExecError::PidUnknown(pid));
        }
        if addr % 4 != 0 {
            return Err(ExecError::BadRequest("watch address unaligned".into()));
        }
        let last = self.ram.read_u32(addr).map_err(|_| {
            ExecError::BadRequest(format!("address {addr:#x} outside RAM"))
        })?;
        if !self.watches.iter().any(|w| w.pid == pid && w.addr == addr) {
            self.watches.push(Watch { pid, addr, last });
        }
        Ok(())
    }

    pub fn watch_clear(&mut self, pid: Pid, addr: u32) -> Result<(), ExecError> {
        if !self.tasks.contains_key(&pid) {
            return Err(ExecError::PidUnknown(pid));
        }
        self.watches.retain(|w| !(w.pid == pid && w.addr == addr));
        Ok(())
    }

    pub fn watch_list(&self, pid: Pid) -> Vec<u32> {
        self.watches
            .iter()
            .filter(|w| w.pid == pid)
            .map(|w| w.addr)
            .collect()
    }

    fn check_watches(&mut self) {
        let mut fired = Vec::new();
        for w in self.watches.iter_mut() {
            let now = self.ram.read_u32(w.addr).unwrap_or(w.last);
            if now != w.last {
                fired.push((w.pid, w.addr, w.last, now));
                w.last = now;
            }
        }
        for (pid, addr, old, new) in fired {
            self.emit(
                EventKind::WatchUpdate,
                Some(pid),
                serde_json::json!({ "addr": addr, "old": old, "new": new }),
            );
        }
    }

    /// Best-effort stack walk: reports the live stack words and flags
    /// values that look like CALL return addresses.
    pub fn stack_info(
        &self,
        pid: Pid,
        max_frames: usize,
    ) -> Result<StackInfo, ExecError> {
        let t = self.tasks.get(&pid).ok_or(ExecError::PidUnknown(pid))?;
        let ctx = t.ctx();
        let code_len = t.image().code.len() as u32;
        let sp = ctx.sp_abs();
        let mut frames = Vec::new();
        let mut addr = sp;
        while addr < ctx.stack_base && frames.len() < max_frames {
            let value = self.ram.read_u32(addr).unwrap_or(0);
            frames.push(StackFrame {
                addr,
                value,
                return_candidate: value % 4 == 0 && value < code_len,
            });
            addr += 4;
        }
        Ok(StackInfo {
            pid,
            sp,
            stack_base: ctx.stack_base,
            stack_limit: ctx.stack_limit,
            used_bytes: ctx.stack_base - sp,
            frames,
        })
    }

    /// Disassembles `count` instructions of a task's code starting at
    /// code offset `addr`.
    pub fn disasm(
        &self,
        pid: Pid,
        addr: u32,
        count: usize,
    ) -> Result<Vec<(u32, String)>, ExecError> {
        let t = self.tasks.get(&pid).ok_or(ExecError::PidUnknown(pid))?;
        if addr % 4 != 0 {
            return Err(ExecError::BadRequest("unaligned code offset".into()));
        }
        let code = &t.image().code;
        let start = (addr as usize / 4).min(code.len() / 4);
        let words: Vec<u32> = code[start * 4..]
            .chunks_exact(4)
            .take(count.min(1024) + 1)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut lines = hsx_minivm::disasm::disasm_range(addr, &words);
        lines.truncate(count.min(1024));
        Ok(lines)
    }

    pub fn sched_stats(&self) -> SchedStats {
        SchedStats {
            tick: self.tick,
            running: self.running,
            counters: self
                .tasks
                .values()
                .map(|t| {
                    let a = t.acct();
                    PidCounters {
                        pid: t.pid(),
                        steps: a.steps,
                        rotates: a.rotates,
                        blocks: a.blocks,
                        wakes: a.wakes,
                    }
                })
                .collect(),
            trace: self.trace.iter().map(|(_, t)| t.clone()).collect(),
        }
    }

    //
    // Pid locks
    //

    pub fn attach(
        &mut self,
        session: u64,
        pid: Pid,
        exclusive: bool,
    ) -> Result<(), ExecError> {
        if !self.tasks.contains_key(&pid) {
            return Err(ExecError::PidUnknown(pid));
        }
        let lock = self.locks.entry(pid).or_default();
        if exclusive {
            match lock.exclusive {
                Some(owner) if owner != session => {
                    Err(ExecError::PidLocked(pid))
                }
                _ => {
                    lock.exclusive = Some(session);
                    Ok(())
                }
            }
        } else {
            lock.observers.insert(session);
            Ok(())
        }
    }

    pub fn detach(&mut self, session: u64, pid: Pid) {
        if let Some(lock) = self.locks.get_mut(&pid) {
            if lock.exclusive == Some(session) {
                lock.exclusive = None;
            }
            lock.observers.remove(&session);
        }
    }

    /// Gate for mutating per-pid commands.
    pub fn check_mutate(&self, session: u64, pid: Pid) -> Result<(), ExecError> {
        match self.locks.get(&pid).and_then(|l| l.exclusive) {
            Some(owner) if owner != session => Err(ExecError::PidLocked(pid)),
            _ => Ok(()),
        }
    }

    /// Drops every lock a disconnecting session held.
    pub fn release_session(&mut self, session: u64) {
        for lock in self.locks.values_mut() {
            if lock.exclusive == Some(session) {
                lock.exclusive = None;
            }
            lock.observers.remove(&session);
        }
    }

    //
    // Mailbox host helpers
    //

    pub fn mailbox_snapshot(&self) -> Vec<MailboxSnapshot> {
        self.mailboxes
            .iter()
            .map(|d| MailboxSnapshot {
                id: d.id,
                namespace: d.key.ns,
                name: d.key.name.clone(),
                owner: d.key.owner,
                capacity: d.capacity,
                mode: d.mode.bits(),
                queue_depth: d.queue_depth(),
                bytes_used: d.bytes_used(),
                head_seq: d.head_seq,
                next_seq: d.next_seq,
                subscribers: d.subscriber_count(),
                taps: d.tap_count(),
                recv_waiters: d.recv_waiters.len(),
                send_waiters: d.send_waiters.len(),
                overruns: d.overruns,
            })
            .collect()
    }

    /// Host-side SEND (src pid 0). Returns the assigned seq.
    pub fn host_send(
        &mut self,
        target: &str,
        channel: u32,
        flags: u32,
        payload: Vec<u8>,
    ) -> Result<u64, MailboxStatus> {
        let key = parse_target(target, Pid::HOST)?;
        let id = self
            .mailboxes
            .lookup(&key)
            .ok_or(MailboxStatus::NoDescriptor)?;
        match self.mailboxes.send(id, Pid::HOST, channel, flags, payload) {
            SendOutcome::Sent(delivery) => {
                let seq = delivery.seq;
                let wakes = delivery.wake_recv;
                self.complete_recv_wakes(id, wakes);
                Ok(seq)
            }
            // The host cannot block; a full blocking descriptor is FULL.
            SendOutcome::Full | SendOutcome::BlockSender { .. } => {
                Err(MailboxStatus::Full)
            }
        }
    }

    /// Host-side non-blocking RECV (consumes like a default-mode
    /// subscriber).
    pub fn host_recv(&mut self, target: &str) -> Result<Message, MailboxStatus> {
        let key = parse_target(target, Pid::HOST)?;
        let id = self
            .mailboxes
            .lookup(&key)
            .ok_or(MailboxStatus::NoDescriptor)?;
        let msg = self
            .mailboxes
            .recv(id, HOST_SUB)
            .ok_or(MailboxStatus::Empty)?;
        self.complete_send_wakes(id);
        Ok(msg)
    }

    pub fn host_peek(&self, target: &str) -> Result<Message, MailboxStatus> {
        let key = parse_target(target, Pid::HOST)?;
        let id = self
            .mailboxes
            .lookup(&key)
            .ok_or(MailboxStatus::NoDescriptor)?;
        self.mailboxes.peek(id, HOST_SUB).ok_or(MailboxStatus::Empty)
    }

    //
    // Events
    //

    pub fn subscribe(
        &mut self,
        filters: Filters,
        since_seq: Option<u64>,
    ) -> (u64, bool) {
        self.events.subscribe(filters, since_seq)
    }

    pub fn unsubscribe(&mut self, id: u64) -> Result<(), ExecError> {
        if self.events.unsubscribe(id) {
            Ok(())
        } else {
            Err(ExecError::UnknownSubscription(id))
        }
    }

    pub fn ack_events(&mut self, id: u64, seq: u64) -> Result<(), ExecError> {
        if self.events.ack(id, seq) {
            Ok(())
        } else {
            Err(ExecError::UnknownSubscription(id))
        }
    }

    pub fn drain_events(&mut self, id: u64, max: usize) -> Vec<Arc<EventRecord>> {
        self.events.drain(id, max)
    }

    pub fn events_pending(&self) -> bool {
        self.events.any_pending()
    }

    pub(crate) fn emit(
        &mut self,
        kind: EventKind,
        pid: Option<Pid>,
        data: serde_json::Value,
    ) {
        self.events.emit(self.tick, kind, pid, data);
    }

    fn emit_task_state(&mut self, pid: Pid) {
        let Some(task) = self.tasks.get(&pid) else { return };
        let state = task.state();
        self.emit(
            EventKind::TaskState,
            Some(pid),
            serde_json::to_value(state)
                .map(|s| serde_json::json!({ "state": s }))
                .unwrap_or(serde_json::Value::Null),
        );
    }

    fn trace_push(&mut self, pid: Pid, what: &'static str) {
        self.trace.push(SchedTrace { tick: self.tick, pid, what });
    }

    //
    // Crate-internal accessors for the SVC layer
    //

    pub(crate) fn task(&self, pid: Pid) -> &Task {
        self.tasks.get(&pid).expect("svc on dead task")
    }

    pub(crate) fn task_mut(&mut self, pid: Pid) -> &mut Task {
        self.tasks.get_mut(&pid).expect("svc on dead task")
    }

    pub(crate) fn stdio_capacity(&self) -> u32 {
        self.cfg.stdio_capacity
    }
}

fn block_reason_name(reason: BlockReason) -> &'static str {
    match reason {
        BlockReason::MailboxRecv => "mailbox_recv",
        BlockReason::MailboxSend => "mailbox_send",
        BlockReason::Sleep => "sleep",
    }
}
