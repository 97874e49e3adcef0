// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end executive scenarios: real HXE images, hand-assembled,
//! loaded and driven through the public API.

use hsx_abi::{
    Capabilities, FaultKind, HxeFlags, MailboxStatus, Pid, TaskState,
};
use hsx_exec::{
    EventKind, ExecConfig, ExecError, Executive, Filters, LoadOptions,
};
use hsx_hxe::{HxeError, HxeImage};
use hsx_minivm::asm;

fn image(name: &str, flags: HxeFlags, words: &[u32], rodata: Vec<u8>, bss: u32) -> Vec<u8> {
    HxeImage::new(
        name,
        flags,
        0,
        asm::words_to_bytes(words),
        rodata,
        bss,
        Capabilities::MAILBOX | Capabilities::STDIO | Capabilities::TIMER,
    )
    .unwrap()
    .encode()
}

fn exec() -> Executive {
    Executive::new(ExecConfig::default())
}

/// Binds `app:procon` (capacity 64, RDWR), blocks in RECV INFINITE, and
/// once woken writes the received bytes to stdout, then spins.
fn consumer_program() -> (Vec<u32>, Vec<u8>, u32) {
    let rodata = b"app:procon\0\0".to_vec();
    let build = |code_len: i32| -> Vec<u32> {
        let mut w = vec![
            asm::addi(1, 15, code_len), // target string in rodata
            asm::ldi(2, 10),
            asm::ldi(3, 64),  // capacity
            asm::ldi(4, 2),   // RDWR
            asm::svc(0x05, 1), // BIND -> r0 handle
            asm::ori(8, 0, 0),
            asm::addi(9, 15, code_len + 12), // bss base
            asm::addi(1, 8, 0),
            asm::addi(2, 9, 0), // recv buffer
            asm::ldi(3, 32),
        ];
        w.extend(asm::ldi32(4, 0xFFFF_FFFF)); // INFINITE
        w.extend([
            asm::addi(5, 9, 32), // info-out in bss
            asm::push(5),        // [sp+12] once the pad words go on
            asm::push(5),
            asm::push(5),
            asm::push(5),
            asm::svc(0x05, 3), // RECV -> blocks
            asm::ori(6, 1, 0), // received length
            asm::addi(1, 9, 0),
            asm::ori(2, 6, 0),
            asm::svc(0x0A, 1), // STDIO.WRITE
        ]);
        let here = w.len() as u32 * 4;
        w.push(asm::jmp(here));
        w
    };
    let len = (build(0).len() * 4) as i32;
    (build(len), rodata, 64)
}

/// Opens `app:procon` (retrying until the consumer has bound it) and
/// sends "hello".
fn producer_program() -> (Vec<u32>, Vec<u8>) {
    let rodata = b"app:procon\0\0hello\0\0\0".to_vec();
    let build = |code_len: i32| -> Vec<u32> {
        vec![
            asm::addi(1, 15, code_len),
            asm::ldi(2, 10),
            asm::ldi(3, 2),    // RDWR, no O_CREATE: must already exist
            asm::svc(0x05, 0), // OPEN
            asm::sari(5, 0, 31),
            asm::jz(5, 7 * 4), // handle >= 0 -> proceed
            asm::jmp(0),       // not bound yet; retry
            asm::ori(8, 0, 0),
            asm::addi(1, 8, 0),
            asm::addi(2, 15, code_len + 12), // "hello"
            asm::ldi(3, 5),
            asm::ldi(4, 0),
            asm::svc(0x05, 2), // SEND
            asm::ldi(1, 0),
            asm::svc(0x06, 1), // EXIT(0)
        ]
    };
    let len = (build(0).len() * 4) as i32;
    (build(len), rodata)
}

#[test]
fn producer_consumer_end_to_end() {
    let mut ex = exec();
    let (cw, cr, cbss) = consumer_program();
    let (pid_c, _) = ex
        .load(&image("consumer", HxeFlags::empty(), &cw, cr, cbss), LoadOptions::default())
        .unwrap();
    assert_eq!(pid_c, Pid(1));
    let (pw, pr) = producer_program();
    let (pid_p, _) = ex
        .load(&image("producer", HxeFlags::empty(), &pw, pr, 0), LoadOptions::default())
        .unwrap();
    assert_eq!(pid_p, Pid(2));

    ex.clock_step(200, None).unwrap();

    // The producer ran to completion; the consumer got "hello" and
    // forwarded it to its stdout mailbox.
    assert_eq!(ex.info(pid_p).unwrap().state, TaskState::Exited(0));
    let out = ex.host_recv("svc:stdio.out@1").unwrap();
    assert_eq!(out.payload, b"hello");
    assert_eq!(out.src_pid, Pid(1));

    // Four auto-created descriptors per task put app:procon at id 9,
    // and the queue drained on consumption.
    let snap = ex.mailbox_snapshot();
    let procon = snap.iter().find(|d| d.name == "procon").unwrap();
    assert_eq!(procon.id, 9);
    assert_eq!(procon.queue_depth, 0);
    assert_eq!(procon.bytes_used, 0);

    // The info-out struct recorded the sender and the exact length.
    let info = ex.info(pid_c).unwrap();
    let info_addr = info.image_base + (cw.len() * 4) as u32 + 12 + 32;
    let bytes = ex.mem_read(info_addr, 20).unwrap();
    let word = |i: usize| {
        u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
    };
    assert_eq!(word(0), MailboxStatus::Ok as u32); // status
    assert_eq!(word(4), 5); // length
    assert_eq!(word(16), pid_p.0); // src_pid
}

#[test]
fn task_memory_invariants_hold_while_runnable() {
    let mut ex = exec();
    let (cw, cr, cbss) = consumer_program();
    ex.load(&image("inv_a", HxeFlags::empty(), &cw, cr, cbss), LoadOptions::default())
        .unwrap();
    ex.load(
        &image("inv_b", HxeFlags::empty(), &[asm::jmp(0)], vec![], 0),
        LoadOptions { stack_size: Some(256) },
    )
    .unwrap();
    for round in 0..40 {
        ex.clock_step(1, None).unwrap();
        for t in ex.ps() {
            if t.state.is_terminal() {
                continue;
            }
            let info = ex.info(t.pid).unwrap();
            assert_ne!(info.reg_base, 0, "round {round}");
            assert!(info.stack_limit > 0, "round {round}");
            assert!(info.stack_base > info.stack_limit, "round {round}");
            assert!(
                info.stack_limit <= info.sp && info.sp <= info.stack_base,
                "round {round}: sp {:#x} outside [{:#x}, {:#x}]",
                info.sp,
                info.stack_limit,
                info.stack_base,
            );
        }
    }
}

#[test]
fn round_robin_fairness_three_ways() {
    let mut ex = exec();
    let spin = [asm::jmp(0)];
    for name in ["spin_a", "spin_b", "spin_c"] {
        ex.load(&image(name, HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
            .unwrap();
    }
    ex.clock_step(9, None).unwrap();

    for pid in 1..=3 {
        assert_eq!(ex.info(Pid(pid)).unwrap().steps, 3, "pid {pid}");
    }
    // The trace alternates strictly 1, 2, 3, 1, 2, 3, ...
    let stats = ex.sched_stats();
    let order: Vec<u32> = stats
        .trace
        .iter()
        .filter(|t| t.what == "step")
        .map(|t| t.pid.0)
        .collect();
    assert_eq!(order, vec![1, 2, 3, 1, 2, 3, 1, 2, 3]);
}

#[test]
fn fairness_holds_for_any_slot_count() {
    // N slots over K ready tasks advance each task by floor(N/K) or
    // ceil(N/K) instructions.
    let mut ex = exec();
    let spin = [asm::jmp(0)];
    for name in ["fair_a", "fair_b", "fair_c"] {
        ex.load(&image(name, HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
            .unwrap();
    }
    ex.clock_step(11, None).unwrap();
    let steps: Vec<u64> =
        (1..=3).map(|p| ex.info(Pid(p)).unwrap().steps).collect();
    assert_eq!(steps.iter().sum::<u64>(), 11);
    for s in steps {
        assert!(s == 3 || s == 4, "unfair share {s}");
    }
}

#[test]
fn stack_overflow_on_fifth_push() {
    let mut ex = exec();
    let words = [
        asm::push(0),
        asm::push(0),
        asm::push(0),
        asm::push(0),
        asm::push(0),
        asm::jmp(20),
    ];
    let (sub, _) = ex.subscribe(
        Filters { pids: None, kinds: Some(vec![EventKind::TaskState]) },
        None,
    );
    let (pid, _) = ex
        .load(
            &image("pusher", HxeFlags::empty(), &words, vec![], 0),
            LoadOptions { stack_size: Some(16) },
        )
        .unwrap();

    ex.clock_step(5, None).unwrap();

    let info = ex.info(pid).unwrap();
    assert_eq!(info.steps, 5);
    match info.state {
        TaskState::Faulted(FaultKind::StackOverflow { addr }) => {
            assert_eq!(addr, info.stack_base - 20);
        }
        other => panic!("expected stack overflow, got {other:?}"),
    }
    // The diagnostic went out on the bus.
    let events = ex.drain_events(sub, 64);
    assert!(events.iter().any(|e| {
        e.kind == EventKind::TaskState
            && e.data.get("fault").is_some()
            && e.pid == Some(pid)
    }));
}

#[test]
fn jmp_is_absolute_and_in_range() {
    let mut ex = exec();
    let mut words = vec![asm::jmp(0xA10)];
    words.resize(0xA14 / 4, asm::jmp(0));
    words[0xA10 / 4] = asm::jmp(0xA10); // spin at the target
    let (pid, _) = ex
        .load(&image("jumper", HxeFlags::empty(), &words, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.clock_step(1, None).unwrap();
    let info = ex.info(pid).unwrap();
    assert_eq!(info.pc, 0x0A10);
    assert_eq!(info.state, TaskState::Ready);
}

#[test]
fn recv_timeout_writes_timeout_status() {
    let mut ex = exec();
    let rodata = b"app:q\0\0\0".to_vec();
    let build = |code_len: i32| -> Vec<u32> {
        let mut w = vec![
            asm::addi(1, 15, code_len),
            asm::ldi(2, 5),
            asm::ldi(3, 64),
            asm::ldi(4, 2),
            asm::svc(0x05, 1), // BIND app:q
            asm::ori(8, 0, 0),
            asm::addi(9, 15, code_len + 8), // bss
            asm::addi(1, 8, 0),
            asm::addi(2, 9, 0),
            asm::ldi(3, 16),
            asm::ldi(4, 10), // timeout: 10 ticks
            asm::addi(5, 9, 32),
            asm::push(5),
            asm::push(5),
            asm::push(5),
            asm::push(5),
            asm::svc(0x05, 3), // RECV on empty queue
        ];
        let here = w.len() as u32 * 4;
        w.push(asm::jmp(here));
        w
    };
    let len = (build(0).len() * 4) as i32;
    let words = build(len);
    let (pid, _) = ex
        .load(&image("waiter", HxeFlags::empty(), &words, rodata, 64), LoadOptions::default())
        .unwrap();

    ex.clock_step(50, None).unwrap();

    // Woken by the deadline, not by a message.
    let info = ex.info(pid).unwrap();
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.blocks, 1);
    assert_eq!(info.wakes, 1);
    let regs = ex.regs(pid).unwrap();
    assert_eq!(regs.regs[0] as i32, MailboxStatus::Timeout.to_guest());
    assert_eq!(regs.regs[1], 0);
    // info_out: status=TIMEOUT, length=0.
    let info_addr = info.image_base + len as u32 + 8 + 32;
    let bytes = ex.mem_read(info_addr, 20).unwrap();
    assert_eq!(bytes[0], MailboxStatus::Timeout as u8);
    assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
}

#[test]
fn crc_corruption_rejects_load_without_allocating_a_pid() {
    let mut ex = exec();
    let words = [asm::jmp(0)];
    let good = image("victim", HxeFlags::empty(), &words, b"data".to_vec(), 0);
    let mut bad = good.clone();
    *bad.last_mut().unwrap() ^= 0x01; // flip a rodata byte

    match ex.load(&bad, LoadOptions::default()) {
        Err(ExecError::Load(HxeError::CrcMismatch { .. })) => {}
        other => panic!("expected crc mismatch, got {other:?}"),
    }
    assert!(ex.ps().is_empty());

    // The next load still gets pid 1: nothing was allocated.
    let (pid, _) = ex.load(&good, LoadOptions::default()).unwrap();
    assert_eq!(pid, Pid(1));
}

#[test]
fn loading_does_not_disturb_running_tasks() {
    let mut ex = exec();
    let spin = [asm::ldi(1, 7), asm::jmp(4)];
    let (pid_a, _) = ex
        .load(&image("steady", HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.clock_step(3, None).unwrap();
    let before_regs = ex.regs(pid_a).unwrap();
    let before_info = ex.info(pid_a).unwrap();

    ex.load(&image("intruder", HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
        .unwrap();

    let after_regs = ex.regs(pid_a).unwrap();
    let after_info = ex.info(pid_a).unwrap();
    assert_eq!(before_regs.regs, after_regs.regs);
    assert_eq!(before_regs.pc, after_regs.pc);
    assert_eq!(before_info.state, after_info.state);
    assert_eq!(before_info.stack_base, after_info.stack_base);
}

#[test]
fn instance_naming_and_eexist() {
    let mut ex = exec();
    let spin = [asm::jmp(0)];
    let single = image("singleton", HxeFlags::empty(), &spin, vec![], 0);
    ex.load(&single, LoadOptions::default()).unwrap();
    match ex.load(&single, LoadOptions::default()) {
        Err(ExecError::AppExists(name)) => assert_eq!(name, "singleton"),
        other => panic!("expected AppExists, got {other:?}"),
    }

    let multi = image(
        "worker",
        HxeFlags::ALLOW_MULTIPLE_INSTANCES,
        &spin,
        vec![],
        0,
    );
    let (_, first) = ex.load(&multi, LoadOptions::default()).unwrap();
    let (_, second) = ex.load(&multi, LoadOptions::default()).unwrap();
    let (_, third) = ex.load(&multi, LoadOptions::default()).unwrap();
    assert_eq!(first, "worker");
    assert_eq!(second, "worker_#2");
    assert_eq!(third, "worker_#3");
}

#[test]
fn host_send_wakes_a_blocked_receiver() {
    let mut ex = exec();
    let rodata = b"pid:1\0\0\0".to_vec();
    let build = |code_len: i32| -> Vec<u32> {
        let mut w = vec![
            asm::addi(1, 15, code_len),
            asm::ldi(2, 5),
            asm::ldi(3, 2),
            asm::svc(0x05, 0), // OPEN pid:1 (auto-created at load)
            asm::ori(8, 0, 0),
            asm::addi(9, 15, code_len + 8),
            asm::addi(1, 8, 0),
            asm::addi(2, 9, 0),
            asm::ldi(3, 16),
        ];
        w.extend(asm::ldi32(4, 0xFFFF_FFFF));
        w.extend([
            asm::ldi(5, 0), // no info-out
            asm::push(5),
            asm::push(5),
            asm::push(5),
            asm::push(5),
            asm::svc(0x05, 3),
        ]);
        let here = w.len() as u32 * 4;
        w.push(asm::jmp(here));
        w
    };
    let len = (build(0).len() * 4) as i32;
    let words = build(len);
    let (pid, _) = ex
        .load(&image("listener", HxeFlags::empty(), &words, rodata, 32), LoadOptions::default())
        .unwrap();

    ex.clock_step(40, None).unwrap();
    assert_eq!(ex.info(pid).unwrap().state, TaskState::WaitMbx);

    // Host delivery completes the guest's RECV synchronously.
    let seq = ex.host_send("pid:1", 3, 1, b"ping".to_vec()).unwrap();
    assert_eq!(seq, 0);
    let info = ex.info(pid).unwrap();
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.wakes, 1);
    let regs = ex.regs(pid).unwrap();
    assert_eq!(regs.regs[0], 0);
    assert_eq!(regs.regs[1], 4);
    let buf = ex.mem_read(info.image_base + len as u32 + 8, 4).unwrap();
    assert_eq!(buf, b"ping");
}

#[test]
fn breakpoints_pause_and_resume_steps_over() {
    let mut ex = exec();
    let words = [asm::ldi(1, 1), asm::ldi(1, 2), asm::jmp(0)];
    let (pid, _) = ex
        .load(&image("bp_target", HxeFlags::empty(), &words, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.bp_set(pid, 4).unwrap();

    ex.clock_step(10, None).unwrap();
    let info = ex.info(pid).unwrap();
    assert_eq!(info.state, TaskState::Paused);
    assert_eq!(info.pc, 4);
    assert_eq!(info.steps, 1); // the breakpoint slot did not execute

    // Resume executes the broken-on instruction without re-trapping.
    ex.resume(pid).unwrap();
    ex.clock_step(1, None).unwrap();
    let info = ex.info(pid).unwrap();
    assert_eq!(info.pc, 8);
    assert_eq!(info.state, TaskState::Ready);

    // Around the loop it traps again.
    ex.clock_step(3, None).unwrap();
    assert_eq!(ex.info(pid).unwrap().state, TaskState::Paused);
}

#[test]
fn brk_instruction_pauses_and_resume_skips_it() {
    let mut ex = exec();
    let words = [asm::brk(), asm::ldi(2, 5), asm::jmp(4)];
    let (pid, _) = ex
        .load(&image("brk_target", HxeFlags::empty(), &words, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.clock_step(3, None).unwrap();
    let info = ex.info(pid).unwrap();
    assert_eq!(info.state, TaskState::Paused);
    assert_eq!(info.pc, 0); // still pointing at the BRK

    ex.resume(pid).unwrap();
    ex.clock_step(1, None).unwrap();
    assert_eq!(ex.regs(pid).unwrap().regs[2], 5);
}

#[test]
fn watchpoints_fire_on_memory_change() {
    let mut ex = exec();
    // code is 4 words (16 bytes); bss directly follows.
    let words = [
        asm::addi(1, 15, 16),
        asm::ldi(2, 7),
        asm::st(1, 0, 2),
        asm::jmp(12),
    ];
    let (pid, _) = ex
        .load(&image("storer", HxeFlags::empty(), &words, vec![], 8), LoadOptions::default())
        .unwrap();
    let bss = ex.info(pid).unwrap().image_base + 16;
    ex.watch_set(pid, bss).unwrap();
    let (sub, _) = ex.subscribe(
        Filters { pids: None, kinds: Some(vec![EventKind::WatchUpdate]) },
        None,
    );

    ex.clock_step(4, None).unwrap();

    let events = ex.drain_events(sub, 16);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].data["old"], 0);
    assert_eq!(events[0].data["new"], 7);
    assert_eq!(ex.watch_list(pid), vec![bss]);
}

#[test]
fn sleep_blocks_and_wakes_on_deadline() {
    let mut ex = exec();
    let words = [
        asm::ldi(1, 5),
        asm::svc(0x06, 3), // SLEEP_MS(5)
        asm::ldi(2, 1),
        asm::jmp(8),
    ];
    let (pid, _) = ex
        .load(&image("sleeper", HxeFlags::empty(), &words, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.clock_step(2, None).unwrap();
    assert_eq!(ex.info(pid).unwrap().state, TaskState::WaitTime);

    ex.clock_step(20, None).unwrap();
    let info = ex.info(pid).unwrap();
    assert_eq!(info.state, TaskState::Ready);
    assert_eq!(info.blocks, 1);
    assert_eq!(info.wakes, 1);
    assert_eq!(ex.regs(pid).unwrap().regs[2], 1); // ran past the sleep
}

#[test]
fn kill_terminates_then_reaps() {
    let mut ex = exec();
    let spin = [asm::jmp(0)];
    let (pid, _) = ex
        .load(&image("doomed", HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.clock_step(3, None).unwrap();

    ex.kill(pid).unwrap();
    assert_eq!(ex.info(pid).unwrap().state, TaskState::Exited(-9));
    // Its stdio descriptors were reclaimed with it.
    assert!(ex.mailbox_snapshot().is_empty());

    // Second kill reaps the record; the name becomes available again.
    ex.kill(pid).unwrap();
    assert!(matches!(ex.info(pid), Err(ExecError::PidUnknown(_))));
    ex.load(&image("doomed", HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
        .unwrap();
}

#[test]
fn pid_locks_are_exclusive_per_session() {
    let mut ex = exec();
    let spin = [asm::jmp(0)];
    let (pid, _) = ex
        .load(&image("debuggee", HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
        .unwrap();

    ex.attach(1, pid, true).unwrap();
    assert!(matches!(ex.attach(2, pid, true), Err(ExecError::PidLocked(_))));
    // Observers are fine.
    ex.attach(2, pid, false).unwrap();
    assert!(matches!(ex.check_mutate(2, pid), Err(ExecError::PidLocked(_))));
    ex.check_mutate(1, pid).unwrap();

    // Session teardown restores the pre-session state.
    ex.release_session(1);
    ex.check_mutate(2, pid).unwrap();
    ex.attach(2, pid, true).unwrap();
}

#[test]
fn single_pid_stepping_leaves_others_alone() {
    let mut ex = exec();
    let spin = [asm::jmp(0)];
    for name in ["solo_a", "solo_b"] {
        ex.load(&image(name, HxeFlags::empty(), &spin, vec![], 0), LoadOptions::default())
            .unwrap();
    }
    ex.clock_step(5, Some(Pid(1))).unwrap();
    assert_eq!(ex.info(Pid(1)).unwrap().steps, 5);
    assert_eq!(ex.info(Pid(2)).unwrap().steps, 0);
}

#[test]
fn disasm_renders_loaded_code() {
    let mut ex = exec();
    let words = [asm::ldi(1, 3), asm::jmp(0)];
    let (pid, _) = ex
        .load(&image("listing", HxeFlags::empty(), &words, vec![], 0), LoadOptions::default())
        .unwrap();
    let lines = ex.disasm(pid, 0, 2).unwrap();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].1, "ldi r1, #3");
    assert!(lines[1].1.starts_with("jmp 0x0"));
}

#[test]
fn stack_info_reports_pushed_frames() {
    let mut ex = exec();
    let words = [
        asm::ldi(1, 0x44),
        asm::push(1),
        asm::call(4), // pushes the return address 12
        asm::jmp(12),
    ];
    let (pid, _) = ex
        .load(&image("framed", HxeFlags::empty(), &words, vec![], 0), LoadOptions::default())
        .unwrap();
    ex.clock_step(3, None).unwrap();
    let si = ex.stack_info(pid, 8).unwrap();
    assert_eq!(si.used_bytes, 8);
    assert_eq!(si.frames.len(), 2);
    // Top of stack is the CALL return address, a code offset.
    assert_eq!(si.frames[0].value, 12);
    assert!(si.frames[0].return_candidate);
    assert_eq!(si.frames[1].value, 0x44);
}
