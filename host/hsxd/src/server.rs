// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Connection handling and command execution.
//!
//! All executive state mutation happens on one thread: connections only
//! parse lines and forward [`Command`]s down an mpsc queue, and every
//! response or event envelope for a connection flows back through that
//! connection's single writer channel, so output lines never interleave.
//! Between commands the executive thread drives `clock run` batches and
//! pumps subscribed events.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hsx_abi::{MailboxStatus, Pid};
use hsx_exec::{EventKind, ExecConfig, ExecError, Executive, Filters, LoadOptions};
use hsx_protocol as proto;
use hsx_protocol::{ErrorCode, Request};
use log::{debug, info, warn};
use serde_json::{json, Value};

/// Instructions per `clock run` batch between command polls.
const RUN_BATCH: u64 = 4096;
/// Events handed to one subscription per pump.
const PUMP_BATCH: usize = 64;

pub enum Command {
    Connect { session: u64, writer: mpsc::Sender<String> },
    Disconnect { session: u64 },
    Request { session: u64, request: Request },
}

struct Session {
    writer: mpsc::Sender<String>,
    subscriptions: Vec<u64>,
}

/// Accept loop. Never returns under normal operation.
pub fn serve(listener: TcpListener, cfg: ExecConfig) -> anyhow::Result<()> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>();
    thread::spawn(move || executive_loop(cfg, cmd_rx));

    let mut next_session = 1u64;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let session = next_session;
                next_session += 1;
                if let Err(e) = spawn_connection(session, stream, cmd_tx.clone())
                {
                    warn!("session {session}: setup failed: {e}");
                }
            }
            Err(e) => warn!("accept failed: {e}"),
        }
    }
    Ok(())
}

fn spawn_connection(
    session: u64,
    stream: TcpStream,
    cmd_tx: mpsc::Sender<Command>,
) -> anyhow::Result<()> {
    let peer = stream.peer_addr()?;
    info!("session {session}: connected from {peer}");
    let write_half = stream.try_clone()?;
    let (line_tx, line_rx) = mpsc::channel::<String>();

    // Writer: the only thread that touches the socket's write half.
    thread::spawn(move || {
        let mut out = BufWriter::new(write_half);
        for line in line_rx {
            if out.write_all(line.as_bytes()).is_err()
                || out.write_all(b"\n").is_err()
                || out.flush().is_err()
            {
                break;
            }
        }
    });

    cmd_tx
        .send(Command::Connect { session, writer: line_tx.clone() })
        .ok();

    // Reader: parse lines, forward requests, answer garbage directly.
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            match Request::parse_line(&line) {
                Ok(request) => {
                    if cmd_tx.send(Command::Request { session, request }).is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let resp = proto::error_response(
                        None,
                        ErrorCode::BadRequest,
                        &e.to_string(),
                    );
                    if line_tx.send(resp.to_string()).is_err() {
                        break;
                    }
                }
            }
        }
        cmd_tx.send(Command::Disconnect { session }).ok();
        info!("session {session}: disconnected");
    });
    Ok(())
}

/// The single thread that owns the executive.
fn executive_loop(cfg: ExecConfig, rx: mpsc::Receiver<Command>) {
    let mut exec = Executive::new(cfg);
    let mut sessions: HashMap<u64, Session> = HashMap::new();

    loop {
        let cmd = if exec.is_running() {
            match rx.try_recv() {
                Ok(cmd) => Some(cmd),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => return,
            }
        } else {
            match rx.recv_timeout(Duration::from_millis(50)) {
                Ok(cmd) => Some(cmd),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => return,
            }
        };

        match cmd {
            Some(Command::Connect { session, writer }) => {
                sessions.insert(
                    session,
                    Session { writer, subscriptions: Vec::new() },
                );
            }
            Some(Command::Disconnect { session }) => {
                if let Some(s) = sessions.remove(&session) {
                    for sub in s.subscriptions {
                        let _ = exec.unsubscribe(sub);
                    }
                }
                exec.release_session(session);
            }
            Some(Command::Request { session, request }) => {
                let response =
                    dispatch(&mut exec, &mut sessions, session, &request);
                if let Some(s) = sessions.get(&session) {
                    let _ = s.writer.send(response.to_string());
                }
            }
            None => {}
        }

        if exec.is_running() {
            let _ = exec.clock_step(RUN_BATCH, None);
            if !exec.has_ready_tasks() {
                // Only sleepers and waiters; pace the tick near real time.
                thread::sleep(Duration::from_millis(1));
            }
        }

        pump_events(&mut exec, &sessions);
    }
}

fn pump_events(exec: &mut Executive, sessions: &HashMap<u64, Session>) {
    if !exec.events_pending() {
        return;
    }
    for session in sessions.values() {
        for &sub in &session.subscriptions {
            for record in exec.drain_events(sub, PUMP_BATCH) {
                let event = serde_json::to_value(record.kind)
                    .unwrap_or(Value::Null);
                let envelope = proto::event_envelope(
                    record.seq,
                    record.ts,
                    &event,
                    record.pid.map(|p| p.0),
                    &record.data,
                );
                if session.writer.send(envelope.to_string()).is_err() {
                    break;
                }
            }
        }
    }
}

fn exec_error(id: Option<&Value>, e: ExecError) -> Value {
    let code = match e {
        ExecError::PidUnknown(_) => ErrorCode::PidUnknown,
        ExecError::PidLocked(_) => ErrorCode::PidLocked,
        ExecError::OutOfMemory => ErrorCode::Internal,
        _ => ErrorCode::BadRequest,
    };
    proto::error_response(id, code, &e.to_string())
}

fn bad_request(id: Option<&Value>, msg: &str) -> Value {
    proto::error_response(id, ErrorCode::BadRequest, msg)
}

/// Executes one command against the executive. Every command handler
/// runs here, on the executive thread, between VM steps.
fn dispatch(
    exec: &mut Executive,
    sessions: &mut HashMap<u64, Session>,
    session: u64,
    req: &Request,
) -> Value {
    let id = req.id.as_ref();
    debug!("session {session}: {}", req.cmd);
    match run_command(exec, sessions, session, req) {
        Ok(fields) => proto::ok_response(id, fields),
        Err(CommandError::Exec(e)) => exec_error(id, e),
        Err(CommandError::Proto(e)) => bad_request(id, &e.to_string()),
        Err(CommandError::Unsupported) => proto::error_response(
            id,
            ErrorCode::UnsupportedCmd,
            &format!("unknown command '{}'", req.cmd),
        ),
        Err(CommandError::Other(msg)) => bad_request(id, &msg),
    }
}

enum CommandError {
    Exec(ExecError),
    Proto(proto::ProtocolError),
    Unsupported,
    Other(String),
}

impl From<ExecError> for CommandError {
    fn from(e: ExecError) -> Self {
        CommandError::Exec(e)
    }
}

impl From<proto::ProtocolError> for CommandError {
    fn from(e: proto::ProtocolError) -> Self {
        CommandError::Proto(e)
    }
}

fn to_fields<T: serde::Serialize>(key: &str, value: &T) -> Value {
    json!({ key: serde_json::to_value(value).unwrap_or(Value::Null) })
}

fn run_command(
    exec: &mut Executive,
    sessions: &mut HashMap<u64, Session>,
    session: u64,
    req: &Request,
) -> Result<Value, CommandError> {
    match req.cmd.as_str() {
        "session.open" => {
            let _params: proto::SessionOpenParams = req.params()?;
            Ok(json!({
                "session": session,
                "capabilities": proto::CAPABILITIES,
                "protocol_version": proto::version::V1,
            }))
        }
        "session.close" => {
            if let Some(s) = sessions.get_mut(&session) {
                for sub in s.subscriptions.drain(..) {
                    let _ = exec.unsubscribe(sub);
                }
            }
            exec.release_session(session);
            Ok(json!({}))
        }
        "session.keepalive" => Ok(json!({ "tick": exec.tick() })),

        "load" => {
            let params: proto::LoadParams = req.params()?;
            let bytes = match (&params.bytes, &params.path) {
                (Some(b64), _) => proto::decode_bytes(b64)?,
                (None, Some(path)) => std::fs::read(path).map_err(|e| {
                    CommandError::Other(format!("reading {path}: {e}"))
                })?,
                (None, None) => {
                    return Err(CommandError::Other(
                        "load needs 'bytes' or 'path'".into(),
                    ))
                }
            };
            let opts = LoadOptions { stack_size: params.stack_size };
            let (pid, app_name) = exec.load(&bytes, opts)?;
            Ok(json!({ "pid": pid.0, "app_name": app_name }))
        }
        "ps" => Ok(to_fields("tasks", &exec.ps())),
        "info" => {
            let params: proto::PidParams = req.params()?;
            let pid = need_pid(params.pid)?;
            Ok(to_fields("task", &exec.info(pid)?))
        }
        "kill" => {
            let params: proto::PidParams = req.params()?;
            let pid = need_pid(params.pid)?;
            exec.check_mutate(session, pid)?;
            exec.kill(pid)?;
            Ok(json!({}))
        }
        "attach" => {
            let params: proto::AttachParams = req.params()?;
            exec.attach(session, Pid(params.pid), params.exclusive)?;
            Ok(json!({ "exclusive": params.exclusive }))
        }
        "detach" => {
            let params: proto::PidParams = req.params()?;
            let pid = need_pid(params.pid)?;
            exec.detach(session, pid);
            Ok(json!({}))
        }
        "resume" => {
            let params: proto::PidParams = req.params()?;
            let pid = need_pid(params.pid)?;
            exec.check_mutate(session, pid)?;
            exec.resume(pid)?;
            Ok(json!({}))
        }

        "clock" => {
            let params: proto::ClockParams = req.params()?;
            match params.action.as_str() {
                "step" => {
                    let n = params.n.unwrap_or(1);
                    let only = params.pid.map(Pid);
                    if let Some(pid) = only {
                        exec.check_mutate(session, pid)?;
                    }
                    let report = exec.clock_step(n, only)?;
                    Ok(json!({
                        "executed": report.executed,
                        "slots": report.slots,
                        "tick": exec.tick(),
                    }))
                }
                "run" => {
                    exec.clock_run();
                    Ok(json!({ "running": true }))
                }
                "pause" => {
                    exec.clock_pause();
                    Ok(json!({ "running": false, "tick": exec.tick() }))
                }
                other => Err(CommandError::Other(format!(
                    "unknown clock action '{other}'"
                ))),
            }
        }

        "reg.get" => {
            let params: proto::PidParams = req.params()?;
            let pid = need_pid(params.pid)?;
            Ok(to_fields("regs", &exec.regs(pid)?))
        }
        "mem.read" => {
            let params: proto::MemReadParams = req.params()?;
            let bytes = exec.mem_read(params.addr, params.len)?;
            Ok(json!({
                "addr": params.addr,
                "bytes": proto::encode_bytes(&bytes),
            }))
        }
        "mem.write" => {
            let params: proto::MemWriteParams = req.params()?;
            if let Some(pid) = params.pid {
                exec.check_mutate(session, Pid(pid))?;
            }
            let bytes = proto::decode_bytes(&params.bytes)?;
            exec.mem_write(params.addr, &bytes)?;
            Ok(json!({ "written": bytes.len() }))
        }

        "bp.set" => {
            let params: proto::BpParams = req.params()?;
            let pid = Pid(params.pid);
            exec.check_mutate(session, pid)?;
            let addr = params
                .addr
                .ok_or_else(|| CommandError::Other("missing addr".into()))?;
            exec.bp_set(pid, addr)?;
            Ok(json!({}))
        }
        "bp.clear" => {
            let params: proto::BpParams = req.params()?;
            let pid = Pid(params.pid);
            exec.check_mutate(session, pid)?;
            let addr = params
                .addr
                .ok_or_else(|| CommandError::Other("missing addr".into()))?;
            exec.bp_clear(pid, addr)?;
            Ok(json!({}))
        }
        "bp.list" => {
            let params: proto::BpParams = req.params()?;
            Ok(to_fields("breakpoints", &exec.bp_list(Pid(params.pid))?))
        }
        "watch.set" => {
            let params: proto::BpParams = req.params()?;
            let pid = Pid(params.pid);
            exec.check_mutate(session, pid)?;
            let addr = params
                .addr
                .ok_or_else(|| CommandError::Other("missing addr".into()))?;
            exec.watch_set(pid, addr)?;
            Ok(json!({}))
        }
        "watch.clear" => {
            let params: proto::BpParams = req.params()?;
            let pid = Pid(params.pid);
            exec.check_mutate(session, pid)?;
            let addr = params
                .addr
                .ok_or_else(|| CommandError::Other("missing addr".into()))?;
            exec.watch_clear(pid, addr)?;
            Ok(json!({}))
        }
        "watch.list" => {
            let params: proto::BpParams = req.params()?;
            Ok(to_fields("watches", &exec.watch_list(Pid(params.pid))))
        }
        "stack.info" => {
            let params: proto::StackInfoParams = req.params()?;
            Ok(to_fields(
                "stack",
                &exec.stack_info(Pid(params.pid), params.max_frames)?,
            ))
        }
        "disasm" => {
            let params: proto::DisasmParams = req.params()?;
            let lines = exec.disasm(Pid(params.pid), params.addr, params.count)?;
            let listing: Vec<Value> = lines
                .into_iter()
                .map(|(addr, text)| json!({ "addr": addr, "text": text }))
                .collect();
            Ok(json!({ "listing": listing }))
        }

        "mailbox.snapshot" => {
            Ok(to_fields("descriptors", &exec.mailbox_snapshot()))
        }
        "mailbox.send" => {
            let params: proto::MailboxSendParams = req.params()?;
            let payload = proto::decode_bytes(&params.bytes)?;
            match exec.host_send(
                &params.target,
                params.channel,
                params.flags,
                payload,
            ) {
                Ok(seq) => Ok(json!({ "mbx": "ok", "seq": seq })),
                Err(status) => mailbox_status_fields(status),
            }
        }
        "mailbox.recv" => {
            let params: proto::MailboxTargetParams = req.params()?;
            match exec.host_recv(&params.target) {
                Ok(msg) => Ok(json!({
                    "mbx": "ok",
                    "seq": msg.seq,
                    "src_pid": msg.src_pid.0,
                    "channel": msg.channel,
                    "flags": msg.flags,
                    "bytes": proto::encode_bytes(&msg.payload),
                })),
                Err(status) => mailbox_status_fields(status),
            }
        }
        "mailbox.peek" => {
            let params: proto::MailboxTargetParams = req.params()?;
            match exec.host_peek(&params.target) {
                Ok(msg) => Ok(json!({
                    "mbx": "ok",
                    "seq": msg.seq,
                    "src_pid": msg.src_pid.0,
                    "channel": msg.channel,
                    "flags": msg.flags,
                    "length": msg.payload.len(),
                })),
                Err(status) => mailbox_status_fields(status),
            }
        }

        "events.subscribe" => {
            let params: proto::SubscribeParams = req.params()?;
            let kinds = match params.events {
                None => None,
                Some(names) => {
                    let mut kinds = Vec::with_capacity(names.len());
                    for name in names {
                        let kind: EventKind =
                            serde_json::from_value(Value::String(name.clone()))
                                .map_err(|_| {
                                    CommandError::Other(format!(
                                        "unknown event kind '{name}'"
                                    ))
                                })?;
                        kinds.push(kind);
                    }
                    Some(kinds)
                }
            };
            let filters = Filters {
                pids: params.pids.map(|ps| ps.into_iter().map(Pid).collect()),
                kinds,
            };
            let (sub, gap) = exec.subscribe(filters, params.since_seq);
            if let Some(s) = sessions.get_mut(&session) {
                s.subscriptions.push(sub);
            }
            Ok(json!({ "subscription": sub, "gap": gap }))
        }
        "events.ack" => {
            let params: proto::AckParams = req.params()?;
            if let Some(s) = sessions.get(&session) {
                for &sub in &s.subscriptions {
                    exec.ack_events(sub, params.seq)?;
                }
            }
            Ok(json!({}))
        }
        "events.unsubscribe" => {
            if let Some(s) = sessions.get_mut(&session) {
                for sub in s.subscriptions.drain(..) {
                    let _ = exec.unsubscribe(sub);
                }
            }
            Ok(json!({}))
        }

        "sched" => Ok(to_fields("sched", &exec.sched_stats())),

        _ => Err(CommandError::Unsupported),
    }
}

fn need_pid(pid: Option<u32>) -> Result<Pid, CommandError> {
    pid.map(Pid)
        .ok_or_else(|| CommandError::Other("missing pid".into()))
}

fn mailbox_status_fields(status: MailboxStatus) -> Result<Value, CommandError> {
    match status {
        // Benign outcomes stay on the ok path with the status named.
        MailboxStatus::Empty | MailboxStatus::Full => Ok(json!({
            "mbx": serde_json::to_value(status).unwrap_or(Value::Null),
        })),
        other => Err(CommandError::Other(format!(
            "mailbox operation failed: {other:?}"
        ))),
    }
}
