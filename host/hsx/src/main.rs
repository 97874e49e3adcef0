// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `hsx`: command-line client for the executive's RPC server.
//!
//! Subcommands map one-to-one onto RPC commands. The default output is
//! a readable rendering of the response; `--json` emits the raw RPC
//! response line. Exit code 0 on success, 1 on an RPC error.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use hsx_protocol as proto;
use serde_json::{json, Value};

#[derive(Debug, Parser)]
#[clap(about = "control a running hsxd executive")]
struct Cli {
    /// Server address.
    #[clap(long, default_value = "127.0.0.1:9955", env = "HSX_ADDR", global = true)]
    addr: String,

    /// Emit the raw RPC response instead of the readable rendering.
    #[clap(long, global = true)]
    json: bool,

    #[clap(subcommand)]
    cmd: Cmd,
}

fn parse_num(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse()
    }
}

#[derive(Debug, clap::Subcommand)]
enum Cmd {
    /// Load an HXE image from a file.
    Load {
        path: PathBuf,
        /// Override the default stack size, in bytes.
        #[clap(long)]
        stack_size: Option<u32>,
    },
    /// List tasks.
    Ps,
    /// Show one task in detail.
    Info { pid: u32 },
    /// Terminate a task (or reap a terminal one).
    Kill { pid: u32 },
    /// Take a debug lock on a pid (or observe with no lock).
    Attach {
        pid: u32,
        #[clap(long)]
        exclusive: bool,
    },
    /// Release a debug lock.
    Detach { pid: u32 },
    /// Resume a paused task.
    Resume { pid: u32 },
    /// Clock control.
    #[clap(subcommand)]
    Clock(ClockCmd),
    /// Dump a task's register window.
    Reg { pid: u32 },
    /// Read guest memory (base64 in the response).
    MemRead {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
        len: u32,
    },
    /// Write guest memory; bytes given as base64.
    MemWrite {
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
        bytes: String,
        #[clap(long)]
        pid: Option<u32>,
    },
    /// Breakpoints.
    #[clap(subcommand)]
    Bp(PointCmd),
    /// Memory watchpoints.
    #[clap(subcommand)]
    Watch(PointCmd),
    /// Walk a task's stack.
    Stack {
        pid: u32,
        #[clap(long, default_value_t = 16)]
        max_frames: usize,
    },
    /// Disassemble task code.
    Disasm {
        pid: u32,
        #[clap(long, default_value_t = 0, parse(try_from_str = parse_num))]
        addr: u32,
        #[clap(long, default_value_t = 16)]
        count: usize,
    },
    /// Mailbox inspection and host-side operations.
    #[clap(subcommand)]
    Mailbox(MailboxCmd),
    /// Subscribe to the event stream and print events as they arrive.
    Events {
        /// Only these pids.
        #[clap(long)]
        pid: Vec<u32>,
        /// Only these event kinds (e.g. stdout, task_state).
        #[clap(long)]
        kind: Vec<String>,
    },
    /// Scheduler counters and trace ring.
    Sched,
}

#[derive(Debug, clap::Subcommand)]
enum ClockCmd {
    /// Run N single-instruction rotations.
    Step {
        #[clap(default_value_t = 1)]
        n: u64,
        /// Step only this pid.
        #[clap(short, long)]
        pid: Option<u32>,
    },
    /// Free-run the executive clock.
    Run,
    /// Pause the executive clock.
    Pause,
}

#[derive(Debug, clap::Subcommand)]
enum PointCmd {
    Set {
        pid: u32,
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
    },
    Clear {
        pid: u32,
        #[clap(parse(try_from_str = parse_num))]
        addr: u32,
    },
    List { pid: u32 },
}

#[derive(Debug, clap::Subcommand)]
enum MailboxCmd {
    /// Dump the descriptor table.
    Snapshot,
    /// Send text to a target (host-side, src pid 0).
    Send {
        target: String,
        text: String,
        #[clap(long, default_value_t = 0)]
        channel: u32,
    },
    /// Non-blocking receive from a target.
    Recv { target: String },
    /// Peek the next message's metadata.
    Peek { target: String },
}

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Connection {
    fn open(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("connecting to {addr}"))?;
        let reader = BufReader::new(stream.try_clone()?);
        let mut conn = Connection { reader, writer: stream };
        let resp = conn.call(json!({ "cmd": "session.open", "client": "hsx" }))?;
        if resp["status"] != json!("ok") {
            bail!("session.open refused: {resp}");
        }
        Ok(conn)
    }

    fn call(&mut self, request: Value) -> Result<Value> {
        let mut line = request.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        loop {
            let msg = self.read_line()?;
            if msg.get("type") != Some(&json!("event")) {
                return Ok(msg);
            }
        }
    }

    fn read_line(&mut self) -> Result<Value> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            bail!("server closed the connection");
        }
        serde_json::from_str(&line).context("parsing server response")
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut conn = Connection::open(&cli.addr)?;

    // `events` stays attached and streams; everything else is one
    // request, one response.
    if let Cmd::Events { pid, kind } = &cli.cmd {
        return stream_events(&mut conn, pid, kind, cli.json);
    }

    let request = build_request(&cli.cmd)?;
    let response = conn.call(request)?;
    let ok = response["status"] == json!("ok");
    if cli.json {
        println!("{response}");
    } else {
        render(&cli.cmd, &response);
    }
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn build_request(cmd: &Cmd) -> Result<Value> {
    Ok(match cmd {
        Cmd::Load { path, stack_size } => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("reading {}", path.display()))?;
            json!({
                "cmd": "load",
                "bytes": proto::encode_bytes(&bytes),
                "stack_size": stack_size,
            })
        }
        Cmd::Ps => json!({ "cmd": "ps" }),
        Cmd::Info { pid } => json!({ "cmd": "info", "pid": pid }),
        Cmd::Kill { pid } => json!({ "cmd": "kill", "pid": pid }),
        Cmd::Attach { pid, exclusive } => {
            json!({ "cmd": "attach", "pid": pid, "exclusive": exclusive })
        }
        Cmd::Detach { pid } => json!({ "cmd": "detach", "pid": pid }),
        Cmd::Resume { pid } => json!({ "cmd": "resume", "pid": pid }),
        Cmd::Clock(ClockCmd::Step { n, pid }) => {
            json!({ "cmd": "clock", "action": "step", "n": n, "pid": pid })
        }
        Cmd::Clock(ClockCmd::Run) => json!({ "cmd": "clock", "action": "run" }),
        Cmd::Clock(ClockCmd::Pause) => {
            json!({ "cmd": "clock", "action": "pause" })
        }
        Cmd::Reg { pid } => json!({ "cmd": "reg.get", "pid": pid }),
        Cmd::MemRead { addr, len } => {
            json!({ "cmd": "mem.read", "addr": addr, "len": len })
        }
        Cmd::MemWrite { addr, bytes, pid } => {
            json!({ "cmd": "mem.write", "addr": addr, "bytes": bytes, "pid": pid })
        }
        Cmd::Bp(point) => point_request("bp", point),
        Cmd::Watch(point) => point_request("watch", point),
        Cmd::Stack { pid, max_frames } => {
            json!({ "cmd": "stack.info", "pid": pid, "max_frames": max_frames })
        }
        Cmd::Disasm { pid, addr, count } => {
            json!({ "cmd": "disasm", "pid": pid, "addr": addr, "count": count })
        }
        Cmd::Mailbox(MailboxCmd::Snapshot) => json!({ "cmd": "mailbox.snapshot" }),
        Cmd::Mailbox(MailboxCmd::Send { target, text, channel }) => json!({
            "cmd": "mailbox.send",
            "target": target,
            "bytes": proto::encode_bytes(text.as_bytes()),
            "channel": channel,
        }),
        Cmd::Mailbox(MailboxCmd::Recv { target }) => {
            json!({ "cmd": "mailbox.recv", "target": target })
        }
        Cmd::Mailbox(MailboxCmd::Peek { target }) => {
            json!({ "cmd": "mailbox.peek", "target": target })
        }
        Cmd::Sched => json!({ "cmd": "sched" }),
        Cmd::Events { .. } => unreachable!("handled by stream_events"),
    })
}

fn point_request(prefix: &str, point: &PointCmd) -> Value {
    match point {
        PointCmd::Set { pid, addr } => {
            json!({ "cmd": format!("{prefix}.set"), "pid": pid, "addr": addr })
        }
        PointCmd::Clear { pid, addr } => {
            json!({ "cmd": format!("{prefix}.clear"), "pid": pid, "addr": addr })
        }
        PointCmd::List { pid } => {
            json!({ "cmd": format!("{prefix}.list"), "pid": pid })
        }
    }
}

fn stream_events(
    conn: &mut Connection,
    pids: &[u32],
    kinds: &[String],
    raw: bool,
) -> Result<()> {
    let mut req = serde_json::Map::new();
    req.insert("cmd".into(), json!("events.subscribe"));
    if !pids.is_empty() {
        req.insert("pids".into(), json!(pids));
    }
    if !kinds.is_empty() {
        req.insert("events".into(), json!(kinds));
    }
    let resp = conn.call(Value::Object(req))?;
    if resp["status"] != json!("ok") {
        println!("{resp}");
        std::process::exit(1);
    }
    let mut last_acked = 0u64;
    loop {
        let msg = conn.read_line()?;
        if msg.get("type") != Some(&json!("event")) {
            continue;
        }
        if raw {
            println!("{msg}");
        } else {
            println!(
                "[{}] #{:<6} pid={} {} {}",
                msg["ts"],
                msg["seq"],
                msg["pid"],
                msg["event"].as_str().unwrap_or("?"),
                msg["data"]
            );
        }
        // Ack in windows so the server keeps the stream flowing.
        if let Some(seq) = msg["seq"].as_u64() {
            if seq >= last_acked + 64 {
                let ack = json!({ "cmd": "events.ack", "seq": seq });
                let line = format!("{ack}\n");
                conn.writer.write_all(line.as_bytes())?;
                last_acked = seq;
            }
        }
    }
}

fn render(cmd: &Cmd, resp: &Value) {
    if resp["status"] != json!("ok") {
        eprintln!(
            "error: {} ({})",
            resp["message"].as_str().unwrap_or("unknown"),
            resp["error"].as_str().unwrap_or("?")
        );
        return;
    }
    match cmd {
        Cmd::Ps => {
            if let Some(tasks) = resp["tasks"].as_array() {
                println!("{:<5} {:<16} {:<10} {:>8} STATE", "PID", "APP", "PC", "STEPS");
                for t in tasks {
                    println!(
                        "{:<5} {:<16} {:<#10x} {:>8} {}",
                        t["pid"],
                        t["instance"].as_str().unwrap_or("?"),
                        t["pc"].as_u64().unwrap_or(0),
                        t["steps"],
                        t["state"]
                    );
                }
            }
        }
        Cmd::Disasm { .. } => {
            if let Some(listing) = resp["listing"].as_array() {
                for line in listing {
                    println!(
                        "{:#06x}  {}",
                        line["addr"].as_u64().unwrap_or(0),
                        line["text"].as_str().unwrap_or("")
                    );
                }
            }
        }
        _ => {
            println!(
                "{}",
                serde_json::to_string_pretty(resp)
                    .unwrap_or_else(|_| resp.to_string())
            );
        }
    }
}
