// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! RPC server integration: a real listener on an ephemeral port, driven
//! over TCP exactly the way a client would.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use hsx_abi::{Capabilities, HxeFlags};
use hsx_exec::ExecConfig;
use hsx_hxe::HxeImage;
use hsx_minivm::asm;
use hsx_protocol as proto;
use serde_json::{json, Value};

fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        hsxd::server::serve(listener, ExecConfig::default()).unwrap();
    });
    addr
}

struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Client {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Client { reader, writer: stream }
    }

    fn send(&mut self, value: Value) {
        let mut line = value.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).unwrap();
    }

    fn read_line(&mut self) -> Value {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        serde_json::from_str(&line).unwrap()
    }

    /// Sends a request and returns its response, setting aside any
    /// interleaved event envelopes.
    fn call(&mut self, value: Value) -> Value {
        self.send(value);
        loop {
            let msg = self.read_line();
            if msg.get("type") != Some(&json!("event")) {
                return msg;
            }
        }
    }

    /// Reads lines until an event envelope arrives.
    fn next_event(&mut self) -> Value {
        loop {
            let msg = self.read_line();
            if msg.get("type") == Some(&json!("event")) {
                return msg;
            }
        }
    }
}

fn spin_image(name: &str) -> String {
    let words = [asm::ldi(1, 1), asm::jmp(4)];
    let bytes = HxeImage::new(
        name,
        HxeFlags::empty(),
        0,
        asm::words_to_bytes(&words),
        vec![],
        0,
        Capabilities::empty(),
    )
    .unwrap()
    .encode();
    proto::encode_bytes(&bytes)
}

#[test]
fn session_open_advertises_capabilities() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    let resp = c.call(json!({ "id": 1, "cmd": "session.open", "client": "test" }));
    assert_eq!(resp["status"], json!("ok"));
    assert_eq!(resp["id"], json!(1));
    assert_eq!(resp["protocol_version"], json!(1));
    let caps = resp["capabilities"].as_array().unwrap();
    assert!(caps.contains(&json!("events")));
    assert!(caps.contains(&json!("breakpoints")));
}

#[test]
fn load_step_inspect_lifecycle() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    c.call(json!({ "cmd": "session.open" }));

    let resp = c.call(json!({
        "cmd": "load",
        "bytes": spin_image("spinner"),
    }));
    assert_eq!(resp["status"], json!("ok"));
    assert_eq!(resp["pid"], json!(1));
    assert_eq!(resp["app_name"], json!("spinner"));

    let resp = c.call(json!({ "cmd": "clock", "action": "step", "n": 6 }));
    assert_eq!(resp["executed"], json!(6));

    let resp = c.call(json!({ "cmd": "ps" }));
    let tasks = resp["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["pid"], json!(1));
    assert_eq!(tasks[0]["steps"], json!(6));

    let resp = c.call(json!({ "cmd": "reg.get", "pid": 1 }));
    assert_eq!(resp["regs"]["regs"][1], json!(1));

    let resp = c.call(json!({ "cmd": "sched" }));
    assert_eq!(resp["sched"]["counters"][0]["steps"], json!(6));
}

#[test]
fn load_from_a_file_path() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    c.call(json!({ "cmd": "session.open" }));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("onfile.hxe");
    std::fs::write(&path, proto::decode_bytes(&spin_image("onfile")).unwrap())
        .unwrap();

    let resp = c.call(json!({
        "cmd": "load",
        "path": path.to_str().unwrap(),
    }));
    assert_eq!(resp["status"], json!("ok"));
    assert_eq!(resp["app_name"], json!("onfile"));

    let resp = c.call(json!({ "cmd": "load", "path": "/no/such/file.hxe" }));
    assert_eq!(resp["error"], json!("bad_request"));
}

#[test]
fn mem_write_read_round_trip() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    c.call(json!({ "cmd": "session.open" }));
    c.call(json!({ "cmd": "load", "bytes": spin_image("memtarget") }));

    let payload = proto::encode_bytes(b"\xde\xad\xbe\xef");
    let resp = c.call(json!({
        "cmd": "mem.write", "addr": 2048, "bytes": payload,
    }));
    assert_eq!(resp["status"], json!("ok"));
    assert_eq!(resp["written"], json!(4));

    let resp = c.call(json!({ "cmd": "mem.read", "addr": 2048, "len": 4 }));
    assert_eq!(
        proto::decode_bytes(resp["bytes"].as_str().unwrap()).unwrap(),
        b"\xde\xad\xbe\xef"
    );
}

#[test]
fn unknown_commands_and_pids_are_reported() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    c.call(json!({ "cmd": "session.open" }));

    let resp = c.call(json!({ "id": 9, "cmd": "frobnicate" }));
    assert_eq!(resp["status"], json!("error"));
    assert_eq!(resp["error"], json!("unsupported_cmd"));
    assert_eq!(resp["id"], json!(9));

    let resp = c.call(json!({ "cmd": "info", "pid": 42 }));
    assert_eq!(resp["error"], json!("pid_unknown"));

    // Garbage lines get a bad_request without killing the session.
    c.writer.write_all(b"this is not json\n").unwrap();
    let resp = c.read_line();
    assert_eq!(resp["error"], json!("bad_request"));
    let resp = c.call(json!({ "cmd": "session.keepalive" }));
    assert_eq!(resp["status"], json!("ok"));
}

#[test]
fn events_stream_to_subscribed_sessions() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    c.call(json!({ "cmd": "session.open" }));
    c.call(json!({ "cmd": "load", "bytes": spin_image("eventful") }));

    let resp = c.call(json!({
        "cmd": "events.subscribe",
        "events": ["trace_step"],
    }));
    assert_eq!(resp["status"], json!("ok"));

    c.call(json!({ "cmd": "clock", "action": "step", "n": 3 }));
    let ev = c.next_event();
    assert_eq!(ev["event"], json!("trace_step"));
    assert_eq!(ev["pid"], json!(1));
    assert!(ev["seq"].is_u64());

    let resp = c.call(json!({ "cmd": "events.ack", "seq": ev["seq"] }));
    assert_eq!(resp["status"], json!("ok"));
    let resp = c.call(json!({ "cmd": "events.unsubscribe" }));
    assert_eq!(resp["status"], json!("ok"));
}

#[test]
fn exclusive_locks_are_per_session_and_released_on_close() {
    let addr = start_server();
    let mut s1 = Client::connect(addr);
    let mut s2 = Client::connect(addr);
    s1.call(json!({ "cmd": "session.open" }));
    s2.call(json!({ "cmd": "session.open" }));
    s1.call(json!({ "cmd": "load", "bytes": spin_image("locked") }));

    let resp = s1.call(json!({ "cmd": "attach", "pid": 1, "exclusive": true }));
    assert_eq!(resp["status"], json!("ok"));

    // The other session cannot mutate the locked pid.
    let resp = s2.call(json!({ "cmd": "bp.set", "pid": 1, "addr": 4 }));
    assert_eq!(resp["error"], json!("pid_locked"));

    // Closing the first session restores the pre-session state.
    s1.call(json!({ "cmd": "session.close" }));
    let resp = s2.call(json!({ "cmd": "bp.set", "pid": 1, "addr": 4 }));
    assert_eq!(resp["status"], json!("ok"));
    let resp = s2.call(json!({ "cmd": "bp.list", "pid": 1 }));
    assert_eq!(resp["breakpoints"], json!([4]));
}

#[test]
fn host_mailbox_helpers_reach_guest_descriptors() {
    let addr = start_server();
    let mut c = Client::connect(addr);
    c.call(json!({ "cmd": "session.open" }));
    c.call(json!({ "cmd": "load", "bytes": spin_image("mbxhost") }));

    // The loader created pid:1; host send then drain it back.
    let resp = c.call(json!({
        "cmd": "mailbox.send",
        "target": "pid:1",
        "bytes": proto::encode_bytes(b"knock"),
        "channel": 2,
    }));
    assert_eq!(resp["status"], json!("ok"));
    assert_eq!(resp["seq"], json!(0));

    let resp = c.call(json!({ "cmd": "mailbox.peek", "target": "pid:1" }));
    assert_eq!(resp["length"], json!(5));

    let resp = c.call(json!({ "cmd": "mailbox.recv", "target": "pid:1" }));
    assert_eq!(resp["src_pid"], json!(0));
    assert_eq!(resp["channel"], json!(2));
    assert_eq!(
        proto::decode_bytes(resp["bytes"].as_str().unwrap()).unwrap(),
        b"knock"
    );

    let resp = c.call(json!({ "cmd": "mailbox.recv", "target": "pid:1" }));
    assert_eq!(resp["mbx"], json!("empty"));

    let snap = c.call(json!({ "cmd": "mailbox.snapshot" }));
    let descs = snap["descriptors"].as_array().unwrap();
    assert_eq!(descs.len(), 4); // pid + three stdio
}
