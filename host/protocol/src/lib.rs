// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types for the JSON-lines RPC protocol spoken between the executive
//! server and its clients.
//!
//! The wire format is one JSON object per `\n`-terminated line, UTF-8,
//! integers decimal. Requests carry a `cmd` and an optional `id` the
//! server echoes back; responses carry `"status": "ok" | "error"`.
//! Events are interleaved on subscribed sessions inside
//! `{"type": "event", ...}` envelopes. Binary payloads (image bytes,
//! memory contents, mailbox messages) travel as base64 strings.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub mod version {
    pub const V1: u32 = 1;
}

/// Capabilities advertised by `session.open`.
pub const CAPABILITIES: [&str; 6] =
    ["events", "stack", "watch", "breakpoints", "disasm", "symbols"];

/// A parsed request line. Unrecognized fields stay in `params` for the
/// per-command payload structs below.
#[derive(Clone, Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub cmd: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Request {
    pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line)
            .map_err(|e| ProtocolError::BadRequestLine(e.to_string()))
    }

    /// Deserializes the parameter fields into a typed payload struct.
    pub fn params<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| ProtocolError::BadParams(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("request is not a JSON object: {0}")]
    BadRequestLine(String),
    #[error("bad parameters: {0}")]
    BadParams(String),
}

/// Error codes carried in `"error"` on failed responses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnsupportedCmd,
    BadRequest,
    PidUnknown,
    PidLocked,
    Timeout,
    Internal,
}

/// Builds a success response; `fields` must be a JSON object and its
/// members land at the top level of the response.
pub fn ok_response(id: Option<&Value>, fields: Value) -> Value {
    let mut obj = Map::new();
    if let Some(id) = id {
        obj.insert("id".into(), id.clone());
    }
    obj.insert("status".into(), json!("ok"));
    if let Value::Object(fields) = fields {
        obj.extend(fields);
    }
    Value::Object(obj)
}

pub fn error_response(
    id: Option<&Value>,
    code: ErrorCode,
    message: &str,
) -> Value {
    let mut obj = Map::new();
    if let Some(id) = id {
        obj.insert("id".into(), id.clone());
    }
    obj.insert("status".into(), json!("error"));
    obj.insert(
        "error".into(),
        serde_json::to_value(code).unwrap_or(Value::Null),
    );
    obj.insert("message".into(), json!(message));
    Value::Object(obj)
}

/// The `{"type":"event", ...}` envelope interleaved on subscribed
/// sessions.
pub fn event_envelope(
    seq: u64,
    ts: u64,
    event: &Value,
    pid: Option<u32>,
    data: &Value,
) -> Value {
    json!({
        "type": "event",
        "seq": seq,
        "ts": ts,
        "event": event,
        "pid": pid,
        "data": data,
    })
}

pub fn encode_bytes(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_bytes(s: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(s)
        .map_err(|e| ProtocolError::BadParams(format!("bad base64: {e}")))
}

//
// Per-command parameter payloads
//

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SessionOpenParams {
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoadParams {
    #[serde(default)]
    pub path: Option<String>,
    /// Base64 image bytes; takes precedence over `path`.
    #[serde(default)]
    pub bytes: Option<String>,
    #[serde(default)]
    pub stack_size: Option<u32>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct PidParams {
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AttachParams {
    pub pid: u32,
    /// `true` takes the exclusive debug lock; `false` observes.
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ClockParams {
    /// "step", "run", or "pause".
    pub action: String,
    #[serde(default)]
    pub n: Option<u64>,
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemReadParams {
    #[serde(default)]
    pub pid: Option<u32>,
    pub addr: u32,
    pub len: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MemWriteParams {
    #[serde(default)]
    pub pid: Option<u32>,
    pub addr: u32,
    /// Base64.
    pub bytes: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BpParams {
    pub pid: u32,
    #[serde(default)]
    pub addr: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StackInfoParams {
    pub pid: u32,
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
}

fn default_max_frames() -> usize {
    16
}

#[derive(Clone, Debug, Deserialize)]
pub struct DisasmParams {
    pub pid: u32,
    #[serde(default)]
    pub addr: u32,
    #[serde(default = "default_disasm_count")]
    pub count: usize,
}

fn default_disasm_count() -> usize {
    16
}

#[derive(Clone, Debug, Deserialize)]
pub struct MailboxSendParams {
    pub target: String,
    /// Base64 payload.
    pub bytes: String,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub flags: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct MailboxTargetParams {
    pub target: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscribeParams {
    #[serde(default)]
    pub pids: Option<Vec<u32>>,
    /// Event kind names, e.g. `["stdout", "task_state"]`.
    #[serde(default)]
    pub events: Option<Vec<String>>,
    #[serde(default)]
    pub since_seq: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AckParams {
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_request_line() {
        let req = Request::parse_line(
            r#"{"id": 7, "cmd": "mem.read", "pid": 1, "addr": 64, "len": 16}"#,
        )
        .unwrap();
        assert_eq!(req.cmd, "mem.read");
        assert_eq!(req.id, Some(json!(7)));
        let params: MemReadParams = req.params().unwrap();
        assert_eq!(params.pid, Some(1));
        assert_eq!(params.addr, 64);
        assert_eq!(params.len, 16);
    }

    #[test]
    fn missing_required_params_are_rejected() {
        let req =
            Request::parse_line(r#"{"cmd": "mem.read", "addr": 4}"#).unwrap();
        assert!(req.params::<MemReadParams>().is_err());
    }

    #[test]
    fn responses_echo_the_id() {
        let id = json!("abc");
        let ok = ok_response(Some(&id), json!({ "pid": 3 }));
        assert_eq!(ok["id"], json!("abc"));
        assert_eq!(ok["status"], json!("ok"));
        assert_eq!(ok["pid"], json!(3));

        let err = error_response(Some(&id), ErrorCode::PidUnknown, "no pid 9");
        assert_eq!(err["status"], json!("error"));
        assert_eq!(err["error"], json!("pid_unknown"));
    }

    #[test]
    fn event_envelope_shape() {
        let env = event_envelope(4, 100, &json!("stdout"), Some(2), &json!({"text": "hi"}));
        assert_eq!(env["type"], json!("event"));
        assert_eq!(env["seq"], json!(4));
        assert_eq!(env["event"], json!("stdout"));
        assert_eq!(env["pid"], json!(2));
        assert_eq!(env["data"]["text"], json!("hi"));
    }

    #[test]
    fn base64_round_trip() {
        let payload = b"\x00\x01hello\xff";
        let encoded = encode_bytes(payload);
        assert_eq!(decode_bytes(&encoded).unwrap(), payload);
        assert!(decode_bytes("!!!").is_err());
    }
}
