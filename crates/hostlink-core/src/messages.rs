// hostlink protocol envelope and built-in message payloads.
//
// Dispatch is keyed by an open string type so collaborators can add their own
// message kinds without touching this crate.

use crate::error::{LinkError, LinkResult};
use crate::ids::generate_request_id;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Built-in message type strings.
pub mod msg {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    pub const TERMINAL_CREATE: &str = "terminal.create";
    pub const TERMINAL_CREATED: &str = "terminal.created";
    pub const TERMINAL_INPUT: &str = "terminal.input";
    pub const TERMINAL_RESIZE: &str = "terminal.resize";
    pub const TERMINAL_KILL: &str = "terminal.kill";
    pub const TERMINAL_KILLED: &str = "terminal.killed";
    pub const TERMINAL_LIST: &str = "terminal.list";
    pub const TERMINAL_SESSIONS: &str = "terminal.sessions";
    pub const TERMINAL_OUTPUT: &str = "terminal.output";

    pub const FS_WATCH: &str = "fs.watch";
    pub const FS_WATCHING: &str = "fs.watching";
    pub const FS_UNWATCH: &str = "fs.unwatch";
    pub const FS_UNWATCHED: &str = "fs.unwatched";
    pub const FS_LIST: &str = "fs.list";
    pub const FS_LISTING: &str = "fs.listing";
    pub const FS_CHANGED: &str = "fs.changed";

    pub const PORT_STATUS: &str = "port.status";
    pub const PORT_CHANGED: &str = "port.changed";
}

/// Wire envelope: `{type, requestId, ...payload}`.
///
/// Payload fields are flattened into the top-level JSON object. The request
/// id is opaque to the gateway and is only ever echoed back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(rename = "requestId", default)]
    pub request_id: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build an outbound envelope from an arbitrary JSON payload.
    ///
    /// Object payloads are flattened; a string `requestId` inside them becomes
    /// the envelope's request id. Any other payload is carried under `data`.
    /// A fresh request id is assigned when none is supplied.
    pub fn new(msg_type: impl Into<String>, payload: Value) -> Self {
        let mut map = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".into(), other);
                map
            }
        };
        let request_id = match map.remove("requestId") {
            Some(Value::String(id)) if !id.is_empty() => id,
            _ => generate_request_id(),
        };
        Self {
            msg_type: msg_type.into(),
            request_id,
            payload: map,
        }
    }

    /// Build a reply that echoes `request_id`.
    pub fn reply(msg_type: impl Into<String>, request_id: &str, payload: Value) -> Self {
        let mut env = Self::new(msg_type, payload);
        if !request_id.is_empty() {
            env.request_id = request_id.to_string();
        }
        env
    }

    /// Deserialize the flattened payload into a typed request.
    pub fn payload_as<T: DeserializeOwned>(&self) -> LinkResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            LinkError::InvalidMessage(format!("bad {} payload: {e}", self.msg_type))
        })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// `terminal.create` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalCreateRequest {
    #[serde(default)]
    pub cols: Option<i64>,
    #[serde(default)]
    pub rows: Option<i64>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
}

/// `terminal.input` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInputRequest {
    pub terminal_id: String,
    pub data: String,
}

/// `terminal.resize` request. Dimensions are signed so that bogus client
/// values can be clamped rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalResizeRequest {
    pub terminal_id: String,
    pub cols: i64,
    pub rows: i64,
}

/// `terminal.kill` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalRef {
    pub terminal_id: String,
}

/// `fs.watch`, `fs.unwatch` and `fs.list` requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

/// One immediate entry of a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    pub name: String,
    pub is_directory: bool,
}

/// Summary of a terminal returned by `terminal.list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalSummary {
    pub terminal_id: String,
    pub alive: bool,
    pub last_command: String,
}

/// Port occupancy, sent for `port.status` and `port.changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u16,
    pub occupied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn object_payload_is_flattened() {
        let env = Envelope::new("fs.watch", json!({"path": "/tmp"}));
        let text = serde_json::to_string(&env).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "fs.watch");
        assert_eq!(v["path"], "/tmp");
        assert!(!v["requestId"].as_str().unwrap().is_empty());
    }

    #[test]
    fn payload_request_id_is_kept() {
        let env = Envelope::new("x", json!({"requestId": "r-1", "a": 1}));
        assert_eq!(env.request_id, "r-1");
        assert!(!env.payload.contains_key("requestId"));
    }

    #[test]
    fn scalar_payload_goes_under_data() {
        let env = Envelope::new("x", json!(42));
        assert_eq!(env.payload["data"], json!(42));
    }

    #[test]
    fn reply_echoes_request_id() {
        let env = Envelope::reply("pong", "abc", Value::Null);
        assert_eq!(env.request_id, "abc");
        assert!(env.payload.is_empty());
    }

    #[test]
    fn typed_payload() {
        let env = Envelope::new(
            msg::TERMINAL_RESIZE,
            json!({"terminalId": "t1", "cols": 0, "rows": -5}),
        );
        let req: TerminalResizeRequest = env.payload_as().unwrap();
        assert_eq!(req.terminal_id, "t1");
        assert_eq!(req.rows, -5);
    }

    #[test]
    fn typed_payload_missing_field() {
        let env = Envelope::new(msg::TERMINAL_INPUT, json!({"data": "ls"}));
        let err = env.payload_as::<TerminalInputRequest>().unwrap_err();
        assert!(matches!(err, LinkError::InvalidMessage(_)));
    }
}
