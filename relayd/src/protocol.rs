//! Pure JSON-RPC line classification and routing-key derivation.
//!
//! Nothing in here performs I/O or mutates session state; the session event
//! loop calls into this module for every message it relays in either
//! direction.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code for malformed request parameters.
pub const JSONRPC_INVALID_PARAMS: i32 = -32602;
/// Reserved code used when a forwarded agent request times out.
pub const JSONRPC_REQUEST_TIMEOUT: i32 = -32000;

/// Request methods whose successful result carries a freshly created thread.
/// Used to backfill a missing `threadId` from `result.thread.id`.
const THREAD_RESULT_METHODS: &[&str] = &[
    "thread/start",
    "thread/resume",
    "thread/fork",
    "thread/read",
    "thread/rollback",
    "thread/unarchive",
];

/// A JSON-RPC message id. The wire allows strings and numbers; both sides of
/// the proxy must be able to key correlation tables on either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Num(i64),
    Str(String),
}

impl RpcId {
    /// Extract an id from a JSON value; anything but a string or an integer
    /// is not an id.
    pub fn from_value(value: &Value) -> Option<RpcId> {
        if let Some(n) = value.as_i64() {
            return Some(RpcId::Num(n));
        }
        value.as_str().map(|s| RpcId::Str(s.to_string()))
    }

    pub fn to_value(&self) -> Value {
        match self {
            RpcId::Num(n) => Value::from(*n),
            RpcId::Str(s) => Value::from(s.clone()),
        }
    }
}

impl fmt::Display for RpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcId::Num(n) => write!(f, "{}", n),
            RpcId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RpcId {
    fn from(n: u64) -> Self {
        RpcId::Num(n as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Request,
    Notification,
    Response,
    Unknown,
}

impl MsgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgKind::Request => "request",
            MsgKind::Notification => "notification",
            MsgKind::Response => "response",
            MsgKind::Unknown => "unknown",
        }
    }
}

/// Classification of a single decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: MsgKind,
    pub method: Option<String>,
    pub id: Option<RpcId>,
}

/// Classify a decoded message as request / notification / response / unknown.
///
/// A request has both a method and an id, a notification has a method only,
/// and a response has an id plus a `result` or `error` member.
pub fn classify(msg: &Value) -> Classified {
    let Some(obj) = msg.as_object() else {
        return Classified {
            kind: MsgKind::Unknown,
            method: None,
            id: None,
        };
    };

    let method = obj.get("method").and_then(Value::as_str).map(str::to_string);
    let id = obj.get("id").and_then(RpcId::from_value);
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");

    match (&method, &id) {
        (Some(_), Some(_)) => Classified {
            kind: MsgKind::Request,
            method,
            id,
        },
        (Some(_), None) => Classified {
            kind: MsgKind::Notification,
            method,
            id: None,
        },
        (None, Some(_)) if has_result || has_error => Classified {
            kind: MsgKind::Response,
            method: None,
            id,
        },
        _ => Classified {
            kind: MsgKind::Unknown,
            method,
            id,
        },
    }
}

/// Conversation/turn/item identifiers derived from a message, used to
/// annotate events for downstream consumers. Best effort only.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoutingKeys {
    pub thread_id: Option<String>,
    pub turn_id: Option<String>,
    pub item_id: Option<String>,
}

fn string_field(root: &Value, key: &str) -> Option<String> {
    root.get(key).and_then(Value::as_str).map(str::to_string)
}

fn container_id(root: &Value, key: &str) -> Option<String> {
    root.get(key)
        .and_then(|c| c.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Scan `params` then `result` for well-known identifier fields and nested
/// container objects; first match per key wins. When the originating request
/// method is known to return a new thread, backfill `threadId` from
/// `result.thread.id`.
pub fn derive_routing_keys(msg: &Value, request_method_hint: Option<&str>) -> RoutingKeys {
    let mut out = RoutingKeys::default();

    let mut roots: Vec<&Value> = Vec::new();
    if let Some(params) = msg.get("params").filter(|v| v.is_object()) {
        roots.push(params);
    }
    if let Some(result) = msg.get("result").filter(|v| v.is_object()) {
        roots.push(result);
    }

    for root in &roots {
        if out.thread_id.is_none() {
            out.thread_id = string_field(root, "threadId");
        }
        if out.turn_id.is_none() {
            out.turn_id = string_field(root, "turnId");
        }
        if out.item_id.is_none() {
            out.item_id = string_field(root, "itemId");
        }

        if out.thread_id.is_none() {
            out.thread_id = container_id(root, "thread");
        }
        if out.turn_id.is_none() {
            out.turn_id = container_id(root, "turn");
        }
        if out.item_id.is_none() {
            out.item_id = container_id(root, "item");
        }
    }

    if out.thread_id.is_none() {
        if let Some(hint) = request_method_hint {
            if THREAD_RESULT_METHODS.contains(&hint) {
                if let Some(result) = msg.get("result") {
                    out.thread_id = container_id(result, "thread");
                }
            }
        }
    }

    out
}
