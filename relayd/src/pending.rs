//! Correlation tables for in-flight requests.
//!
//! Two independent maps that are never merged: outbound entries track
//! requests the relay sent to the agent and are resolved by a matching
//! response id; inbound entries track requests the agent sent to the relay
//! and are resolved by a controller answer or a timeout. Both support bulk
//! failure for the crash and exit paths.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::RpcId;

#[derive(Debug, Error)]
#[error("request id {0} is already pending")]
pub struct DuplicateId(pub RpcId);

/// A request sent relay -> agent, awaiting the agent's response.
#[derive(Debug, Clone)]
pub struct OutboundEntry {
    /// Opaque correlation tag supplied by the controller, echoed back on the
    /// response event.
    pub client_request_id: Option<String>,
    pub method: Option<String>,
    /// Issued by the relay itself (e.g. the handshake) rather than the
    /// controller.
    pub internal: bool,
    pub thread_id_hint: Option<String>,
    pub turn_id_hint: Option<String>,
    pub item_id_hint: Option<String>,
}

#[derive(Debug, Default)]
pub struct OutboundTable {
    entries: HashMap<RpcId, OutboundEntry>,
}

impl OutboundTable {
    /// Register a new pending request. A live duplicate id is a caller error
    /// and must be rejected before the request ever reaches the agent.
    pub fn insert(&mut self, id: RpcId, entry: OutboundEntry) -> Result<(), DuplicateId> {
        if self.entries.contains_key(&id) {
            return Err(DuplicateId(id));
        }
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Resolve by response id; removes and returns the entry.
    pub fn resolve(&mut self, id: &RpcId) -> Option<OutboundEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &RpcId) -> bool {
        self.entries.contains_key(id)
    }

    /// Drain every entry in one pass; the caller reports the failure for
    /// each. After this the table is empty.
    pub fn fail_all(&mut self) -> Vec<(RpcId, OutboundEntry)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A request sent agent -> relay that was forwarded to the controller.
#[derive(Debug, Clone)]
pub struct InboundEntry {
    pub method: String,
    pub params: Value,
    pub started_at: Instant,
}

#[derive(Debug, Default)]
pub struct InboundTable {
    entries: HashMap<RpcId, InboundEntry>,
}

impl InboundTable {
    /// Track a forwarded agent request. The agent owns this id space; a
    /// reused id replaces the stale entry.
    pub fn insert(&mut self, id: RpcId, entry: InboundEntry) {
        self.entries.insert(id, entry);
    }

    pub fn get(&self, id: &RpcId) -> Option<&InboundEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &RpcId) -> Option<InboundEntry> {
        self.entries.remove(id)
    }

    /// Clear every entry in one pass. No replies are owed to a dead agent.
    pub fn clear_all(&mut self) -> Vec<(RpcId, InboundEntry)> {
        self.entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbound(method: &str) -> OutboundEntry {
        OutboundEntry {
            client_request_id: None,
            method: Some(method.to_string()),
            internal: false,
            thread_id_hint: None,
            turn_id_hint: None,
            item_id_hint: None,
        }
    }

    #[test]
    fn duplicate_outbound_id_is_rejected() {
        let mut table = OutboundTable::default();
        table.insert(RpcId::Num(1), outbound("turn/start")).unwrap();

        let err = table
            .insert(RpcId::Num(1), outbound("turn/steer"))
            .unwrap_err();
        assert_eq!(err.0, RpcId::Num(1));

        // First entry survives the rejection.
        assert_eq!(
            table.resolve(&RpcId::Num(1)).unwrap().method.as_deref(),
            Some("turn/start")
        );
    }

    #[test]
    fn resolve_is_at_most_once() {
        let mut table = OutboundTable::default();
        table.insert(RpcId::Str("a".into()), outbound("x")).unwrap();

        assert!(table.resolve(&RpcId::Str("a".into())).is_some());
        assert!(table.resolve(&RpcId::Str("a".into())).is_none());
    }

    #[test]
    fn string_and_numeric_ids_do_not_collide() {
        let mut table = OutboundTable::default();
        table.insert(RpcId::Num(1), outbound("x")).unwrap();
        table.insert(RpcId::Str("1".into()), outbound("y")).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn fail_all_empties_both_tables() {
        let mut out = OutboundTable::default();
        out.insert(RpcId::Num(1), outbound("a")).unwrap();
        out.insert(RpcId::Num(2), outbound("b")).unwrap();
        assert_eq!(out.fail_all().len(), 2);
        assert!(out.is_empty());

        let mut inb = InboundTable::default();
        inb.insert(
            RpcId::Num(9),
            InboundEntry {
                method: "item/tool/call".into(),
                params: json!({}),
                started_at: Instant::now(),
            },
        );
        assert_eq!(inb.clear_all().len(), 1);
        assert!(inb.is_empty());
    }

    #[test]
    fn inbound_timeout_removal_then_answer_misses() {
        let mut inb = InboundTable::default();
        inb.insert(
            RpcId::Num(5),
            InboundEntry {
                method: "item/tool/call".into(),
                params: json!({}),
                started_at: Instant::now(),
            },
        );

        // Timer fires first.
        assert!(inb.remove(&RpcId::Num(5)).is_some());
        // A late controller answer finds nothing; at-most-one resolution.
        assert!(inb.remove(&RpcId::Num(5)).is_none());
    }
}
