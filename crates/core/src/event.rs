//! The persisted event model and its companion records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{AggregateId, EventId};
use crate::value::Value;

/// Metadata key carrying the partition key across the transport.
///
/// Events with equal `__ctx` values land on the same partition in arrival
/// order; events without it share a neutral partition.
pub const CTX_META_KEY: &str = "__ctx";

/// Event metadata: opaque values under string keys, kept sorted.
pub type EventMeta = BTreeMap<String, Value>;

/// A position in an aggregate's event sequence.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AggregateRef {
    pub id: AggregateId,
    /// 1-based, strictly monotonic per aggregate with no gaps.
    pub version: u32,
}

impl AggregateRef {
    pub fn new(id: AggregateId, version: u32) -> Self {
        Self { id, version }
    }
}

/// An immutable fact appended to an aggregate's log.
///
/// The runtime never interprets `body` or `meta`; they are opaque
/// [`Value`] trees owned by domain code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub event_type: u32,
    pub aggregate: AggregateRef,
    pub body: Option<Value>,
    pub meta: EventMeta,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// The partition key for transport ordering, when present.
    pub fn ctx(&self) -> Option<&Value> {
        self.meta.get(CTX_META_KEY)
    }
}

/// One row per aggregate, tracking the head of its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub id: AggregateId,
    /// Version of the most recently appended event.
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    /// Once set, the aggregate rejects all further appends.
    pub is_final: bool,
}

/// A cached fold of events `1..=version` for one aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate: AggregateRef,
    pub state: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Durable marker of the last processed version per (projection, aggregate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionCheckpoint {
    pub projection: String,
    pub aggregate: AggregateRef,
    pub timestamp: DateTime<Utc>,
}

/// A subscriber stream's declared interest in event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRegistration {
    /// Subscriber topic name.
    pub id: String,
    pub events: BTreeSet<u32>,
    pub timestamp: DateTime<Utc>,
}
