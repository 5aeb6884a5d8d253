//! The in-memory world state: every keyed map the store owns.
//!
//! All collections are ordered (`BTreeMap`) so a serialized dump of the
//! state is deterministic — the replay test compares canonical encodings of
//! two dumps, and iteration order must not depend on insertion history.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use proxy_types::{
    ArtifactRecord, ControlState, Delivery, DeliveryState, EntityKind, EventRecord, IngestRecord,
    LedgerEntry, OutboxMessage,
};

/// Response snapshot retained under an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// Fingerprint of the request that first used the key.
    pub fingerprint: String,
    /// Response replayed to repeats of the same request.
    pub response: Value,
    /// First-write time.
    pub created_at: String,
}

/// Running totals for one `(account, currency)` cell of a tenant ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceCell {
    /// Sum of posted debits, minor units.
    pub debits: u64,
    /// Sum of posted credits, minor units.
    pub credits: u64,
}

/// One tenant's double-entry ledger: the applied journal plus running
/// balances per account and currency.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerState {
    /// Applied entries by id; each id is applied at most once.
    pub entries: BTreeMap<String, LedgerEntry>,
    /// account → currency → running totals.
    pub balances: BTreeMap<String, BTreeMap<String, BalanceCell>>,
}

/// Cheap counters for status logging.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Keyed records across all entity tables.
    pub records: usize,
    /// Event streams.
    pub streams: usize,
    /// Events across all streams.
    pub events: usize,
    /// Undrained outbox messages.
    pub outbox_depth: usize,
    /// Deliveries in `pending`.
    pub deliveries_pending: usize,
    /// Deliveries in `delivered`.
    pub deliveries_delivered: usize,
    /// Deliveries in `failed`.
    pub deliveries_failed: usize,
    /// Ledger entries across all tenants.
    pub ledger_entries: usize,
}

/// The canonical in-memory state. Exclusively owned by the kernel; every
/// mutation arrives through the transaction applier so the state and the
/// transaction log stay in lockstep.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorldState {
    /// One table per entity kind, records keyed by `(tenantId, id)`.
    pub tables: BTreeMap<EntityKind, BTreeMap<String, Value>>,
    /// Signer public key → key id, keyed by `(tenantId, publicKey)`.
    pub signer_key_index: BTreeMap<String, String>,
    /// Hash-chained event streams keyed by `(tenantId, aggregateKind,
    /// aggregateId)`.
    pub streams: BTreeMap<String, Vec<EventRecord>>,
    /// Reduced aggregate snapshots, same keys as `streams`.
    pub snapshots: BTreeMap<String, Value>,
    /// Per-tenant double-entry ledgers.
    pub ledgers: BTreeMap<String, LedgerState>,
    /// Idempotency cache keyed by `(tenantId, key)`.
    pub idempotency: BTreeMap<String, IdempotencyRecord>,
    /// Per-tenant outbox queues in enqueue order.
    pub outbox: BTreeMap<String, VecDeque<OutboxMessage>>,
    /// Next outbox sequence per tenant.
    pub outbox_seq: BTreeMap<String, u64>,
    /// Attempt-tracked deliveries keyed by `(tenantId, deliveryId)`.
    pub deliveries: BTreeMap<String, Delivery>,
    /// Emergency-control states keyed by `(tenantId, scopeType, scopeId,
    /// controlType)`.
    pub control_states: BTreeMap<String, ControlState>,
    /// Canonical form of every accepted control event, keyed by
    /// `(tenantId, eventId)`; the conflict check compares against this.
    pub control_events: BTreeMap<String, String>,
    /// Ingested external events keyed by `(tenantId, source,
    /// externalEventId)`.
    pub ingest: BTreeMap<String, IngestRecord>,
    /// Deliverable artifacts keyed by `(tenantId, artifactId)`.
    pub artifacts: BTreeMap<String, ArtifactRecord>,
}

impl WorldState {
    /// Fresh, empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record lookup in one entity table.
    pub fn record(&self, kind: EntityKind, key: &str) -> Option<&Value> {
        self.tables.get(&kind).and_then(|table| table.get(key))
    }

    /// Mutable table for one entity kind, created on first touch.
    pub fn table_mut(&mut self, kind: EntityKind) -> &mut BTreeMap<String, Value> {
        self.tables.entry(kind).or_default()
    }

    /// Counters for status logging.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            records: self.tables.values().map(BTreeMap::len).sum(),
            streams: self.streams.len(),
            events: self.streams.values().map(Vec::len).sum(),
            outbox_depth: self.outbox.values().map(VecDeque::len).sum(),
            ledger_entries: self.ledgers.values().map(|l| l.entries.len()).sum(),
            ..StoreStats::default()
        };
        for delivery in self.deliveries.values() {
            match delivery.state {
                DeliveryState::Pending => stats.deliveries_pending += 1,
                DeliveryState::Delivered => stats.deliveries_delivered += 1,
                DeliveryState::Failed => stats.deliveries_failed += 1,
            }
        }
        stats
    }

    /// Serialized dump used by the replay-equivalence test. Canonical
    /// encoding of two dumps is byte-equal exactly when the states match.
    pub fn dump(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
