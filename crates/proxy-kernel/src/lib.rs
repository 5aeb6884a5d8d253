#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-kernel** – Deterministic state core of the settlement service.
//!
//! The kernel owns the in-memory [`WorldState`] and is the only writer to
//! it: every mutation arrives as a typed operation batch, is validated and
//! applied atomically (whole-batch success or whole-batch failure), then
//! journalled to the transaction log and mirrored to the relational backend
//! when one is configured. Successful batches are broadcast on an in-memory
//! bus for live observers.
//!
//! The kernel also implements the claim/lease, outbox-drain and
//! agent-paging contracts from `proxy-store-core`, making it the in-memory
//! twin of the relational mirror: the delivery worker and the sweep workers
//! run identically over either backend.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use proxy_canonical::CanonicalError;
use proxy_store_core::{
    AgentDirectory, AttemptUpdate, ClaimQuery, DeliveryBackend, MetricsSink, MirrorStore,
    OutboxDrainReport, OutboxProcessor, RECLAIM_AFTER_SECS,
};
use proxy_txlog::{TxLog, TxLogError, TxRecord};
use proxy_types::{
    iso_millis, now_iso, parse_iso, scoped_key, AggregateKind, ArtifactRecord, ControlState,
    CoreError, Delivery, DeliveryState, EntityKind, EventRecord, Op,
};

mod apply;
mod control;
mod ledger;
mod state;
mod streams;

pub use state::{BalanceCell, IdempotencyRecord, LedgerState, StoreStats, WorldState};
pub use streams::{default_reduce, ReduceInput, ReducerFn, ReducerRegistry};

/// Buffer size for the applied-batch broadcast channel.
const BUS_BUFFER: usize = 1024;

//─────────────────────────────
//  Kernel error type
//─────────────────────────────

/// Errors produced while applying a batch.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Validation or conflict error; surfaces to the API caller unchanged.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// Canonicalization failure.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Transaction-log append failure. Fatal: the store can no longer be
    /// committed durably and the process should abort.
    #[error("transaction log append failed: {0}")]
    Journal(#[from] TxLogError),
    /// Relational mirror rejected a batch the memory store accepted.
    #[error("relational mirror apply failed: {0}")]
    Mirror(#[source] anyhow::Error),
}

impl KernelError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Core(e) => e.code(),
            Self::Canonical(_) => "CANONICAL_ERROR",
            Self::Journal(_) => "TXLOG_WRITE_FAILED",
            Self::Mirror(_) => "MIRROR_APPLY_FAILED",
        }
    }

    /// HTTP status for errors that surface on an API boundary.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Core(e) => Some(e.status_code()),
            _ => None,
        }
    }
}

//─────────────────────────────
//  Applied-batch bus
//─────────────────────────────

/// Notification broadcast after a batch commits.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedBatch {
    /// Commit time stamped into the journal record.
    pub at: String,
    /// Operations in the batch.
    pub op_count: usize,
    /// Wire kinds, in batch order.
    pub kinds: Vec<String>,
}

//─────────────────────────────
//  Kernel
//─────────────────────────────

/// The deterministic state-machine executor and in-memory store.
pub struct Kernel {
    state: Arc<RwLock<WorldState>>,
    reducers: ReducerRegistry,
    txlog: Option<Arc<TxLog>>,
    mirror: Option<Arc<dyn MirrorStore>>,
    metrics: MetricsSink,
    bus: broadcast::Sender<AppliedBatch>,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("reducers", &self.reducers)
            .field("txlog", &self.txlog.as_ref().map(|t| t.path()))
            .field("mirrored", &self.mirror.is_some())
            .finish()
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// A kernel over an empty state with no journal and no mirror.
    pub fn new() -> Self {
        let (bus, _) = broadcast::channel(BUS_BUFFER);
        Self {
            state: Arc::new(RwLock::new(WorldState::new())),
            reducers: ReducerRegistry::new(),
            txlog: None,
            mirror: None,
            metrics: MetricsSink::new(),
            bus,
        }
    }

    /// Journal every applied batch to `txlog`.
    pub fn with_txlog(mut self, txlog: Arc<TxLog>) -> Self {
        self.txlog = Some(txlog);
        self
    }

    /// Mirror every applied batch to a relational backend.
    pub fn with_mirror(mut self, mirror: Arc<dyn MirrorStore>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Share a metrics sink with the rest of the process.
    pub fn with_metrics(mut self, metrics: MetricsSink) -> Self {
        self.metrics = metrics;
        self
    }

    /// Install a domain snapshot reducer. Must happen before the kernel is
    /// shared.
    pub fn register_reducer(&mut self, kind: AggregateKind, reducer: ReducerFn) {
        self.reducers.register(kind, reducer);
    }

    /// The shared metrics sink.
    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Subscribe to applied-batch notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedBatch> {
        self.bus.subscribe()
    }

    //───────────────────── write path ─────────────────────

    /// Validate and apply one batch atomically, journal it, then mirror it.
    ///
    /// Any invariant violation fails the whole batch with no state change.
    /// A journal failure is fatal and leaves the memory state unmutated, so
    /// the store never runs ahead of the log.
    pub async fn apply(&self, ops: Vec<Op>) -> Result<AppliedBatch, KernelError> {
        for op in &ops {
            op.validate()?;
        }
        let at = now_iso();
        let kinds: Vec<String> = ops.iter().map(|op| op.kind().to_string()).collect();

        {
            let mut state = self.state.write().await;
            let mut scratch = state.clone();
            for op in &ops {
                apply::apply_op(&mut scratch, &self.reducers, op, &at)?;
            }
            if let Some(txlog) = &self.txlog {
                txlog.append(&TxRecord::new(at.clone(), ops.clone()))?;
            }
            *state = scratch;

            // Mirrored while the write lock is held so SQL sees batches in
            // exactly the order the memory store committed them. A mirror
            // failure leaves the mirror behind the journal; boot catch-up
            // replays it forward.
            if let Some(mirror) = &self.mirror {
                mirror
                    .apply_batch(&at, &ops)
                    .await
                    .map_err(KernelError::Mirror)?;
            }
        }

        let applied = AppliedBatch {
            at,
            op_count: ops.len(),
            kinds,
        };
        debug!(ops = applied.op_count, "batch applied");
        let _ = self.bus.send(applied.clone());
        Ok(applied)
    }

    /// Rebuild state from journalled records, e.g. on boot. Records were
    /// validated when first applied; replay re-runs the applier with each
    /// record's original timestamp so the result is bit-identical to the
    /// live application.
    pub async fn replay(&self, records: &[TxRecord]) -> Result<usize, KernelError> {
        let mut state = self.state.write().await;
        let mut scratch = state.clone();
        for record in records {
            for op in &record.ops {
                apply::apply_op(&mut scratch, &self.reducers, op, &record.at)?;
            }
        }
        *state = scratch;
        Ok(records.len())
    }

    //───────────────────── read surface ─────────────────────

    /// Record lookup by `(tenantId, id)`.
    pub async fn record(&self, kind: EntityKind, tenant_id: &str, id: &str) -> Option<Value> {
        self.state
            .read()
            .await
            .record(kind, &scoped_key(tenant_id, id))
            .cloned()
    }

    /// Full event stream for an aggregate.
    pub async fn events(
        &self,
        kind: AggregateKind,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Vec<EventRecord> {
        let key = proxy_types::scoped_key3(tenant_id, kind.as_str(), aggregate_id);
        self.state
            .read()
            .await
            .streams
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Current snapshot for an aggregate.
    pub async fn snapshot(
        &self,
        kind: AggregateKind,
        tenant_id: &str,
        aggregate_id: &str,
    ) -> Option<Value> {
        let key = proxy_types::scoped_key3(tenant_id, kind.as_str(), aggregate_id);
        self.state.read().await.snapshots.get(&key).cloned()
    }

    /// One tenant's ledger.
    pub async fn ledger(&self, tenant_id: &str) -> Option<LedgerState> {
        self.state.read().await.ledgers.get(tenant_id).cloned()
    }

    /// Current emergency-control state for one key.
    pub async fn control_state(
        &self,
        tenant_id: &str,
        scope_type: &str,
        scope_id: &str,
        control_type: &str,
    ) -> Option<ControlState> {
        let key = control::state_key(tenant_id, scope_type, scope_id, control_type);
        self.state.read().await.control_states.get(&key).cloned()
    }

    /// Delivery lookup by `(tenantId, deliveryId)`.
    pub async fn delivery(&self, tenant_id: &str, delivery_id: &str) -> Option<Delivery> {
        self.state
            .read()
            .await
            .deliveries
            .get(&scoped_key(tenant_id, delivery_id))
            .cloned()
    }

    /// All deliveries for one tenant, in key order.
    pub async fn deliveries(&self, tenant_id: &str) -> Vec<Delivery> {
        let prefix = scoped_key(tenant_id, "");
        self.state
            .read()
            .await
            .deliveries
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, delivery)| delivery.clone())
            .collect()
    }

    /// Cheap counters for status logging.
    pub async fn stats(&self) -> StoreStats {
        self.state.read().await.stats()
    }

    /// Serialized dump of the full state (deterministic; used by the replay
    /// equivalence test).
    pub async fn dump(&self) -> serde_json::Result<Value> {
        self.state.read().await.dump()
    }
}

//─────────────────────────────
//  In-memory claim / lease
//─────────────────────────────

#[async_trait::async_trait]
impl DeliveryBackend for Kernel {
    async fn claim_due_deliveries(&self, query: ClaimQuery) -> anyhow::Result<Vec<Delivery>> {
        let now = parse_iso(&query.now)?;
        let now_s = iso_millis(now);
        let reclaim_cutoff = iso_millis(now - Duration::seconds(RECLAIM_AFTER_SECS));

        let mut state = self.state.write().await;

        // Deterministic claim order: (scopeKey, orderSeq, priority,
        // nextAttemptAt, deliveryId). Fixed-width ISO strings compare
        // chronologically, so string comparison is sufficient throughout.
        let mut candidates: Vec<(String, u64, i64, String, String)> = state
            .deliveries
            .iter()
            .filter(|(_, d)| {
                d.state == DeliveryState::Pending
                    && d.next_attempt_at <= now_s
                    && query
                        .tenant_id
                        .as_deref()
                        .map_or(true, |t| d.tenant_id == t)
                    && d.claimed_at
                        .as_deref()
                        .map_or(true, |claimed| claimed < reclaim_cutoff.as_str())
            })
            .map(|(key, d)| {
                (
                    d.scope_key.clone(),
                    d.order_seq,
                    d.priority,
                    d.next_attempt_at.clone(),
                    key.clone(),
                )
            })
            .collect();
        candidates.sort();
        candidates.truncate(query.max_messages);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, _, _, key) in candidates {
            if let Some(delivery) = state.deliveries.get_mut(&key) {
                delivery.claimed_at = Some(now_s.clone());
                delivery.worker = Some(query.worker.clone());
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_delivery_attempt(&self, update: AttemptUpdate) -> anyhow::Result<()> {
        let key = scoped_key(&update.tenant_id, &update.delivery_id);
        let mut state = self.state.write().await;
        let delivery = state
            .deliveries
            .get_mut(&key)
            .ok_or_else(|| anyhow::anyhow!("unknown delivery {}", update.delivery_id))?;

        delivery.state = update.state;
        delivery.attempts = update.attempts;
        if let Some(next_attempt_at) = update.next_attempt_at {
            delivery.next_attempt_at = next_attempt_at;
        }
        delivery.last_status = update.last_status;
        delivery.last_error = update.last_error;
        if update.expires_at.is_some() {
            delivery.expires_at = update.expires_at;
        }
        if update.delivered_at.is_some() {
            delivery.delivered_at = update.delivered_at;
        }
        // Lease released on every outcome: terminal rows no longer need it
        // and retryable rows must become claimable at nextAttemptAt.
        delivery.claimed_at = None;
        delivery.worker = None;
        Ok(())
    }

    async fn artifact(
        &self,
        tenant_id: &str,
        artifact_id: &str,
    ) -> anyhow::Result<Option<ArtifactRecord>> {
        Ok(self
            .state
            .read()
            .await
            .artifacts
            .get(&scoped_key(tenant_id, artifact_id))
            .cloned())
    }
}

//─────────────────────────────
//  In-memory outbox drain
//─────────────────────────────

#[async_trait::async_trait]
impl OutboxProcessor for Kernel {
    async fn process_outbox(&self, max_messages: usize) -> anyhow::Result<OutboxDrainReport> {
        let now = now_iso();
        let mut report = OutboxDrainReport::default();
        let mut state = self.state.write().await;

        let tenants: Vec<String> = state.outbox.keys().cloned().collect();
        'tenants: for tenant in tenants {
            loop {
                if report.drained >= max_messages {
                    break 'tenants;
                }
                let Some(message) = state.outbox.get_mut(&tenant).and_then(|q| q.pop_front())
                else {
                    break;
                };
                report.drained += 1;
                for destination_id in &message.destination_ids {
                    let delivery_id = uuid::Uuid::new_v4().to_string();
                    let delivery = Delivery {
                        tenant_id: tenant.clone(),
                        delivery_id: delivery_id.clone(),
                        scope_key: message.scope_key.clone(),
                        order_seq: message.seq,
                        priority: message.priority,
                        order_key: Delivery::order_key_for(
                            &message.scope_key,
                            message.seq,
                            message.priority,
                            &delivery_id,
                        ),
                        destination_id: destination_id.clone(),
                        artifact_id: message.artifact_id.clone(),
                        artifact_type: message.artifact_type.clone(),
                        artifact_hash: message.artifact_hash.clone(),
                        dedupe_key: message.dedupe_key.clone(),
                        state: DeliveryState::Pending,
                        attempts: 0,
                        next_attempt_at: now.clone(),
                        claimed_at: None,
                        worker: None,
                        last_status: None,
                        last_error: None,
                        expires_at: None,
                        created_at: now.clone(),
                        delivered_at: None,
                    };
                    state
                        .deliveries
                        .insert(scoped_key(&tenant, &delivery_id), delivery);
                    report.deliveries_created += 1;
                }
            }
        }
        Ok(report)
    }

    async fn prune_expired_deliveries(&self, now: &str) -> anyhow::Result<usize> {
        let mut state = self.state.write().await;
        let before = state.deliveries.len();
        state.deliveries.retain(|_, d| {
            let terminal = matches!(d.state, DeliveryState::Delivered | DeliveryState::Failed);
            !(terminal && d.expires_at.as_deref().is_some_and(|expiry| expiry <= now))
        });
        Ok(before - state.deliveries.len())
    }
}

//─────────────────────────────
//  Agent paging for the insolvency sweep
//─────────────────────────────

#[async_trait::async_trait]
impl AgentDirectory for Kernel {
    async fn tenants(&self) -> anyhow::Result<Vec<String>> {
        let state = self.state.read().await;
        let mut tenants: Vec<String> = state
            .tables
            .get(&EntityKind::X402AgentLifecycles)
            .map(|table| {
                table
                    .keys()
                    .filter_map(|key| key.split(proxy_types::KEY_SEPARATOR).next())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    async fn active_agents(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(table) = state.tables.get(&EntityKind::X402AgentLifecycles) else {
            return Ok(Vec::new());
        };
        let prefix = scoped_key(tenant_id, "");
        Ok(table
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, record)| {
                record.get("status").and_then(Value::as_str) == Some("active")
            })
            .filter_map(|(key, _)| key.split(proxy_types::KEY_SEPARATOR).nth(1))
            .skip(offset)
            .take(limit)
            .map(str::to_owned)
            .collect())
    }
}
