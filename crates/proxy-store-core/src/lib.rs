#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-store-core** – Backend-neutral storage traits for the settlement
//! core.
//!
//! The delivery worker and the sweep workers run identically over the
//! in-memory store and the relational mirror; this crate defines the
//! contracts both backends satisfy, without providing implementations.
//! It also carries the process-local metrics sink every component shares.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use proxy_types::{ArtifactRecord, Delivery, DeliveryState, Op};

pub mod metrics;

pub use metrics::MetricsSink;

/// Worker name recorded on delivery leases.
pub const DELIVERY_WORKER: &str = "delivery_v1";

/// Seconds after which another worker may steal a stale claim.
pub const RECLAIM_AFTER_SECS: i64 = 60;

//─────────────────────────────
//  Relational mirror contract
//─────────────────────────────

/// A durable backend that executes each operation batch in one transaction,
/// fanning outbox rows out in the same transaction that mutates domain rows.
/// The apply must be idempotent: replaying a journalled batch after a crash
/// may not error or double-apply.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// Apply one validated batch transactionally.
    async fn apply_batch(&self, at: &str, ops: &[Op]) -> anyhow::Result<()>;
}

//─────────────────────────────
//  Delivery claim contract
//─────────────────────────────

/// Parameters for a claim pass.
#[derive(Debug, Clone)]
pub struct ClaimQuery {
    /// Restrict to one tenant, or scan all tenants when `None`.
    pub tenant_id: Option<String>,
    /// Upper bound on leased rows.
    pub max_messages: usize,
    /// Worker name stamped on the lease.
    pub worker: String,
    /// Claim instant (ISO-8601); "due" is evaluated against this.
    pub now: String,
}

/// State transition recorded after a delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptUpdate {
    /// Tenant scope.
    pub tenant_id: String,
    /// Delivery identifier.
    pub delivery_id: String,
    /// New state.
    pub state: DeliveryState,
    /// Total attempts including the one just made.
    pub attempts: u32,
    /// Next eligible attempt time; `None` for terminal states.
    pub next_attempt_at: Option<String>,
    /// HTTP status of the attempt, when one was observed.
    pub last_status: Option<u16>,
    /// Failure classification; `None` clears the field on success.
    pub last_error: Option<String>,
    /// Retention deadline for terminal states.
    pub expires_at: Option<String>,
    /// Success time, set exactly when `state == delivered`.
    pub delivered_at: Option<String>,
}

/// Claim/lease surface both backends provide for the delivery worker.
///
/// "Due" means `state = pending AND nextAttemptAt <= now AND (claimedAt is
/// null OR claimedAt < now - reclaimAfter)`. Claims are leases, not locks:
/// a crashed worker's rows become reclaimable after
/// [`RECLAIM_AFTER_SECS`].
#[async_trait]
pub trait DeliveryBackend: Send + Sync {
    /// Lease up to `max_messages` due deliveries, stamping `claimedAt` and
    /// `worker`. Rows are returned in deterministic `(scopeKey, orderSeq,
    /// priority, nextAttemptAt, deliveryId)` order.
    async fn claim_due_deliveries(&self, query: ClaimQuery) -> anyhow::Result<Vec<Delivery>>;

    /// Record the outcome of one attempt. Non-terminal updates clear the
    /// lease so the row becomes claimable at `nextAttemptAt`.
    async fn update_delivery_attempt(&self, update: AttemptUpdate) -> anyhow::Result<()>;

    /// Resolve the artifact a delivery references.
    async fn artifact(
        &self,
        tenant_id: &str,
        artifact_id: &str,
    ) -> anyhow::Result<Option<ArtifactRecord>>;
}

//─────────────────────────────
//  Outbox drain contract
//─────────────────────────────

/// Outcome of one outbox drain pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxDrainReport {
    /// Outbox messages consumed.
    pub drained: usize,
    /// Delivery rows fanned out.
    pub deliveries_created: usize,
    /// Expired terminal deliveries pruned.
    pub pruned: usize,
}

/// Drains durably enqueued outbox messages into delivery rows and prunes
/// expired terminal rows.
#[async_trait]
pub trait OutboxProcessor: Send + Sync {
    /// Fan out up to `max_messages` outbox messages into deliveries (one per
    /// destination), preserving per-tenant enqueue order.
    async fn process_outbox(&self, max_messages: usize) -> anyhow::Result<OutboxDrainReport>;

    /// Remove terminal deliveries whose `expiresAt` has passed.
    async fn prune_expired_deliveries(&self, now: &str) -> anyhow::Result<usize>;
}

//─────────────────────────────
//  Agent paging contract
//─────────────────────────────

/// Tenant and agent enumeration for the insolvency sweep.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// All tenants with agent lifecycles, deduplicated and sorted.
    async fn tenants(&self) -> anyhow::Result<Vec<String>>;

    /// One page of active agent ids for a tenant.
    async fn active_agents(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<String>>;
}
