#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-store-sqlite** – SQLite-backed relational mirror.
//!
//! The mirror executes each validated operation batch in one SQL
//! transaction, inserting outbox rows in the same transaction that mutates
//! domain rows (the outbox pattern), and provides the durable claim/lease
//! surface for the delivery worker. Batch application is idempotent: a
//! journalled batch replayed after a crash is detected by its content hash
//! and skipped, so mirror and journal converge.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Row, Sqlite, Transaction};

use proxy_canonical::to_canonical_string;
use proxy_store_core::{
    AgentDirectory, AttemptUpdate, ClaimQuery, DeliveryBackend, MirrorStore, OutboxDrainReport,
    OutboxProcessor, RECLAIM_AFTER_SECS,
};
use proxy_types::{
    iso_millis, now_iso, parse_iso, ArtifactRecord, Delivery, DeliveryState, EntityKind, Op,
};

mod schema;

/// SQLite-backed implementation of the relational store contract.
#[derive(Debug, Clone)]
pub struct SqliteMirror {
    pool: SqlitePool,
}

impl SqliteMirror {
    /// Open (creating if missing) a database file and run migrations.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options)
            .await
            .with_context(|| format!("open sqlite db at {}", path.as_ref().display()))?;
        Self::from_pool(pool).await
    }

    /// An in-memory database, for tests and ephemeral runs.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePool::connect("sqlite::memory:").await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let mirror = Self { pool };
        schema::migrate(&mirror.pool).await?;
        Ok(mirror)
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Record lookup, mirroring the kernel's read surface.
    pub async fn record(
        &self,
        kind: EntityKind,
        tenant_id: &str,
        id: &str,
    ) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT record FROM records WHERE kind = ? AND tenant_id = ? AND id = ?")
            .bind(kind.table())
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(r.get::<String, _>("record").as_str()))
            .transpose()
            .map_err(Into::into)
    }

    /// Number of events stored for one aggregate stream.
    pub async fn event_count(
        &self,
        tenant_id: &str,
        aggregate_kind: &str,
        aggregate_id: &str,
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM events \
             WHERE tenant_id = ? AND aggregate_kind = ? AND aggregate_id = ?",
        )
        .bind(tenant_id)
        .bind(aggregate_kind)
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("count"))
    }

    /// Delivery lookup by `(tenantId, deliveryId)`.
    pub async fn delivery(&self, tenant_id: &str, delivery_id: &str) -> Result<Option<Delivery>> {
        let row = sqlx::query("SELECT * FROM deliveries WHERE tenant_id = ? AND delivery_id = ?")
            .bind(tenant_id)
            .bind(delivery_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode_delivery(&r)).transpose()
    }
}

//─────────────────────────────
//  Batch apply (one transaction)
//─────────────────────────────

#[async_trait]
impl MirrorStore for SqliteMirror {
    async fn apply_batch(&self, at: &str, ops: &[Op]) -> Result<()> {
        let batch_id = batch_hash(at, ops)?;
        let mut tx = self.pool.begin().await?;

        // Content-addressed replay guard: a batch already applied under this
        // hash is skipped wholesale.
        let fresh = sqlx::query("INSERT OR IGNORE INTO applied_batches (batch_id, at) VALUES (?, ?)")
            .bind(&batch_id)
            .bind(at)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            == 1;
        if !fresh {
            tx.rollback().await?;
            return Ok(());
        }

        for op in ops {
            apply_op(&mut tx, op, at).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

fn batch_hash(at: &str, ops: &[Op]) -> Result<String> {
    let body = serde_json::json!({ "at": at, "ops": ops });
    Ok(proxy_canonical::chain_hash(&body, None)?)
}

async fn apply_op(tx: &mut Transaction<'_, Sqlite>, op: &Op, at: &str) -> Result<()> {
    if let Some((kind, upsert)) = op.upsert() {
        put_record(tx, kind, &upsert.tenant_id, &upsert.id, &upsert.record).await?;
        if kind == EntityKind::SignerKeys {
            if let Some(public_key) = upsert.record.get("publicKey").and_then(Value::as_str) {
                sqlx::query(
                    "INSERT OR REPLACE INTO signer_key_index (tenant_id, public_key, key_id) \
                     VALUES (?, ?, ?)",
                )
                .bind(&upsert.tenant_id)
                .bind(public_key)
                .bind(&upsert.id)
                .execute(&mut **tx)
                .await?;
            }
        }
        return Ok(());
    }

    if let Some((kind, put)) = op.immutable_put() {
        // Conflicts were rejected by the kernel; the mirror keeps the first
        // write and ignores replays.
        sqlx::query("INSERT OR IGNORE INTO records (kind, tenant_id, id, record) VALUES (?, ?, ?, ?)")
            .bind(kind.table())
            .bind(&put.tenant_id)
            .bind(&put.id)
            .bind(serde_json::to_string(&put.record)?)
            .execute(&mut **tx)
            .await?;
        return Ok(());
    }

    if let Some((kind, append)) = op.events_append() {
        return apply_events(tx, kind.as_str(), append).await;
    }

    match op {
        Op::SettlementPolicyUpserted(policy) => {
            put_record(
                tx,
                EntityKind::SettlementPolicies,
                &policy.tenant_id,
                &policy.composite_id(),
                &policy.record,
            )
            .await
        }
        Op::SignerKeyStatusSet(status) => {
            merge_key_status(tx, EntityKind::SignerKeys, status).await
        }
        Op::AuthKeyStatusSet(status) => merge_key_status(tx, EntityKind::AuthKeys, status).await,
        Op::EmergencyControlEventAppended(control) => apply_control(tx, control).await,
        Op::LedgerEntryApplied(entry) => {
            sqlx::query(
                "INSERT OR IGNORE INTO ledger_entries (tenant_id, entry_id, entry) VALUES (?, ?, ?)",
            )
            .bind(&entry.tenant_id)
            .bind(&entry.entry.entry_id)
            .bind(serde_json::to_string(&entry.entry)?)
            .execute(&mut **tx)
            .await?;
            Ok(())
        }
        Op::IdempotencyPut(put) => {
            sqlx::query(
                "INSERT OR IGNORE INTO idempotency \
                 (tenant_id, idem_key, fingerprint, response, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&put.tenant_id)
            .bind(&put.key)
            .bind(&put.fingerprint)
            .bind(serde_json::to_string(&put.response)?)
            .bind(at)
            .execute(&mut **tx)
            .await?;
            Ok(())
        }
        Op::OutboxEnqueued(enqueue) => apply_outbox_enqueue(tx, enqueue, at).await,
        Op::IngestRecordsPut(ingest) => {
            for record in &ingest.records {
                sqlx::query(
                    "INSERT OR IGNORE INTO ingest \
                     (tenant_id, source, external_event_id, payload, received_at) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&ingest.tenant_id)
                .bind(&record.source)
                .bind(&record.external_event_id)
                .bind(serde_json::to_string(&record.payload)?)
                .bind(record.received_at.as_deref().unwrap_or(at))
                .execute(&mut **tx)
                .await?;
            }
            Ok(())
        }
        // Upsert / immutable / append families handled above.
        _ => Ok(()),
    }
}

async fn put_record(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    tenant_id: &str,
    id: &str,
    record: &Value,
) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO records (kind, tenant_id, id, record) VALUES (?, ?, ?, ?)")
        .bind(kind.table())
        .bind(tenant_id)
        .bind(id)
        .bind(serde_json::to_string(record)?)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn merge_key_status(
    tx: &mut Transaction<'_, Sqlite>,
    kind: EntityKind,
    status: &proxy_types::KeyStatusOp,
) -> Result<()> {
    let row = sqlx::query("SELECT record FROM records WHERE kind = ? AND tenant_id = ? AND id = ?")
        .bind(kind.table())
        .bind(&status.tenant_id)
        .bind(&status.id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| anyhow!("{} {} missing in mirror", kind.table(), status.id))?;

    let mut record: Value = serde_json::from_str(row.get::<String, _>("record").as_str())?;
    let fields = record
        .as_object_mut()
        .ok_or_else(|| anyhow!("{} {} is not an object", kind.table(), status.id))?;
    fields.insert("status".into(), Value::String(status.status.as_str().into()));
    if let Some(rotated_at) = &status.rotated_at {
        fields.insert("rotatedAt".into(), Value::String(rotated_at.clone()));
    }
    if let Some(revoked_at) = &status.revoked_at {
        fields.insert("revokedAt".into(), Value::String(revoked_at.clone()));
    }
    put_record(tx, kind, &status.tenant_id, &status.id, &record).await
}

async fn apply_events(
    tx: &mut Transaction<'_, Sqlite>,
    aggregate_kind: &str,
    append: &proxy_types::EventsAppendOp,
) -> Result<()> {
    let head_row = sqlx::query(
        "SELECT idx, chain_hash FROM events \
         WHERE tenant_id = ? AND aggregate_kind = ? AND aggregate_id = ? \
         ORDER BY idx DESC LIMIT 1",
    )
    .bind(&append.tenant_id)
    .bind(aggregate_kind)
    .bind(&append.aggregate_id)
    .fetch_optional(&mut **tx)
    .await?;

    let (next_idx, head) = match &head_row {
        Some(row) => (
            row.get::<i64, _>("idx") + 1,
            Some(row.get::<String, _>("chain_hash")),
        ),
        None => (0, None),
    };

    let incoming_prev = append.events[0].prev_chain_hash.clone();
    if head != incoming_prev {
        // Either this batch is already mirrored (its tail is the head), or
        // the mirror has diverged from the kernel.
        let tail = append.events.last().map(|e| e.chain_hash.clone());
        if head == tail {
            return Ok(());
        }
        return Err(anyhow!(
            "event stream divergence on {}/{}/{}: head {head:?}, incoming prev {incoming_prev:?}",
            append.tenant_id,
            aggregate_kind,
            append.aggregate_id,
        ));
    }

    for (offset, event) in append.events.iter().enumerate() {
        sqlx::query(
            "INSERT INTO events \
             (tenant_id, aggregate_kind, aggregate_id, idx, event, chain_hash) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&append.tenant_id)
        .bind(aggregate_kind)
        .bind(&append.aggregate_id)
        .bind(next_idx + offset as i64)
        .bind(serde_json::to_string(event)?)
        .bind(&event.chain_hash)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn apply_control(
    tx: &mut Transaction<'_, Sqlite>,
    control: &proxy_types::ControlEventOp,
) -> Result<()> {
    let event = &control.event;
    let canonical = to_canonical_string(&serde_json::to_value(event)?)?;
    let fresh = sqlx::query(
        "INSERT OR IGNORE INTO control_events (tenant_id, event_id, canonical) VALUES (?, ?, ?)",
    )
    .bind(&control.tenant_id)
    .bind(&event.event_id)
    .bind(&canonical)
    .execute(&mut **tx)
    .await?
    .rows_affected()
        == 1;
    if !fresh {
        return Ok(());
    }

    let targets: Vec<String> = if event.is_resume() {
        match &event.resume_of {
            Some(controls) => controls.clone(),
            None => {
                let rows = sqlx::query(
                    "SELECT control_type FROM control_states \
                     WHERE tenant_id = ? AND scope_type = ? AND scope_id = ? AND active = 1",
                )
                .bind(&control.tenant_id)
                .bind(&event.scope_type)
                .bind(&event.scope_id)
                .fetch_all(&mut **tx)
                .await?;
                rows.iter().map(|r| r.get("control_type")).collect()
            }
        }
    } else {
        vec![event.control_type.clone()]
    };
    let active = if event.is_resume() { 0 } else { 1 };

    for control_type in targets {
        sqlx::query(
            "INSERT INTO control_states \
             (tenant_id, scope_type, scope_id, control_type, active, revision, updated_at, last_event_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7) \
             ON CONFLICT (tenant_id, scope_type, scope_id, control_type) DO UPDATE SET \
             active = ?5, revision = control_states.revision + 1, updated_at = ?6, last_event_id = ?7",
        )
        .bind(&control.tenant_id)
        .bind(&event.scope_type)
        .bind(&event.scope_id)
        .bind(&control_type)
        .bind(active)
        .bind(&event.at)
        .bind(&event.event_id)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn apply_outbox_enqueue(
    tx: &mut Transaction<'_, Sqlite>,
    enqueue: &proxy_types::OutboxEnqueueOp,
    at: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO outbox_seq (tenant_id, next_seq) VALUES (?, 1) \
         ON CONFLICT (tenant_id) DO UPDATE SET next_seq = outbox_seq.next_seq + 1",
    )
    .bind(&enqueue.tenant_id)
    .execute(&mut **tx)
    .await?;
    let seq: i64 = sqlx::query("SELECT next_seq FROM outbox_seq WHERE tenant_id = ?")
        .bind(&enqueue.tenant_id)
        .fetch_one(&mut **tx)
        .await?
        .get("next_seq");

    let dedupe_key = enqueue.dedupe_key.clone().unwrap_or_else(|| {
        format!(
            "{}:{}:{}",
            enqueue.artifact.artifact_id, enqueue.artifact.artifact_hash, seq
        )
    });

    sqlx::query("INSERT OR REPLACE INTO artifacts (tenant_id, artifact_id, artifact) VALUES (?, ?, ?)")
        .bind(&enqueue.tenant_id)
        .bind(&enqueue.artifact.artifact_id)
        .bind(serde_json::to_string(&enqueue.artifact)?)
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "INSERT INTO outbox \
         (tenant_id, seq, scope_key, priority, dedupe_key, destination_ids, \
          artifact_id, artifact_type, artifact_hash, enqueued_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&enqueue.tenant_id)
    .bind(seq)
    .bind(&enqueue.scope_key)
    .bind(enqueue.priority)
    .bind(&dedupe_key)
    .bind(serde_json::to_string(&enqueue.destination_ids)?)
    .bind(&enqueue.artifact.artifact_id)
    .bind(&enqueue.artifact.artifact_type)
    .bind(&enqueue.artifact.artifact_hash)
    .bind(at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

//─────────────────────────────
//  Durable claim / lease
//─────────────────────────────

#[async_trait]
impl DeliveryBackend for SqliteMirror {
    async fn claim_due_deliveries(&self, query: ClaimQuery) -> Result<Vec<Delivery>> {
        let now = parse_iso(&query.now)?;
        let now_s = iso_millis(now);
        let reclaim_cutoff = iso_millis(now - Duration::seconds(RECLAIM_AFTER_SECS));

        let mut tx = self.pool.begin().await?;
        let rows = match &query.tenant_id {
            Some(tenant_id) => {
                sqlx::query(
                    "SELECT * FROM deliveries \
                     WHERE state = 'pending' AND next_attempt_at <= ?1 \
                       AND (claimed_at IS NULL OR claimed_at < ?2) AND tenant_id = ?3 \
                     ORDER BY scope_key, order_seq, priority, next_attempt_at, delivery_id \
                     LIMIT ?4",
                )
                .bind(&now_s)
                .bind(&reclaim_cutoff)
                .bind(tenant_id)
                .bind(query.max_messages as i64)
                .fetch_all(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM deliveries \
                     WHERE state = 'pending' AND next_attempt_at <= ?1 \
                       AND (claimed_at IS NULL OR claimed_at < ?2) \
                     ORDER BY scope_key, order_seq, priority, next_attempt_at, delivery_id \
                     LIMIT ?3",
                )
                .bind(&now_s)
                .bind(&reclaim_cutoff)
                .bind(query.max_messages as i64)
                .fetch_all(&mut *tx)
                .await?
            }
        };

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut delivery = decode_delivery(row)?;
            sqlx::query(
                "UPDATE deliveries SET claimed_at = ?, worker = ? \
                 WHERE tenant_id = ? AND delivery_id = ?",
            )
            .bind(&now_s)
            .bind(&query.worker)
            .bind(&delivery.tenant_id)
            .bind(&delivery.delivery_id)
            .execute(&mut *tx)
            .await?;
            delivery.claimed_at = Some(now_s.clone());
            delivery.worker = Some(query.worker.clone());
            claimed.push(delivery);
        }
        tx.commit().await?;
        Ok(claimed)
    }

    async fn update_delivery_attempt(&self, update: AttemptUpdate) -> Result<()> {
        let affected = sqlx::query(
            "UPDATE deliveries SET \
               state = ?, attempts = ?, \
               next_attempt_at = COALESCE(?, next_attempt_at), \
               last_status = ?, last_error = ?, \
               expires_at = COALESCE(?, expires_at), \
               delivered_at = COALESCE(?, delivered_at), \
               claimed_at = NULL, worker = NULL \
             WHERE tenant_id = ? AND delivery_id = ?",
        )
        .bind(update.state.as_str())
        .bind(update.attempts as i64)
        .bind(&update.next_attempt_at)
        .bind(update.last_status.map(|s| s as i64))
        .bind(&update.last_error)
        .bind(&update.expires_at)
        .bind(&update.delivered_at)
        .bind(&update.tenant_id)
        .bind(&update.delivery_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(anyhow!("unknown delivery {}", update.delivery_id));
        }
        Ok(())
    }

    async fn artifact(&self, tenant_id: &str, artifact_id: &str) -> Result<Option<ArtifactRecord>> {
        let row = sqlx::query("SELECT artifact FROM artifacts WHERE tenant_id = ? AND artifact_id = ?")
            .bind(tenant_id)
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| serde_json::from_str(r.get::<String, _>("artifact").as_str()))
            .transpose()
            .map_err(Into::into)
    }
}

//─────────────────────────────
//  Outbox drain
//─────────────────────────────

#[async_trait]
impl OutboxProcessor for SqliteMirror {
    async fn process_outbox(&self, max_messages: usize) -> Result<OutboxDrainReport> {
        let now = now_iso();
        let mut report = OutboxDrainReport::default();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            "SELECT * FROM outbox ORDER BY tenant_id, seq LIMIT ?",
        )
        .bind(max_messages as i64)
        .fetch_all(&mut *tx)
        .await?;

        for row in rows {
            let tenant_id: String = row.get("tenant_id");
            let seq: i64 = row.get("seq");
            let scope_key: String = row.get("scope_key");
            let priority: i64 = row.get("priority");
            let destination_ids: Vec<String> =
                serde_json::from_str(row.get::<String, _>("destination_ids").as_str())?;

            for destination_id in &destination_ids {
                let delivery_id = uuid::Uuid::new_v4().to_string();
                sqlx::query(
                    "INSERT INTO deliveries \
                     (tenant_id, delivery_id, scope_key, order_seq, priority, order_key, \
                      destination_id, artifact_id, artifact_type, artifact_hash, dedupe_key, \
                      state, attempts, next_attempt_at, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)",
                )
                .bind(&tenant_id)
                .bind(&delivery_id)
                .bind(&scope_key)
                .bind(seq)
                .bind(priority)
                .bind(Delivery::order_key_for(
                    &scope_key,
                    seq as u64,
                    priority,
                    &delivery_id,
                ))
                .bind(destination_id)
                .bind(row.get::<String, _>("artifact_id"))
                .bind(row.get::<String, _>("artifact_type"))
                .bind(row.get::<String, _>("artifact_hash"))
                .bind(row.get::<String, _>("dedupe_key"))
                .bind(&now)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                report.deliveries_created += 1;
            }

            sqlx::query("DELETE FROM outbox WHERE tenant_id = ? AND seq = ?")
                .bind(&tenant_id)
                .bind(seq)
                .execute(&mut *tx)
                .await?;
            report.drained += 1;
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn prune_expired_deliveries(&self, now: &str) -> Result<usize> {
        let affected = sqlx::query(
            "DELETE FROM deliveries \
             WHERE state IN ('delivered', 'failed') \
               AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected as usize)
    }
}

//─────────────────────────────
//  Agent paging
//─────────────────────────────

#[async_trait]
impl AgentDirectory for SqliteMirror {
    async fn tenants(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT tenant_id FROM records WHERE kind = ? ORDER BY tenant_id",
        )
        .bind(EntityKind::X402AgentLifecycles.table())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("tenant_id")).collect())
    }

    async fn active_agents(
        &self,
        tenant_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id FROM records \
             WHERE kind = ? AND tenant_id = ? \
               AND json_extract(record, '$.status') = 'active' \
             ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(EntityKind::X402AgentLifecycles.table())
        .bind(tenant_id)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}

//─────────────────────────────
//  Row decoding
//─────────────────────────────

fn decode_delivery(row: &sqlx::sqlite::SqliteRow) -> Result<Delivery> {
    let state = match row.get::<String, _>("state").as_str() {
        "pending" => DeliveryState::Pending,
        "delivered" => DeliveryState::Delivered,
        "failed" => DeliveryState::Failed,
        other => return Err(anyhow!("unknown delivery state {other}")),
    };
    Ok(Delivery {
        tenant_id: row.get("tenant_id"),
        delivery_id: row.get("delivery_id"),
        scope_key: row.get("scope_key"),
        order_seq: row.get::<i64, _>("order_seq") as u64,
        priority: row.get("priority"),
        order_key: row.get("order_key"),
        destination_id: row.get("destination_id"),
        artifact_id: row.get("artifact_id"),
        artifact_type: row.get("artifact_type"),
        artifact_hash: row.get("artifact_hash"),
        dedupe_key: row.get("dedupe_key"),
        state,
        attempts: row.get::<i64, _>("attempts") as u32,
        next_attempt_at: row.get("next_attempt_at"),
        claimed_at: row.get("claimed_at"),
        worker: row.get("worker"),
        last_status: row.get::<Option<i64>, _>("last_status").map(|s| s as u16),
        last_error: row.get("last_error"),
        expires_at: row.get("expires_at"),
        created_at: row.get("created_at"),
        delivered_at: row.get("delivered_at"),
    })
}
