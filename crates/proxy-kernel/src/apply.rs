//! The transaction applier: one typed batch in, whole-batch success or
//! whole-batch failure out.
//!
//! Dispatch is a single table keyed by the operation `kind`; each family has
//! one handler below. Handlers only read the operation and the `at`
//! timestamp of the batch, which keeps replay from the transaction log
//! deterministic.

use serde_json::Value;

use proxy_canonical::canonically_equal;
use proxy_types::{
    scoped_key, scoped_key3, CoreError, EntityKind, IdempotencyPutOp, ImmutablePutOp, IngestPutOp,
    KeyStatusOp, Op, OutboxEnqueueOp, OutboxMessage, UpsertOp,
};

use crate::state::{IdempotencyRecord, WorldState};
use crate::streams::{append_events, ReducerRegistry};
use crate::{control, ledger, KernelError};

/// Apply one operation to the state.
pub fn apply_op(
    state: &mut WorldState,
    reducers: &ReducerRegistry,
    op: &Op,
    at: &str,
) -> Result<(), KernelError> {
    if let Some((kind, upsert)) = op.upsert() {
        return apply_upsert(state, kind, upsert);
    }
    if let Some((kind, put)) = op.immutable_put() {
        return apply_immutable_put(state, kind, put);
    }
    if let Some((kind, append)) = op.events_append() {
        return Ok(append_events(state, reducers, kind, append)?);
    }
    match op {
        Op::SettlementPolicyUpserted(policy) => {
            let key = scoped_key(&policy.tenant_id, &policy.composite_id());
            state
                .table_mut(EntityKind::SettlementPolicies)
                .insert(key, policy.record.clone());
            Ok(())
        }
        Op::SignerKeyStatusSet(status) => {
            apply_key_status(state, EntityKind::SignerKeys, "signerKey", status)
        }
        Op::AuthKeyStatusSet(status) => {
            apply_key_status(state, EntityKind::AuthKeys, "authKey", status)
        }
        Op::EmergencyControlEventAppended(control_op) => {
            control::apply_control_event(state, control_op)
        }
        Op::LedgerEntryApplied(entry_op) => ledger::apply_entry(state, entry_op),
        Op::IdempotencyPut(put) => apply_idempotency(state, put, at),
        Op::OutboxEnqueued(enqueue) => apply_outbox_enqueue(state, enqueue, at),
        Op::IngestRecordsPut(ingest) => apply_ingest(state, ingest, at),
        // Covered by the family accessors above.
        _ => Ok(()),
    }
}

fn apply_upsert(
    state: &mut WorldState,
    kind: EntityKind,
    op: &UpsertOp,
) -> Result<(), KernelError> {
    let key = scoped_key(&op.tenant_id, &op.id);
    state.table_mut(kind).insert(key, op.record.clone());

    // Signer keys additionally maintain the public-key index.
    if kind == EntityKind::SignerKeys {
        if let Some(public_key) = op.record.get("publicKey").and_then(Value::as_str) {
            state
                .signer_key_index
                .insert(scoped_key(&op.tenant_id, public_key), op.id.clone());
        }
    }
    Ok(())
}

fn apply_immutable_put(
    state: &mut WorldState,
    kind: EntityKind,
    op: &ImmutablePutOp,
) -> Result<(), KernelError> {
    let key = scoped_key(&op.tenant_id, &op.id);
    if let Some(existing) = state.record(kind, &key) {
        // Adjustments conflict strictly; receipts and verification keys are
        // idempotent on a byte-identical canonical form.
        if kind == EntityKind::SettlementAdjustments {
            return Err(CoreError::AdjustmentAlreadyExists { id: op.id.clone() }.into());
        }
        if canonically_equal(existing, &op.record)? {
            return Ok(());
        }
        let conflict = match kind {
            EntityKind::X402Receipts => CoreError::ReceiptImmutable { id: op.id.clone() },
            _ => CoreError::ZkVerificationKeyImmutable { id: op.id.clone() },
        };
        return Err(conflict.into());
    }
    state.table_mut(kind).insert(key, op.record.clone());
    Ok(())
}

fn apply_key_status(
    state: &mut WorldState,
    kind: EntityKind,
    what: &str,
    op: &KeyStatusOp,
) -> Result<(), KernelError> {
    let key = scoped_key(&op.tenant_id, &op.id);
    let record = state
        .table_mut(kind)
        .get_mut(&key)
        .ok_or_else(|| CoreError::NotFound {
            what: what.to_string(),
            id: op.id.clone(),
        })?;
    let fields = record
        .as_object_mut()
        .ok_or_else(|| CoreError::validation(format!("{what} {} is not an object", op.id)))?;
    fields.insert("status".into(), Value::String(op.status.as_str().into()));
    if let Some(rotated_at) = &op.rotated_at {
        fields.insert("rotatedAt".into(), Value::String(rotated_at.clone()));
    }
    if let Some(revoked_at) = &op.revoked_at {
        fields.insert("revokedAt".into(), Value::String(revoked_at.clone()));
    }
    Ok(())
}

fn apply_idempotency(
    state: &mut WorldState,
    op: &IdempotencyPutOp,
    at: &str,
) -> Result<(), KernelError> {
    let key = scoped_key(&op.tenant_id, &op.key);
    if let Some(existing) = state.idempotency.get(&key) {
        if existing.fingerprint == op.fingerprint {
            // Same request replayed; the stored response stands.
            return Ok(());
        }
        return Err(CoreError::IdempotencyKeyConflict { key: op.key.clone() }.into());
    }
    state.idempotency.insert(
        key,
        IdempotencyRecord {
            fingerprint: op.fingerprint.clone(),
            response: op.response.clone(),
            created_at: at.to_string(),
        },
    );
    Ok(())
}

fn apply_outbox_enqueue(
    state: &mut WorldState,
    op: &OutboxEnqueueOp,
    at: &str,
) -> Result<(), KernelError> {
    let seq = {
        let counter = state.outbox_seq.entry(op.tenant_id.clone()).or_insert(0);
        *counter += 1;
        *counter
    };
    // The dedupe key must survive a crash-induced second fanout unchanged,
    // so a generated key is derived from stable inputs, never random.
    let dedupe_key = op.dedupe_key.clone().unwrap_or_else(|| {
        format!(
            "{}:{}:{}",
            op.artifact.artifact_id, op.artifact.artifact_hash, seq
        )
    });
    state.artifacts.insert(
        scoped_key(&op.tenant_id, &op.artifact.artifact_id),
        op.artifact.clone(),
    );
    state
        .outbox
        .entry(op.tenant_id.clone())
        .or_default()
        .push_back(OutboxMessage {
            tenant_id: op.tenant_id.clone(),
            seq,
            scope_key: op.scope_key.clone(),
            priority: op.priority,
            dedupe_key,
            destination_ids: op.destination_ids.clone(),
            artifact_id: op.artifact.artifact_id.clone(),
            artifact_type: op.artifact.artifact_type.clone(),
            artifact_hash: op.artifact.artifact_hash.clone(),
            enqueued_at: at.to_string(),
        });
    Ok(())
}

fn apply_ingest(state: &mut WorldState, op: &IngestPutOp, at: &str) -> Result<(), KernelError> {
    for record in &op.records {
        let key = scoped_key3(&op.tenant_id, &record.source, &record.external_event_id);
        if state.ingest.contains_key(&key) {
            // Duplicate by (tenantId, source, externalEventId); dropped.
            continue;
        }
        let mut stored = record.clone();
        if stored.received_at.is_none() {
            stored.received_at = Some(at.to_string());
        }
        state.ingest.insert(key, stored);
    }
    Ok(())
}
