//! Relational mirror behaviour: idempotent batch apply, durable claim/lease
//! semantics, outbox fanout in SQL.

use proxy_store_core::{
    AgentDirectory, AttemptUpdate, ClaimQuery, DeliveryBackend, MirrorStore, OutboxProcessor,
    DELIVERY_WORKER,
};
use proxy_store_sqlite::SqliteMirror;
use proxy_types::{
    now_iso, ArtifactRecord, DeliveryState, EntityKind, Op, OutboxEnqueueOp, UpsertOp,
};
use serde_json::json;

fn upsert(tenant: &str, id: &str, record: serde_json::Value) -> Op {
    Op::RobotUpserted(UpsertOp {
        tenant_id: tenant.into(),
        id: id.into(),
        record,
    })
}

fn enqueue(tenant: &str, scope: &str, artifact_id: &str) -> Op {
    Op::OutboxEnqueued(OutboxEnqueueOp {
        tenant_id: tenant.into(),
        scope_key: scope.into(),
        priority: 0,
        dedupe_key: None,
        destination_ids: vec!["hooks".into()],
        artifact: ArtifactRecord {
            artifact_id: artifact_id.into(),
            artifact_type: "invoice".into(),
            artifact_hash: "h1".into(),
            body: json!({"total": 9}),
        },
    })
}

#[tokio::test]
async fn batch_apply_is_idempotent_by_content() {
    let mirror = SqliteMirror::in_memory().await.unwrap();
    let at = "2026-08-01T00:00:00.000Z";
    let ops = vec![
        upsert("default", "r1", json!({"model": "arm-7"})),
        enqueue("default", "jobs/j1", "a1"),
    ];

    mirror.apply_batch(at, &ops).await.unwrap();
    // A crash-replay of the same journalled batch must not double-apply.
    mirror.apply_batch(at, &ops).await.unwrap();

    let record = mirror
        .record(EntityKind::Robots, "default", "r1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record["model"], "arm-7");

    let report = mirror.process_outbox(16).await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.deliveries_created, 1);
}

#[tokio::test]
async fn outbox_fanout_creates_one_delivery_per_destination() {
    let mirror = SqliteMirror::in_memory().await.unwrap();
    let op = Op::OutboxEnqueued(OutboxEnqueueOp {
        tenant_id: "default".into(),
        scope_key: "jobs/j1".into(),
        priority: 2,
        dedupe_key: Some("dk-1".into()),
        destination_ids: vec!["hooks".into(), "archive".into()],
        artifact: ArtifactRecord {
            artifact_id: "a1".into(),
            artifact_type: "invoice".into(),
            artifact_hash: "h1".into(),
            body: json!({}),
        },
    });
    mirror.apply_batch("2026-08-01T00:00:00.000Z", &[op]).await.unwrap();

    let report = mirror.process_outbox(16).await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.deliveries_created, 2);

    let claimed = mirror
        .claim_due_deliveries(ClaimQuery {
            tenant_id: Some("default".into()),
            max_messages: 10,
            worker: DELIVERY_WORKER.into(),
            now: now_iso(),
        })
        .await
        .unwrap();
    assert_eq!(claimed.len(), 2);
    for delivery in &claimed {
        assert_eq!(delivery.dedupe_key, "dk-1");
        assert_eq!(delivery.order_seq, 1);
        assert_eq!(delivery.worker.as_deref(), Some(DELIVERY_WORKER));
    }
    // The artifact rides along in the same transaction as the outbox row.
    assert!(mirror.artifact("default", "a1").await.unwrap().is_some());
}

#[tokio::test]
async fn reclaim_window_blocks_second_claim() {
    let mirror = SqliteMirror::in_memory().await.unwrap();
    mirror
        .apply_batch("2026-08-01T00:00:00.000Z", &[enqueue("default", "s", "a1")])
        .await
        .unwrap();
    mirror.process_outbox(16).await.unwrap();

    let claim = |now: String| ClaimQuery {
        tenant_id: None,
        max_messages: 10,
        worker: DELIVERY_WORKER.into(),
        now,
    };
    let first = mirror.claim_due_deliveries(claim(now_iso())).await.unwrap();
    assert_eq!(first.len(), 1);
    let again = mirror.claim_due_deliveries(claim(now_iso())).await.unwrap();
    assert!(again.is_empty());

    let later = proxy_types::iso_millis(
        proxy_types::parse_iso(&now_iso()).unwrap() + chrono::Duration::seconds(61),
    );
    let reclaimed = mirror.claim_due_deliveries(claim(later)).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
}

#[tokio::test]
async fn attempt_update_transitions_and_releases_the_lease() {
    let mirror = SqliteMirror::in_memory().await.unwrap();
    mirror
        .apply_batch("2026-08-01T00:00:00.000Z", &[enqueue("default", "s", "a1")])
        .await
        .unwrap();
    mirror.process_outbox(16).await.unwrap();
    let claimed = mirror
        .claim_due_deliveries(ClaimQuery {
            tenant_id: None,
            max_messages: 1,
            worker: DELIVERY_WORKER.into(),
            now: now_iso(),
        })
        .await
        .unwrap();
    let delivery = &claimed[0];

    mirror
        .update_delivery_attempt(AttemptUpdate {
            tenant_id: delivery.tenant_id.clone(),
            delivery_id: delivery.delivery_id.clone(),
            state: DeliveryState::Delivered,
            attempts: 1,
            next_attempt_at: None,
            last_status: Some(200),
            last_error: None,
            expires_at: Some("2026-09-01T00:00:00.000Z".into()),
            delivered_at: Some(now_iso()),
        })
        .await
        .unwrap();

    let stored = mirror
        .delivery(&delivery.tenant_id, &delivery.delivery_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, DeliveryState::Delivered);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.last_status, Some(200));
    assert!(stored.claimed_at.is_none());
    assert!(stored.worker.is_none());

    // Terminal + past retention: pruned.
    let pruned = mirror
        .prune_expired_deliveries("2026-09-02T00:00:00.000Z")
        .await
        .unwrap();
    assert_eq!(pruned, 1);
}

#[tokio::test]
async fn agent_directory_reads_lifecycle_records() {
    let mirror = SqliteMirror::in_memory().await.unwrap();
    let mut ops = Vec::new();
    for (tenant, id, status) in [
        ("b", "agent-1", "active"),
        ("a", "agent-1", "active"),
        ("a", "agent-2", "frozen"),
        ("a", "agent-3", "active"),
    ] {
        ops.push(Op::X402AgentLifecycleUpserted(UpsertOp {
            tenant_id: tenant.into(),
            id: id.into(),
            record: json!({"status": status}),
        }));
    }
    mirror.apply_batch("2026-08-01T00:00:00.000Z", &ops).await.unwrap();

    assert_eq!(mirror.tenants().await.unwrap(), vec!["a", "b"]);
    assert_eq!(
        mirror.active_agents("a", 0, 10).await.unwrap(),
        vec!["agent-1", "agent-3"]
    );
    assert_eq!(mirror.active_agents("a", 1, 1).await.unwrap(), vec!["agent-3"]);
}
