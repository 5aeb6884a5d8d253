//! End-to-end kernel behaviour: batch atomicity, optimistic concurrency on
//! stream heads, journal replay equivalence and the in-memory claim/lease
//! semantics.

use std::sync::Arc;

use serde_json::json;

use proxy_canonical::{event_chain_hash, to_canonical_string};
use proxy_kernel::Kernel;
use proxy_store_core::{
    AgentDirectory, ClaimQuery, DeliveryBackend, OutboxProcessor, DELIVERY_WORKER,
};
use proxy_txlog::TxLog;
use proxy_types::{
    now_iso, AggregateKind, ArtifactRecord, EventRecord, EventsAppendOp, Op, OutboxEnqueueOp,
    UpsertOp,
};

fn upsert(id: &str, record: serde_json::Value) -> Op {
    Op::RobotUpserted(UpsertOp {
        tenant_id: "default".into(),
        id: id.into(),
        record,
    })
}

fn chained_event(event_id: &str, prev: Option<&str>, data: serde_json::Value) -> EventRecord {
    let mut body = json!({
        "eventId": event_id,
        "type": "job.updated",
        "at": "2026-08-01T00:00:00.000Z",
        "data": data,
        "prevChainHash": prev,
    });
    let chain_hash = event_chain_hash(&body).unwrap();
    body["chainHash"] = json!(chain_hash);
    serde_json::from_value(body).unwrap()
}

fn append_op(aggregate_id: &str, events: Vec<EventRecord>) -> Op {
    Op::JobEventsAppended(EventsAppendOp {
        tenant_id: "default".into(),
        aggregate_id: aggregate_id.into(),
        events,
    })
}

#[tokio::test]
async fn batch_failure_leaves_no_partial_state() {
    let kernel = Kernel::new();
    let bad = vec![
        upsert("r1", json!({"model": "arm-7"})),
        // Opens a stream twice inside one batch: the second append's head
        // check fails, which must roll back the first upsert too.
        append_op("j1", vec![chained_event("e1", None, json!({}))]),
        append_op("j1", vec![chained_event("e2", None, json!({}))]),
    ];
    let err = kernel.apply(bad).await.unwrap_err();
    assert_eq!(err.code(), "PREV_CHAIN_HASH_MISMATCH");

    assert!(kernel
        .record(proxy_types::EntityKind::Robots, "default", "r1")
        .await
        .is_none());
    assert!(kernel
        .events(AggregateKind::Job, "default", "j1")
        .await
        .is_empty());
}

#[tokio::test]
async fn concurrent_appends_race_on_the_head() {
    let kernel = Arc::new(Kernel::new());
    kernel
        .apply(vec![append_op("j1", vec![chained_event("e0", None, json!({}))])])
        .await
        .unwrap();
    let head = kernel.events(AggregateKind::Job, "default", "j1").await[0]
        .chain_hash
        .clone();

    // Two appenders built against the same head; exactly one wins.
    let batch_a = append_op("j1", vec![chained_event("ea", Some(&head), json!({"w": "a"}))]);
    let batch_b = append_op("j1", vec![chained_event("eb", Some(&head), json!({"w": "b"}))]);

    let (ra, rb) = tokio::join!(
        {
            let kernel = Arc::clone(&kernel);
            async move { kernel.apply(vec![batch_a]).await }
        },
        {
            let kernel = Arc::clone(&kernel);
            async move { kernel.apply(vec![batch_b]).await }
        }
    );

    let outcomes = [ra.is_ok(), rb.is_ok()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
    let loser = if ra.is_ok() { rb } else { ra };
    assert_eq!(loser.unwrap_err().code(), "PREV_CHAIN_HASH_MISMATCH");
    assert_eq!(kernel.events(AggregateKind::Job, "default", "j1").await.len(), 2);
}

#[tokio::test]
async fn journal_replay_reproduces_the_store_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let txlog = Arc::new(TxLog::open(dir.path().join("tx.log")).unwrap());

    let live = Kernel::new().with_txlog(Arc::clone(&txlog));
    live.apply(vec![upsert("r1", json!({"model": "arm-7"}))])
        .await
        .unwrap();
    let e1 = chained_event("e1", None, json!({"status": "created"}));
    let follow = chained_event("e2", Some(&e1.chain_hash), json!({"status": "assigned"}));
    live.apply(vec![append_op("j1", vec![e1, follow])]).await.unwrap();
    live.apply(vec![Op::OutboxEnqueued(OutboxEnqueueOp {
        tenant_id: "default".into(),
        scope_key: "jobs/j1".into(),
        priority: 0,
        dedupe_key: None,
        destination_ids: vec!["hooks".into()],
        artifact: ArtifactRecord {
            artifact_id: "a1".into(),
            artifact_type: "invoice".into(),
            artifact_hash: "h1".into(),
            body: json!({"total": 7}),
        },
    })])
    .await
    .unwrap();

    let rebuilt = Kernel::new();
    let records = TxLog::load(txlog.path()).unwrap();
    assert_eq!(rebuilt.replay(&records).await.unwrap(), 3);

    let live_dump = to_canonical_string(&live.dump().await.unwrap()).unwrap();
    let rebuilt_dump = to_canonical_string(&rebuilt.dump().await.unwrap()).unwrap();
    assert_eq!(live_dump, rebuilt_dump);
}

#[tokio::test]
async fn claim_is_exclusive_within_the_reclaim_window() {
    let kernel = Kernel::new();
    kernel
        .apply(vec![Op::OutboxEnqueued(OutboxEnqueueOp {
            tenant_id: "default".into(),
            scope_key: "jobs/j1".into(),
            priority: 0,
            dedupe_key: None,
            destination_ids: vec!["hooks".into()],
            artifact: ArtifactRecord {
                artifact_id: "a1".into(),
                artifact_type: "invoice".into(),
                artifact_hash: "h1".into(),
                body: json!({}),
            },
        })])
        .await
        .unwrap();
    let report = kernel.process_outbox(16).await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.deliveries_created, 1);

    let claim = |now: String| ClaimQuery {
        tenant_id: None,
        max_messages: 10,
        worker: DELIVERY_WORKER.into(),
        now,
    };

    let first = kernel.claim_due_deliveries(claim(now_iso())).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].worker.as_deref(), Some(DELIVERY_WORKER));

    // Within the reclaim window the same row is not handed out again.
    let second = kernel.claim_due_deliveries(claim(now_iso())).await.unwrap();
    assert!(second.is_empty());

    // Once the lease goes stale (61 s later), the row is reclaimable.
    let later = proxy_types::iso_millis(
        proxy_types::parse_iso(&now_iso()).unwrap() + chrono::Duration::seconds(61),
    );
    let third = kernel.claim_due_deliveries(claim(later)).await.unwrap();
    assert_eq!(third.len(), 1);
}

#[tokio::test]
async fn agent_directory_pages_active_agents() {
    let kernel = Kernel::new();
    let mut ops = Vec::new();
    for tenant in ["a", "b"] {
        for n in 0..3 {
            let status = if n == 1 { "wound_down" } else { "active" };
            ops.push(Op::X402AgentLifecycleUpserted(UpsertOp {
                tenant_id: tenant.into(),
                id: format!("agent-{n}"),
                record: json!({"status": status}),
            }));
        }
    }
    kernel.apply(ops).await.unwrap();

    assert_eq!(kernel.tenants().await.unwrap(), vec!["a", "b"]);
    assert_eq!(
        kernel.active_agents("a", 0, 10).await.unwrap(),
        vec!["agent-0", "agent-2"]
    );
    assert_eq!(
        kernel.active_agents("a", 1, 10).await.unwrap(),
        vec!["agent-2"]
    );
}
