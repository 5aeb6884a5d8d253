//! Delivery worker end-to-end behaviour against live HTTP receivers.

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use proxy_delivery::{
    failpoint, DeliveryConfig, DeliveryWorker, DestinationResolver, InMemoryDestinations,
    StaticSecretsProvider, TickOptions,
};
use proxy_kernel::Kernel;
use proxy_store_core::{AttemptUpdate, DeliveryBackend, MetricsSink, OutboxProcessor};
use proxy_types::{
    now_iso, parse_iso, ArtifactRecord, Delivery, DeliveryState, Destination, DestinationKind,
    Op, OutboxEnqueueOp, S3Destination, SecretSource, WebhookDestination,
};

struct Harness {
    kernel: Arc<Kernel>,
    worker: DeliveryWorker,
    destinations: Arc<InMemoryDestinations>,
    metrics: MetricsSink,
}

fn harness(config: DeliveryConfig) -> Harness {
    let kernel = Arc::new(Kernel::new());
    let destinations = Arc::new(InMemoryDestinations::new());
    let secrets = Arc::new(
        StaticSecretsProvider::new().with_secret("vault://hook", "wh-secret"),
    );
    let metrics = MetricsSink::new();
    let worker = DeliveryWorker::new(
        Arc::clone(&kernel) as Arc<dyn DeliveryBackend>,
        Arc::clone(&destinations) as Arc<dyn DestinationResolver>,
        secrets,
        metrics.clone(),
        config,
    )
    .unwrap();
    Harness {
        kernel,
        worker,
        destinations,
        metrics,
    }
}

fn webhook_destination(id: &str, url: String) -> Destination {
    Destination {
        destination_id: id.into(),
        kind: DestinationKind::Webhook,
        webhook: Some(WebhookDestination {
            url,
            secret: Some(SecretSource::reference("vault://hook")),
        }),
        s3: None,
    }
}

async fn enqueue(kernel: &Kernel, scope: &str, artifact_id: &str, destination: &str) {
    kernel
        .apply(vec![Op::OutboxEnqueued(OutboxEnqueueOp {
            tenant_id: "default".into(),
            scope_key: scope.into(),
            priority: 0,
            dedupe_key: None,
            destination_ids: vec![destination.into()],
            artifact: ArtifactRecord {
                artifact_id: artifact_id.into(),
                artifact_type: "invoice".into(),
                artifact_hash: "h1".into(),
                body: json!({"artifact": artifact_id, "total": 12}),
            },
        })])
        .await
        .unwrap();
    kernel.process_outbox(64).await.unwrap();
}

async fn force_due(kernel: &Kernel, delivery: &Delivery) {
    kernel
        .update_delivery_attempt(AttemptUpdate {
            tenant_id: delivery.tenant_id.clone(),
            delivery_id: delivery.delivery_id.clone(),
            state: DeliveryState::Pending,
            attempts: delivery.attempts,
            next_attempt_at: Some(now_iso()),
            last_status: delivery.last_status,
            last_error: delivery.last_error.clone(),
            expires_at: None,
            delivered_at: None,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn webhook_retry_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DeliveryConfig::default());
    h.destinations
        .put("default", webhook_destination("hooks", format!("{}/hook", server.uri())));
    enqueue(&h.kernel, "jobs/j1", "a1", "hooks").await;

    let before = parse_iso(&now_iso()).unwrap();
    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.retried, 1);

    let delivery = h.kernel.deliveries("default").await.remove(0);
    assert_eq!(delivery.state, DeliveryState::Pending);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.last_status, Some(500));
    assert_eq!(delivery.last_error.as_deref(), Some("non_2xx"));

    // First retry lands in the documented backoff envelope.
    let next = parse_iso(&delivery.next_attempt_at).unwrap();
    let delay_ms = (next - before).num_milliseconds();
    assert!(
        (800..=3_000).contains(&delay_ms),
        "unexpected backoff {delay_ms} ms"
    );

    force_due(&h.kernel, &delivery).await;
    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.delivered, 1);

    let delivery = h.kernel.deliveries("default").await.remove(0);
    assert_eq!(delivery.state, DeliveryState::Delivered);
    assert_eq!(delivery.attempts, 2);
    assert_eq!(delivery.last_status, Some(200));
    assert!(delivery.last_error.is_none());
    assert!(delivery.delivered_at.is_some());

    assert_eq!(
        h.metrics.get("delivery_attempt_total", &[("destinationType", "webhook")]),
        2
    );
    assert_eq!(
        h.metrics.get("delivery_success_total", &[("destinationType", "webhook")]),
        1
    );

    // Receiver saw the full signed header set.
    let requests = server.received_requests().await.unwrap();
    let first = &requests[0];
    for header in [
        "x-proxy-dedupe-key",
        "x-proxy-delivery-id",
        "x-proxy-artifact-type",
        "x-proxy-artifact-id",
        "x-proxy-artifact-hash",
        "x-proxy-order-key",
        "x-proxy-timestamp",
        "x-proxy-signature",
    ] {
        assert!(first.headers.get(header).is_some(), "missing {header}");
    }
    // Canonical body: sorted members.
    let body = String::from_utf8(first.body.clone()).unwrap();
    assert_eq!(body, r#"{"artifact":"a1","total":12}"#);
}

#[tokio::test]
async fn always_failing_receiver_hits_the_dlq() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let h = harness(DeliveryConfig {
        max_attempts: 2,
        retention_dlq_days: 30,
        ..DeliveryConfig::default()
    });
    h.destinations
        .put("default", webhook_destination("hooks", format!("{}/hook", server.uri())));
    enqueue(&h.kernel, "jobs/j1", "a1", "hooks").await;

    h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    let delivery = h.kernel.deliveries("default").await.remove(0);
    force_due(&h.kernel, &delivery).await;
    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.failed, 1);

    let delivery = h.kernel.deliveries("default").await.remove(0);
    assert_eq!(delivery.state, DeliveryState::Failed);
    assert_eq!(delivery.attempts, 2);
    // DLQ retention stamped ~30 days out.
    let expiry = parse_iso(delivery.expires_at.as_deref().unwrap()).unwrap();
    let days = (expiry - parse_iso(&now_iso()).unwrap()).num_days();
    assert!((29..=30).contains(&days), "retention {days} days");

    assert_eq!(
        h.metrics.get("delivery_dlq_total", &[("destinationType", "webhook")]),
        1
    );
    assert_eq!(
        h.metrics.get("delivery_fail_total", &[("destinationType", "webhook")]),
        2
    );
}

#[tokio::test]
async fn same_scope_deliveries_post_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DeliveryConfig {
        concurrency: 50,
        ..DeliveryConfig::default()
    });
    h.destinations
        .put("default", webhook_destination("hooks", format!("{}/hook", server.uri())));
    enqueue(&h.kernel, "jobs/j1", "a1", "hooks").await;
    enqueue(&h.kernel, "jobs/j1", "a2", "hooks").await;

    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.delivered, 2);

    let requests = server.received_requests().await.unwrap();
    let order: Vec<String> = requests
        .iter()
        .map(|r| {
            r.headers
                .get("x-proxy-artifact-id")
                .unwrap()
                .to_str()
                .unwrap()
                .to_string()
        })
        .collect();
    // orderSeq 1 before orderSeq 2, even with 50-way group concurrency.
    assert_eq!(order, vec!["a1", "a2"]);
}

#[tokio::test]
async fn unknown_destination_dead_letters_without_retry() {
    let h = harness(DeliveryConfig::default());
    enqueue(&h.kernel, "jobs/j1", "a1", "nowhere").await;

    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 0);

    let delivery = h.kernel.deliveries("default").await.remove(0);
    assert_eq!(delivery.state, DeliveryState::Failed);
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.last_error.as_deref(), Some("unknown_destination"));
}

#[tokio::test]
async fn secret_failures_are_classified() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(DeliveryConfig::default());
    let mut destination = webhook_destination("hooks", format!("{}/hook", server.uri()));
    destination.webhook.as_mut().unwrap().secret =
        Some(SecretSource::reference("vault://absent"));
    h.destinations.put("default", destination);
    enqueue(&h.kernel, "jobs/j1", "a1", "hooks").await;

    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    // secret_not_found is retryable; no bytes left the process.
    assert_eq!(report.retried, 1);
    let delivery = h.kernel.deliveries("default").await.remove(0);
    assert_eq!(delivery.last_error.as_deref(), Some("secret_not_found"));
    assert_eq!(delivery.last_status, None);
}

#[tokio::test]
async fn s3_put_uses_a_presigned_url() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/artifacts/tenants/default/artifacts/invoice/a1_h1\.json$"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DeliveryConfig::default());
    h.destinations.put(
        "default",
        Destination {
            destination_id: "archive".into(),
            kind: DestinationKind::S3,
            webhook: None,
            s3: Some(S3Destination {
                endpoint: server.uri(),
                region: "us-east-1".into(),
                bucket: "artifacts".into(),
                prefix: None,
                access_key_id: SecretSource::inline("ak"),
                secret_access_key: SecretSource::inline("sk"),
                force_path_style: true,
            }),
        },
    );
    enqueue(&h.kernel, "jobs/j1", "a1", "archive").await;

    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(
        h.metrics.get("delivery_success_total", &[("destinationType", "s3")]),
        1
    );

    let requests = server.received_requests().await.unwrap();
    let query = requests[0].url.query().unwrap_or_default();
    assert!(query.contains("X-Amz-Algorithm=AWS4-HMAC-SHA256"));
    assert!(query.contains("X-Amz-Signature="));
    assert!(query.contains("X-Amz-Expires=300"));
}

#[tokio::test]
async fn failpoint_crash_forces_duplicate_with_same_dedupe_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let h = harness(DeliveryConfig::default());
    h.destinations
        .put("default", webhook_destination("hooks", format!("{}/hook", server.uri())));
    enqueue(&h.kernel, "jobs/j1", "a1", "hooks").await;

    // Simulated crash: POST lands, the state transition never happens.
    failpoint::set(failpoint::WEBHOOK_AFTER_POST, || {
        failpoint::FailpointAction::SkipCommit
    });
    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    failpoint::clear(failpoint::WEBHOOK_AFTER_POST);
    assert_eq!(report.delivered, 0);

    let delivery = h.kernel.deliveries("default").await.remove(0);
    assert_eq!(delivery.state, DeliveryState::Pending);
    assert_eq!(delivery.attempts, 0);
    assert!(delivery.claimed_at.is_some(), "lease survives the crash");

    // Recovery: the lease is released (as the reclaim window would) and the
    // delivery goes out again.
    force_due(&h.kernel, &delivery).await;
    let report = h.worker.tick_deliveries(TickOptions { tenant_id: None, max_messages: 10 }).await.unwrap();
    assert_eq!(report.delivered, 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let dedupe: Vec<&str> = requests
        .iter()
        .map(|r| r.headers.get("x-proxy-dedupe-key").unwrap().to_str().unwrap())
        .collect();
    // At-least-once: the receiver dedupes on the identical key.
    assert_eq!(dedupe[0], dedupe[1]);
}
