#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-delivery** – The outbox-driven delivery worker.
//!
//! `tick_deliveries` leases due deliveries from whichever backend is
//! configured (the in-memory kernel or the relational mirror — both speak
//! the claim contract), groups them by scope for in-order single-flight
//! execution, dispatches webhook and S3 attempts, and records each outcome:
//! delivered, retried with exponential backoff and jitter, or dead-lettered
//! once the attempt budget is exhausted. Delivery is at-least-once; the
//! receiver contract is to dedupe on `x-proxy-dedupe-key`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use proxy_store_core::{AttemptUpdate, ClaimQuery, DeliveryBackend, MetricsSink, DELIVERY_WORKER};
use proxy_types::{
    iso_millis, now_iso, parse_iso, scoped_key, Delivery, DeliveryState, DestinationKind,
};

mod backoff;
mod destinations;
mod dispatch;
pub mod failpoint;
mod secrets;
mod sign;

pub use backoff::{backoff_delay_ms, jittered_delay_ms};
pub use destinations::{DestinationResolver, InMemoryDestinations};
pub use dispatch::{s3_object_key, strip_control_chars, AttemptOutcome, FailureReason};
pub use secrets::{resolve_source, SecretError, SecretsProvider, StaticSecretsProvider};
pub use sign::{hmac_sha256_hex, presign_put_url, PresignPut};

/// Hard cap on per-tick group concurrency.
pub const MAX_CONCURRENCY: usize = 50;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Worker tuning, fed from the environment by the runtime.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Name stamped on leases.
    pub worker_name: String,
    /// Attempt budget before the DLQ.
    pub max_attempts: u32,
    /// Backoff base.
    pub backoff_base_ms: u64,
    /// Backoff ceiling.
    pub backoff_max_ms: u64,
    /// Outbound HTTP timeout; 0 disables the timeout.
    pub http_timeout_ms: u64,
    /// Parallel scope groups per tick; capped at [`MAX_CONCURRENCY`].
    pub concurrency: usize,
    /// Retention for delivered rows, in days; 0 = keep forever.
    pub retention_delivered_days: u32,
    /// Retention for dead-lettered rows, in days; 0 = keep forever.
    pub retention_dlq_days: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_name: DELIVERY_WORKER.to_string(),
            max_attempts: 5,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            http_timeout_ms: 10_000,
            concurrency: 8,
            retention_delivered_days: 0,
            retention_dlq_days: 0,
        }
    }
}

/// Parameters for one tick.
#[derive(Debug, Clone, Default)]
pub struct TickOptions {
    /// Restrict to one tenant.
    pub tenant_id: Option<String>,
    /// Claim budget for the tick.
    pub max_messages: usize,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Deliveries leased this tick.
    pub claimed: usize,
    /// Attempts that landed.
    pub delivered: usize,
    /// Attempts that exhausted the budget or hit a non-retryable fault.
    pub failed: usize,
    /// Attempts rescheduled with backoff.
    pub retried: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.failed += other.failed;
        self.retried += other.retried;
    }
}

//─────────────────────────────
//  Worker
//─────────────────────────────

/// The delivery worker. Cheap to clone handles inside; construct once and
/// share.
pub struct DeliveryWorker {
    store: Arc<dyn DeliveryBackend>,
    destinations: Arc<dyn DestinationResolver>,
    secrets: Arc<dyn SecretsProvider>,
    metrics: MetricsSink,
    config: DeliveryConfig,
    http: reqwest::Client,
}

impl DeliveryWorker {
    /// Build a worker over a claim backend and the injected capabilities.
    pub fn new(
        store: Arc<dyn DeliveryBackend>,
        destinations: Arc<dyn DestinationResolver>,
        secrets: Arc<dyn SecretsProvider>,
        metrics: MetricsSink,
        config: DeliveryConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder();
        if config.http_timeout_ms > 0 {
            builder = builder.timeout(StdDuration::from_millis(config.http_timeout_ms));
        }
        Ok(Self {
            store,
            destinations,
            secrets,
            metrics,
            config,
            http: builder.build()?,
        })
    }

    /// The worker's configuration.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Claim due deliveries and run them: groups in parallel up to the
    /// concurrency cap, each group strictly in order.
    pub async fn tick_deliveries(&self, options: TickOptions) -> anyhow::Result<TickReport> {
        let claimed = self
            .store
            .claim_due_deliveries(ClaimQuery {
                tenant_id: options.tenant_id.clone(),
                max_messages: options.max_messages,
                worker: self.config.worker_name.clone(),
                now: now_iso(),
            })
            .await?;

        let mut report = TickReport {
            claimed: claimed.len(),
            ..TickReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(claimed = claimed.len(), "delivery tick claimed work");

        // Group by (tenantId, scopeKey); claims arrive sorted, so each
        // group's vec keeps per-scope order.
        let mut groups: BTreeMap<String, Vec<Delivery>> = BTreeMap::new();
        for delivery in claimed {
            groups
                .entry(scoped_key(&delivery.tenant_id, &delivery.scope_key))
                .or_default()
                .push(delivery);
        }

        let concurrency = self.config.concurrency.clamp(1, MAX_CONCURRENCY);
        let outcomes: Vec<TickReport> = stream::iter(groups.into_values())
            .map(|group| self.process_group(group))
            .buffer_unordered(concurrency)
            .collect()
            .await;
        for outcome in outcomes {
            report.absorb(outcome);
        }
        Ok(report)
    }

    /// Run one scope group sequentially.
    async fn process_group(&self, group: Vec<Delivery>) -> TickReport {
        let mut report = TickReport::default();
        for delivery in group {
            let outcome = self.attempt_one(&delivery).await;
            let label = outcome
                .destination_type
                .map(|kind| kind.as_str())
                .unwrap_or("unknown");
            self.metrics
                .incr("delivery_attempt_total", &[("destinationType", label)]);

            if !outcome.commit {
                // Failpoint simulated a crash after the side-effect: leave
                // the claim in place and record nothing.
                continue;
            }

            let update = self.outcome_update(&delivery, &outcome, label, &mut report);
            if let Err(err) = self.store.update_delivery_attempt(update).await {
                warn!(
                    delivery_id = %delivery.delivery_id,
                    error = %err,
                    "failed to record delivery attempt"
                );
            }
        }
        report
    }

    fn outcome_update(
        &self,
        delivery: &Delivery,
        outcome: &AttemptOutcome,
        label: &str,
        report: &mut TickReport,
    ) -> AttemptUpdate {
        let now = now_iso();
        let attempts = delivery.attempts + 1;

        if outcome.ok {
            self.metrics
                .incr("delivery_success_total", &[("destinationType", label)]);
            report.delivered += 1;
            return AttemptUpdate {
                tenant_id: delivery.tenant_id.clone(),
                delivery_id: delivery.delivery_id.clone(),
                state: DeliveryState::Delivered,
                attempts,
                next_attempt_at: None,
                last_status: outcome.status,
                last_error: None,
                expires_at: self.retention_for(DeliveryState::Delivered, &now),
                delivered_at: Some(now),
            };
        }

        self.metrics
            .incr("delivery_fail_total", &[("destinationType", label)]);
        let retryable = outcome.failure.map(|f| f.is_retryable()).unwrap_or(true);
        let exhausted = attempts >= self.config.max_attempts;

        if exhausted || !retryable {
            self.metrics
                .incr("delivery_dlq_total", &[("destinationType", label)]);
            report.failed += 1;
            AttemptUpdate {
                tenant_id: delivery.tenant_id.clone(),
                delivery_id: delivery.delivery_id.clone(),
                state: DeliveryState::Failed,
                attempts,
                next_attempt_at: None,
                last_status: outcome.status,
                last_error: outcome.failure.map(|f| f.as_str().to_string()),
                expires_at: self.retention_for(DeliveryState::Failed, &now),
                delivered_at: None,
            }
        } else {
            report.retried += 1;
            let delay = backoff_delay_ms(
                self.config.backoff_base_ms,
                self.config.backoff_max_ms,
                attempts,
            );
            let next_attempt_at = parse_iso(&now)
                .map(|t| iso_millis(t + Duration::milliseconds(delay as i64)))
                .unwrap_or_else(|_| now.clone());
            AttemptUpdate {
                tenant_id: delivery.tenant_id.clone(),
                delivery_id: delivery.delivery_id.clone(),
                state: DeliveryState::Pending,
                attempts,
                next_attempt_at: Some(next_attempt_at),
                last_status: outcome.status,
                last_error: outcome.failure.map(|f| f.as_str().to_string()),
                expires_at: None,
                delivered_at: None,
            }
        }
    }

    fn retention_for(&self, state: DeliveryState, now: &str) -> Option<String> {
        let days = match state {
            DeliveryState::Delivered => self.config.retention_delivered_days,
            DeliveryState::Failed => self.config.retention_dlq_days,
            DeliveryState::Pending => 0,
        };
        if days == 0 {
            return None;
        }
        parse_iso(now)
            .ok()
            .map(|t| iso_millis(t + Duration::days(days as i64)))
    }

    /// Resolve destination and artifact, then dispatch by destination kind.
    async fn attempt_one(&self, delivery: &Delivery) -> AttemptOutcome {
        let destination = match self
            .destinations
            .resolve(&delivery.tenant_id, &delivery.destination_id)
            .await
        {
            Ok(Some(destination)) => destination,
            Ok(None) => {
                return AttemptOutcome::failure(
                    FailureReason::UnknownDestination,
                    format!("destination {} is not registered", delivery.destination_id),
                    None,
                    None,
                )
            }
            Err(err) => {
                return AttemptOutcome::failure(FailureReason::Exception, err.to_string(), None, None)
            }
        };

        let artifact = match self
            .store
            .artifact(&delivery.tenant_id, &delivery.artifact_id)
            .await
        {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                return AttemptOutcome::failure(
                    FailureReason::MissingArtifact,
                    format!("artifact {} is gone", delivery.artifact_id),
                    None,
                    Some(destination.kind),
                )
            }
            Err(err) => {
                return AttemptOutcome::failure(
                    FailureReason::Exception,
                    err.to_string(),
                    None,
                    Some(destination.kind),
                )
            }
        };

        match destination.kind {
            DestinationKind::Webhook => match &destination.webhook {
                Some(webhook) => {
                    dispatch::dispatch_webhook(
                        &self.http,
                        delivery,
                        webhook,
                        &artifact,
                        self.secrets.as_ref(),
                    )
                    .await
                }
                None => AttemptOutcome::failure(
                    FailureReason::Exception,
                    "webhook destination has no webhook settings",
                    None,
                    Some(DestinationKind::Webhook),
                ),
            },
            DestinationKind::S3 => match &destination.s3 {
                Some(s3) => {
                    dispatch::dispatch_s3(
                        &self.http,
                        delivery,
                        s3,
                        &artifact,
                        self.secrets.as_ref(),
                    )
                    .await
                }
                None => AttemptOutcome::failure(
                    FailureReason::Exception,
                    "s3 destination has no s3 settings",
                    None,
                    Some(DestinationKind::S3),
                ),
            },
        }
    }
}
