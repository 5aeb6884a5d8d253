//! Outbox, delivery and destination records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ensure_id;
use crate::error::CoreError;

//─────────────────────────────
//  Artifacts
//─────────────────────────────

/// A signed artifact addressed by `(artifactId, artifactHash)`. The body is
/// canonicalized before signing and before every outbound dispatch, so the
/// bytes a receiver sees are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    /// Artifact identifier.
    pub artifact_id: String,
    /// Application-defined artifact family, e.g. `invoice` or `proof`.
    pub artifact_type: String,
    /// Hash of the canonical body.
    pub artifact_hash: String,
    /// Artifact content.
    pub body: Value,
}

impl ArtifactRecord {
    /// Validate identifier fields.
    pub fn validate(&self) -> Result<(), CoreError> {
        ensure_id("artifactId", &self.artifact_id)?;
        ensure_id("artifactType", &self.artifact_type)?;
        ensure_id("artifactHash", &self.artifact_hash)
    }
}

//─────────────────────────────
//  Outbox
//─────────────────────────────

/// A durably enqueued outbound message, written in the same transaction as
/// the state mutation that produced it. `seq` is monotonic per tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    /// Tenant scope.
    pub tenant_id: String,
    /// Monotonic sequence within the tenant.
    pub seq: u64,
    /// Serialization boundary for the deliveries this fans out to.
    pub scope_key: String,
    /// Delivery priority (lower sorts earlier within a scope).
    pub priority: i64,
    /// Receiver-side idempotency key.
    pub dedupe_key: String,
    /// Destinations to fan out to.
    pub destination_ids: Vec<String>,
    /// Artifact identifier.
    pub artifact_id: String,
    /// Artifact family.
    pub artifact_type: String,
    /// Artifact content hash.
    pub artifact_hash: String,
    /// Enqueue time.
    pub enqueued_at: String,
}

//─────────────────────────────
//  Deliveries
//─────────────────────────────

/// Terminal and in-flight delivery states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DeliveryState {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryState {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

/// One attempt-tracked delivery of an artifact to a destination.
///
/// At most one delivery per `(tenantId, scopeKey)` is in flight at a time;
/// within a scope, deliveries are processed in `(orderSeq, priority,
/// deliveryId)` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    /// Tenant scope.
    pub tenant_id: String,
    /// Delivery identifier.
    pub delivery_id: String,
    /// Serialization boundary.
    pub scope_key: String,
    /// Position within the scope (the outbox sequence that produced it).
    pub order_seq: u64,
    /// Priority within the scope; lower runs earlier.
    pub priority: i64,
    /// Stable composite sort key, computed once at creation.
    pub order_key: String,
    /// Destination to dispatch to.
    pub destination_id: String,
    /// Artifact identifier.
    pub artifact_id: String,
    /// Artifact family.
    pub artifact_type: String,
    /// Artifact content hash.
    pub artifact_hash: String,
    /// Receiver-side idempotency key.
    pub dedupe_key: String,
    /// Current state.
    pub state: DeliveryState,
    /// Attempts made so far.
    pub attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: String,
    /// Lease acquisition time; `None` when unclaimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<String>,
    /// Worker holding the lease.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    /// HTTP status of the last attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<u16>,
    /// Failure classification of the last attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Retention deadline once terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Creation time.
    pub created_at: String,
    /// Success time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<String>,
}

impl Delivery {
    /// Compute the stable composite order key. Newlines keep the components
    /// separable; the outbound header copy strips control characters. The key
    /// is written once at creation and never mutated — claim ordering sorts
    /// on the typed fields, not on this string.
    pub fn order_key_for(
        scope_key: &str,
        order_seq: u64,
        priority: i64,
        delivery_id: &str,
    ) -> String {
        format!("{scope_key}\n{order_seq}\n{priority}\n{delivery_id}")
    }
}

//─────────────────────────────
//  Destinations
//─────────────────────────────

/// Where a secret comes from: inline, or an opaque reference resolved by the
/// secrets provider at dispatch time. Secret values are never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    /// Inline value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Provider reference.
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl SecretSource {
    /// An inline secret.
    pub fn inline(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            secret_ref: None,
        }
    }

    /// A provider-resolved secret.
    pub fn reference(r: impl Into<String>) -> Self {
        Self {
            value: None,
            secret_ref: Some(r.into()),
        }
    }
}

/// Destination kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum DestinationKind {
    Webhook,
    S3,
}

impl DestinationKind {
    /// Metric label value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::S3 => "s3",
        }
    }
}

/// Webhook destination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDestination {
    /// Receiver URL.
    pub url: String,
    /// HMAC signing secret.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretSource>,
}

/// S3-compatible object-store destination settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Destination {
    /// Service endpoint, e.g. `https://s3.us-east-1.amazonaws.com`.
    pub endpoint: String,
    /// Signing region.
    pub region: String,
    /// Target bucket.
    pub bucket: String,
    /// Optional key prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Access key id.
    pub access_key_id: SecretSource,
    /// Secret access key.
    pub secret_access_key: SecretSource,
    /// Path-style addressing unless explicitly disabled.
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
}

fn default_force_path_style() -> bool {
    true
}

/// A per-tenant delivery destination, resolved at dispatch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Destination identifier.
    pub destination_id: String,
    /// Destination kind.
    pub kind: DestinationKind,
    /// Webhook settings when `kind == webhook`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookDestination>,
    /// S3 settings when `kind == s3`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Destination>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_key_is_deterministic_and_component_separated() {
        let key = Delivery::order_key_for("jobs/j1", 7, -2, "d1");
        assert_eq!(key, "jobs/j1\n7\n-2\nd1");
        assert_eq!(key, Delivery::order_key_for("jobs/j1", 7, -2, "d1"));
    }

    #[test]
    fn s3_destination_defaults_to_path_style() {
        let wire = serde_json::json!({
            "endpoint": "http://127.0.0.1:9000",
            "region": "us-east-1",
            "bucket": "artifacts",
            "accessKeyId": {"value": "ak"},
            "secretAccessKey": {"ref": "vault://s3"}
        });
        let dest: S3Destination = serde_json::from_value(wire).unwrap();
        assert!(dest.force_path_style);
        assert_eq!(dest.secret_access_key.secret_ref.as_deref(), Some("vault://s3"));
    }
}
