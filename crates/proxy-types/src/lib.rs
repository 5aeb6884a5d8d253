#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-types** – Shared primitive data structures for the proxy
//! settlement core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines tenant scoping, the typed operation vocabulary applied by the
//! kernel, the record shapes that cross the wire (events, deliveries, ledger
//! entries, outbox messages) and the machine-readable error taxonomy.

use chrono::{DateTime, SecondsFormat, Utc};

pub mod delivery;
pub mod error;
pub mod event;
pub mod ledger;
pub mod ops;

pub use delivery::{
    ArtifactRecord, Delivery, DeliveryState, Destination, DestinationKind, OutboxMessage,
    S3Destination, SecretSource, WebhookDestination,
};
pub use error::CoreError;
pub use event::{ControlState, EmergencyControlEvent, EventRecord, RESUME_CONTROL_TYPE};
pub use ledger::{LedgerEntry, LedgerLine};
pub use ops::{
    AggregateKind, ControlEventOp, EntityKind, EventsAppendOp, IdempotencyPutOp, ImmutablePutOp,
    IngestPutOp, IngestRecord, KeyStatus, KeyStatusOp, LedgerEntryOp, Op, OutboxEnqueueOp,
    PolicyUpsertOp, UpsertOp,
};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Largest integer that survives a round-trip through a JSON `number`.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Maximum accepted length for any identifier field.
pub const MAX_ID_LEN: usize = 512;

//─────────────────────────────
//  Tenant scoping
//─────────────────────────────

/// Tenant used when a request carries no explicit tenant.
pub const DEFAULT_TENANT: &str = "default";

/// Separator byte used inside scoped keys. Identifiers are rejected when they
/// contain it, so a scoped key is unique under its `(tenantId, id)` pair.
pub const KEY_SEPARATOR: char = '\u{001f}';

/// Normalize a raw tenant identifier: trim whitespace and fall back to
/// [`DEFAULT_TENANT`] when empty or absent.
pub fn normalize_tenant(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => DEFAULT_TENANT.to_string(),
    }
}

/// Build the store key for a `(tenantId, id)` pair.
pub fn scoped_key(tenant_id: &str, id: &str) -> String {
    format!("{tenant_id}{KEY_SEPARATOR}{id}")
}

/// Build the store key for a `(tenantId, a, b)` triple (event streams,
/// control states and similar multi-part identities).
pub fn scoped_key3(tenant_id: &str, a: &str, b: &str) -> String {
    format!("{tenant_id}{KEY_SEPARATOR}{a}{KEY_SEPARATOR}{b}")
}

//─────────────────────────────
//  Timestamps
//─────────────────────────────

/// Current wall-clock time as an ISO-8601 UTC string with millisecond
/// precision, e.g. `2026-08-01T12:00:00.123Z`.
pub fn now_iso() -> String {
    iso_millis(Utc::now())
}

/// Format a [`DateTime<Utc>`] as ISO-8601 with millisecond precision.
pub fn iso_millis(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an ISO-8601 timestamp, returning a UTC instant.
pub fn parse_iso(raw: &str) -> Result<DateTime<Utc>, CoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::validation(format!("invalid timestamp {raw:?}: {e}")))
}

//─────────────────────────────
//  Field validation helpers
//─────────────────────────────

/// Require a non-empty identifier that is free of the scoped-key separator.
pub fn ensure_id(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} must be non-empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(CoreError::validation(format!(
            "{field} exceeds {MAX_ID_LEN} bytes"
        )));
    }
    if value.contains(KEY_SEPARATOR) {
        return Err(CoreError::validation(format!(
            "{field} contains a reserved separator byte"
        )));
    }
    Ok(())
}

/// Require a positive integer small enough to survive JSON (`< 2^53`).
pub fn ensure_positive_safe_int(field: &str, value: u64) -> Result<(), CoreError> {
    if value == 0 || value > MAX_SAFE_INTEGER {
        return Err(CoreError::validation(format!(
            "{field} must be a positive safe integer, got {value}"
        )));
    }
    Ok(())
}
