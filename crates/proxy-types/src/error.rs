//! Machine-readable error taxonomy shared by the kernel and the stores.
//!
//! Every error carries a stable `code` and, where the error surfaces on an
//! HTTP boundary, a mapped `status_code`. Conflict-family errors (409) are
//! retryable after the caller refreshes its view; validation errors are not.

use serde_json::{json, Value};

/// Typed error produced by operation validation and batch application.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Malformed input; rejected synchronously with no state change.
    #[error("{message}")]
    Validation {
        /// Human-readable reason.
        message: String,
    },

    /// Optimistic-concurrency failure on a hash-chained stream head.
    #[error("previous chain hash mismatch on {stream}: expected {expected:?}, got {got:?}")]
    PrevChainHashMismatch {
        /// Scoped stream key the append targeted.
        stream: String,
        /// Chain hash of the current stream head (`None` for an empty stream).
        expected: Option<String>,
        /// `prevChainHash` the rejected batch carried.
        got: Option<String>,
    },

    /// Re-put of an x402 receipt with a different canonical form.
    #[error("x402 receipt {id} is immutable")]
    ReceiptImmutable {
        /// Receipt identifier.
        id: String,
    },

    /// Re-put of an x402 zk verification key with a different canonical form.
    #[error("x402 zk verification key {id} is immutable")]
    ZkVerificationKeyImmutable {
        /// Verification key identifier.
        id: String,
    },

    /// Settlement adjustments conflict strictly: an existing key is an error
    /// even when the payload is identical.
    #[error("settlement adjustment {id} already exists")]
    AdjustmentAlreadyExists {
        /// Adjustment identifier.
        id: String,
    },

    /// An emergency-control event id was reused with a different body.
    #[error("emergency control event {event_id} conflicts with a recorded event")]
    EmergencyControlEventConflict {
        /// Conflicting event identifier.
        event_id: String,
    },

    /// An idempotency key was reused with a different request fingerprint.
    #[error("idempotency key {key} was reused with a different fingerprint")]
    IdempotencyKeyConflict {
        /// The reused key.
        key: String,
    },

    /// A ledger entry whose debits and credits do not balance per currency.
    #[error("ledger entry {entry_id} does not balance for currency {currency}")]
    LedgerUnbalanced {
        /// Entry identifier.
        entry_id: String,
        /// First currency found unbalanced.
        currency: String,
    },

    /// A ledger entry id was reused with different content.
    #[error("ledger entry {entry_id} was already applied with different content")]
    LedgerEntryConflict {
        /// Entry identifier.
        entry_id: String,
    },

    /// A referenced record does not exist.
    #[error("{what} {id} not found")]
    NotFound {
        /// Entity family, e.g. `signerKey`.
        what: String,
        /// Missing identifier.
        id: String,
    },

    /// High-risk write guard rejection.
    #[error("forbidden: {route_id}")]
    Forbidden {
        /// Route the guard fired on.
        route_id: String,
    },
}

impl CoreError {
    /// Shorthand for a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::PrevChainHashMismatch { .. } => "PREV_CHAIN_HASH_MISMATCH",
            Self::ReceiptImmutable { .. } => "X402_RECEIPT_IMMUTABLE",
            Self::ZkVerificationKeyImmutable { .. } => "X402_ZK_VERIFICATION_KEY_IMMUTABLE",
            Self::AdjustmentAlreadyExists { .. } => "ADJUSTMENT_ALREADY_EXISTS",
            Self::EmergencyControlEventConflict { .. } => "EMERGENCY_CONTROL_EVENT_CONFLICT",
            Self::IdempotencyKeyConflict { .. } => "IDEMPOTENCY_KEY_CONFLICT",
            Self::LedgerUnbalanced { .. } => "LEDGER_UNBALANCED",
            Self::LedgerEntryConflict { .. } => "LEDGER_ENTRY_CONFLICT",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Forbidden { .. } => "FORBIDDEN",
        }
    }

    /// HTTP status this error maps to when it reaches an API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } | Self::LedgerUnbalanced { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::PrevChainHashMismatch { .. }
            | Self::ReceiptImmutable { .. }
            | Self::ZkVerificationKeyImmutable { .. }
            | Self::AdjustmentAlreadyExists { .. }
            | Self::EmergencyControlEventConflict { .. }
            | Self::IdempotencyKeyConflict { .. }
            | Self::LedgerEntryConflict { .. } => 409,
        }
    }

    /// Structured details record for API payloads and logs.
    pub fn details(&self) -> Value {
        match self {
            Self::PrevChainHashMismatch {
                stream,
                expected,
                got,
            } => json!({ "stream": stream, "expected": expected, "got": got }),
            Self::ReceiptImmutable { id }
            | Self::ZkVerificationKeyImmutable { id }
            | Self::AdjustmentAlreadyExists { id } => json!({ "id": id }),
            Self::EmergencyControlEventConflict { event_id } => json!({ "eventId": event_id }),
            Self::IdempotencyKeyConflict { key } => json!({ "key": key }),
            Self::LedgerUnbalanced { entry_id, currency } => {
                json!({ "entryId": entry_id, "currency": currency })
            }
            Self::LedgerEntryConflict { entry_id } => json!({ "entryId": entry_id }),
            Self::NotFound { what, id } => json!({ "what": what, "id": id }),
            Self::Forbidden { route_id } => json!({ "routeId": route_id }),
            Self::Validation { .. } => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_family_maps_to_409() {
        let err = CoreError::PrevChainHashMismatch {
            stream: "t\u{001f}job\u{001f}j1".into(),
            expected: Some("a".into()),
            got: None,
        };
        assert_eq!(err.code(), "PREV_CHAIN_HASH_MISMATCH");
        assert_eq!(err.status_code(), 409);
        assert_eq!(err.details()["expected"], "a");
        assert_eq!(err.details()["got"], Value::Null);
    }

    #[test]
    fn validation_maps_to_400() {
        let err = CoreError::validation("bad");
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(err.status_code(), 400);
    }
}
