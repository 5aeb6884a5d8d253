//! Event records for hash-chained streams and emergency controls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ensure_id;
use crate::error::CoreError;

/// Control type that deactivates previously activated controls.
pub const RESUME_CONTROL_TYPE: &str = "RESUME";

//─────────────────────────────
//  Stream events
//─────────────────────────────

/// One event inside a hash-chained aggregate stream.
///
/// `chainHash` binds the event to its predecessor:
/// `chainHash = sha256(canonical(event \ {chainHash}) ‖ prevChainHash)`.
/// Unknown fields are preserved verbatim so canonical hashing is stable
/// across schema evolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    /// Producer-assigned event identifier.
    pub event_id: String,
    /// Application-defined event type, e.g. `job.assigned`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// ISO-8601 timestamp the event was produced at.
    pub at: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
    /// Chain hash of the predecessor; `None` opens a stream.
    pub prev_chain_hash: Option<String>,
    /// Chain hash of this event.
    pub chain_hash: String,
    /// Fields outside the fixed schema, carried as-is.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl EventRecord {
    /// Validate required fields.
    pub fn validate(&self) -> Result<(), CoreError> {
        ensure_id("eventId", &self.event_id)?;
        ensure_id("type", &self.event_type)?;
        if self.at.trim().is_empty() {
            return Err(CoreError::validation("at must be non-empty"));
        }
        if self.chain_hash.trim().is_empty() {
            return Err(CoreError::validation("chainHash must be non-empty"));
        }
        Ok(())
    }
}

//─────────────────────────────
//  Emergency controls
//─────────────────────────────

/// Immutable emergency-control event. A replayed event with the identical
/// canonical form is a no-op; the same `eventId` with a different body is a
/// conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyControlEvent {
    /// Producer-assigned event identifier.
    pub event_id: String,
    /// Scope family, e.g. `tenant`, `robot`, `job`.
    pub scope_type: String,
    /// Identifier within the scope family.
    pub scope_id: String,
    /// Control being activated, or [`RESUME_CONTROL_TYPE`].
    pub control_type: String,
    /// ISO-8601 activation time.
    pub at: String,
    /// Optional operator-facing reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// For RESUME: the control types to deactivate. Absent means every
    /// control currently active on the scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_of: Option<Vec<String>>,
}

impl EmergencyControlEvent {
    /// Whether this event deactivates controls instead of activating one.
    pub fn is_resume(&self) -> bool {
        self.control_type == RESUME_CONTROL_TYPE
    }

    /// Validate required fields and the RESUME shape.
    pub fn validate(&self) -> Result<(), CoreError> {
        ensure_id("eventId", &self.event_id)?;
        ensure_id("scopeType", &self.scope_type)?;
        ensure_id("scopeId", &self.scope_id)?;
        ensure_id("controlType", &self.control_type)?;
        if self.at.trim().is_empty() {
            return Err(CoreError::validation("at must be non-empty"));
        }
        if let Some(resume_of) = &self.resume_of {
            if !self.is_resume() {
                return Err(CoreError::validation(
                    "resumeOf is only valid on RESUME events",
                ));
            }
            if resume_of.is_empty() {
                return Err(CoreError::validation("resumeOf must be non-empty when set"));
            }
            for control in resume_of {
                ensure_id("resumeOf[]", control)?;
            }
        }
        Ok(())
    }
}

/// Last-write-wins control state derived from the event log, keyed by
/// `(tenantId, scopeType, scopeId, controlType)` with a strictly-increasing
/// `revision`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlState {
    /// Tenant scope.
    pub tenant_id: String,
    /// Scope family.
    pub scope_type: String,
    /// Identifier within the scope family.
    pub scope_id: String,
    /// Control this state tracks.
    pub control_type: String,
    /// Whether the control is currently engaged.
    pub active: bool,
    /// Strictly increasing per state key.
    pub revision: u64,
    /// Time of the last transition.
    pub updated_at: String,
    /// Event that produced the current state.
    pub last_event_id: String,
}
