//! The typed operation vocabulary applied by the kernel.
//!
//! Every operation is a tagged record with a `kind` discriminator plus
//! kind-specific fields. Dispatch inside the applier is a single table keyed
//! by `kind`; the helper accessors ([`Op::upsert`], [`Op::events_append`])
//! collapse the per-entity variants back into their operation family.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::event::{EmergencyControlEvent, EventRecord};
use crate::ledger::LedgerEntry;
use crate::{ensure_id, ensure_positive_safe_int};

//─────────────────────────────
//  Entity and aggregate kinds
//─────────────────────────────

/// Keyed entity tables owned by the store. One table per kind; records are
/// keyed by `(tenantId, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum EntityKind {
    Robots,
    Operators,
    Contracts,
    AgentIdentities,
    AgentCards,
    AgentPassports,
    AgentWallets,
    Sessions,
    SignerKeys,
    AuthKeys,
    ArbitrationCases,
    DelegationGrants,
    TaskQuotes,
    TaskOffers,
    TaskAcceptances,
    CapabilityAttestations,
    SubagentWorkOrders,
    SubagentCompletionReceipts,
    StateCheckpoints,
    SessionRelayStates,
    X402Gates,
    X402AgentLifecycles,
    SettlementPolicies,
    GovernanceTemplates,
    Rollouts,
    X402WebhookEndpoints,
    ToolCallHolds,
    MarketplaceRfqs,
    SimulationRuns,
    // Immutable-put tables.
    X402Receipts,
    X402ZkVerificationKeys,
    SettlementAdjustments,
}

impl EntityKind {
    /// Stable table name used by the relational mirror and diagnostics.
    pub fn table(&self) -> &'static str {
        match self {
            Self::Robots => "robots",
            Self::Operators => "operators",
            Self::Contracts => "contracts",
            Self::AgentIdentities => "agent_identities",
            Self::AgentCards => "agent_cards",
            Self::AgentPassports => "agent_passports",
            Self::AgentWallets => "agent_wallets",
            Self::Sessions => "sessions",
            Self::SignerKeys => "signer_keys",
            Self::AuthKeys => "auth_keys",
            Self::ArbitrationCases => "arbitration_cases",
            Self::DelegationGrants => "delegation_grants",
            Self::TaskQuotes => "task_quotes",
            Self::TaskOffers => "task_offers",
            Self::TaskAcceptances => "task_acceptances",
            Self::CapabilityAttestations => "capability_attestations",
            Self::SubagentWorkOrders => "subagent_work_orders",
            Self::SubagentCompletionReceipts => "subagent_completion_receipts",
            Self::StateCheckpoints => "state_checkpoints",
            Self::SessionRelayStates => "session_relay_states",
            Self::X402Gates => "x402_gates",
            Self::X402AgentLifecycles => "x402_agent_lifecycles",
            Self::SettlementPolicies => "settlement_policies",
            Self::GovernanceTemplates => "governance_templates",
            Self::Rollouts => "rollouts",
            Self::X402WebhookEndpoints => "x402_webhook_endpoints",
            Self::ToolCallHolds => "tool_call_holds",
            Self::MarketplaceRfqs => "marketplace_rfqs",
            Self::SimulationRuns => "simulation_runs",
            Self::X402Receipts => "x402_receipts",
            Self::X402ZkVerificationKeys => "x402_zk_verification_keys",
            Self::SettlementAdjustments => "settlement_adjustments",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Aggregates reconstructed from hash-chained event streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub enum AggregateKind {
    Job,
    Robot,
    Operator,
    AgentRun,
    MonthClose,
    Session,
}

impl AggregateKind {
    /// Stable stream-family name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Robot => "robot",
            Self::Operator => "operator",
            Self::AgentRun => "agentRun",
            Self::MonthClose => "monthClose",
            Self::Session => "session",
        }
    }
}

impl std::fmt::Display for AggregateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Operation payloads
//─────────────────────────────

/// Last-write-wins upsert of a keyed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Record identifier, unique within the tenant.
    pub id: String,
    /// Full replacement record.
    pub record: Value,
}

impl UpsertOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("id", &self.id)?;
        if !self.record.is_object() {
            return Err(CoreError::validation("record must be an object"));
        }
        Ok(())
    }
}

/// Upsert of a tenant settlement policy, keyed by `(policyId, policyVersion)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpsertOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Policy identifier.
    pub policy_id: String,
    /// Positive policy version; part of the key.
    pub policy_version: u64,
    /// Full replacement record.
    pub record: Value,
}

impl PolicyUpsertOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("policyId", &self.policy_id)?;
        ensure_positive_safe_int("policyVersion", self.policy_version)?;
        if !self.record.is_object() {
            return Err(CoreError::validation("record must be an object"));
        }
        Ok(())
    }

    /// Composite record id under the tenant.
    pub fn composite_id(&self) -> String {
        format!("{}@{}", self.policy_id, self.policy_version)
    }
}

/// Immutable put: idempotent on identical canonical content, conflict
/// otherwise (adjustments conflict strictly even on identical content).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImmutablePutOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Record identifier.
    pub id: String,
    /// Record content, canonicalized before comparison.
    pub record: Value,
}

impl ImmutablePutOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("id", &self.id)?;
        if !self.record.is_object() {
            return Err(CoreError::validation("record must be an object"));
        }
        Ok(())
    }
}

/// Closed set of key lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum KeyStatus {
    Active,
    Rotated,
    Revoked,
}

impl KeyStatus {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Rotated => "rotated",
            Self::Revoked => "revoked",
        }
    }
}

/// Status transition for a signer or auth key; optional timestamps are merged
/// into the existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatusOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Key identifier.
    pub id: String,
    /// New lifecycle status.
    pub status: KeyStatus,
    /// Rotation timestamp, merged when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_at: Option<String>,
    /// Revocation timestamp, merged when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
}

impl KeyStatusOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("id", &self.id)
    }
}

/// Hash-chained append to an aggregate event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsAppendOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Aggregate identifier within the stream family.
    pub aggregate_id: String,
    /// Chained batch; `events[0].prevChainHash` must match the stream head.
    pub events: Vec<EventRecord>,
}

impl EventsAppendOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("aggregateId", &self.aggregate_id)?;
        if self.events.is_empty() {
            return Err(CoreError::validation("events must be non-empty"));
        }
        for event in &self.events {
            event.validate()?;
        }
        Ok(())
    }
}

/// Append of an emergency-control event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlEventOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// The control event; idempotent on a byte-identical canonical form.
    pub event: EmergencyControlEvent,
}

impl ControlEventOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        self.event.validate()
    }
}

/// Application of a balanced double-entry ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntryOp {
    /// Tenant scope; each tenant owns one ledger.
    pub tenant_id: String,
    /// The journal entry.
    pub entry: LedgerEntry,
}

impl LedgerEntryOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        self.entry.validate()
    }
}

/// Record of a response served under an idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyPutOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Caller-chosen idempotency key.
    pub key: String,
    /// Fingerprint of the request body; a reused key with a different
    /// fingerprint is a conflict.
    pub fingerprint: String,
    /// Response snapshot replayed on repeats.
    pub response: Value,
}

impl IdempotencyPutOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("key", &self.key)?;
        if self.fingerprint.trim().is_empty() {
            return Err(CoreError::validation("fingerprint must be non-empty"));
        }
        Ok(())
    }
}

/// Durable enqueue of an outbound message, fanned out to destinations when
/// the outbox drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEnqueueOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Serialization boundary for the resulting deliveries.
    pub scope_key: String,
    /// Delivery priority (lower sorts earlier within a scope).
    #[serde(default)]
    pub priority: i64,
    /// Receiver-side idempotency key; generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    /// Destinations this message fans out to.
    pub destination_ids: Vec<String>,
    /// The signed artifact to deliver.
    pub artifact: crate::delivery::ArtifactRecord,
}

impl OutboxEnqueueOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        ensure_id("scopeKey", &self.scope_key)?;
        if let Some(dedupe_key) = &self.dedupe_key {
            ensure_id("dedupeKey", dedupe_key)?;
        }
        if self.destination_ids.is_empty() {
            return Err(CoreError::validation("destinationIds must be non-empty"));
        }
        for id in &self.destination_ids {
            ensure_id("destinationId", id)?;
        }
        self.artifact.validate()
    }
}

/// External event ingested exactly once per `(tenantId, source,
/// externalEventId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    /// Originating system.
    pub source: String,
    /// Source-assigned event identifier; the dedupe key component.
    pub external_event_id: String,
    /// Raw payload as received.
    pub payload: Value,
    /// Receipt time; stamped by the applier when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,
}

impl IngestRecord {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("source", &self.source)?;
        ensure_id("externalEventId", &self.external_event_id)
    }
}

/// Batched ingest put; duplicates are dropped, not errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestPutOp {
    /// Tenant scope.
    pub tenant_id: String,
    /// Records to ingest.
    pub records: Vec<IngestRecord>,
}

impl IngestPutOp {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_id("tenantId", &self.tenant_id)?;
        if self.records.is_empty() {
            return Err(CoreError::validation("records must be non-empty"));
        }
        for record in &self.records {
            record.validate()?;
        }
        Ok(())
    }
}

//─────────────────────────────
//  The operation sum type
//─────────────────────────────

/// One mutation inside a transaction batch. The serialized form is a tagged
/// record: `{ "kind": "<KIND>", ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[allow(missing_docs)]
pub enum Op {
    // ── last-write-wins upserts ──
    #[serde(rename = "ROBOT_UPSERTED")]
    RobotUpserted(UpsertOp),
    #[serde(rename = "OPERATOR_UPSERTED")]
    OperatorUpserted(UpsertOp),
    #[serde(rename = "CONTRACT_UPSERTED")]
    ContractUpserted(UpsertOp),
    #[serde(rename = "AGENT_IDENTITY_UPSERTED")]
    AgentIdentityUpserted(UpsertOp),
    #[serde(rename = "AGENT_CARD_UPSERTED")]
    AgentCardUpserted(UpsertOp),
    #[serde(rename = "AGENT_PASSPORT_UPSERTED")]
    AgentPassportUpserted(UpsertOp),
    #[serde(rename = "AGENT_WALLET_UPSERTED")]
    AgentWalletUpserted(UpsertOp),
    #[serde(rename = "SESSION_UPSERTED")]
    SessionUpserted(UpsertOp),
    #[serde(rename = "SIGNER_KEY_UPSERTED")]
    SignerKeyUpserted(UpsertOp),
    #[serde(rename = "AUTH_KEY_UPSERTED")]
    AuthKeyUpserted(UpsertOp),
    #[serde(rename = "ARBITRATION_CASE_UPSERTED")]
    ArbitrationCaseUpserted(UpsertOp),
    #[serde(rename = "DELEGATION_GRANT_UPSERTED")]
    DelegationGrantUpserted(UpsertOp),
    #[serde(rename = "TASK_QUOTE_UPSERTED")]
    TaskQuoteUpserted(UpsertOp),
    #[serde(rename = "TASK_OFFER_UPSERTED")]
    TaskOfferUpserted(UpsertOp),
    #[serde(rename = "TASK_ACCEPTANCE_UPSERTED")]
    TaskAcceptanceUpserted(UpsertOp),
    #[serde(rename = "CAPABILITY_ATTESTATION_UPSERTED")]
    CapabilityAttestationUpserted(UpsertOp),
    #[serde(rename = "SUBAGENT_WORK_ORDER_UPSERTED")]
    SubagentWorkOrderUpserted(UpsertOp),
    #[serde(rename = "SUBAGENT_COMPLETION_RECEIPT_UPSERTED")]
    SubagentCompletionReceiptUpserted(UpsertOp),
    #[serde(rename = "STATE_CHECKPOINT_UPSERTED")]
    StateCheckpointUpserted(UpsertOp),
    #[serde(rename = "SESSION_RELAY_STATE_UPSERTED")]
    SessionRelayStateUpserted(UpsertOp),
    #[serde(rename = "X402_GATE_UPSERTED")]
    X402GateUpserted(UpsertOp),
    #[serde(rename = "X402_AGENT_LIFECYCLE_UPSERTED")]
    X402AgentLifecycleUpserted(UpsertOp),
    #[serde(rename = "SETTLEMENT_POLICY_UPSERTED")]
    SettlementPolicyUpserted(PolicyUpsertOp),
    #[serde(rename = "GOVERNANCE_TEMPLATE_UPSERTED")]
    GovernanceTemplateUpserted(UpsertOp),
    #[serde(rename = "ROLLOUT_UPSERTED")]
    RolloutUpserted(UpsertOp),
    #[serde(rename = "X402_WEBHOOK_ENDPOINT_UPSERTED")]
    X402WebhookEndpointUpserted(UpsertOp),
    #[serde(rename = "TOOL_CALL_HOLD_UPSERTED")]
    ToolCallHoldUpserted(UpsertOp),
    #[serde(rename = "MARKETPLACE_RFQ_UPSERTED")]
    MarketplaceRfqUpserted(UpsertOp),
    #[serde(rename = "SIMULATION_RUN_UPSERTED")]
    SimulationRunUpserted(UpsertOp),

    // ── immutable puts ──
    #[serde(rename = "X402_RECEIPT_PUT")]
    X402ReceiptPut(ImmutablePutOp),
    #[serde(rename = "X402_ZK_VERIFICATION_KEY_PUT")]
    X402ZkVerificationKeyPut(ImmutablePutOp),
    #[serde(rename = "SETTLEMENT_ADJUSTMENT_PUT")]
    SettlementAdjustmentPut(ImmutablePutOp),

    // ── key status transitions ──
    #[serde(rename = "SIGNER_KEY_STATUS_SET")]
    SignerKeyStatusSet(KeyStatusOp),
    #[serde(rename = "AUTH_KEY_STATUS_SET")]
    AuthKeyStatusSet(KeyStatusOp),

    // ── event-stream appends ──
    #[serde(rename = "JOB_EVENTS_APPENDED")]
    JobEventsAppended(EventsAppendOp),
    #[serde(rename = "ROBOT_EVENTS_APPENDED")]
    RobotEventsAppended(EventsAppendOp),
    #[serde(rename = "OPERATOR_EVENTS_APPENDED")]
    OperatorEventsAppended(EventsAppendOp),
    #[serde(rename = "AGENT_RUN_EVENTS_APPENDED")]
    AgentRunEventsAppended(EventsAppendOp),
    #[serde(rename = "MONTH_CLOSE_EVENTS_APPENDED")]
    MonthCloseEventsAppended(EventsAppendOp),
    #[serde(rename = "SESSION_EVENTS_APPENDED")]
    SessionEventsAppended(EventsAppendOp),

    // ── everything else ──
    #[serde(rename = "EMERGENCY_CONTROL_EVENT_APPENDED")]
    EmergencyControlEventAppended(ControlEventOp),
    #[serde(rename = "LEDGER_ENTRY_APPLIED")]
    LedgerEntryApplied(LedgerEntryOp),
    #[serde(rename = "IDEMPOTENCY_PUT")]
    IdempotencyPut(IdempotencyPutOp),
    #[serde(rename = "OUTBOX_ENQUEUED")]
    OutboxEnqueued(OutboxEnqueueOp),
    #[serde(rename = "INGEST_RECORDS_PUT")]
    IngestRecordsPut(IngestPutOp),
}

impl Op {
    /// The wire discriminator for this operation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RobotUpserted(_) => "ROBOT_UPSERTED",
            Self::OperatorUpserted(_) => "OPERATOR_UPSERTED",
            Self::ContractUpserted(_) => "CONTRACT_UPSERTED",
            Self::AgentIdentityUpserted(_) => "AGENT_IDENTITY_UPSERTED",
            Self::AgentCardUpserted(_) => "AGENT_CARD_UPSERTED",
            Self::AgentPassportUpserted(_) => "AGENT_PASSPORT_UPSERTED",
            Self::AgentWalletUpserted(_) => "AGENT_WALLET_UPSERTED",
            Self::SessionUpserted(_) => "SESSION_UPSERTED",
            Self::SignerKeyUpserted(_) => "SIGNER_KEY_UPSERTED",
            Self::AuthKeyUpserted(_) => "AUTH_KEY_UPSERTED",
            Self::ArbitrationCaseUpserted(_) => "ARBITRATION_CASE_UPSERTED",
            Self::DelegationGrantUpserted(_) => "DELEGATION_GRANT_UPSERTED",
            Self::TaskQuoteUpserted(_) => "TASK_QUOTE_UPSERTED",
            Self::TaskOfferUpserted(_) => "TASK_OFFER_UPSERTED",
            Self::TaskAcceptanceUpserted(_) => "TASK_ACCEPTANCE_UPSERTED",
            Self::CapabilityAttestationUpserted(_) => "CAPABILITY_ATTESTATION_UPSERTED",
            Self::SubagentWorkOrderUpserted(_) => "SUBAGENT_WORK_ORDER_UPSERTED",
            Self::SubagentCompletionReceiptUpserted(_) => "SUBAGENT_COMPLETION_RECEIPT_UPSERTED",
            Self::StateCheckpointUpserted(_) => "STATE_CHECKPOINT_UPSERTED",
            Self::SessionRelayStateUpserted(_) => "SESSION_RELAY_STATE_UPSERTED",
            Self::X402GateUpserted(_) => "X402_GATE_UPSERTED",
            Self::X402AgentLifecycleUpserted(_) => "X402_AGENT_LIFECYCLE_UPSERTED",
            Self::SettlementPolicyUpserted(_) => "SETTLEMENT_POLICY_UPSERTED",
            Self::GovernanceTemplateUpserted(_) => "GOVERNANCE_TEMPLATE_UPSERTED",
            Self::RolloutUpserted(_) => "ROLLOUT_UPSERTED",
            Self::X402WebhookEndpointUpserted(_) => "X402_WEBHOOK_ENDPOINT_UPSERTED",
            Self::ToolCallHoldUpserted(_) => "TOOL_CALL_HOLD_UPSERTED",
            Self::MarketplaceRfqUpserted(_) => "MARKETPLACE_RFQ_UPSERTED",
            Self::SimulationRunUpserted(_) => "SIMULATION_RUN_UPSERTED",
            Self::X402ReceiptPut(_) => "X402_RECEIPT_PUT",
            Self::X402ZkVerificationKeyPut(_) => "X402_ZK_VERIFICATION_KEY_PUT",
            Self::SettlementAdjustmentPut(_) => "SETTLEMENT_ADJUSTMENT_PUT",
            Self::SignerKeyStatusSet(_) => "SIGNER_KEY_STATUS_SET",
            Self::AuthKeyStatusSet(_) => "AUTH_KEY_STATUS_SET",
            Self::JobEventsAppended(_) => "JOB_EVENTS_APPENDED",
            Self::RobotEventsAppended(_) => "ROBOT_EVENTS_APPENDED",
            Self::OperatorEventsAppended(_) => "OPERATOR_EVENTS_APPENDED",
            Self::AgentRunEventsAppended(_) => "AGENT_RUN_EVENTS_APPENDED",
            Self::MonthCloseEventsAppended(_) => "MONTH_CLOSE_EVENTS_APPENDED",
            Self::SessionEventsAppended(_) => "SESSION_EVENTS_APPENDED",
            Self::EmergencyControlEventAppended(_) => "EMERGENCY_CONTROL_EVENT_APPENDED",
            Self::LedgerEntryApplied(_) => "LEDGER_ENTRY_APPLIED",
            Self::IdempotencyPut(_) => "IDEMPOTENCY_PUT",
            Self::OutboxEnqueued(_) => "OUTBOX_ENQUEUED",
            Self::IngestRecordsPut(_) => "INGEST_RECORDS_PUT",
        }
    }

    /// Collapse the per-entity upsert variants into `(table, payload)`.
    pub fn upsert(&self) -> Option<(EntityKind, &UpsertOp)> {
        use EntityKind as K;
        Some(match self {
            Self::RobotUpserted(op) => (K::Robots, op),
            Self::OperatorUpserted(op) => (K::Operators, op),
            Self::ContractUpserted(op) => (K::Contracts, op),
            Self::AgentIdentityUpserted(op) => (K::AgentIdentities, op),
            Self::AgentCardUpserted(op) => (K::AgentCards, op),
            Self::AgentPassportUpserted(op) => (K::AgentPassports, op),
            Self::AgentWalletUpserted(op) => (K::AgentWallets, op),
            Self::SessionUpserted(op) => (K::Sessions, op),
            Self::SignerKeyUpserted(op) => (K::SignerKeys, op),
            Self::AuthKeyUpserted(op) => (K::AuthKeys, op),
            Self::ArbitrationCaseUpserted(op) => (K::ArbitrationCases, op),
            Self::DelegationGrantUpserted(op) => (K::DelegationGrants, op),
            Self::TaskQuoteUpserted(op) => (K::TaskQuotes, op),
            Self::TaskOfferUpserted(op) => (K::TaskOffers, op),
            Self::TaskAcceptanceUpserted(op) => (K::TaskAcceptances, op),
            Self::CapabilityAttestationUpserted(op) => (K::CapabilityAttestations, op),
            Self::SubagentWorkOrderUpserted(op) => (K::SubagentWorkOrders, op),
            Self::SubagentCompletionReceiptUpserted(op) => (K::SubagentCompletionReceipts, op),
            Self::StateCheckpointUpserted(op) => (K::StateCheckpoints, op),
            Self::SessionRelayStateUpserted(op) => (K::SessionRelayStates, op),
            Self::X402GateUpserted(op) => (K::X402Gates, op),
            Self::X402AgentLifecycleUpserted(op) => (K::X402AgentLifecycles, op),
            Self::GovernanceTemplateUpserted(op) => (K::GovernanceTemplates, op),
            Self::RolloutUpserted(op) => (K::Rollouts, op),
            Self::X402WebhookEndpointUpserted(op) => (K::X402WebhookEndpoints, op),
            Self::ToolCallHoldUpserted(op) => (K::ToolCallHolds, op),
            Self::MarketplaceRfqUpserted(op) => (K::MarketplaceRfqs, op),
            Self::SimulationRunUpserted(op) => (K::SimulationRuns, op),
            _ => return None,
        })
    }

    /// Collapse the immutable-put variants into `(table, payload)`.
    pub fn immutable_put(&self) -> Option<(EntityKind, &ImmutablePutOp)> {
        use EntityKind as K;
        Some(match self {
            Self::X402ReceiptPut(op) => (K::X402Receipts, op),
            Self::X402ZkVerificationKeyPut(op) => (K::X402ZkVerificationKeys, op),
            Self::SettlementAdjustmentPut(op) => (K::SettlementAdjustments, op),
            _ => return None,
        })
    }

    /// Collapse the stream-append variants into `(aggregate, payload)`.
    pub fn events_append(&self) -> Option<(AggregateKind, &EventsAppendOp)> {
        use AggregateKind as A;
        Some(match self {
            Self::JobEventsAppended(op) => (A::Job, op),
            Self::RobotEventsAppended(op) => (A::Robot, op),
            Self::OperatorEventsAppended(op) => (A::Operator, op),
            Self::AgentRunEventsAppended(op) => (A::AgentRun, op),
            Self::MonthCloseEventsAppended(op) => (A::MonthClose, op),
            Self::SessionEventsAppended(op) => (A::Session, op),
            _ => return None,
        })
    }

    /// Tenant this operation is scoped to.
    pub fn tenant_id(&self) -> &str {
        match self {
            Self::SettlementPolicyUpserted(op) => &op.tenant_id,
            Self::SignerKeyStatusSet(op) | Self::AuthKeyStatusSet(op) => &op.tenant_id,
            Self::EmergencyControlEventAppended(op) => &op.tenant_id,
            Self::LedgerEntryApplied(op) => &op.tenant_id,
            Self::IdempotencyPut(op) => &op.tenant_id,
            Self::OutboxEnqueued(op) => &op.tenant_id,
            Self::IngestRecordsPut(op) => &op.tenant_id,
            other => {
                if let Some((_, op)) = other.upsert() {
                    &op.tenant_id
                } else if let Some((_, op)) = other.immutable_put() {
                    &op.tenant_id
                } else if let Some((_, op)) = other.events_append() {
                    &op.tenant_id
                } else {
                    unreachable!("op variant without a tenant")
                }
            }
        }
    }

    /// Validate required fields, identifier shapes and closed sets.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some((_, op)) = self.upsert() {
            return op.validate();
        }
        if let Some((_, op)) = self.immutable_put() {
            return op.validate();
        }
        if let Some((_, op)) = self.events_append() {
            return op.validate();
        }
        match self {
            Self::SettlementPolicyUpserted(op) => op.validate(),
            Self::SignerKeyStatusSet(op) | Self::AuthKeyStatusSet(op) => op.validate(),
            Self::EmergencyControlEventAppended(op) => op.validate(),
            Self::LedgerEntryApplied(op) => op.validate(),
            Self::IdempotencyPut(op) => op.validate(),
            Self::OutboxEnqueued(op) => op.validate(),
            Self::IngestRecordsPut(op) => op.validate(),
            _ => Ok(()),
        }
    }
}
