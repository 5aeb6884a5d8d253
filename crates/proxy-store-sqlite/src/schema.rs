//! Schema migrations, run on every open.

use anyhow::Result;
use sqlx::SqlitePool;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS applied_batches (
        batch_id TEXT PRIMARY KEY,
        at TEXT NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS records (
        kind TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        id TEXT NOT NULL,
        record TEXT NOT NULL,
        PRIMARY KEY (kind, tenant_id, id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS signer_key_index (
        tenant_id TEXT NOT NULL,
        public_key TEXT NOT NULL,
        key_id TEXT NOT NULL,
        PRIMARY KEY (tenant_id, public_key)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        tenant_id TEXT NOT NULL,
        aggregate_kind TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        event TEXT NOT NULL,
        chain_hash TEXT NOT NULL,
        PRIMARY KEY (tenant_id, aggregate_kind, aggregate_id, idx)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ledger_entries (
        tenant_id TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        entry TEXT NOT NULL,
        PRIMARY KEY (tenant_id, entry_id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS idempotency (
        tenant_id TEXT NOT NULL,
        idem_key TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        response TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, idem_key)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox_seq (
        tenant_id TEXT PRIMARY KEY,
        next_seq INTEGER NOT NULL
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS outbox (
        tenant_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        scope_key TEXT NOT NULL,
        priority INTEGER NOT NULL,
        dedupe_key TEXT NOT NULL,
        destination_ids TEXT NOT NULL,
        artifact_id TEXT NOT NULL,
        artifact_type TEXT NOT NULL,
        artifact_hash TEXT NOT NULL,
        enqueued_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, seq)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts (
        tenant_id TEXT NOT NULL,
        artifact_id TEXT NOT NULL,
        artifact TEXT NOT NULL,
        PRIMARY KEY (tenant_id, artifact_id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deliveries (
        tenant_id TEXT NOT NULL,
        delivery_id TEXT NOT NULL,
        scope_key TEXT NOT NULL,
        order_seq INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        order_key TEXT NOT NULL,
        destination_id TEXT NOT NULL,
        artifact_id TEXT NOT NULL,
        artifact_type TEXT NOT NULL,
        artifact_hash TEXT NOT NULL,
        dedupe_key TEXT NOT NULL,
        state TEXT NOT NULL,
        attempts INTEGER NOT NULL,
        next_attempt_at TEXT NOT NULL,
        claimed_at TEXT,
        worker TEXT,
        last_status INTEGER,
        last_error TEXT,
        expires_at TEXT,
        created_at TEXT NOT NULL,
        delivered_at TEXT,
        PRIMARY KEY (tenant_id, delivery_id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS control_events (
        tenant_id TEXT NOT NULL,
        event_id TEXT NOT NULL,
        canonical TEXT NOT NULL,
        PRIMARY KEY (tenant_id, event_id)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS control_states (
        tenant_id TEXT NOT NULL,
        scope_type TEXT NOT NULL,
        scope_id TEXT NOT NULL,
        control_type TEXT NOT NULL,
        active INTEGER NOT NULL,
        revision INTEGER NOT NULL,
        updated_at TEXT NOT NULL,
        last_event_id TEXT NOT NULL,
        PRIMARY KEY (tenant_id, scope_type, scope_id, control_type)
    ) STRICT
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ingest (
        tenant_id TEXT NOT NULL,
        source TEXT NOT NULL,
        external_event_id TEXT NOT NULL,
        payload TEXT NOT NULL,
        received_at TEXT NOT NULL,
        PRIMARY KEY (tenant_id, source, external_event_id)
    ) STRICT
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_deliveries_due \
     ON deliveries (state, next_attempt_at, claimed_at)",
    "CREATE INDEX IF NOT EXISTS idx_deliveries_scope \
     ON deliveries (tenant_id, scope_key, order_seq)",
    "CREATE INDEX IF NOT EXISTS idx_records_status \
     ON records (kind, tenant_id, id)",
];

/// Create any missing tables and indexes.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in TABLES.iter().chain(INDEXES) {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
