//! The insolvency sweep worker: tenant-paged solvency evaluation under a
//! bounded processing budget.

use async_trait::async_trait;
use serde::Serialize;

use proxy_store_core::AgentDirectory;
use proxy_types::{ensure_positive_safe_int, now_iso, CoreError};

/// Verdict for one agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolvencyVerdict {
    /// Whether the agent can no longer cover its obligations.
    pub insolvent: bool,
    /// Optional evaluator detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of freezing an agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreezeOutcome {
    /// Whether the freeze changed anything (false when already frozen).
    pub changed: bool,
}

/// Domain capability evaluating and freezing agents. The settlement
/// semantics live outside the core; the sweep only drives the calls.
#[async_trait]
pub trait SolvencyEngine: Send + Sync {
    /// Evaluate one agent.
    async fn evaluate_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> anyhow::Result<SolvencyVerdict>;

    /// Freeze one agent.
    async fn freeze_agent(&self, tenant_id: &str, agent_id: &str) -> anyhow::Result<FreezeOutcome>;
}

/// Budget for one sweep pass. All counts must be positive safe integers.
#[derive(Debug, Clone)]
pub struct InsolvencySweepOptions {
    /// Restrict the sweep to one tenant.
    pub tenant_id: Option<String>,
    /// Tenants considered per pass.
    pub max_tenants: u64,
    /// Agents scanned per pass, across all tenants.
    pub max_messages: u64,
    /// Page size while walking a tenant's active agents.
    pub batch_size: u64,
}

impl Default for InsolvencySweepOptions {
    fn default() -> Self {
        Self {
            tenant_id: None,
            max_tenants: 100,
            max_messages: 500,
            batch_size: 50,
        }
    }
}

impl InsolvencySweepOptions {
    fn validate(&self) -> Result<(), CoreError> {
        ensure_positive_safe_int("maxTenants", self.max_tenants)?;
        ensure_positive_safe_int("maxMessages", self.max_messages)?;
        ensure_positive_safe_int("batchSize", self.batch_size)
    }
}

/// Per-agent outcome record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    /// Tenant the agent belongs to.
    pub tenant_id: String,
    /// The agent.
    pub agent_id: String,
    /// `frozen`, `skipped` or `error`.
    pub action: String,
    /// Stable error code for `error` outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error detail for `error` outcomes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether a freeze changed anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changed: Option<bool>,
}

/// Sweep pass summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InsolvencySweepReport {
    /// False when any agent produced an error outcome.
    pub ok: bool,
    /// Pass start time.
    pub started_at: String,
    /// Tenants enumerated.
    pub tenant_count: usize,
    /// Agents pulled from pages (bounded by `maxMessages`).
    pub scanned: usize,
    /// Agents whose evaluation completed.
    pub processed: usize,
    /// Agents frozen this pass.
    pub frozen: usize,
    /// Agents left untouched (solvent, or freeze was a no-op).
    pub skipped: usize,
    /// Agents whose evaluation or freeze errored.
    pub failures: usize,
    /// Per-agent outcomes in scan order.
    pub outcomes: Vec<SweepOutcome>,
}

/// Walk active agents tenant by tenant, evaluating solvency and freezing as
/// needed, until the budget is spent. Evaluation errors are captured per
/// agent and never halt the pass.
pub async fn tick_insolvency_sweep(
    directory: &dyn AgentDirectory,
    engine: &dyn SolvencyEngine,
    options: InsolvencySweepOptions,
) -> anyhow::Result<InsolvencySweepReport> {
    options.validate()?;
    let started_at = now_iso();

    let mut tenants = match &options.tenant_id {
        Some(tenant_id) => vec![tenant_id.clone()],
        None => directory.tenants().await?,
    };
    tenants.sort();
    tenants.dedup();
    tenants.truncate(options.max_tenants as usize);

    let mut report = InsolvencySweepReport {
        ok: true,
        started_at,
        tenant_count: tenants.len(),
        scanned: 0,
        processed: 0,
        frozen: 0,
        skipped: 0,
        failures: 0,
        outcomes: Vec::new(),
    };

    let batch_size = options.batch_size as usize;
    let max_messages = options.max_messages as usize;

    'tenants: for tenant_id in &tenants {
        let mut offset = 0;
        loop {
            let page = directory.active_agents(tenant_id, offset, batch_size).await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            for agent_id in page {
                if report.scanned >= max_messages {
                    break 'tenants;
                }
                report.scanned += 1;
                sweep_agent(engine, tenant_id, &agent_id, &mut report).await;
            }
            if page_len < batch_size {
                break;
            }
            offset += batch_size;
        }
    }

    report.ok = report.failures == 0;
    Ok(report)
}

async fn sweep_agent(
    engine: &dyn SolvencyEngine,
    tenant_id: &str,
    agent_id: &str,
    report: &mut InsolvencySweepReport,
) {
    let outcome = async {
        let verdict = engine.evaluate_agent(tenant_id, agent_id).await?;
        if !verdict.insolvent {
            return Ok::<_, anyhow::Error>(("skipped".to_string(), None));
        }
        let freeze = engine.freeze_agent(tenant_id, agent_id).await?;
        let action = if freeze.changed { "frozen" } else { "skipped" };
        Ok((action.to_string(), Some(freeze.changed)))
    }
    .await;

    match outcome {
        Ok((action, changed)) => {
            report.processed += 1;
            match action.as_str() {
                "frozen" => report.frozen += 1,
                _ => report.skipped += 1,
            }
            report.outcomes.push(SweepOutcome {
                tenant_id: tenant_id.to_string(),
                agent_id: agent_id.to_string(),
                action,
                code: None,
                message: None,
                changed,
            });
        }
        Err(error) => {
            report.failures += 1;
            report.outcomes.push(SweepOutcome {
                tenant_id: tenant_id.to_string(),
                agent_id: agent_id.to_string(),
                action: "error".to_string(),
                code: Some("SWEEP_AGENT_ERROR".to_string()),
                message: Some(error.to_string()),
                changed: None,
            });
        }
    }
}
