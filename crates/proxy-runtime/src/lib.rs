#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **proxy-runtime** – Node assembly.
//!
//! Wires the kernel (with transaction-log replay on boot), the optional
//! relational mirror, the delivery worker and the background sweeps into
//! one runtime with a periodic single-flight tick loop and cooperative
//! shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use proxy_delivery::{
    DeliveryWorker, DestinationResolver, InMemoryDestinations, SecretsProvider,
    StaticSecretsProvider, TickOptions,
};
use proxy_kernel::Kernel;
use proxy_store_core::{
    AgentDirectory, DeliveryBackend, MetricsSink, MirrorStore, OutboxProcessor,
};
use proxy_store_sqlite::SqliteMirror;
use proxy_txlog::TxLog;
use proxy_types::{now_iso, EntityKind, Op, UpsertOp};

mod config;
mod sweep;
mod tick;

pub use config::RuntimeConfig;
pub use sweep::{
    tick_insolvency_sweep, FreezeOutcome, InsolvencySweepOptions, InsolvencySweepReport,
    SolvencyEngine, SolvencyVerdict, SweepOutcome,
};
pub use tick::{Sweep, TickScheduler};

//─────────────────────────────
//  Extension points
//─────────────────────────────

/// Fixed sweep slots reserved for the domain layers. The core runs its own
/// sweeps (outbox drain, deliveries, insolvency) and executes registered
/// hooks at these positions of the tick order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[allow(missing_docs)]
pub enum SweepSlot {
    Dispatch,
    Proof,
    Artifacts,
    X402Holdbacks,
    WinddownReversals,
    BillingSync,
    FinanceReconciliation,
}

/// Capabilities and hooks injected at boot.
#[derive(Default)]
pub struct RuntimeExtensions {
    /// Secret resolution; defaults to an empty static provider.
    pub secrets: Option<Arc<dyn SecretsProvider>>,
    /// Solvency evaluation; defaults to the lifecycle-record engine.
    pub solvency: Option<Arc<dyn SolvencyEngine>>,
    /// Domain sweeps, run at their slot position in the tick order.
    pub hooks: Vec<(SweepSlot, Arc<dyn Sweep>)>,
}

//─────────────────────────────
//  Runtime
//─────────────────────────────

/// One assembled node.
pub struct Runtime {
    config: RuntimeConfig,
    kernel: Arc<Kernel>,
    mirror: Option<SqliteMirror>,
    destinations: Arc<InMemoryDestinations>,
    worker: Arc<DeliveryWorker>,
    scheduler: Arc<TickScheduler>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsSink,
}

impl Runtime {
    /// Boot with default extensions.
    pub async fn start(config: RuntimeConfig) -> Result<Self> {
        Self::start_with(config, RuntimeExtensions::default()).await
    }

    /// Boot: open and replay the transaction log, bring the mirror up to
    /// date, start the delivery worker and the tick loop.
    pub async fn start_with(config: RuntimeConfig, extensions: RuntimeExtensions) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data dir {}", config.data_dir.display()))?;

        let metrics = MetricsSink::new();
        let txlog_path = config.txlog_path();
        let records = TxLog::load(&txlog_path)?;
        let txlog = Arc::new(TxLog::open(&txlog_path)?);

        let mirror = match &config.db_path {
            Some(path) => Some(SqliteMirror::open(path).await?),
            None => None,
        };

        let mut kernel = Kernel::new()
            .with_metrics(metrics.clone())
            .with_txlog(txlog);
        if let Some(mirror) = &mirror {
            kernel = kernel.with_mirror(Arc::new(mirror.clone()) as Arc<dyn MirrorStore>);
        }
        let kernel = Arc::new(kernel);
        let replayed = kernel.replay(&records).await?;
        if let Some(mirror) = &mirror {
            // Idempotent catch-up: batches already mirrored are skipped by
            // their content hash.
            for record in &records {
                mirror.apply_batch(&record.at, &record.ops).await?;
            }
        }
        info!(replayed, "transaction log replayed");

        let destinations = Arc::new(InMemoryDestinations::new());
        let secrets = extensions
            .secrets
            .unwrap_or_else(|| Arc::new(StaticSecretsProvider::new()));

        let (claims, processor, directory): (
            Arc<dyn DeliveryBackend>,
            Arc<dyn OutboxProcessor>,
            Arc<dyn AgentDirectory>,
        ) = match &mirror {
            Some(mirror) => (
                Arc::new(mirror.clone()),
                Arc::new(mirror.clone()),
                Arc::new(mirror.clone()),
            ),
            None => (kernel.clone(), kernel.clone(), kernel.clone()),
        };

        let worker = Arc::new(DeliveryWorker::new(
            claims,
            Arc::clone(&destinations) as Arc<dyn DestinationResolver>,
            secrets,
            metrics.clone(),
            config.delivery_config(),
        )?);

        let solvency = extensions
            .solvency
            .unwrap_or_else(|| Arc::new(RecordSolvencyEngine::new(Arc::clone(&kernel))));

        let sweeps = assemble_sweeps(
            &config,
            processor,
            Arc::clone(&worker),
            directory,
            solvency,
            extensions.hooks,
        );
        let scheduler = Arc::new(TickScheduler::new(sweeps));
        let tick_task = scheduler.spawn(config.autotick_interval_ms);

        Ok(Self {
            config,
            kernel,
            mirror,
            destinations,
            worker,
            scheduler,
            tick_task: Mutex::new(Some(tick_task)),
            metrics,
        })
    }

    /// The kernel (command surface and in-memory reads).
    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Destination registry for the delivery worker.
    pub fn destinations(&self) -> &Arc<InMemoryDestinations> {
        &self.destinations
    }

    /// The delivery worker.
    pub fn worker(&self) -> &Arc<DeliveryWorker> {
        &self.worker
    }

    /// The tick scheduler.
    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    /// Shared counters.
    pub fn metrics(&self) -> &MetricsSink {
        &self.metrics
    }

    /// Resolved configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Run one tick pass outside the timer (admin surface).
    pub async fn tick_once(&self) -> bool {
        self.scheduler.run_tick_once().await
    }

    /// Cooperative shutdown: stop the timer, wait for the in-flight pass,
    /// close the mirror.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        if let Some(task) = self.tick_task.lock().await.take() {
            if let Err(error) = task.await {
                warn!(%error, "tick task ended abnormally");
            }
        }
        if let Some(mirror) = &self.mirror {
            mirror.close().await;
        }
        info!("runtime stopped");
    }
}

fn assemble_sweeps(
    config: &RuntimeConfig,
    processor: Arc<dyn OutboxProcessor>,
    worker: Arc<DeliveryWorker>,
    directory: Arc<dyn AgentDirectory>,
    solvency: Arc<dyn SolvencyEngine>,
    hooks: Vec<(SweepSlot, Arc<dyn Sweep>)>,
) -> Vec<Arc<dyn Sweep>> {
    let hook = |slot: SweepSlot| -> Vec<Arc<dyn Sweep>> {
        hooks
            .iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, sweep)| Arc::clone(sweep))
            .collect()
    };

    // Fixed tick order; domain hooks run at their reserved positions.
    let mut sweeps: Vec<Arc<dyn Sweep>> = vec![Arc::new(OutboxDrainSweep {
        processor,
        batch: config.outbox_batch,
    })];
    sweeps.extend(hook(SweepSlot::Dispatch));
    sweeps.extend(hook(SweepSlot::Proof));
    sweeps.extend(hook(SweepSlot::Artifacts));
    sweeps.push(Arc::new(DeliveriesSweep {
        worker,
        batch: config.delivery_batch,
    }));
    sweeps.extend(hook(SweepSlot::X402Holdbacks));
    sweeps.push(Arc::new(InsolvencySweep {
        directory,
        solvency,
    }));
    sweeps.extend(hook(SweepSlot::WinddownReversals));
    sweeps.extend(hook(SweepSlot::BillingSync));
    sweeps.extend(hook(SweepSlot::FinanceReconciliation));
    sweeps
}

//─────────────────────────────
//  Built-in sweeps
//─────────────────────────────

struct OutboxDrainSweep {
    processor: Arc<dyn OutboxProcessor>,
    batch: usize,
}

#[async_trait]
impl Sweep for OutboxDrainSweep {
    fn name(&self) -> &'static str {
        "outbox_drain"
    }

    async fn run(&self) -> Result<()> {
        let report = self.processor.process_outbox(self.batch).await?;
        let pruned = self.processor.prune_expired_deliveries(&now_iso()).await?;
        if report.drained > 0 || pruned > 0 {
            info!(
                drained = report.drained,
                fanned_out = report.deliveries_created,
                pruned,
                "outbox drained"
            );
        }
        Ok(())
    }
}

struct DeliveriesSweep {
    worker: Arc<DeliveryWorker>,
    batch: usize,
}

#[async_trait]
impl Sweep for DeliveriesSweep {
    fn name(&self) -> &'static str {
        "deliveries"
    }

    async fn run(&self) -> Result<()> {
        let report = self
            .worker
            .tick_deliveries(TickOptions {
                tenant_id: None,
                max_messages: self.batch,
            })
            .await?;
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                failed = report.failed,
                "delivery tick"
            );
        }
        Ok(())
    }
}

struct InsolvencySweep {
    directory: Arc<dyn AgentDirectory>,
    solvency: Arc<dyn SolvencyEngine>,
}

#[async_trait]
impl Sweep for InsolvencySweep {
    fn name(&self) -> &'static str {
        "x402_insolvency_sweep"
    }

    async fn run(&self) -> Result<()> {
        let report = tick_insolvency_sweep(
            self.directory.as_ref(),
            self.solvency.as_ref(),
            InsolvencySweepOptions::default(),
        )
        .await?;
        if report.frozen > 0 || report.failures > 0 {
            info!(
                scanned = report.scanned,
                frozen = report.frozen,
                failures = report.failures,
                "insolvency sweep"
            );
        }
        Ok(())
    }
}

//─────────────────────────────
//  Default solvency engine
//─────────────────────────────

/// Engine driven by the agent lifecycle record itself: an agent is
/// insolvent when its record says so, and freezing rewrites the record's
/// status through the kernel so the transition is journalled like any other
/// mutation.
pub struct RecordSolvencyEngine {
    kernel: Arc<Kernel>,
}

impl RecordSolvencyEngine {
    /// Engine over a kernel.
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    async fn lifecycle(&self, tenant_id: &str, agent_id: &str) -> Result<Value> {
        self.kernel
            .record(EntityKind::X402AgentLifecycles, tenant_id, agent_id)
            .await
            .with_context(|| format!("agent lifecycle {tenant_id}/{agent_id} missing"))
    }
}

#[async_trait]
impl SolvencyEngine for RecordSolvencyEngine {
    async fn evaluate_agent(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> Result<SolvencyVerdict> {
        let record = self.lifecycle(tenant_id, agent_id).await?;
        Ok(SolvencyVerdict {
            insolvent: record.get("insolvent").and_then(Value::as_bool).unwrap_or(false),
            reason: None,
        })
    }

    async fn freeze_agent(&self, tenant_id: &str, agent_id: &str) -> Result<FreezeOutcome> {
        let mut record = self.lifecycle(tenant_id, agent_id).await?;
        let already_frozen = record.get("status").and_then(Value::as_str) == Some("frozen");
        if already_frozen {
            return Ok(FreezeOutcome { changed: false });
        }
        record["status"] = Value::String("frozen".into());
        record["frozenAt"] = Value::String(now_iso());
        self.kernel
            .apply(vec![Op::X402AgentLifecycleUpserted(UpsertOp {
                tenant_id: tenant_id.to_string(),
                id: agent_id.to_string(),
                record,
            })])
            .await?;
        Ok(FreezeOutcome { changed: true })
    }
}
