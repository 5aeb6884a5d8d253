//! The periodic tick scheduler.
//!
//! All background sweeps run under a single-flight guard: one pass at a
//! time per process, re-entrant calls return immediately. Sweeps run in a
//! fixed order; a failing sweep is logged and the pass continues.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use proxy_types::now_iso;

/// One background sweep.
#[async_trait]
pub trait Sweep: Send + Sync {
    /// Stable sweep name for logs.
    fn name(&self) -> &'static str;
    /// Run one pass. Errors are caught by the scheduler.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Single-flight driver for an ordered list of sweeps.
pub struct TickScheduler {
    sweeps: Vec<Arc<dyn Sweep>>,
    in_flight: Mutex<()>,
    stopped: AtomicBool,
    shutdown: Notify,
    last_tick_at: RwLock<Option<String>>,
    last_success_at: RwLock<Option<String>>,
}

impl TickScheduler {
    /// A scheduler over sweeps in their execution order.
    pub fn new(sweeps: Vec<Arc<dyn Sweep>>) -> Self {
        Self {
            sweeps,
            in_flight: Mutex::new(()),
            stopped: AtomicBool::new(false),
            shutdown: Notify::new(),
            last_tick_at: RwLock::new(None),
            last_success_at: RwLock::new(None),
        }
    }

    /// Run one pass. Returns `false` without doing anything when a pass is
    /// already in flight or the scheduler is stopped.
    pub async fn run_tick_once(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(_guard) = self.in_flight.try_lock() else {
            return false;
        };
        *self.last_tick_at.write().await = Some(now_iso());

        let mut clean = true;
        for sweep in &self.sweeps {
            if let Err(error) = sweep.run().await {
                clean = false;
                warn!(sweep = sweep.name(), %error, "sweep failed; pass continues");
            }
        }
        if clean {
            *self.last_success_at.write().await = Some(now_iso());
        }
        debug!(clean, "tick pass finished");
        true
    }

    /// Drive ticks on a fixed interval until [`TickScheduler::shutdown`].
    pub fn spawn(self: &Arc<Self>, interval_ms: u64) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a tokio interval completes immediately;
            // consume it so the loop fires one interval after start.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if scheduler.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        scheduler.run_tick_once().await;
                    }
                    _ = scheduler.shutdown.notified() => break,
                }
            }
        })
    }

    /// Stop the timer and wait for any in-flight pass to finish. The pass
    /// is never aborted mid-sweep.
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        let _wait_for_in_flight = self.in_flight.lock().await;
    }

    /// Start time of the most recent pass.
    pub async fn last_tick_at(&self) -> Option<String> {
        self.last_tick_at.read().await.clone()
    }

    /// Completion time of the most recent fully clean pass.
    pub async fn last_success_at(&self) -> Option<String> {
        self.last_success_at.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSweep {
        runs: AtomicUsize,
        block: Option<Arc<Notify>>,
        fail: bool,
    }

    #[async_trait]
    impl Sweep for CountingSweep {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(block) = &self.block {
                block.notified().await;
            }
            if self.fail {
                anyhow::bail!("sweep exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn reentrant_ticks_return_immediately() {
        let gate = Arc::new(Notify::new());
        let sweep = Arc::new(CountingSweep {
            runs: AtomicUsize::new(0),
            block: Some(Arc::clone(&gate)),
            fail: false,
        });
        let scheduler = Arc::new(TickScheduler::new(vec![sweep.clone()]));

        let running = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_tick_once().await })
        };
        // Let the first pass enter the sweep and park.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!scheduler.run_tick_once().await, "second caller must bounce");

        gate.notify_waiters();
        assert!(running.await.unwrap());
        assert_eq!(sweep.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_sweep_does_not_stop_later_sweeps() {
        let failing = Arc::new(CountingSweep {
            runs: AtomicUsize::new(0),
            block: None,
            fail: true,
        });
        let after = Arc::new(CountingSweep {
            runs: AtomicUsize::new(0),
            block: None,
            fail: false,
        });
        let scheduler =
            TickScheduler::new(vec![failing.clone() as Arc<dyn Sweep>, after.clone()]);

        assert!(scheduler.run_tick_once().await);
        assert_eq!(failing.runs.load(Ordering::SeqCst), 1);
        assert_eq!(after.runs.load(Ordering::SeqCst), 1);

        // A dirty pass records a tick but no success.
        assert!(scheduler.last_tick_at().await.is_some());
        assert!(scheduler.last_success_at().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_in_flight_pass() {
        let gate = Arc::new(Notify::new());
        let sweep = Arc::new(CountingSweep {
            runs: AtomicUsize::new(0),
            block: Some(Arc::clone(&gate)),
            fail: false,
        });
        let scheduler = Arc::new(TickScheduler::new(vec![sweep.clone()]));

        let pass = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run_tick_once().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished(), "shutdown must wait for the pass");

        gate.notify_waiters();
        pass.await.unwrap();
        shutdown.await.unwrap();

        // Stopped: further ticks bounce.
        assert!(!scheduler.run_tick_once().await);
    }
}
