// Tick driver: the time-driven loop that fires due definitions
//
// One logical timer loop per scheduler instance. Each wake-up collects the
// definitions whose armed fire instant has arrived, advances every such
// schedule from the instant that fired (whatever the dispatch outcome, so a
// skipped fire can never wedge a key), and runs admit -> dispatch for all
// due keys concurrently. The tick completes only when every attempt has
// resolved, so a key never has two in-flight fires.

use crate::clock::Clock;
use crate::dedup::{Admission, DedupStore};
use crate::dispatcher::Dispatcher;
use crate::table::{ScheduleTable, TaskDefinition};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

/// Configuration for the tick driver
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Wake-up interval in seconds. Cron resolution is one minute, so values
    /// below 60 only tighten fire latency, they never add fires.
    pub tick_interval_seconds: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 60,
        }
    }
}

/// What one wake-up did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub dispatched: usize,
    pub duplicates: usize,
    pub failures: usize,
}

enum FireOutcome {
    Dispatched,
    Duplicate,
    Failed,
}

/// Driver operations
#[async_trait]
pub trait Driver: Send + Sync {
    /// Run the tick loop until a shutdown signal arrives
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Request a graceful stop
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Evaluate one tick: fire everything currently due
    async fn process_due_tasks(&self) -> TickReport;
}

/// Tick driver engine
pub struct TickDriver {
    config: DriverConfig,
    table: Arc<ScheduleTable>,
    dedup: Arc<dyn DedupStore>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    armed: Mutex<HashMap<String, DateTime<Utc>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TickDriver {
    pub fn new(
        config: DriverConfig,
        table: Arc<ScheduleTable>,
        dedup: Arc<dyn DedupStore>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _shutdown_rx) = broadcast::channel(1);

        Self {
            config,
            table,
            dedup,
            dispatcher,
            clock,
            armed: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Arm every definition from "now"
    ///
    /// Fire instants missed while the process was down are dropped, not
    /// backfilled: only the single next occurrence after startup is
    /// considered. Deliberate policy; a restart after an outage must not
    /// unleash a burst of overdue jobs.
    pub fn arm_all(&self) {
        let now = self.clock.now();
        let mut armed = self.lock_armed();
        armed.clear();

        for definition in self.table.iter() {
            match definition.cron.next_after(now) {
                Ok(instant) => {
                    debug!(
                        task_key = %definition.key,
                        next_fire = %instant,
                        "Task armed"
                    );
                    armed.insert(definition.key.clone(), instant);
                }
                Err(error) => {
                    error!(
                        task_key = %definition.key,
                        cron = %definition.cron,
                        error = %error,
                        "Failed to arm task, disabling it for this run"
                    );
                }
            }
        }
    }

    fn lock_armed(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        match self.armed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Collect due definitions and advance their schedules
    ///
    /// Advancing happens before dispatch and independently of its outcome:
    /// the next occurrence is seeded from the instant that just fired.
    fn collect_due(&self, now: DateTime<Utc>) -> Vec<(TaskDefinition, DateTime<Utc>)> {
        let mut due = Vec::new();
        let mut armed = self.lock_armed();

        for definition in self.table.iter() {
            let Some(next_fire) = armed.get(&definition.key).copied() else {
                continue;
            };
            if next_fire > now {
                continue;
            }

            match definition.cron.next_after(next_fire) {
                Ok(instant) => {
                    armed.insert(definition.key.clone(), instant);
                }
                Err(error) => {
                    // Impossible for a load-validated expression; surfaced
                    // loudly, never silently skipped.
                    error!(
                        task_key = %definition.key,
                        cron = %definition.cron,
                        error = %error,
                        "Re-arm failed, disabling task for this run"
                    );
                    armed.remove(&definition.key);
                }
            }

            due.push((definition.clone(), next_fire));
        }

        due
    }

    async fn attempt_fire(
        dedup: Arc<dyn DedupStore>,
        dispatcher: Arc<Dispatcher>,
        definition: TaskDefinition,
        scheduled_at: DateTime<Utc>,
    ) -> FireOutcome {
        match dedup.try_admit(&definition.key, scheduled_at).await {
            Ok(Admission::Admitted) => {
                match dispatcher.dispatch(&definition, scheduled_at).await {
                    Ok(()) => {
                        info!(
                            task_key = %definition.key,
                            scheduled_at = %scheduled_at,
                            "Fire dispatched"
                        );
                        FireOutcome::Dispatched
                    }
                    Err(error) => {
                        error!(
                            task_key = %definition.key,
                            scheduled_at = %scheduled_at,
                            error = %error,
                            "Dispatch failed, releasing fire record"
                        );
                        // Rollback keeps the instant retryable; the key is
                        // NOT re-armed for it, the next occurrence proceeds
                        // normally.
                        if let Err(release_error) =
                            dedup.release(&definition.key, scheduled_at).await
                        {
                            warn!(
                                task_key = %definition.key,
                                error = %release_error,
                                "Failed to release fire record"
                            );
                        }
                        FireOutcome::Failed
                    }
                }
            }
            Ok(Admission::Duplicate) => {
                debug!(
                    task_key = %definition.key,
                    scheduled_at = %scheduled_at,
                    "Fire already admitted elsewhere"
                );
                telemetry::record_duplicate_fire(&definition.key);
                FireOutcome::Duplicate
            }
            Err(error) => {
                // No admission means no exactly-once guarantee: skip this
                // fire. The schedule has already advanced.
                error!(
                    task_key = %definition.key,
                    scheduled_at = %scheduled_at,
                    error = %error,
                    "Dedup store unavailable, skipping fire"
                );
                FireOutcome::Failed
            }
        }
    }
}

#[async_trait]
impl Driver for TickDriver {
    /// Run the tick loop
    ///
    /// In-flight dispatch attempts always finish before shutdown is
    /// observed: each tick is awaited to completion inside the select loop.
    #[instrument(skip(self))]
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!(
            tick_interval_seconds = self.config.tick_interval_seconds,
            task_count = self.table.len(),
            "Starting tick driver"
        );

        self.arm_all();

        let mut tick = interval(Duration::from_secs(self.config.tick_interval_seconds));
        let mut shutdown_rx = self.shutdown_receiver();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.process_due_tasks().await;
                    if report.due > 0 {
                        info!(
                            due = report.due,
                            dispatched = report.dispatched,
                            duplicates = report.duplicates,
                            failures = report.failures,
                            "Tick complete"
                        );
                    } else {
                        debug!("No tasks due");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping tick driver");
                    break;
                }
            }
        }

        info!("Tick driver stopped");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn stop(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Stopping tick driver");
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    /// Evaluate one tick
    ///
    /// Dispatch attempts for different keys run concurrently; a slow or
    /// failing key cannot block the others. The report is returned once
    /// every attempt has resolved.
    #[instrument(skip(self))]
    async fn process_due_tasks(&self) -> TickReport {
        let now = self.clock.now();
        let due = self.collect_due(now);

        if due.is_empty() {
            return TickReport::default();
        }
        debug!(due = due.len(), "Evaluating due tasks");

        let attempts = due.iter().map(|(definition, scheduled_at)| {
            Self::attempt_fire(
                self.dedup.clone(),
                self.dispatcher.clone(),
                definition.clone(),
                *scheduled_at,
            )
        });

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        for outcome in join_all(attempts).await {
            match outcome {
                FireOutcome::Dispatched => report.dispatched += 1,
                FireOutcome::Duplicate => report.duplicates += 1,
                FireOutcome::Failed => report.failures += 1,
            }
        }

        report
    }
}
