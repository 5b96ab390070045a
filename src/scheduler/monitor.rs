//! Per-worker lifecycle monitoring.
//!
//! Each monitored worker gets one periodic task that polls its record
//! from storage, hands off to the engine bootstrap the moment the worker
//! becomes usable, and retires itself on any terminal condition. The
//! registry guarantees at most one task per worker id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::comfy::setup::EngineBootstrap;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::scheduler::entry::{CompletionReason, SchedulerEntry, SchedulerEntryInfo};
use crate::store::{AuditEvent, AuditLog, WorkerStore};
use crate::worker::{SetupStatus, WorkerStatus, WorkerUpdate};

pub struct WorkerMonitor {
    config: SchedulerConfig,
    store: Arc<dyn WorkerStore>,
    audit: Arc<dyn AuditLog>,
    bootstrap: Arc<dyn EngineBootstrap>,
    entries: Mutex<HashMap<i64, SchedulerEntry>>,
}

impl WorkerMonitor {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn WorkerStore>,
        audit: Arc<dyn AuditLog>,
        bootstrap: Arc<dyn EngineBootstrap>,
    ) -> Self {
        Self {
            config,
            store,
            audit,
            bootstrap,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Start monitoring a worker. Idempotent: a second call for the same
    /// worker is a no-op while the first entry is alive. Unknown workers
    /// are logged and skipped without creating an entry.
    pub async fn schedule_monitoring(self: &Arc<Self>, worker_id: i64) -> Result<()> {
        // The registry lock is held across the existence check and the
        // insert so concurrent calls cannot both create an entry.
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&worker_id) {
            debug!(worker_id, "monitor already active, ignoring");
            return Ok(());
        }

        let Some(worker) = self.store.get_worker(worker_id).await? else {
            warn!(worker_id, "cannot monitor unknown worker");
            return Ok(());
        };

        let token = CancellationToken::new();
        let handle = self.spawn_poll_loop(worker_id, token.clone());
        entries.insert(
            worker_id,
            SchedulerEntry {
                worker_id,
                token,
                handle,
                check_count: 0,
                last_status: worker.status,
                created_at: Utc::now(),
                last_check_at: None,
            },
        );
        drop(entries);

        if let Err(err) = self
            .store
            .update_worker(
                worker_id,
                WorkerUpdate {
                    scheduler_active: Some(true),
                    check_count: Some(0),
                    scheduler_started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
        {
            warn!(worker_id, error = %err, "failed to persist scheduler start");
        }

        info!(worker_id, status = %worker.status, "started worker monitor");
        Ok(())
    }

    fn spawn_poll_loop(self: &Arc<Self>, worker_id: i64, token: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let poll_interval = self.config.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval yields immediately; the first check waits one period
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => monitor.check_status(worker_id).await,
                }
            }
            debug!(worker_id, "poll loop exited");
        })
    }

    /// One monitoring tick. Any error is logged and swallowed: a failed
    /// check never tears down the entry, only the terminal conditions in
    /// `run_check` do.
    pub async fn check_status(&self, worker_id: i64) {
        if let Err(err) = self.run_check(worker_id).await {
            warn!(worker_id, error = %err, "status check failed, monitoring continues");
        }
    }

    async fn run_check(&self, worker_id: i64) -> Result<()> {
        // Guards against a tick racing entry removal.
        let check_count = {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&worker_id) {
                Some(entry) => {
                    entry.check_count += 1;
                    entry.last_check_at = Some(Utc::now());
                    entry.check_count
                }
                None => return Ok(()),
            }
        };

        let Some(worker) = self.store.get_worker(worker_id).await? else {
            warn!(worker_id, "worker record disappeared, retiring monitor");
            self.remove_with_reason(worker_id, CompletionReason::WorkerMissing)
                .await;
            return Ok(());
        };

        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = entries.get_mut(&worker_id) {
                entry.last_status = worker.status;
            }
        }

        if worker.status == WorkerStatus::Running && worker.setup_status != SetupStatus::Ready {
            // Bootstrap and monitoring are mutually exclusive: the entry
            // goes away before the hand-off so the trigger fires at most
            // once even with a tick in flight.
            info!(worker_id, check_count, "worker is up, handing off to engine bootstrap");
            self.remove_with_reason(worker_id, CompletionReason::BootstrapTriggered)
                .await;
            if let Err(err) = self.bootstrap.start_setup(worker_id).await {
                error!(worker_id, error = %err, "engine bootstrap failed to start");
            }
            return Ok(());
        }

        if worker.status == WorkerStatus::Ready
            || (worker.status == WorkerStatus::Running && worker.setup_status == SetupStatus::Ready)
        {
            info!(worker_id, check_count, "worker already configured, retiring monitor");
            self.remove_with_reason(worker_id, CompletionReason::WorkerReady)
                .await;
            return Ok(());
        }

        if worker.status.is_terminal() {
            let reason = match worker.status {
                WorkerStatus::Error => CompletionReason::WorkerError,
                _ => CompletionReason::WorkerStopped,
            };
            info!(worker_id, status = %worker.status, check_count, "worker reached terminal status");
            self.remove_with_reason(worker_id, reason).await;
            return Ok(());
        }

        if check_count >= self.config.max_checks {
            warn!(
                worker_id,
                check_count,
                max_checks = self.config.max_checks,
                "check ceiling reached, giving up on worker"
            );
            self.remove_with_reason(worker_id, CompletionReason::MaxChecksReached)
                .await;
            return Ok(());
        }

        self.store
            .update_worker(
                worker_id,
                WorkerUpdate {
                    check_count: Some(check_count),
                    last_check_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        debug!(worker_id, status = %worker.status, check_count, "worker not ready yet");
        Ok(())
    }

    /// Stop monitoring a worker. Idempotent; safe to call while a tick is
    /// in flight. No further ticks fire after this returns.
    pub async fn remove_scheduler(&self, worker_id: i64) -> bool {
        self.remove_with_reason(worker_id, CompletionReason::ManualStop)
            .await
    }

    async fn remove_with_reason(&self, worker_id: i64, reason: CompletionReason) -> bool {
        let Some(entry) = self.entries.lock().await.remove(&worker_id) else {
            return false;
        };
        entry.token.cancel();
        info!(worker_id, reason = %reason, check_count = entry.check_count, "monitor removed");

        let severity = match reason {
            CompletionReason::WorkerError
            | CompletionReason::WorkerMissing
            | CompletionReason::MaxChecksReached => "warning",
            _ => "info",
        };
        self.audit
            .append(AuditEvent::new(
                "scheduler",
                reason.as_str(),
                format!("worker:{worker_id}"),
                severity,
                serde_json::json!({ "check_count": entry.check_count }),
            ))
            .await;

        // The in-memory removal above is authoritative; the persisted
        // flag is best-effort telemetry and is not retried.
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(err) = store
                .update_worker(
                    worker_id,
                    WorkerUpdate {
                        scheduler_active: Some(false),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(worker_id, error = %err, "failed to clear scheduler-active flag");
            }
        });
        true
    }

    /// Snapshot of one entry, if the worker is currently monitored.
    pub async fn get_scheduler_info(&self, worker_id: i64) -> Option<SchedulerEntryInfo> {
        self.entries
            .lock()
            .await
            .get(&worker_id)
            .map(SchedulerEntry::info)
    }

    /// Snapshots of every monitored worker.
    pub async fn scheduled_workers(&self) -> Vec<SchedulerEntryInfo> {
        self.entries
            .lock()
            .await
            .values()
            .map(SchedulerEntry::info)
            .collect()
    }

    /// Retire every monitor. Called on process shutdown.
    pub async fn stop_all(&self) {
        let worker_ids: Vec<i64> = self.entries.lock().await.keys().copied().collect();
        info!(count = worker_ids.len(), "stopping all worker monitors");
        for worker_id in worker_ids {
            self.remove_with_reason(worker_id, CompletionReason::Shutdown)
                .await;
        }
    }
}
