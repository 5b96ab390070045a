use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::WorkerStatus;

/// Why a monitoring entry was retired. Persisted as the audit event
/// action, so the string values are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    WorkerReady,
    BootstrapTriggered,
    WorkerStopped,
    WorkerError,
    WorkerMissing,
    MaxChecksReached,
    ManualStop,
    Shutdown,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::WorkerReady => "worker_ready",
            CompletionReason::BootstrapTriggered => "bootstrap_triggered",
            CompletionReason::WorkerStopped => "worker_stopped",
            CompletionReason::WorkerError => "worker_error",
            CompletionReason::WorkerMissing => "worker_missing",
            CompletionReason::MaxChecksReached => "max_checks_reached",
            CompletionReason::ManualStop => "manual_stop",
            CompletionReason::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live polling task paired with one worker. In-memory only; at most
/// one entry per worker id exists at any time.
#[derive(Debug)]
pub(crate) struct SchedulerEntry {
    pub worker_id: i64,
    /// Cancels the timer task. Fired on removal, before the entry drops.
    pub token: CancellationToken,
    pub handle: JoinHandle<()>,
    pub check_count: u32,
    pub last_status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl SchedulerEntry {
    pub fn info(&self) -> SchedulerEntryInfo {
        SchedulerEntryInfo {
            worker_id: self.worker_id,
            check_count: self.check_count,
            last_status: self.last_status,
            created_at: self.created_at,
            last_check_at: self.last_check_at,
        }
    }
}

/// Read-only snapshot of a scheduler entry for observability endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerEntryInfo {
    pub worker_id: i64,
    pub check_count: u32,
    pub last_status: WorkerStatus,
    pub created_at: DateTime<Utc>,
    pub last_check_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_reason_strings_are_stable() {
        assert_eq!(CompletionReason::MaxChecksReached.to_string(), "max_checks_reached");
        assert_eq!(CompletionReason::BootstrapTriggered.to_string(), "bootstrap_triggered");
        assert_eq!(CompletionReason::WorkerMissing.to_string(), "worker_missing");
        assert_eq!(CompletionReason::ManualStop.to_string(), "manual_stop");
    }
}
