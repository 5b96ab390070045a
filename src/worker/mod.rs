use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a rented worker machine.
///
/// The persisted string values are a stable contract shared with the
/// storage layer and the API; renaming one is a breaking change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Pending,
    Creating,
    Running,
    Configuring,
    Ready,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Creating => "creating",
            WorkerStatus::Running => "running",
            WorkerStatus::Configuring => "configuring",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
        }
    }

    /// Statuses the monitor can never observe a worker leaving.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerStatus::Stopped | WorkerStatus::Error)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-state of the compute-engine bootstrap, tracked independently of
/// the machine lifecycle so a failed install never forces re-provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupStatus {
    Pending,
    Installing,
    Ready,
    Failed,
}

impl SetupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SetupStatus::Pending => "pending",
            SetupStatus::Installing => "installing",
            SetupStatus::Ready => "ready",
            SetupStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SetupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rented remote machine hosting a compute engine.
///
/// Created by the allocation subsystem when a rental succeeds; the
/// monitor mutates status/setup bookkeeping, the allocation subsystem
/// owns the address and raw provider state. Never deleted by this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub name: String,
    pub status: WorkerStatus,
    pub setup_status: SetupStatus,
    /// Reachable address reported by the provider, absent until known.
    pub public_addr: Option<String>,
    pub ssh_port: u16,
    pub scheduler_active: bool,
    pub check_count: u32,
    pub scheduler_started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: i64, name: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            status: WorkerStatus::Pending,
            setup_status: SetupStatus::Pending,
            public_addr: None,
            ssh_port: 22,
            scheduler_active: false,
            check_count: 0,
            scheduler_started_at: None,
            last_check_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied to a worker record. `None` leaves a field
/// unchanged; address clearing goes through the allocation subsystem,
/// not this core, so no double-Option is needed here.
#[derive(Debug, Clone, Default)]
pub struct WorkerUpdate {
    pub status: Option<WorkerStatus>,
    pub setup_status: Option<SetupStatus>,
    pub scheduler_active: Option<bool>,
    pub check_count: Option<u32>,
    pub scheduler_started_at: Option<DateTime<Utc>>,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl WorkerUpdate {
    pub fn apply(&self, worker: &mut Worker) {
        if let Some(status) = self.status {
            worker.status = status;
        }
        if let Some(setup_status) = self.setup_status {
            worker.setup_status = setup_status;
        }
        if let Some(active) = self.scheduler_active {
            worker.scheduler_active = active;
        }
        if let Some(count) = self.check_count {
            worker.check_count = count;
        }
        if let Some(started) = self.scheduler_started_at {
            worker.scheduler_started_at = Some(started);
        }
        if let Some(checked) = self.last_check_at {
            worker.last_check_at = Some(checked);
        }
        worker.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_are_stable() {
        assert_eq!(WorkerStatus::Pending.to_string(), "pending");
        assert_eq!(WorkerStatus::Creating.to_string(), "creating");
        assert_eq!(WorkerStatus::Running.to_string(), "running");
        assert_eq!(WorkerStatus::Configuring.to_string(), "configuring");
        assert_eq!(WorkerStatus::Ready.to_string(), "ready");
        assert_eq!(WorkerStatus::Stopped.to_string(), "stopped");
        assert_eq!(WorkerStatus::Error.to_string(), "error");
    }

    #[test]
    fn status_serde_matches_display() {
        for status in [
            WorkerStatus::Pending,
            WorkerStatus::Creating,
            WorkerStatus::Running,
            WorkerStatus::Configuring,
            WorkerStatus::Ready,
            WorkerStatus::Stopped,
            WorkerStatus::Error,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn setup_status_strings_are_stable() {
        assert_eq!(SetupStatus::Pending.to_string(), "pending");
        assert_eq!(SetupStatus::Installing.to_string(), "installing");
        assert_eq!(SetupStatus::Ready.to_string(), "ready");
        assert_eq!(SetupStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn terminal_statuses() {
        assert!(WorkerStatus::Stopped.is_terminal());
        assert!(WorkerStatus::Error.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert!(!WorkerStatus::Ready.is_terminal());
    }

    #[test]
    fn update_applies_only_set_fields() {
        let mut worker = Worker::new(1, "gpu-1".to_string());
        worker.check_count = 5;

        let update = WorkerUpdate {
            status: Some(WorkerStatus::Running),
            ..Default::default()
        };
        update.apply(&mut worker);

        assert_eq!(worker.status, WorkerStatus::Running);
        assert_eq!(worker.setup_status, SetupStatus::Pending);
        assert_eq!(worker.check_count, 5);
    }

    #[test]
    fn new_worker_defaults() {
        let worker = Worker::new(7, "gpu-7".to_string());
        assert_eq!(worker.status, WorkerStatus::Pending);
        assert_eq!(worker.setup_status, SetupStatus::Pending);
        assert!(worker.public_addr.is_none());
        assert!(!worker.scheduler_active);
        assert_eq!(worker.check_count, 0);
    }
}
