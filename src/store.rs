//! External collaborator interfaces.
//!
//! The orchestration core does not own persistence or the audit sink;
//! it talks to them through these traits. `MemoryStore` is a keyed-map
//! implementation used by embedders that bring their own durability and
//! by the integration tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FleetError, Result};
use crate::worker::{Worker, WorkerUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One recorded attempt to run a setup script on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    /// Correlation id for log lines spanning the async resolution.
    pub attempt_id: Uuid,
    pub worker_id: i64,
    pub script_id: i64,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewExecution {
    pub worker_id: i64,
    pub script_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionUpdate {
    pub status: Option<ExecutionStatus>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A cataloged bootstrap script, looked up by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupScript {
    pub id: i64,
    pub name: String,
    pub script: String,
}

#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn get_worker(&self, id: i64) -> Result<Option<Worker>>;
    async fn update_worker(&self, id: i64, update: WorkerUpdate) -> Result<()>;
    async fn create_execution(&self, exec: NewExecution) -> Result<Execution>;
    async fn update_execution(&self, id: i64, update: ExecutionUpdate) -> Result<()>;
    async fn get_setup_scripts(&self) -> Result<Vec<SetupScript>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub category: String,
    pub action: String,
    pub resource: String,
    pub severity: String,
    pub detail: serde_json::Value,
}

impl AuditEvent {
    pub fn new(
        category: &str,
        action: &str,
        resource: String,
        severity: &str,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            category: category.to_string(),
            action: action.to_string(),
            resource,
            severity: severity.to_string(),
            detail,
        }
    }
}

/// Structured event sink. Appends are fire-and-forget from the caller's
/// point of view; the sink owns delivery.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, event: AuditEvent);
}

#[derive(Debug, Default)]
struct MemoryState {
    workers: HashMap<i64, Worker>,
    executions: HashMap<i64, Execution>,
    scripts: Vec<SetupScript>,
    next_execution_id: i64,
}

/// In-memory `WorkerStore` + `AuditLog`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_worker(&self, worker: Worker) {
        self.state
            .lock()
            .expect("memory store poisoned")
            .workers
            .insert(worker.id, worker);
    }

    pub fn remove_worker(&self, id: i64) {
        self.state
            .lock()
            .expect("memory store poisoned")
            .workers
            .remove(&id);
    }

    pub fn insert_script(&self, script: SetupScript) {
        self.state
            .lock()
            .expect("memory store poisoned")
            .scripts
            .push(script);
    }

    pub fn executions(&self) -> Vec<Execution> {
        self.state
            .lock()
            .expect("memory store poisoned")
            .executions
            .values()
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("memory store poisoned").clone()
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn get_worker(&self, id: i64) -> Result<Option<Worker>> {
        let state = self.state.lock().expect("memory store poisoned");
        Ok(state.workers.get(&id).cloned())
    }

    async fn update_worker(&self, id: i64, update: WorkerUpdate) -> Result<()> {
        let mut state = self.state.lock().expect("memory store poisoned");
        let worker = state
            .workers
            .get_mut(&id)
            .ok_or(FleetError::WorkerNotFound(id))?;
        update.apply(worker);
        Ok(())
    }

    async fn create_execution(&self, exec: NewExecution) -> Result<Execution> {
        let mut state = self.state.lock().expect("memory store poisoned");
        state.next_execution_id += 1;
        let execution = Execution {
            id: state.next_execution_id,
            attempt_id: Uuid::new_v4(),
            worker_id: exec.worker_id,
            script_id: exec.script_id,
            status: ExecutionStatus::Running,
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        };
        state.executions.insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn update_execution(&self, id: i64, update: ExecutionUpdate) -> Result<()> {
        let mut state = self.state.lock().expect("memory store poisoned");
        let execution = state
            .executions
            .get_mut(&id)
            .ok_or_else(|| FleetError::Store(format!("execution {id} not found")))?;
        if let Some(status) = update.status {
            execution.status = status;
        }
        if update.output.is_some() {
            execution.output = update.output;
        }
        if update.error.is_some() {
            execution.error = update.error;
        }
        if update.finished_at.is_some() {
            execution.finished_at = update.finished_at;
        }
        Ok(())
    }

    async fn get_setup_scripts(&self) -> Result<Vec<SetupScript>> {
        let state = self.state.lock().expect("memory store poisoned");
        Ok(state.scripts.clone())
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append(&self, event: AuditEvent) {
        self.events
            .lock()
            .expect("memory store poisoned")
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_missing_worker_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update_worker(99, WorkerUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::WorkerNotFound(99)));
    }

    #[tokio::test]
    async fn execution_ids_are_sequential() {
        let store = MemoryStore::new();
        let first = store
            .create_execution(NewExecution {
                worker_id: 1,
                script_id: 10,
            })
            .await
            .unwrap();
        let second = store
            .create_execution(NewExecution {
                worker_id: 1,
                script_id: 10,
            })
            .await
            .unwrap();
        assert_eq!(second.id, first.id + 1);
        assert_eq!(first.status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn execution_update_merges_fields() {
        let store = MemoryStore::new();
        let exec = store
            .create_execution(NewExecution {
                worker_id: 2,
                script_id: 3,
            })
            .await
            .unwrap();

        store
            .update_execution(
                exec.id,
                ExecutionUpdate {
                    status: Some(ExecutionStatus::Completed),
                    output: Some("ok".to_string()),
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = &store.executions()[0];
        assert_eq!(stored.status, ExecutionStatus::Completed);
        assert_eq!(stored.output.as_deref(), Some("ok"));
        assert!(stored.finished_at.is_some());
        assert!(stored.error.is_none());
    }
}
