//! Engine bootstrap.
//!
//! Turns a freshly running worker into a usable compute endpoint: mark
//! the install in progress, record an execution attempt, stream the
//! bootstrap script to the worker over ssh, and resolve the attempt.
//! Failure leaves the worker running with `setup_status = failed` so a
//! retry never requires re-provisioning.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::{ComfyConfig, TunnelConfig};
use crate::error::{FleetError, Result};
use crate::store::{
    AuditEvent, AuditLog, ExecutionStatus, ExecutionUpdate, NewExecution, SetupScript, WorkerStore,
};
use crate::worker::{SetupStatus, Worker, WorkerStatus, WorkerUpdate};

/// Seam between the lifecycle monitor and the engine bootstrap. The
/// monitor only hands off; everything after the hand-off is owned by the
/// implementation.
#[async_trait]
pub trait EngineBootstrap: Send + Sync {
    /// Kick off the one-time install for a worker. Returns once the
    /// attempt is recorded; resolution happens asynchronously.
    async fn start_setup(&self, worker_id: i64) -> Result<()>;
}

pub struct ComfyBootstrap {
    config: ComfyConfig,
    transport: TunnelConfig,
    store: Arc<dyn WorkerStore>,
    audit: Arc<dyn AuditLog>,
}

impl ComfyBootstrap {
    pub fn new(
        config: ComfyConfig,
        transport: TunnelConfig,
        store: Arc<dyn WorkerStore>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            audit,
        }
    }
}

#[async_trait]
impl EngineBootstrap for ComfyBootstrap {
    async fn start_setup(&self, worker_id: i64) -> Result<()> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))?;

        self.store
            .update_worker(
                worker_id,
                WorkerUpdate {
                    status: Some(WorkerStatus::Configuring),
                    setup_status: Some(SetupStatus::Installing),
                    ..Default::default()
                },
            )
            .await?;

        let script = match self
            .store
            .get_setup_scripts()
            .await?
            .into_iter()
            .find(|s| s.name == self.config.setup_script_name)
        {
            Some(script) => script,
            None => {
                error!(worker_id, name = %self.config.setup_script_name, "bootstrap script missing from catalog");
                self.store
                    .update_worker(
                        worker_id,
                        WorkerUpdate {
                            status: Some(WorkerStatus::Running),
                            setup_status: Some(SetupStatus::Failed),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Err(FleetError::ScriptNotFound(
                    self.config.setup_script_name.clone(),
                ));
            }
        };

        let execution = self
            .store
            .create_execution(NewExecution {
                worker_id,
                script_id: script.id,
            })
            .await?;
        info!(
            worker_id,
            execution_id = execution.id,
            attempt_id = %execution.attempt_id,
            script = %script.name,
            "engine bootstrap started"
        );

        let store = Arc::clone(&self.store);
        let audit = Arc::clone(&self.audit);
        let transport = self.transport.clone();
        tokio::spawn(async move {
            resolve_setup(store, audit, transport, worker, script, execution.id).await;
        });
        Ok(())
    }
}

/// Run the script and persist the outcome. Never reverts the worker to
/// an earlier lifecycle stage: success lands on running/ready, failure
/// on running/failed.
async fn resolve_setup(
    store: Arc<dyn WorkerStore>,
    audit: Arc<dyn AuditLog>,
    transport: TunnelConfig,
    worker: Worker,
    script: SetupScript,
    execution_id: i64,
) {
    let worker_id = worker.id;
    let outcome = run_remote_script(&transport, &worker, &script.script).await;

    let (exec_update, setup_status, action, severity) = match &outcome {
        Ok(output) => (
            ExecutionUpdate {
                status: Some(ExecutionStatus::Completed),
                output: Some(output.clone()),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
            SetupStatus::Ready,
            "setup_completed",
            "info",
        ),
        Err(message) => (
            ExecutionUpdate {
                status: Some(ExecutionStatus::Failed),
                error: Some(message.clone()),
                finished_at: Some(Utc::now()),
                ..Default::default()
            },
            SetupStatus::Failed,
            "setup_failed",
            "error",
        ),
    };

    if let Err(err) = store.update_execution(execution_id, exec_update).await {
        warn!(worker_id, execution_id, error = %err, "failed to persist execution outcome");
    }
    if let Err(err) = store
        .update_worker(
            worker_id,
            WorkerUpdate {
                status: Some(WorkerStatus::Running),
                setup_status: Some(setup_status),
                ..Default::default()
            },
        )
        .await
    {
        warn!(worker_id, error = %err, "failed to persist setup outcome");
    }

    match &outcome {
        Ok(_) => info!(worker_id, execution_id, "engine bootstrap completed"),
        Err(message) => error!(worker_id, execution_id, error = %message, "engine bootstrap failed"),
    }
    audit
        .append(AuditEvent::new(
            "setup",
            action,
            format!("worker:{worker_id}"),
            severity,
            serde_json::json!({
                "execution_id": execution_id,
                "script": script.name,
                "error": outcome.as_ref().err(),
            }),
        ))
        .await;
}

/// Stream the script to the worker over ssh (`bash -s` reads it from
/// stdin) and capture the result. Exit status decides success; stderr
/// is preferred over a bare exit code for the failure message.
async fn run_remote_script(
    transport: &TunnelConfig,
    worker: &Worker,
    script: &str,
) -> std::result::Result<String, String> {
    let Some(addr) = worker.public_addr.as_deref() else {
        return Err("worker has no reachable address".to_string());
    };

    let mut child = Command::new(&transport.ssh_program)
        .args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-p",
            &worker.ssh_port.to_string(),
            &format!("{}@{}", transport.ssh_user, addr),
            "bash -s",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn ssh: {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(script.as_bytes()).await {
            return Err(format!("failed to send script: {e}"));
        }
        // Closing stdin lets bash -s see EOF and start executing.
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| format!("ssh did not complete: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        Ok(stdout)
    } else if stderr.is_empty() {
        Err(format!("exit code: {:?}", output.status.code()))
    } else {
        Err(stderr)
    }
}
