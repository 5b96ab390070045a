//! Generation submission pipeline.
//!
//! Gates a submission through, in order: worker exists, setup complete,
//! address known, engine alive, engine accepted. Each gate fails with
//! its own error kind so callers can tell the user exactly what to fix.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::comfy::client::ComfyClient;
use crate::comfy::workflow::{compile_workflow, GenerationParams, WorkflowTemplate};
use crate::config::ComfyConfig;
use crate::error::{FleetError, Result};
use crate::store::WorkerStore;
use crate::tunnel::TunnelManager;
use crate::worker::{SetupStatus, Worker};

/// Plain result object for the API layer. Only the queue id is persisted
/// (by the storage collaborator); the instance itself is discarded.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub queue_id: String,
    pub seed: u32,
    /// Engine endpoint the job was submitted to.
    pub engine_url: String,
}

pub struct SubmissionClient {
    config: ComfyConfig,
    store: Arc<dyn WorkerStore>,
    tunnels: Arc<TunnelManager>,
}

impl SubmissionClient {
    pub fn new(
        config: ComfyConfig,
        store: Arc<dyn WorkerStore>,
        tunnels: Arc<TunnelManager>,
    ) -> Self {
        Self {
            config,
            store,
            tunnels,
        }
    }

    /// Compile `template` with `params` and submit it to the worker's
    /// engine. See module docs for the gate order.
    pub async fn generate(
        &self,
        worker_id: i64,
        template: &WorkflowTemplate,
        params: &GenerationParams,
    ) -> Result<GenerationResult> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))?;

        if worker.setup_status != SetupStatus::Ready {
            return Err(FleetError::SetupRequired(worker_id));
        }

        let client = self.engine_client(&worker).await?;
        if !client.check_status().await {
            return Err(FleetError::NotAccessible {
                worker_id,
                url: client.status_url(),
            });
        }

        let compiled = compile_workflow(template, params, &self.config.negative_marker)?;
        let queue_id = client
            .queue_prompt(&compiled.workflow)
            .await
            .ok_or(FleetError::SubmissionRejected { worker_id })?;

        info!(
            worker_id,
            queue_id,
            seed = compiled.seed,
            engine_url = client.base_url(),
            "generation queued"
        );
        Ok(GenerationResult {
            queue_id,
            seed: compiled.seed,
            engine_url: client.base_url().to_string(),
        })
    }

    /// Status/outputs of a previously queued generation, straight from
    /// the engine's history endpoint. `None` when the engine has nothing
    /// recorded (or did not answer).
    pub async fn get_status(&self, worker_id: i64, queue_id: &str) -> Result<Option<Value>> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))?;
        let client = self.engine_client(&worker).await?;
        Ok(client.get_history(queue_id).await)
    }

    /// Engine catalog for a worker, best-effort.
    pub async fn get_object_info(
        &self,
        worker_id: i64,
    ) -> Result<Option<crate::comfy::client::ModelCatalog>> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))?;
        let client = self.engine_client(&worker).await?;
        Ok(client.get_object_info().await)
    }

    /// Resolve the engine endpoint: a live tunnel wins over the direct
    /// address; no tunnel and no address means the worker is unreachable.
    async fn engine_client(&self, worker: &Worker) -> Result<ComfyClient> {
        if let Some(local_port) = self
            .tunnels
            .get_tunnel_port(worker.id, self.config.engine_port)
            .await
        {
            return Ok(ComfyClient::new(
                format!("http://127.0.0.1:{local_port}"),
                self.config.clone(),
            ));
        }
        match &worker.public_addr {
            Some(addr) => Ok(ComfyClient::new(
                format!("http://{addr}:{}", self.config.engine_port),
                self.config.clone(),
            )),
            None => Err(FleetError::NotAccessible {
                worker_id: worker.id,
                url: "(no known address)".to_string(),
            }),
        }
    }
}
