//! HTTP client for a worker's compute engine.
//!
//! Liveness, introspection, and history are best-effort: transport
//! failures and bad responses come back as `false`/`None`, never as
//! errors, because callers only need to know whether the engine answered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::comfy::workflow::WorkflowTemplate;
use crate::config::ComfyConfig;

/// Loadable assets the engine reports per loader category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelCatalog {
    pub checkpoints: Vec<String>,
    pub loras: Vec<String>,
    pub vaes: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    prompt_id: String,
}

pub struct ComfyClient {
    http: reqwest::Client,
    base_url: String,
    config: ComfyConfig,
}

impl ComfyClient {
    /// `base_url` is scheme://host:port with no trailing slash, either
    /// the worker's direct address or a tunneled localhost endpoint.
    pub fn new(base_url: String, config: ComfyConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            config,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL hit by the liveness probe, reported in unreachable errors.
    pub fn status_url(&self) -> String {
        format!("{}/system_stats", self.base_url)
    }

    /// Liveness probe. Any transport error or non-success status means
    /// "not alive"; this never fails.
    pub async fn check_status(&self) -> bool {
        let url = self.status_url();
        match self
            .http
            .get(&url)
            .timeout(self.config.status_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(err) => {
                debug!(url, error = %err, "engine liveness probe failed");
                false
            }
        }
    }

    /// Introspect the engine's loadable-asset catalog. Best-effort:
    /// `None` on any transport or parse failure.
    pub async fn get_object_info(&self) -> Option<ModelCatalog> {
        let url = format!("{}/object_info", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.config.object_info_timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            debug!(url, status = %resp.status(), "object_info returned non-success");
            return None;
        }
        let info: Value = resp.json().await.ok()?;
        Some(parse_catalog(&info))
    }

    /// Submit a compiled workflow. Returns the engine's opaque queue id,
    /// or `None` on any failure; absence means "not submitted".
    pub async fn queue_prompt(&self, workflow: &WorkflowTemplate) -> Option<String> {
        let url = format!("{}/prompt", self.base_url);
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": Uuid::new_v4().to_string(),
        });
        let resp = match self
            .http
            .post(&url)
            .timeout(self.config.queue_timeout)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                warn!(url, error = %err, "prompt submission failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(url, status = %resp.status(), "engine refused prompt");
            return None;
        }
        match resp.json::<QueueResponse>().await {
            Ok(queued) => Some(queued.prompt_id),
            Err(err) => {
                warn!(url, error = %err, "malformed queue response");
                None
            }
        }
    }

    /// Look up the recorded outputs/status of a submitted job.
    pub async fn get_history(&self, queue_id: &str) -> Option<Value> {
        let url = format!("{}/history/{queue_id}", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.config.history_timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<Value>().await.ok()
    }
}

/// Pull the interesting loader categories out of the engine's (huge)
/// node-info response. Unknown shapes simply yield empty lists.
fn parse_catalog(info: &Value) -> ModelCatalog {
    ModelCatalog {
        checkpoints: loader_choices(info, "CheckpointLoaderSimple", "ckpt_name"),
        loras: loader_choices(info, "LoraLoader", "lora_name"),
        vaes: loader_choices(info, "VAELoader", "vae_name"),
    }
}

fn loader_choices(info: &Value, node_type: &str, input: &str) -> Vec<String> {
    // Shape: info[node_type].input.required[input][0] == ["a.safetensors", ...]
    info.get(node_type)
        .and_then(|n| n.get("input"))
        .and_then(|i| i.get("required"))
        .and_then(|r| r.get(input))
        .and_then(|choices| choices.get(0))
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// Catalogs keyed by category for API serialization.
impl ModelCatalog {
    pub fn by_category(&self) -> BTreeMap<&'static str, &[String]> {
        BTreeMap::from([
            ("checkpoints", self.checkpoints.as_slice()),
            ("loras", self.loras.as_slice()),
            ("vaes", self.vaes.as_slice()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_catalog_extracts_loader_choices() {
        let info = json!({
            "CheckpointLoaderSimple": {
                "input": { "required": { "ckpt_name": [["base.safetensors", "refiner.safetensors"]] } }
            },
            "LoraLoader": {
                "input": { "required": { "lora_name": [["detail.safetensors"]] } }
            }
        });
        let catalog = parse_catalog(&info);
        assert_eq!(
            catalog.checkpoints,
            vec!["base.safetensors", "refiner.safetensors"]
        );
        assert_eq!(catalog.loras, vec!["detail.safetensors"]);
        assert!(catalog.vaes.is_empty());
    }

    #[test]
    fn parse_catalog_tolerates_garbage() {
        let catalog = parse_catalog(&json!({"CheckpointLoaderSimple": 42}));
        assert_eq!(catalog, ModelCatalog::default());
    }

    #[test]
    fn catalog_by_category() {
        let catalog = ModelCatalog {
            checkpoints: vec!["a".to_string()],
            loras: vec![],
            vaes: vec!["b".to_string()],
        };
        let by_cat = catalog.by_category();
        assert_eq!(by_cat["checkpoints"], ["a".to_string()]);
        assert_eq!(by_cat["vaes"], ["b".to_string()]);
    }
}
