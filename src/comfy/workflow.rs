//! Workflow templates and job compilation.
//!
//! A workflow is a directed graph of named nodes in the compute engine's
//! JSON wire format: each node has a type tag and a key-value input map,
//! and an input may reference another node's output as `[node_id, slot]`.
//! Templates are read-only catalog data; `compile_workflow` binds caller
//! parameters into a fresh instance without touching the original.

use std::collections::BTreeMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FleetError, Result};

/// Explicit prompt-slot tag carried per text-conditioning node.
///
/// Keys starting with `_` are ignored by the engine, so the tag rides
/// along in the template without affecting submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    Positive,
    Negative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(rename = "_role", default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PromptRole>,
}

impl WorkflowNode {
    pub fn new(class_type: &str) -> Self {
        Self {
            class_type: class_type.to_string(),
            inputs: BTreeMap::new(),
            role: None,
        }
    }

    pub fn with_input(mut self, key: &str, value: Value) -> Self {
        self.inputs.insert(key.to_string(), value);
        self
    }

    pub fn with_role(mut self, role: PromptRole) -> Self {
        self.role = Some(role);
        self
    }

    fn is_sampler(&self) -> bool {
        self.class_type.starts_with("KSampler")
    }

    fn is_latent_size(&self) -> bool {
        self.class_type == "EmptyLatentImage"
    }

    fn is_text_encoder(&self) -> bool {
        self.class_type == "CLIPTextEncode"
    }
}

/// A named-node graph in the engine's prompt format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowTemplate {
    pub nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowTemplate {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, id: &str, node: WorkflowNode) {
        self.nodes.insert(id.to_string(), node);
    }

    /// Check that every node-output reference resolves to an existing
    /// node. References are two-element arrays `[node_id, output_slot]`.
    pub fn validate(&self) -> Result<()> {
        for (id, node) in &self.nodes {
            for (input, value) in &node.inputs {
                if let Some(target) = node_reference(value) {
                    if !self.nodes.contains_key(target) {
                        return Err(FleetError::InvalidWorkflow(format!(
                            "node {id} input {input} references missing node {target}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for WorkflowTemplate {
    fn default() -> Self {
        Self::new()
    }
}

fn node_reference(value: &Value) -> Option<&str> {
    let arr = value.as_array()?;
    if arr.len() != 2 || !arr[1].is_u64() {
        return None;
    }
    arr[0].as_str()
}

/// Caller-supplied job parameters bound into a template at submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: WorkflowTemplate,
    /// The effective seed: the caller's, or a fresh random one.
    pub seed: u32,
}

/// Bind `params` into a copy of `template`.
///
/// Sampler nodes receive the step count, guidance scale, and resolved
/// seed; latent-size nodes receive width/height when supplied; text
/// encoders receive the positive or negative prompt. Slot routing
/// prefers the node's explicit role tag; untagged legacy nodes fall back
/// to checking the placeholder text for `negative_marker`. Node wiring
/// is preserved untouched and the input template is never mutated.
pub fn compile_workflow(
    template: &WorkflowTemplate,
    params: &GenerationParams,
    negative_marker: &str,
) -> Result<CompiledWorkflow> {
    template.validate()?;

    let seed = params
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen::<u32>());
    let mut workflow = template.clone();

    for node in workflow.nodes.values_mut() {
        if node.is_sampler() {
            node.inputs.insert("seed".to_string(), seed.into());
            if let Some(steps) = params.steps {
                node.inputs.insert("steps".to_string(), steps.into());
            }
            if let Some(cfg) = params.cfg_scale {
                node.inputs.insert("cfg".to_string(), cfg.into());
            }
        } else if node.is_latent_size() {
            if let Some(width) = params.width {
                node.inputs.insert("width".to_string(), width.into());
            }
            if let Some(height) = params.height {
                node.inputs.insert("height".to_string(), height.into());
            }
        } else if node.is_text_encoder() {
            match prompt_role(node, negative_marker) {
                PromptRole::Positive => {
                    node.inputs
                        .insert("text".to_string(), params.prompt.clone().into());
                }
                PromptRole::Negative => {
                    if let Some(negative) = &params.negative_prompt {
                        node.inputs
                            .insert("text".to_string(), negative.clone().into());
                    }
                }
            }
        }
    }

    Ok(CompiledWorkflow { workflow, seed })
}

fn prompt_role(node: &WorkflowNode, negative_marker: &str) -> PromptRole {
    if let Some(role) = node.role {
        return role;
    }
    // Legacy templates without role tags: a placeholder containing the
    // marker substring is treated as the negative slot.
    let placeholder = node
        .inputs
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if placeholder
        .to_lowercase()
        .contains(&negative_marker.to_lowercase())
    {
        PromptRole::Negative
    } else {
        PromptRole::Positive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_template() -> WorkflowTemplate {
        let mut template = WorkflowTemplate::new();
        template.insert(
            "3",
            WorkflowNode::new("KSampler")
                .with_input("seed", json!(0))
                .with_input("steps", json!(20))
                .with_input("cfg", json!(7.0))
                .with_input("model", json!(["4", 0]))
                .with_input("positive", json!(["6", 0]))
                .with_input("negative", json!(["7", 0]))
                .with_input("latent_image", json!(["5", 0])),
        );
        template.insert(
            "4",
            WorkflowNode::new("CheckpointLoaderSimple")
                .with_input("ckpt_name", json!("sd_xl_base_1.0.safetensors")),
        );
        template.insert(
            "5",
            WorkflowNode::new("EmptyLatentImage")
                .with_input("width", json!(512))
                .with_input("height", json!(512)),
        );
        template.insert(
            "6",
            WorkflowNode::new("CLIPTextEncode")
                .with_input("text", json!("a photo placeholder"))
                .with_input("clip", json!(["4", 1]))
                .with_role(PromptRole::Positive),
        );
        template.insert(
            "7",
            WorkflowNode::new("CLIPTextEncode")
                .with_input("text", json!("blurry, low quality"))
                .with_input("clip", json!(["4", 1]))
                .with_role(PromptRole::Negative),
        );
        template
    }

    #[test]
    fn compile_does_not_mutate_template() {
        let template = sample_template();
        let before = template.clone();

        let params = GenerationParams {
            prompt: "sunset over mountains".to_string(),
            negative_prompt: Some("watermark".to_string()),
            steps: Some(30),
            seed: Some(42),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();

        assert_eq!(template, before);
        assert_ne!(compiled.workflow, template);
    }

    #[test]
    fn compile_binds_sampler_params() {
        let template = sample_template();
        let params = GenerationParams {
            prompt: "x".to_string(),
            steps: Some(25),
            cfg_scale: Some(8.5),
            seed: Some(1234),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();

        let sampler = &compiled.workflow.nodes["3"];
        assert_eq!(sampler.inputs["seed"], json!(1234));
        assert_eq!(sampler.inputs["steps"], json!(25));
        assert_eq!(sampler.inputs["cfg"], json!(8.5));
        assert_eq!(compiled.seed, 1234);
    }

    #[test]
    fn compile_resolves_random_seed_when_absent() {
        let template = sample_template();
        let params = GenerationParams {
            prompt: "x".to_string(),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();
        assert_eq!(
            compiled.workflow.nodes["3"].inputs["seed"],
            json!(compiled.seed)
        );
    }

    #[test]
    fn compile_routes_prompts_by_role_tag() {
        let template = sample_template();
        let params = GenerationParams {
            prompt: "a castle".to_string(),
            negative_prompt: Some("text, watermark".to_string()),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();

        assert_eq!(compiled.workflow.nodes["6"].inputs["text"], json!("a castle"));
        assert_eq!(
            compiled.workflow.nodes["7"].inputs["text"],
            json!("text, watermark")
        );
    }

    #[test]
    fn role_tag_beats_marker_heuristic() {
        // A tagged-positive node whose placeholder contains the marker
        // must still receive the positive prompt.
        let mut template = sample_template();
        template.insert(
            "6",
            WorkflowNode::new("CLIPTextEncode")
                .with_input("text", json!("describe the negative space"))
                .with_role(PromptRole::Positive),
        );

        let params = GenerationParams {
            prompt: "a lighthouse".to_string(),
            negative_prompt: Some("blurry".to_string()),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();
        assert_eq!(
            compiled.workflow.nodes["6"].inputs["text"],
            json!("a lighthouse")
        );
    }

    #[test]
    fn untagged_nodes_fall_back_to_marker_heuristic() {
        let mut template = sample_template();
        for node in template.nodes.values_mut() {
            node.role = None;
        }
        // "7" has placeholder "blurry, low quality": no marker, so both
        // encoders look positive unless the marker matches.
        template
            .nodes
            .get_mut("7")
            .unwrap()
            .inputs
            .insert("text".to_string(), json!("negative prompt here"));

        let params = GenerationParams {
            prompt: "a harbor".to_string(),
            negative_prompt: Some("fog".to_string()),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();

        assert_eq!(compiled.workflow.nodes["6"].inputs["text"], json!("a harbor"));
        assert_eq!(compiled.workflow.nodes["7"].inputs["text"], json!("fog"));
    }

    #[test]
    fn negative_prompt_absent_leaves_placeholder() {
        let template = sample_template();
        let params = GenerationParams {
            prompt: "a harbor".to_string(),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();
        assert_eq!(
            compiled.workflow.nodes["7"].inputs["text"],
            json!("blurry, low quality")
        );
    }

    #[test]
    fn compile_binds_latent_dimensions() {
        let template = sample_template();
        let params = GenerationParams {
            prompt: "x".to_string(),
            width: Some(1024),
            height: Some(768),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();
        let latent = &compiled.workflow.nodes["5"];
        assert_eq!(latent.inputs["width"], json!(1024));
        assert_eq!(latent.inputs["height"], json!(768));
    }

    #[test]
    fn compile_preserves_node_wiring() {
        let template = sample_template();
        let params = GenerationParams {
            prompt: "x".to_string(),
            seed: Some(7),
            ..Default::default()
        };
        let compiled = compile_workflow(&template, &params, "negative").unwrap();
        let sampler = &compiled.workflow.nodes["3"];
        assert_eq!(sampler.inputs["model"], json!(["4", 0]));
        assert_eq!(sampler.inputs["positive"], json!(["6", 0]));
        assert_eq!(sampler.inputs["latent_image"], json!(["5", 0]));
    }

    #[test]
    fn two_compilations_are_independent() {
        let template = sample_template();
        let first = compile_workflow(
            &template,
            &GenerationParams {
                prompt: "first".to_string(),
                seed: Some(1),
                ..Default::default()
            },
            "negative",
        )
        .unwrap();
        let second = compile_workflow(
            &template,
            &GenerationParams {
                prompt: "second".to_string(),
                seed: Some(2),
                ..Default::default()
            },
            "negative",
        )
        .unwrap();

        assert_eq!(first.workflow.nodes["6"].inputs["text"], json!("first"));
        assert_eq!(second.workflow.nodes["6"].inputs["text"], json!("second"));
        assert_eq!(first.workflow.nodes["3"].inputs["seed"], json!(1));
        assert_eq!(second.workflow.nodes["3"].inputs["seed"], json!(2));
    }

    #[test]
    fn validate_rejects_dangling_reference() {
        let mut template = sample_template();
        template.insert(
            "8",
            WorkflowNode::new("VAEDecode").with_input("samples", json!(["99", 0])),
        );
        let err = template.validate().unwrap_err();
        assert!(matches!(err, FleetError::InvalidWorkflow(_)));
        assert!(err.to_string().contains("99"));
    }

    #[test]
    fn scalar_arrays_are_not_references() {
        // A two-element array that is not [string, slot] is plain data.
        let mut template = WorkflowTemplate::new();
        template.insert(
            "1",
            WorkflowNode::new("SomeNode").with_input("pair", json!([1, 2])),
        );
        assert!(template.validate().is_ok());
    }

    #[test]
    fn template_round_trips_through_wire_format() {
        let template = sample_template();
        let json = serde_json::to_string(&template).unwrap();
        let parsed: WorkflowTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, template);
        // Role tags ride in an underscore-prefixed key the engine ignores.
        assert!(json.contains("\"_role\":\"negative\""));
    }
}
