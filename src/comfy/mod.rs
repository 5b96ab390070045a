pub mod client;
pub mod generate;
pub mod setup;
pub mod workflow;

pub use client::{ComfyClient, ModelCatalog};
pub use generate::{GenerationResult, SubmissionClient};
pub use setup::{ComfyBootstrap, EngineBootstrap};
pub use workflow::{compile_workflow, GenerationParams, PromptRole, WorkflowNode, WorkflowTemplate};
