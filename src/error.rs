use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Worker not found: {0}")]
    WorkerNotFound(i64),

    #[error("Setup script not found: {0}")]
    ScriptNotFound(String),

    #[error("Worker {0} is not set up yet; run setup before submitting jobs")]
    SetupRequired(i64),

    #[error("Worker {worker_id} is not accessible at {url}; check that the engine is running and the tunnel is open")]
    NotAccessible { worker_id: i64, url: String },

    #[error("Engine on worker {worker_id} rejected the job submission")]
    SubmissionRejected { worker_id: i64 },

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, FleetError>;
