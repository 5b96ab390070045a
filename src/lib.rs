pub mod comfy;
pub mod config;
pub mod error;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod tunnel;
pub mod worker;

pub use config::FleetConfig;
pub use error::{FleetError, Result};
