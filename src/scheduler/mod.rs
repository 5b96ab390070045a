pub mod entry;
pub mod monitor;

pub use entry::{CompletionReason, SchedulerEntryInfo};
pub use monitor::WorkerMonitor;
