pub mod controller;
pub mod dispatch;
pub mod extract;
pub mod frontier;
pub mod job;
pub mod options;
pub mod progress;
pub mod retry;
pub mod target;
pub mod task;
pub mod worker;

// Re-export common types
pub use controller::{Orchestrator, OrchestratorSettings, SubmitError};
pub use dispatch::{BrokerAssetFetcher, BrokerDispatcher, Dispatcher, LocalDispatcher};
pub use frontier::{Frontier, FrontierEntry};
pub use job::{CloneJob, JobCounters, JobRecord, JobStatus};
pub use options::{CrawlMode, JobOptions};
pub use progress::{ProgressEvent, ProgressStream};
pub use retry::RetryPolicy;
pub use task::{AssetOutcome, CrawlTask, PageRecord, TaskKind, TaskOutcome};
pub use worker::Worker;
