//! Job pipeline: registry, per-job orchestration, result storage and the
//! progress relay.
//!
//! [`JobRegistry::submit`] starts a job, [`JobRegistry::get`] plus
//! [`relay::stream_progress`] observe it, and [`ResultStore::fetch_result`]
//! serves the finished artifact.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod registry;
pub mod relay;
pub mod storage;
pub mod workflow;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use orchestrator::Pipeline;
pub use registry::{Asset, JobEntry, JobRegistry, JobResult, JobState};
pub use relay::{stream_progress, RelayMessage};
pub use storage::ResultStore;
