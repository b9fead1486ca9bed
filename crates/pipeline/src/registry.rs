//! Process-wide job table.
//!
//! The registry map is the only structure shared across tasks. Each
//! [`JobEntry`] is written by exactly one orchestration task: job state
//! lives in a `watch` cell (one writer, many readers) and progress events
//! fan out over unbounded mpsc channels, one per subscriber.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tinter_core::error::CoreError;
use tinter_core::job_events::{ProgressEvent, ProgressSink};
use tinter_core::types::{new_job_id, JobId, Timestamp};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::orchestrator::{run_job, Pipeline};
use crate::storage::check_component;
use crate::workflow::sanitize_filename;

/// An uploaded input image.
#[derive(Debug, Clone)]
pub struct Asset {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Asset {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

/// Reference to a finished job's stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub prompt_id: String,
    pub result_url: String,
}

/// Lifecycle of one job. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Processing,
    Completed(JobResult),
    Failed(String),
}

impl JobState {
    pub fn is_processing(&self) -> bool {
        matches!(self, JobState::Processing)
    }

    /// Wire name: `processing`, `completed` or `failed`.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Processing => "processing",
            JobState::Completed(_) => "completed",
            JobState::Failed(_) => "failed",
        }
    }
}

/// One submitted job.
pub struct JobEntry {
    pub id: JobId,
    pub submitter: String,
    pub created_at: Timestamp,
    state: watch::Sender<JobState>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ProgressEvent>>>,
    /// Receiver created at submission, handed to the first subscriber.
    initial: Mutex<Option<mpsc::UnboundedReceiver<ProgressEvent>>>,
}

impl JobEntry {
    pub fn new(id: JobId, submitter: impl Into<String>) -> Self {
        let (state, _) = watch::channel(JobState::Processing);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            submitter: submitter.into(),
            created_at: chrono::Utc::now(),
            state,
            subscribers: Mutex::new(vec![tx]),
            initial: Mutex::new(Some(rx)),
        }
    }

    /// Current state snapshot.
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    /// Attach a progress subscriber.
    ///
    /// The first call gets every event since submission. Later calls only
    /// see events published after they attached.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ProgressEvent> {
        if let Some(rx) = self
            .initial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return rx;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// `processing → completed`. Returns `false` if the job already ended.
    pub fn complete(&self, result: JobResult) -> bool {
        self.transition(JobState::Completed(result))
    }

    /// `processing → failed`. Returns `false` if the job already ended.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.transition(JobState::Failed(message.into()))
    }

    fn transition(&self, next: JobState) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.is_processing() {
                *state = next;
                true
            } else {
                false
            }
        });
        if !changed {
            tracing::warn!(job_id = %self.id, "Ignoring transition of finished job");
        }
        changed
    }
}

impl ProgressSink for JobEntry {
    fn publish(&self, event: ProgressEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Table of every job submitted to this process.
///
/// Entries are never removed.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    pipeline: Arc<Pipeline>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl JobRegistry {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            pipeline: Arc::new(pipeline),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Register a job and start its orchestration task.
    ///
    /// Both asset names get the same short unique prefix so concurrent
    /// jobs never collide in the backend's input folder.
    pub async fn submit(
        &self,
        gray: Asset,
        reference: Asset,
        submitter: &str,
    ) -> Result<JobId, CoreError> {
        check_component("submitter", submitter)?;
        if self.cancel.is_cancelled() {
            return Err(CoreError::Unavailable("server is shutting down".into()));
        }

        let job_id = new_job_id();
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let prefix = &unique[..8];
        let gray = Asset::new(
            format!("{prefix}_{}", sanitize_filename(&gray.filename)),
            gray.bytes,
        );
        let reference = Asset::new(
            format!("{prefix}_{}", sanitize_filename(&reference.filename)),
            reference.bytes,
        );

        let entry = Arc::new(JobEntry::new(job_id.clone(), submitter));
        let total = {
            let mut jobs = self.jobs.write().await;
            jobs.insert(job_id.clone(), Arc::clone(&entry));
            jobs.len()
        };
        tracing::info!(job_id = %job_id, submitter, total, "Job submitted");

        self.tasks.spawn(run_job(
            Arc::clone(&self.pipeline),
            entry,
            gray,
            reference,
            self.cancel.child_token(),
        ));

        Ok(job_id)
    }

    pub async fn get(&self, job_id: &str) -> Option<Arc<JobEntry>> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Cancel every running job and wait up to `grace` for the tasks to
    /// record their terminal state.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        self.tasks.close();
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                "Job tasks still running after shutdown grace period",
            );
        }
    }
}
