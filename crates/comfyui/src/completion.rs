//! Completion signal and detector errors.
//!
//! Two detectors watch one prompt: the WebSocket [`listener`](crate::listener)
//! and the `/history` [`poller`](crate::poller). Whichever observes the
//! terminal stage first fires the shared [`CompletionSignal`]; the signal
//! records that detector and ignores every later fire.

use std::fmt;
use std::sync::OnceLock;

use tokio::sync::Notify;

/// Which detector observed completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detector {
    Listener,
    Poller,
}

impl fmt::Display for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detector::Listener => f.write_str("listener"),
            Detector::Poller => f.write_str("poller"),
        }
    }
}

/// Single-use "terminal stage observed" notification for one prompt.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    fired_by: OnceLock<Detector>,
    notify: Notify,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal on behalf of `detector`.
    ///
    /// Returns `true` for the first call only; every later call is a no-op
    /// returning `false`.
    pub fn fire(&self, detector: Detector) -> bool {
        if self.fired_by.set(detector).is_err() {
            tracing::debug!(%detector, "Completion signal already fired, ignoring");
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.fired_by.get().is_some()
    }

    /// The detector that fired the signal, if any.
    pub fn fired_by(&self) -> Option<Detector> {
        self.fired_by.get().copied()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) -> Detector {
        loop {
            let notified = self.notify.notified();
            if let Some(detector) = self.fired_by() {
                return detector;
            }
            notified.await;
        }
    }
}

/// Failures of the completion detectors and of the race between them.
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    /// The WebSocket listener used up its reconnect budget.
    #[error("Event listener gave up after {attempts} reconnect attempts: {last_error}")]
    ListenerExhausted { attempts: u32, last_error: String },

    /// The poller hit its attempt ceiling without seeing the output node.
    #[error("Workflow did not complete within {attempts} history polls")]
    PollTimeout { attempts: u32 },

    /// ComfyUI reported the prompt itself as failed.
    #[error("ComfyUI error: {}", messages.join("; "))]
    RemoteExecution { messages: Vec<String> },

    /// Neither detector could confirm completion.
    #[error("Both completion detectors failed (listener: {listener}; poller: {poller})")]
    BothDetectorsFailed {
        listener: Box<DetectionError>,
        poller: Box<DetectionError>,
    },

    /// The detector was cancelled before reaching a verdict.
    #[error("Detector cancelled")]
    Cancelled,

    /// The detector task panicked or was aborted.
    #[error("Detector task failed: {0}")]
    TaskFailed(String),
}

impl DetectionError {
    /// Whether this error settles the job outright, regardless of what the
    /// other detector would report.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DetectionError::RemoteExecution { .. })
    }
}
