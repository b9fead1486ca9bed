//! Completion race between the WebSocket listener and the history poller.
//!
//! Both detectors run as their own tokio task against the same prompt and
//! share one [`CompletionSignal`]. The first success wins and the other
//! detector is cancelled and awaited before [`CompletionRace::run`]
//! returns, so no detector outlives the race.
//!
//! Failures are asymmetric. A listener that ran out of reconnects or a
//! poller that hit its ceiling only loses its own vote; the race keeps
//! waiting for the other detector. A history error status is authoritative
//! and ends the race at once. Cancelling the caller's token stops both
//! detectors and the race reports [`DetectionError::Cancelled`].

use std::sync::Arc;

use tinter_core::job_events::ProgressSink;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIBackend;
use crate::client::EventConnector;
use crate::completion::{CompletionSignal, DetectionError, Detector};
use crate::listener::{EventListener, ListenerConfig};
use crate::poller::{poll_history, PollerConfig};

type DetectorTask = JoinHandle<Result<(), DetectionError>>;

/// Everything needed to race the two detectors for any prompt.
#[derive(Clone)]
pub struct CompletionRace {
    pub connector: Arc<dyn EventConnector>,
    pub backend: Arc<dyn ComfyUIBackend>,
    pub listener: ListenerConfig,
    pub poller: PollerConfig,
}

impl CompletionRace {
    pub fn new(
        connector: Arc<dyn EventConnector>,
        backend: Arc<dyn ComfyUIBackend>,
        listener: ListenerConfig,
        poller: PollerConfig,
    ) -> Self {
        Self {
            connector,
            backend,
            listener,
            poller,
        }
    }

    /// Wait for `prompt_id` to reach its terminal stage.
    ///
    /// Returns the detector that observed completion. Listener progress is
    /// published to `sink` until the listener stops.
    pub async fn run(
        &self,
        prompt_id: &str,
        client_id: &str,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<Detector, DetectionError> {
        let signal = Arc::new(CompletionSignal::new());
        let listener_cancel = cancel.child_token();
        let poller_cancel = cancel.child_token();

        let listener = EventListener::new(
            Arc::clone(&self.connector),
            self.listener.clone(),
            prompt_id,
            client_id,
            Arc::clone(&signal),
            sink,
        );
        let mut listener_task: DetectorTask = tokio::spawn(listener.run(listener_cancel.clone()));
        let mut poller_task: DetectorTask = tokio::spawn(poll_history(
            Arc::clone(&self.backend),
            self.poller.clone(),
            prompt_id.to_string(),
            Arc::clone(&signal),
            poller_cancel.clone(),
        ));

        let (first, result) = tokio::select! {
            res = &mut listener_task => (Detector::Listener, flatten(res)),
            res = &mut poller_task => (Detector::Poller, flatten(res)),
        };

        let (other_cancel, other_task) = match first {
            Detector::Listener => (poller_cancel, poller_task),
            Detector::Poller => (listener_cancel, listener_task),
        };

        match result {
            Ok(()) => {
                stop(other_cancel, other_task).await;
                let winner = signal.fired_by().unwrap_or(first);
                tracing::info!(prompt_id, %winner, "Completion race won");
                Ok(winner)
            }
            Err(_) if cancel.is_cancelled() => {
                stop(other_cancel, other_task).await;
                tracing::info!(prompt_id, "Completion race cancelled");
                Err(DetectionError::Cancelled)
            }
            Err(e) if e.is_fatal() => {
                stop(other_cancel, other_task).await;
                Err(e)
            }
            Err(first_err) => {
                tracing::warn!(
                    prompt_id,
                    detector = %first,
                    error = %first_err,
                    "Detector failed, waiting on the other one",
                );
                let other = first.other();
                match flatten(other_task.await) {
                    Ok(()) => {
                        tracing::info!(prompt_id, winner = %other, "Completion race won");
                        Ok(signal.fired_by().unwrap_or(other))
                    }
                    Err(_) if cancel.is_cancelled() => Err(DetectionError::Cancelled),
                    Err(e) if e.is_fatal() => Err(e),
                    Err(second_err) => {
                        let (listener, poller) = match first {
                            Detector::Listener => (first_err, second_err),
                            Detector::Poller => (second_err, first_err),
                        };
                        Err(DetectionError::BothDetectorsFailed {
                            listener: Box::new(listener),
                            poller: Box::new(poller),
                        })
                    }
                }
            }
        }
    }
}

impl Detector {
    fn other(self) -> Detector {
        match self {
            Detector::Listener => Detector::Poller,
            Detector::Poller => Detector::Listener,
        }
    }
}

/// Cancel a losing detector and wait for its task to finish.
async fn stop(cancel: CancellationToken, task: DetectorTask) {
    cancel.cancel();
    match task.await {
        Ok(Ok(())) | Ok(Err(DetectionError::Cancelled)) => {}
        Ok(Err(e)) => tracing::debug!(error = %e, "Losing detector finished with error"),
        Err(e) => tracing::warn!(error = %e, "Losing detector task failed"),
    }
}

fn flatten(res: Result<Result<(), DetectionError>, JoinError>) -> Result<(), DetectionError> {
    res.unwrap_or_else(|e| Err(DetectionError::TaskFailed(e.to_string())))
}
