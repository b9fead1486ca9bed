//! Progress relay: a job's progress channel as an outward message stream.
//!
//! The stream opens with `started`, forwards events while the job is
//! processing (interleaving `heartbeat` whenever nothing arrived within the
//! heartbeat window), stops draining right after a terminal event and ends
//! with exactly one `done` or `error` message taken from the job state.
//!
//! Relays subscribe when the stream is created. Only the first relay of a
//! job sees events from before it attached; there is no replay buffer.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use tinter_core::job_events::{
    ProgressEvent, MSG_TYPE_DONE, MSG_TYPE_ERROR, MSG_TYPE_HEARTBEAT, MSG_TYPE_STARTED,
};
use tinter_core::types::JobId;
use tokio::sync::mpsc;

use crate::registry::{JobEntry, JobResult, JobState};

/// One message of the outward stream.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Started { job_id: JobId },
    Event(ProgressEvent),
    Heartbeat,
    Done { result: JobResult },
    Error { message: String },
}

impl RelayMessage {
    /// The `type` tag of the serialized message.
    pub fn kind(&self) -> &str {
        match self {
            RelayMessage::Started { .. } => MSG_TYPE_STARTED,
            RelayMessage::Event(event) => event.kind.as_str(),
            RelayMessage::Heartbeat => MSG_TYPE_HEARTBEAT,
            RelayMessage::Done { .. } => MSG_TYPE_DONE,
            RelayMessage::Error { .. } => MSG_TYPE_ERROR,
        }
    }

    /// Flat `{"type": ..., ...fields}` form.
    pub fn to_json(&self) -> Value {
        match self {
            RelayMessage::Started { job_id } => json!({"type": MSG_TYPE_STARTED, "job_id": job_id}),
            RelayMessage::Event(event) => {
                let mut body = event.payload.clone();
                body.insert("type".into(), Value::from(event.kind.as_str()));
                Value::Object(body)
            }
            RelayMessage::Heartbeat => json!({"type": MSG_TYPE_HEARTBEAT}),
            RelayMessage::Done { result } => json!({"type": MSG_TYPE_DONE, "result": result}),
            RelayMessage::Error { message } => json!({"type": MSG_TYPE_ERROR, "message": message}),
        }
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

enum Phase {
    Start,
    Draining,
    Finish,
    Closed,
}

struct Relay {
    entry: Arc<JobEntry>,
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    heartbeat: Duration,
    phase: Phase,
}

impl Relay {
    async fn next(&mut self) -> Option<RelayMessage> {
        loop {
            match self.phase {
                Phase::Start => {
                    self.phase = Phase::Draining;
                    return Some(RelayMessage::Started {
                        job_id: self.entry.id.clone(),
                    });
                }
                Phase::Draining => {
                    if !self.entry.state().is_processing() {
                        self.phase = Phase::Finish;
                        continue;
                    }
                    match tokio::time::timeout(self.heartbeat, self.events.recv()).await {
                        Err(_) => return Some(RelayMessage::Heartbeat),
                        Ok(Some(event)) => {
                            if event.kind.is_terminal() {
                                self.phase = Phase::Finish;
                            }
                            return Some(RelayMessage::Event(event));
                        }
                        Ok(None) => self.phase = Phase::Finish,
                    }
                }
                Phase::Finish => {
                    self.phase = Phase::Closed;
                    return Some(self.final_message().await);
                }
                Phase::Closed => return None,
            }
        }
    }

    /// Terminal events are published just before the state flips, so wait
    /// for the flip rather than reading a stale `processing`.
    async fn final_message(&self) -> RelayMessage {
        let mut state = self.entry.watch_state();
        let settled = state.wait_for(|s| !s.is_processing()).await;
        match settled.as_deref() {
            Ok(JobState::Completed(result)) => RelayMessage::Done {
                result: result.clone(),
            },
            Ok(JobState::Failed(message)) => RelayMessage::Error {
                message: message.clone(),
            },
            Ok(JobState::Processing) | Err(_) => RelayMessage::Error {
                message: "job state unavailable".into(),
            },
        }
    }
}

/// Stream the progress of `entry` until it reaches a terminal state.
pub fn stream_progress(
    entry: Arc<JobEntry>,
    heartbeat: Duration,
) -> impl Stream<Item = RelayMessage> + Send + 'static {
    tracing::debug!(job_id = %entry.id, "Starting progress stream");
    let relay = Relay {
        events: entry.subscribe(),
        entry,
        heartbeat,
        phase: Phase::Start,
    };
    futures::stream::unfold(relay, |mut relay| async move {
        let message = relay.next().await?;
        Some((message, relay))
    })
}
