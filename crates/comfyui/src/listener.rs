//! WebSocket completion detector.
//!
//! [`EventListener`] subscribes to the ComfyUI event stream of one client
//! id, forwards the interesting messages of one prompt as progress events,
//! and fires the [`CompletionSignal`] once the prompt's output node has
//! run and the server reports idle again.
//!
//! ComfyUI reports idle as `executing` with `node: null`, both before the
//! first node of a run and after the last one. The listener only treats it
//! as terminal after it has seen the designated output node execute. This
//! relies on ComfyUI's event ordering and on the output node id being
//! right; the history poller covers the cases where it is not.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tinter_core::job_events::{ProgressEvent, ProgressSink};
use tokio_util::sync::CancellationToken;

use crate::client::{EventConnector, MessageStream};
use crate::completion::{CompletionSignal, DetectionError, Detector};
use crate::messages::{parse_message, ComfyUIMessage};
use crate::reconnect::{reconnect_loop, ReconnectBudget, ReconnectConfig, ReconnectOutcome};

/// Listener tuning.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Node whose execution marks the output stage.
    pub output_node: String,
    /// Longest silence tolerated on a connection before reconnecting.
    pub message_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            output_node: "1239".to_string(),
            message_timeout: Duration::from_secs(300),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Step progress as a whole percentage. A zero or negative `max` yields 0.
pub fn progress_percent(value: i64, max: i64) -> u8 {
    if max <= 0 {
        return 0;
    }
    let percent = (value as f64 * 100.0 / max as f64).round();
    percent.clamp(0.0, 100.0) as u8
}

/// What the listener should do with one message.
#[derive(Debug, PartialEq)]
pub enum Step {
    Ignore,
    Forward(ProgressEvent),
    Terminal,
}

/// Per-invocation interpretation state. Survives reconnects.
#[derive(Debug)]
pub struct ListenerState {
    prompt_id: String,
    output_node: String,
    output_stage: bool,
}

impl ListenerState {
    pub fn new(prompt_id: impl Into<String>, output_node: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            output_node: output_node.into(),
            output_stage: false,
        }
    }

    /// Whether the output node has been seen executing.
    pub fn output_stage_entered(&self) -> bool {
        self.output_stage
    }

    fn is_ours(&self, prompt_id: Option<&str>) -> bool {
        prompt_id.map_or(true, |id| id == self.prompt_id)
    }

    pub fn handle(&mut self, msg: &ComfyUIMessage) -> Step {
        match msg {
            ComfyUIMessage::ExecutionStart(data) if data.prompt_id == self.prompt_id => {
                tracing::info!(prompt_id = %data.prompt_id, "Execution started");
                Step::Forward(ProgressEvent::execution_start(&self.prompt_id))
            }
            ComfyUIMessage::Executing(data) if self.is_ours(data.prompt_id.as_deref()) => {
                match data.node.as_deref() {
                    Some(node) => {
                        if node == self.output_node {
                            self.output_stage = true;
                        }
                        tracing::debug!(prompt_id = %self.prompt_id, node, "Executing node");
                        Step::Forward(ProgressEvent::node_executing(&self.prompt_id, node))
                    }
                    None if self.output_stage => Step::Terminal,
                    None => {
                        tracing::debug!(
                            prompt_id = %self.prompt_id,
                            "Idle before output stage, ignoring",
                        );
                        Step::Ignore
                    }
                }
            }
            ComfyUIMessage::Progress(data) if self.is_ours(data.prompt_id.as_deref()) => {
                let percent = progress_percent(data.value, data.max);
                Step::Forward(ProgressEvent::progress(
                    data.value,
                    data.max,
                    data.node.as_deref(),
                    percent,
                ))
            }
            ComfyUIMessage::ExecutionError(data) if data.prompt_id == self.prompt_id => {
                tracing::error!(
                    prompt_id = %data.prompt_id,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error",
                );
                Step::Ignore
            }
            ComfyUIMessage::Status(data) => {
                tracing::trace!(
                    queue_remaining = data.status.exec_info.queue_remaining,
                    "ComfyUI queue status",
                );
                Step::Ignore
            }
            _ => Step::Ignore,
        }
    }
}

/// How one connection ended.
enum Drain {
    Terminal,
    Cancelled,
    Dropped(String),
}

/// WebSocket completion detector for one prompt.
pub struct EventListener {
    connector: Arc<dyn EventConnector>,
    config: ListenerConfig,
    prompt_id: String,
    client_id: String,
    signal: Arc<CompletionSignal>,
    sink: Arc<dyn ProgressSink>,
}

impl EventListener {
    /// * `client_id` - the id the prompt was queued with; ComfyUI routes
    ///   the prompt's execution messages to connections using it.
    pub fn new(
        connector: Arc<dyn EventConnector>,
        config: ListenerConfig,
        prompt_id: impl Into<String>,
        client_id: impl Into<String>,
        signal: Arc<CompletionSignal>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            connector,
            config,
            prompt_id: prompt_id.into(),
            client_id: client_id.into(),
            signal,
            sink,
        }
    }

    /// Listen until the terminal stage is observed, the reconnect budget
    /// is spent, or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DetectionError> {
        let mut state = ListenerState::new(&self.prompt_id, &self.config.output_node);
        let mut budget = ReconnectBudget::new(self.config.reconnect.max_attempts);
        let mut wait_first = false;

        loop {
            let outcome = reconnect_loop(
                self.connector.as_ref(),
                &self.client_id,
                &self.config.reconnect,
                &mut budget,
                &cancel,
                wait_first,
            )
            .await;

            let mut stream = match outcome {
                ReconnectOutcome::Connected(stream) => stream,
                ReconnectOutcome::Exhausted => return Err(self.exhausted(&budget)),
                ReconnectOutcome::Cancelled => return Err(DetectionError::Cancelled),
            };
            wait_first = true;

            match self.drain(&mut stream, &mut state, &cancel).await {
                Drain::Terminal => {
                    tracing::info!(
                        prompt_id = %self.prompt_id,
                        "Workflow completed (detected via WebSocket)",
                    );
                    self.signal.fire(Detector::Listener);
                    return Ok(());
                }
                Drain::Cancelled => return Err(DetectionError::Cancelled),
                Drain::Dropped(reason) => {
                    tracing::warn!(
                        prompt_id = %self.prompt_id,
                        reason = %reason,
                        output_stage = state.output_stage_entered(),
                        "ComfyUI event stream dropped",
                    );
                    if !budget.record_failure(reason) {
                        return Err(self.exhausted(&budget));
                    }
                }
            }
        }
    }

    /// Read one connection until it ends.
    async fn drain(
        &self,
        stream: &mut MessageStream,
        state: &mut ListenerState,
        cancel: &CancellationToken,
    ) -> Drain {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Drain::Cancelled,
                next = tokio::time::timeout(self.config.message_timeout, stream.next()) => next,
            };

            let text = match next {
                Err(_) => {
                    return Drain::Dropped(format!(
                        "no message within {}s",
                        self.config.message_timeout.as_secs()
                    ))
                }
                Ok(None) => return Drain::Dropped("connection closed".to_string()),
                Ok(Some(Err(e))) => return Drain::Dropped(e.to_string()),
                Ok(Some(Ok(text))) => text,
            };

            let msg = match parse_message(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        raw_message = %text,
                        "Failed to parse ComfyUI message",
                    );
                    continue;
                }
            };

            match state.handle(&msg) {
                Step::Ignore => {}
                Step::Forward(event) => {
                    if cancel.is_cancelled() {
                        return Drain::Cancelled;
                    }
                    self.sink.publish(event);
                }
                Step::Terminal => return Drain::Terminal,
            }
        }
    }

    fn exhausted(&self, budget: &ReconnectBudget) -> DetectionError {
        tracing::error!(
            prompt_id = %self.prompt_id,
            attempts = budget.failures(),
            last_error = %budget.last_error(),
            "Event listener exhausted its reconnect budget",
        );
        DetectionError::ListenerExhausted {
            attempts: budget.failures(),
            last_error: budget.last_error().to_string(),
        }
    }
}
