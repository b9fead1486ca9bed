//! Bounded reconnection logic for ComfyUI WebSocket subscriptions.
//!
//! When the event stream of a prompt drops, the listener calls
//! [`reconnect_loop`] to retry on a fixed delay. Every failed connect,
//! dropped connection and read timeout spends one unit of the shared
//! [`ReconnectBudget`]. The budget covers a whole listener invocation and
//! is never refilled, so a server that accepts and then drops every
//! connection still exhausts it. Once the budget is spent the listener
//! gives up and the poller carries the job alone.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{EventConnector, MessageStream};

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Failures tolerated per listener invocation before giving up.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(2),
        }
    }
}

/// Failure accounting shared by every connection of one listener
/// invocation.
#[derive(Debug)]
pub struct ReconnectBudget {
    max_attempts: u32,
    failures: u32,
    last_error: String,
}

impl ReconnectBudget {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            failures: 0,
            last_error: String::new(),
        }
    }

    /// Record one failure. Returns `false` once the budget is exceeded.
    pub fn record_failure(&mut self, reason: impl Into<String>) -> bool {
        self.failures += 1;
        self.last_error = reason.into();
        self.failures <= self.max_attempts
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_error(&self) -> &str {
        &self.last_error
    }
}

/// Result of a [`reconnect_loop`] run.
pub enum ReconnectOutcome {
    Connected(MessageStream),
    Exhausted,
    Cancelled,
}

/// Connect to the event stream, retrying on the fixed delay until a
/// connection succeeds, the budget runs out, or `cancel` fires.
///
/// When `wait_first` is set the loop sleeps before its first attempt, as
/// it does after a dropped connection.
pub async fn reconnect_loop(
    connector: &dyn EventConnector,
    client_id: &str,
    config: &ReconnectConfig,
    budget: &mut ReconnectBudget,
    cancel: &CancellationToken,
    wait_first: bool,
) -> ReconnectOutcome {
    if wait_first && !pause(config.delay, cancel).await {
        return ReconnectOutcome::Cancelled;
    }

    loop {
        tracing::debug!(
            client_id,
            failures = budget.failures(),
            "Connecting to ComfyUI event stream",
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(client_id, "Reconnect cancelled");
                return ReconnectOutcome::Cancelled;
            }
            result = connector.connect(client_id) => {
                match result {
                    Ok(stream) => return ReconnectOutcome::Connected(stream),
                    Err(e) => {
                        tracing::warn!(
                            client_id,
                            error = %e,
                            "Connect attempt {} failed",
                            budget.failures() + 1,
                        );
                        if !budget.record_failure(e.to_string()) {
                            return ReconnectOutcome::Exhausted;
                        }
                    }
                }
            }
        }

        if !pause(config.delay, cancel).await {
            return ReconnectOutcome::Cancelled;
        }
    }
}

/// Sleep for `delay`. Returns `false` if cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
