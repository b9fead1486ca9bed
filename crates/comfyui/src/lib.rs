//! ComfyUI WebSocket and REST client library.
//!
//! Provides the HTTP API wrapper, typed WebSocket message parsing, and the
//! two completion detectors (event listener and history poller) together
//! with the race that runs them side by side for one prompt.

pub mod api;
pub mod client;
pub mod completion;
pub mod listener;
pub mod messages;
pub mod poller;
pub mod race;
pub mod reconnect;

#[cfg(test)]
mod testing;

pub use api::{ComfyUIApi, ComfyUIApiError, ComfyUIBackend, HistoryEntry};
pub use client::{ComfyUIClient, ComfyUIClientError, EventConnector, MessageStream};
pub use completion::{CompletionSignal, DetectionError, Detector};
pub use listener::{EventListener, ListenerConfig};
pub use poller::PollerConfig;
pub use race::CompletionRace;
pub use reconnect::ReconnectConfig;
