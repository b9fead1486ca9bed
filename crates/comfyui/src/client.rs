//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the WebSocket base URL of one ComfyUI server.
//! Call [`ComfyUIClient::connect`] to establish a live
//! [`ComfyUIConnection`], or use it through the [`EventConnector`] trait,
//! which hands the event listener a plain stream of text frames.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Text frames received from a ComfyUI WebSocket, in arrival order.
///
/// The stream ends when the server closes the connection. A receive error
/// is yielded once as `Err`; callers treat it as a dropped connection.
pub type MessageStream = BoxStream<'static, Result<String, ComfyUIClientError>>;

/// Opens event subscriptions scoped to a ComfyUI client id.
#[async_trait]
pub trait EventConnector: Send + Sync {
    async fn connect(&self, client_id: &str) -> Result<MessageStream, ComfyUIClientError>;
}

/// Configuration handle for a ComfyUI WebSocket endpoint.
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading/writing frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl ComfyUIClient {
    /// Create a new client.
    ///
    /// * `ws_url` - WebSocket base URL, e.g. `ws://host:8188`.
    pub fn new(ws_url: impl Into<String>) -> Self {
        let ws_url = ws_url.into().trim_end_matches('/').to_string();
        Self { ws_url }
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint as `client_id`.
    ///
    /// ComfyUI addresses execution messages for prompts queued with the
    /// same `client_id` to this connection.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Turn the connection into a stream of text frames.
    ///
    /// Binary frames (preview images) and ping/pong are skipped; a close
    /// frame ends the stream.
    pub fn into_text_stream(self) -> MessageStream {
        let client_id = self.client_id;
        futures::stream::unfold(Some(self.ws_stream), move |state| {
            let client_id = client_id.clone();
            async move {
                let mut ws_stream = state?;
                while let Some(msg_result) = ws_stream.next().await {
                    match msg_result {
                        Ok(Message::Text(text)) => {
                            return Some((Ok(text.to_string()), Some(ws_stream)));
                        }
                        Ok(Message::Binary(_)) => {
                            tracing::trace!(
                                client_id = %client_id,
                                "Ignoring binary message (preview image)",
                            );
                        }
                        Ok(Message::Ping(_) | Message::Pong(_)) => {
                            // Handled automatically by tungstenite.
                        }
                        Ok(Message::Close(frame)) => {
                            tracing::info!(
                                client_id = %client_id,
                                ?frame,
                                "ComfyUI WebSocket closed",
                            );
                            return None;
                        }
                        Ok(Message::Frame(_)) => {}
                        Err(e) => {
                            return Some((Err(ComfyUIClientError::Protocol(e.to_string())), None));
                        }
                    }
                }
                None
            }
        })
        .boxed()
    }
}

#[async_trait]
impl EventConnector for ComfyUIClient {
    async fn connect(&self, client_id: &str) -> Result<MessageStream, ComfyUIClientError> {
        Ok(ComfyUIClient::connect(self, client_id).await?.into_text_stream())
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
