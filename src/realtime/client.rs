//! # Realtime Connection Client
//!
//! Opens the WebSocket to the realtime AI service and splits it into:
//! - a **RealtimeSender**: cloneable handle that queues outbound messages
//! - an **inbound stream** of text frames, consumed by the session's receive loop
//!
//! The socket's write half is owned by one writer task fed by an unbounded
//! channel, so flushes, configuration messages, and the final close never race
//! each other on the wire.
//!
//! ## Testability:
//! Connections are created through the [`RealtimeConnector`] trait. Production
//! uses [`OpenAiRealtimeConnector`]; tests swap in a channel-backed fake.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::ClientMessage;
use crate::audio::AudioSink;
use crate::config::RealtimeConfig;
use crate::error::{BridgeError, BridgeResult};

/// Outbound queue item for the writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Text(String),
    Close,
}

/// Cloneable write handle for one realtime connection.
#[derive(Debug, Clone)]
pub struct RealtimeSender {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl RealtimeSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: &ClientMessage) -> BridgeResult<()> {
        let json = message.to_json()?;
        self.tx
            .send(Outgoing::Text(json))
            .map_err(|_| BridgeError::Connection(format!("realtime connection closed, could not send {}", message.kind())))
    }

    /// Queue a close frame. A connection that is already gone counts as closed.
    pub fn close(&self) -> BridgeResult<()> {
        if self.tx.is_closed() {
            return Ok(());
        }
        self.tx
            .send(Outgoing::Close)
            .map_err(|_| BridgeError::Connection("realtime connection closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Flushed caller audio becomes `input_audio_buffer.append` messages.
impl AudioSink for RealtimeSender {
    fn append_audio(&self, pcm: &[u8]) -> BridgeResult<()> {
        self.send(&ClientMessage::InputAudioAppend {
            audio: STANDARD.encode(pcm),
        })
    }
}

/// An open realtime connection.
pub struct RealtimeLink {
    pub sender: RealtimeSender,
    /// Text frames from the service; ends when the connection drops
    pub inbound: BoxStream<'static, BridgeResult<String>>,
}

/// Factory for realtime connections.
///
/// ## Rust Concepts:
/// - **async_trait**: Async methods in a trait object (`Arc<dyn RealtimeConnector>`)
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self, stream_id: &str) -> BridgeResult<RealtimeLink>;
}

/// Connects to the realtime API over TLS WebSockets.
pub struct OpenAiRealtimeConnector {
    url: Url,
    api_key: String,
}

impl OpenAiRealtimeConnector {
    /// Build the connector from settings; fails on an unparsable URL.
    pub fn new(settings: &RealtimeConfig) -> BridgeResult<Self> {
        let mut url = Url::parse(&settings.url)
            .map_err(|e| BridgeError::Config(format!("invalid realtime URL: {}", e)))?;
        url.query_pairs_mut().append_pair("model", &settings.model);

        Ok(Self {
            url,
            api_key: settings.api_key.clone(),
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl RealtimeConnector for OpenAiRealtimeConnector {
    async fn connect(&self, stream_id: &str) -> BridgeResult<RealtimeLink> {
        let mut request = self.url.as_str().into_client_request()?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| BridgeError::Config(format!("invalid API key header: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        debug!(stream_id, url = %self.url, "Connecting to realtime service");
        let (socket, response) = connect_async(request).await?;
        info!(stream_id, status = %response.status(), "Realtime connection established");

        let (mut write, read) = socket.split();
        let (sender, mut outgoing) = RealtimeSender::channel();

        let label = stream_id.to_string();
        tokio::spawn(async move {
            while let Some(item) = outgoing.recv().await {
                match item {
                    Outgoing::Text(text) => {
                        if let Err(err) = write.send(Message::Text(text)).await {
                            warn!(stream_id = %label, error = %err, "Realtime write failed");
                            break;
                        }
                    }
                    Outgoing::Close => {
                        if let Err(err) = write.send(Message::Close(None)).await {
                            debug!(stream_id = %label, error = %err, "Close frame not delivered");
                        }
                        break;
                    }
                }
            }
            let _ = write.close().await;
            debug!(stream_id = %label, "Realtime writer stopped");
        });

        let label = stream_id.to_string();
        let inbound = read
            .filter_map(move |frame| {
                let label = label.clone();
                async move {
                    match frame {
                        Ok(Message::Text(text)) => Some(Ok(text)),
                        Ok(Message::Close(reason)) => {
                            debug!(stream_id = %label, reason = ?reason, "Realtime service closed the connection");
                            None
                        }
                        // Binary frames are not part of the protocol; pings are answered by tungstenite
                        Ok(_) => None,
                        Err(err) => Some(Err(BridgeError::from(err))),
                    }
                }
            })
            .boxed();

        Ok(RealtimeLink { sender, inbound })
    }
}
