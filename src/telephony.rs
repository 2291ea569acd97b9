//! # Telephony Media Stream Protocol
//!
//! Frames exchanged with the telephony provider's media-stream WebSocket and
//! the per-call worker that feeds them into the [`SessionBridge`].
//!
//! ## Inbound Frames (JSON, discriminated by `event`):
//! - `connected`: Socket is up (informational)
//! - `start`: `{"start": {"streamSid", "mediaFormat": {"encoding", "sampleRate"}}}`
//! - `media`: `{"media": {"payload": "<base64>"}}`
//! - `mark`: Playback marker echo (informational)
//! - `stop`: Caller hung up
//!
//! ## Outbound Frames:
//! `{"event": "media", "streamSid": "...", "media": {"payload": "<base64 µ-law 8kHz>"}}`
//!
//! ## Rust Concepts:
//! - **mpsc channels**: The WebSocket actor and the worker never share state; text frames flow
//!   in through one channel and outbound frames flow back through another
//! - **Sequential worker**: One task per call handles frames strictly in arrival order

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridge::SessionBridge;
use crate::error::{BridgeError, BridgeResult};

/// Frames sent by the telephony provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TwilioInbound {
    Connected {
        #[serde(default)]
        protocol: Option<String>,
    },
    Start {
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {
        #[serde(default)]
        mark: Option<MarkInfo>,
    },
    Stop,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMetadata {
    pub stream_sid: String,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default, alias = "media_format")]
    pub media_format: Option<MediaFormat>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    pub encoding: String,
    #[serde(alias = "sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub channels: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkInfo {
    pub name: String,
}

/// Media frame sent back to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMediaFrame {
    pub event: &'static str,
    pub stream_sid: String,
    pub media: OutboundMedia,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}

impl OutboundMediaFrame {
    pub fn new(stream_sid: impl Into<String>, payload: String) -> Self {
        Self {
            event: "media",
            stream_sid: stream_sid.into(),
            media: OutboundMedia { payload },
        }
    }
}

/// What the WebSocket actor should do with its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyOutbound {
    /// Serialized JSON text frame
    Media(String),
    /// Close the socket
    Close,
}

/// Write handle for one telephony socket.
///
/// The socket has a single writer (its actor); everybody else goes through
/// this channel.
#[derive(Debug, Clone)]
pub struct TelephonySender {
    tx: mpsc::UnboundedSender<TelephonyOutbound>,
}

impl TelephonySender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TelephonyOutbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send_media(&self, frame: &OutboundMediaFrame) -> BridgeResult<()> {
        let json = serde_json::to_string(frame)?;
        self.tx
            .send(TelephonyOutbound::Media(json))
            .map_err(|_| BridgeError::Connection("telephony socket closed".to_string()))
    }

    /// Ask the actor to close the socket. Closing an already closed socket is not an error.
    pub fn close(&self) -> BridgeResult<()> {
        if self.tx.is_closed() {
            return Ok(());
        }
        self.tx
            .send(TelephonyOutbound::Close)
            .map_err(|_| BridgeError::Connection("telephony socket closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Process one call's inbound frames in order until the socket goes away.
///
/// ## Frame handling:
/// - `start` → `register`, `configure_audio`, `start`
/// - `media` → `forward_inbound`
/// - `stop` or channel closed → `terminate`
///
/// Malformed frames are logged and skipped.
pub async fn run_stream_worker(
    bridge: Arc<SessionBridge>,
    outbound: TelephonySender,
    mut frames: mpsc::UnboundedReceiver<String>,
) {
    let mut stream_id: Option<String> = None;

    while let Some(text) = frames.recv().await {
        if text.trim().is_empty() {
            continue;
        }

        let frame = match serde_json::from_str::<TwilioInbound>(&text) {
            Ok(frame) => frame,
            Err(err) => {
                let err = BridgeError::from(err);
                warn!(stream_id = ?stream_id, error = %err, "Skipping malformed telephony frame");
                continue;
            }
        };

        match frame {
            TwilioInbound::Connected { protocol } => {
                info!(protocol = ?protocol, "Telephony media stream connected");
            }
            TwilioInbound::Start { start } => {
                if let Some(previous) = stream_id.take() {
                    warn!(stream_id = %previous, "Stream restarted on the same socket");
                    if previous != start.stream_sid {
                        if let Err(err) = bridge.terminate(&previous) {
                            warn!(stream_id = %previous, error = %err, "Teardown reported errors");
                        }
                    }
                }

                if handle_start(&bridge, &outbound, &start).await {
                    stream_id = Some(start.stream_sid);
                }
            }
            TwilioInbound::Media { media } => {
                let Some(id) = stream_id.as_deref() else {
                    debug!("Media frame before start, dropping");
                    continue;
                };
                if let Err(err) = bridge.forward_inbound(id, &media.payload) {
                    warn!(stream_id = %id, error = %err, "Dropping inbound media chunk");
                }
            }
            TwilioInbound::Mark { mark } => {
                debug!(stream_id = ?stream_id, mark = ?mark.map(|m| m.name), "Mark received");
            }
            TwilioInbound::Stop => {
                info!(stream_id = ?stream_id, "Telephony stream stopped");
                break;
            }
            TwilioInbound::Unknown => {
                debug!(stream_id = ?stream_id, "Ignoring unrecognized telephony frame");
            }
        }
    }

    if let Some(id) = stream_id {
        if let Err(err) = bridge.terminate(&id) {
            warn!(stream_id = %id, error = %err, "Teardown reported errors");
        }
    }
    debug!("Telephony stream worker finished");
}

/// Returns true when the session is registered and its AI connection is up.
async fn handle_start(bridge: &Arc<SessionBridge>, outbound: &TelephonySender, start: &StartMetadata) -> bool {
    let id = start.stream_sid.as_str();
    info!(stream_id = %id, call_sid = ?start.call_sid, "Telephony stream starting");

    if let Err(err) = bridge.register(id, outbound.clone()) {
        error!(stream_id = %id, error = %err, "Rejecting stream");
        let _ = outbound.close();
        return false;
    }

    if let Some(format) = &start.media_format {
        debug!(
            stream_id = %id,
            encoding = %format.encoding,
            sample_rate = format.sample_rate,
            channels = ?format.channels,
            "Media format announced"
        );
        if let Err(err) = bridge.configure_audio(id, &format.encoding, format.sample_rate) {
            warn!(stream_id = %id, error = %err, "Keeping previous audio format");
        }
    }

    // On failure the bridge has already torn the session down
    match bridge.start(id).await {
        Ok(()) => true,
        Err(err) => {
            error!(stream_id = %id, error = %err, "Failed to start realtime session");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::tests::test_bridge;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde_json::{json, Value};
    use std::time::Duration;

    #[test]
    fn test_parse_inbound_frames() {
        let start = json!({
            "event": "start",
            "sequenceNumber": "1",
            "streamSid": "MZ1",
            "start": {
                "streamSid": "MZ1",
                "callSid": "CA1",
                "tracks": ["inbound"],
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        });
        match serde_json::from_value::<TwilioInbound>(start).unwrap() {
            TwilioInbound::Start { start } => {
                assert_eq!(start.stream_sid, "MZ1");
                let format = start.media_format.unwrap();
                assert_eq!(format.encoding, "audio/x-mulaw");
                assert_eq!(format.sample_rate, 8000);
            }
            other => panic!("unexpected frame {:?}", other),
        }

        let stop = serde_json::from_str::<TwilioInbound>(r#"{"event":"stop","stop":{"callSid":"CA1"}}"#);
        assert!(matches!(stop.unwrap(), TwilioInbound::Stop));

        let other = serde_json::from_str::<TwilioInbound>(r#"{"event":"dtmf","dtmf":{"digit":"1"}}"#);
        assert!(matches!(other.unwrap(), TwilioInbound::Unknown));
    }

    #[test]
    fn test_outbound_frame_shape() {
        let frame = OutboundMediaFrame::new("CA123", "//8=".to_string());
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"event": "media", "streamSid": "CA123", "media": {"payload": "//8="}})
        );
    }

    #[test]
    fn test_sender_close_is_idempotent() {
        let (sender, rx) = TelephonySender::channel();
        assert!(sender.close().is_ok());
        drop(rx);
        assert!(sender.is_closed());
        assert!(sender.close().is_ok());
        assert!(sender.send_media(&OutboundMediaFrame::new("x", String::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_runs_call_end_to_end() {
        let (bridge, connector) = test_bridge();
        let (outbound, mut outbound_rx) = TelephonySender::channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_stream_worker(bridge.clone(), outbound, frames_rx));

        frames_tx.send(json!({"event": "connected", "protocol": "Call"}).to_string()).unwrap();
        frames_tx
            .send(
                json!({
                    "event": "start",
                    "start": {
                        "streamSid": "CA123",
                        "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000}
                    }
                })
                .to_string(),
            )
            .unwrap();
        frames_tx.send("{broken".to_string()).unwrap();
        frames_tx
            .send(
                json!({"event": "media", "media": {"payload": STANDARD.encode(vec![0xFFu8; 4000])}})
                    .to_string(),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bridge.active_sessions(), 1);
        let session = bridge.session("CA123").unwrap();
        let buffer = session.buffer().unwrap();
        assert_eq!(buffer.pending_samples(), 8000);
        assert!(buffer.has_scheduled_flush());

        let mut remote = connector.take_remote().unwrap();
        remote.push_event(json!({"type": "response.output_audio.delta", "delta": STANDARD.encode(vec![0u8; 960])}));
        tokio::time::sleep(Duration::from_millis(10)).await;

        match outbound_rx.try_recv().unwrap() {
            TelephonyOutbound::Media(text) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame["event"], "media");
                assert_eq!(frame["streamSid"], "CA123");
            }
            other => panic!("expected media frame, got {:?}", other),
        }
        assert!(outbound_rx.try_recv().is_err());

        frames_tx.send(json!({"event": "stop"}).to_string()).unwrap();
        worker.await.unwrap();

        assert_eq!(bridge.active_sessions(), 0);
        assert_eq!(outbound_rx.try_recv().unwrap(), TelephonyOutbound::Close);
        // The pending audio was over threshold, so teardown flushed it
        let appends = remote
            .sent_types()
            .into_iter()
            .filter(|kind| kind == "input_audio_buffer.append")
            .count();
        assert_eq!(appends, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_terminates_when_socket_goes_away() {
        let (bridge, _connector) = test_bridge();
        let (outbound, _outbound_rx) = TelephonySender::channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_stream_worker(bridge.clone(), outbound, frames_rx));

        frames_tx
            .send(json!({"event": "start", "start": {"streamSid": "CA9"}}).to_string())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(bridge.active_sessions(), 1);

        drop(frames_tx);
        worker.await.unwrap();
        assert_eq!(bridge.active_sessions(), 0);
    }
}
