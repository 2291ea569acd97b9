//! # Realtime Event State Machine
//!
//! Interprets the realtime AI service's event stream for one call. The machine
//! itself performs no I/O: `apply` updates per-session state and returns the
//! side effects the receive loop must carry out.
//!
//! ## Phases:
//! ```text
//! Configuring --session.updated--> Ready --teardown--> Closed
//!                                    |
//!                   response.created / response.done toggle awaiting_response
//! ```

use serde::Serialize;
use tracing::{debug, info};

use super::protocol::ServerEvent;

/// Where a session's AI connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Configuration update sent, not yet acknowledged
    Configuring,
    Ready,
    Closed,
}

/// Side effect requested by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Wake whoever waits for the configuration handshake
    ConfigAcknowledged,
    /// Base64 PCM16 at the AI output rate, to be sent to the caller
    ForwardAudio(String),
    /// Completed response text for the context store
    PersistTranscript(String),
    /// Non-fatal error reported by the service
    ReportError(String),
}

/// Per-session interpretation of realtime events.
#[derive(Debug)]
pub struct RemoteEventStateMachine {
    stream_id: String,
    phase: SessionPhase,
    awaiting_response: bool,
    transcript: String,
    config_acknowledged: bool,
}

impl RemoteEventStateMachine {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            phase: SessionPhase::Configuring,
            awaiting_response: false,
            transcript: String::new(),
            config_acknowledged: false,
        }
    }

    /// Feed one event, returning the effects to execute in order.
    ///
    /// Events arriving after `close` are ignored.
    pub fn apply(&mut self, event: &ServerEvent) -> Vec<Effect> {
        if self.phase == SessionPhase::Closed {
            return Vec::new();
        }

        match event {
            ServerEvent::SessionCreated => {
                info!(stream_id = %self.stream_id, "Realtime session created");
                Vec::new()
            }
            ServerEvent::SessionUpdated => {
                let first = !self.config_acknowledged;
                self.config_acknowledged = true;
                self.phase = SessionPhase::Ready;
                if first {
                    info!(stream_id = %self.stream_id, "Session configuration acknowledged");
                    vec![Effect::ConfigAcknowledged]
                } else {
                    Vec::new()
                }
            }
            ServerEvent::InputAudioCommitted => {
                debug!(stream_id = %self.stream_id, "Caller audio committed");
                Vec::new()
            }
            ServerEvent::SpeechStarted | ServerEvent::SpeechStopped => {
                debug!(stream_id = %self.stream_id, event = ?event, "Speech activity");
                Vec::new()
            }
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                info!(stream_id = %self.stream_id, transcript = %transcript, "Caller said");
                Vec::new()
            }
            ServerEvent::ResponseCreated { response } => {
                self.awaiting_response = true;
                debug!(stream_id = %self.stream_id, response_id = ?response.id, "Response started");
                Vec::new()
            }
            ServerEvent::AudioDelta { delta } => {
                if delta.is_empty() {
                    Vec::new()
                } else {
                    vec![Effect::ForwardAudio(delta.clone())]
                }
            }
            ServerEvent::AudioDone => {
                debug!(stream_id = %self.stream_id, "Response audio finished");
                Vec::new()
            }
            ServerEvent::TextDelta { delta } | ServerEvent::AudioTranscriptDelta { delta } => {
                self.transcript.push_str(delta);
                Vec::new()
            }
            ServerEvent::ResponseDone { response } => {
                self.awaiting_response = false;
                debug!(stream_id = %self.stream_id, response_id = ?response.id, status = ?response.status, "Response finished");
                if self.transcript.is_empty() {
                    Vec::new()
                } else {
                    vec![Effect::PersistTranscript(std::mem::take(&mut self.transcript))]
                }
            }
            ServerEvent::ResponseError { error } | ServerEvent::Error { error } => {
                self.awaiting_response = false;
                let message = error
                    .as_ref()
                    .map(|detail| detail.to_string())
                    .unwrap_or_else(|| "unspecified error".to_string());
                vec![Effect::ReportError(message)]
            }
            ServerEvent::Unknown => {
                debug!(stream_id = %self.stream_id, "Ignoring unrecognized realtime event");
                Vec::new()
            }
        }
    }

    /// Enter the terminal phase; the partial transcript is dropped.
    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
        self.awaiting_response = false;
        self.transcript.clear();
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn awaiting_response(&self) -> bool {
        self.awaiting_response
    }

    pub fn config_acknowledged(&self) -> bool {
        self.config_acknowledged
    }

    /// Transcript accumulated for the current response.
    pub fn transcript(&self) -> &str {
        &self.transcript
    }
}
