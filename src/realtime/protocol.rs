//! # Realtime Wire Protocol
//!
//! JSON messages exchanged with the realtime AI service. Every message is an
//! object with a `type` discriminator, which maps directly onto serde's
//! internally tagged enums.
//!
//! ## Message Directions:
//! - **ClientMessage**: What we send (`session.update`, `input_audio_buffer.append`, ...)
//! - **ServerEvent**: What the service streams back (`session.updated`, `response.output_audio.delta`, ...)
//!
//! Beta and GA releases of the API name some events differently
//! (`response.audio.delta` vs `response.output_audio.delta`); both spellings are
//! accepted through `#[serde(alias)]`. Unrecognized event types deserialize to
//! `ServerEvent::Unknown` instead of failing.

use serde::{Deserialize, Serialize};

use crate::config::RealtimeConfig;
use crate::error::BridgeResult;

/// Messages sent to the realtime AI service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// One base64 PCM16 chunk of caller audio
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseOptions },
}

impl ClientMessage {
    pub fn to_json(&self) -> BridgeResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionUpdate { .. } => "session.update",
            ClientMessage::InputAudioAppend { .. } => "input_audio_buffer.append",
            ClientMessage::ConversationItemCreate { .. } => "conversation.item.create",
            ClientMessage::ResponseCreate { .. } => "response.create",
        }
    }
}

/// Body of `session.update`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

impl SessionConfig {
    /// Build the configuration update for one call.
    ///
    /// Audio is always PCM16 in both directions; the bridge does the G.711 work.
    pub fn from_settings(settings: &RealtimeConfig, instructions: String) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions,
            voice: settings.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionConfig {
                model: settings.transcription_model.clone(),
            },
            turn_detection: TurnDetection {
                kind: "server_vad".to_string(),
                threshold: settings.turn_detection.threshold,
                prefix_padding_ms: settings.turn_detection.prefix_padding_ms,
                silence_duration_ms: settings.turn_detection.silence_duration_ms,
            },
            temperature: settings.temperature,
            max_response_output_tokens: settings.max_response_output_tokens,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// A conversation item; only system text messages are created by the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    pub fn system_text(text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            role: "system".to_string(),
            content: vec![ContentPart {
                kind: "input_text".to_string(),
                text: text.into(),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseOptions {
    pub instructions: String,
}

/// Events streamed by the realtime AI service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated,

    /// Acknowledgement of our `session.update`
    #[serde(rename = "session.updated")]
    SessionUpdated,

    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioCommitted,

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    /// What the caller said, as transcribed by the service
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.created")]
    ResponseCreated {
        #[serde(default)]
        response: ResponseInfo,
    },

    /// Base64 PCM16 audio at the AI output rate
    #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.output_audio.done", alias = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.output_text.delta", alias = "response.text.delta")]
    TextDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(
        rename = "response.output_audio_transcript.delta",
        alias = "response.audio_transcript.delta"
    )]
    AudioTranscriptDelta {
        #[serde(default)]
        delta: String,
    },

    #[serde(rename = "response.done", alias = "response.completed")]
    ResponseDone {
        #[serde(default)]
        response: ResponseInfo,
    },

    #[serde(rename = "response.error")]
    ResponseError {
        #[serde(default)]
        error: Option<ErrorDetail>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Option<ErrorDetail>,
    },

    #[serde(other)]
    Unknown,
}

/// The parts of a response object we log.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.kind, &self.code) {
            (Some(kind), Some(code)) => write!(f, "{} ({}): {}", kind, code, self.message),
            (Some(kind), None) => write!(f, "{}: {}", kind, self.message),
            _ => f.write_str(&self.message),
        }
    }
}

#[derive(Deserialize)]
struct EventType {
    #[serde(rename = "type", default)]
    kind: String,
}

impl ServerEvent {
    /// Parse one text frame.
    pub fn parse(text: &str) -> BridgeResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Raw `type` of a frame, for logging events we don't model.
    pub fn raw_type(text: &str) -> String {
        serde_json::from_str::<EventType>(text)
            .map(|event| event.kind)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_session_update_shape() {
        let message = ClientMessage::SessionUpdate {
            session: SessionConfig::from_settings(&RealtimeConfig::default(), "Be brief.".to_string()),
        };
        let value: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "session.update");
        assert_eq!(value["session"]["instructions"], "Be brief.");
        assert_eq!(value["session"]["voice"], "alloy");
        assert_eq!(value["session"]["input_audio_format"], "pcm16");
        assert_eq!(value["session"]["output_audio_format"], "pcm16");
        assert_eq!(value["session"]["modalities"], json!(["text", "audio"]));
        assert_eq!(value["session"]["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(value["session"]["turn_detection"]["type"], "server_vad");
        assert_eq!(value["session"]["turn_detection"]["silence_duration_ms"], 700);
        assert_eq!(value["session"]["max_response_output_tokens"], 200);
    }

    #[test]
    fn test_append_and_system_message_shape() {
        let append = ClientMessage::InputAudioAppend {
            audio: "AAAA".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&append).unwrap(),
            json!({"type": "input_audio_buffer.append", "audio": "AAAA"})
        );

        let item = ClientMessage::ConversationItemCreate {
            item: ConversationItem::system_text("Stay polite."),
        };
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({
                "type": "conversation.item.create",
                "item": {
                    "type": "message",
                    "role": "system",
                    "content": [{"type": "input_text", "text": "Stay polite."}]
                }
            })
        );
    }

    #[test]
    fn test_parse_events_and_aliases() {
        let event = ServerEvent::parse(r#"{"type":"session.updated","event_id":"e1","session":{"voice":"alloy"}}"#).unwrap();
        assert_eq!(event, ServerEvent::SessionUpdated);

        let ga = ServerEvent::parse(r#"{"type":"response.output_audio.delta","delta":"AQI="}"#).unwrap();
        let beta = ServerEvent::parse(r#"{"type":"response.audio.delta","delta":"AQI="}"#).unwrap();
        assert_eq!(ga, beta);

        let done = ServerEvent::parse(r#"{"type":"response.completed"}"#).unwrap();
        assert!(matches!(done, ServerEvent::ResponseDone { .. }));

        let error = ServerEvent::parse(
            r#"{"type":"error","error":{"type":"invalid_request_error","message":"bad"}}"#,
        )
        .unwrap();
        match error {
            ServerEvent::Error { error: Some(detail) } => {
                assert_eq!(detail.to_string(), "invalid_request_error: bad")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed_events() {
        let text = r#"{"type":"rate_limits.updated","rate_limits":[]}"#;
        assert_eq!(ServerEvent::parse(text).unwrap(), ServerEvent::Unknown);
        assert_eq!(ServerEvent::raw_type(text), "rate_limits.updated");

        assert!(ServerEvent::parse("not json").is_err());
        // Known type with a missing required field
        assert!(ServerEvent::parse(r#"{"type":"response.output_audio.delta"}"#).is_err());
    }
}
