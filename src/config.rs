//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix, `__` between nested keys)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Converts between Rust structs and TOML/env data
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize
//! - **Result<T, E>**: Loading and validation both report failures instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, OPENAI_API_KEY, TWILIO_STREAM_ENDPOINT)
//! 2. Environment variables (APP_SERVER__PORT, APP_REALTIME__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impls)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - `server`: where the HTTP/WebSocket server listens
/// - `realtime`: how we talk to the speech-to-speech AI service
/// - `telephony`: the call webhook and the media-stream socket
/// - `bridge`: audio rates and buffering policy between the two
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub realtime: RealtimeConfig,
    pub telephony: TelephonyConfig,
    pub bridge: BridgeConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production, behind the telephony provider)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Realtime AI service settings.
///
/// Everything in here ends up either in the connection URL/headers or in the
/// `session.update` message sent right after connecting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint without query string
    pub url: String,
    /// Model name, appended as `?model=`
    pub model: String,
    /// Bearer token for the `Authorization` header
    pub api_key: String,
    /// Voice id for synthesized replies
    pub voice: String,
    /// Sampling temperature
    pub temperature: f32,
    /// Cap on tokens per response
    pub max_response_output_tokens: u32,
    /// Model used for caller speech transcription
    pub transcription_model: String,
    /// Base system prompt handed to the context store
    pub instructions: String,
    /// System message injected after the configuration handshake (empty disables it)
    pub system_message: String,
    /// Instructions attached to `response.create`
    pub reinforcement_instructions: String,
    /// Ask the agent to speak first once the session is configured
    pub request_initial_response: bool,
    pub turn_detection: TurnDetectionConfig,
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnDetectionConfig {
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Telephony provider settings (webhook greeting and media-stream socket).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    /// Public `wss://` URL of our `/twilio/stream` endpoint, embedded in the webhook reply
    pub stream_endpoint: String,
    pub greeting: String,
    pub greeting_language: String,
    pub greeting_voice: String,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
}

/// Audio rates and buffering policy.
///
/// ## Defaults:
/// - Telephony audio is µ-law at 8kHz
/// - The AI service takes PCM16 at 16kHz and answers with PCM16 at 24kHz
/// - 2400 samples at 16kHz = 150ms of caller audio before a flush is scheduled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub telephony_sample_rate: u32,
    pub ai_input_sample_rate: u32,
    pub ai_output_sample_rate: u32,
    pub flush_threshold_samples: usize,
    pub flush_debounce_ms: u64,
    pub ack_timeout_ms: u64,
    pub max_concurrent_sessions: usize,
}

impl BridgeConfig {
    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-realtime".to_string(),
            api_key: String::new(),
            voice: "alloy".to_string(),
            temperature: 0.6,
            max_response_output_tokens: 200,
            transcription_model: "whisper-1".to_string(),
            instructions: "You are a customer service agent answering a phone call. \
                           Keep replies short, polite, and conversational."
                .to_string(),
            system_message: "Always answer in the caller's language and keep a polite register."
                .to_string(),
            reinforcement_instructions: "Answer briefly and politely.".to_string(),
            request_initial_response: false,
            turn_detection: TurnDetectionConfig::default(),
        }
    }
}

impl Default for TurnDetectionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 700, // 700ms of silence ends the caller's turn
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            stream_endpoint: String::new(),
            greeting: "Hello. Connecting you now, please hold on.".to_string(),
            greeting_language: "en-US".to_string(),
            greeting_voice: "Polly.Joanna-Neural".to_string(),
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            telephony_sample_rate: 8000,
            ai_input_sample_rate: 16000,
            ai_output_sample_rate: 24000,
            flush_threshold_samples: 2400,
            flush_debounce_ms: 150,
            ack_timeout_ms: 2000,
            max_concurrent_sessions: 50,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            realtime: RealtimeConfig::default(),
            telephony: TelephonyConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_REALTIME__VOICE=verse`: Override the AI voice
    /// - `APP_BRIDGE__FLUSH_DEBOUNCE_MS=200`: Override the debounce delay
    /// - `OPENAI_API_KEY=...`: Realtime API key
    /// - `TWILIO_STREAM_ENDPOINT=wss://.../twilio/stream`: Stream URL for the webhook
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Variables used by deployment platforms and by the provider dashboards
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }
        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("realtime.api_key", key)?;
        }
        if let Ok(endpoint) = env::var("TWILIO_STREAM_ENDPOINT") {
            settings = settings.set_override("telephony.stream_endpoint", endpoint)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Every sample rate is non-zero
    /// - The flush threshold and session cap are greater than 0
    /// - The realtime URL is a ws:// or wss:// URL
    /// - Turn detection threshold lies in 0.0..=1.0
    ///
    /// A missing API key is only a warning at startup (see `main`), so that the
    /// webhook and health endpoints can run in local development without one.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let bridge = &self.bridge;
        if bridge.telephony_sample_rate == 0
            || bridge.ai_input_sample_rate == 0
            || bridge.ai_output_sample_rate == 0
        {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if bridge.flush_threshold_samples == 0 {
            return Err(anyhow::anyhow!("Flush threshold must be greater than 0"));
        }

        if bridge.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let url = url::Url::parse(&self.realtime.url)
            .map_err(|e| anyhow::anyhow!("Invalid realtime URL '{}': {}", self.realtime.url, e))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(anyhow::anyhow!(
                "Realtime URL must use ws:// or wss://, got {}",
                url.scheme()
            ));
        }

        let threshold = self.realtime.turn_detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(anyhow::anyhow!(
                "Turn detection threshold must be between 0.0 and 1.0, got {}",
                threshold
            ));
        }

        Ok(())
    }
}
