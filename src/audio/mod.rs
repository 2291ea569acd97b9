//! # Audio Module
//!
//! Everything that touches raw audio on its way between the phone call and the
//! realtime AI service.
//!
//! ## Key Components:
//! - **Codec**: G.711 µ-law/A-law ↔ PCM16 and linear-interpolation resampling
//! - **Buffer**: Threshold + debounce aggregation of the caller's audio
//!
//! ## Audio Formats:
//! - **Telephony side**: µ-law at 8kHz unless the stream announces otherwise
//! - **AI input**: PCM16 little-endian mono at 16kHz
//! - **AI output**: PCM16 little-endian mono at 24kHz

pub mod buffer; // Inbound aggregation with debounced flush
pub mod codec; // Stateless format conversion

pub use buffer::{AudioBufferAggregator, AudioSink, FlushPolicy};
pub use codec::AudioFormat;
