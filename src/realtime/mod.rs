//! # Realtime AI Service
//!
//! Client side of the speech-to-speech realtime API.
//!
//! ## Key Components:
//! - **protocol**: Typed JSON messages in both directions
//! - **client**: WebSocket connection, writer task, and the connector seam
//! - **state_machine**: Pure interpretation of the event stream
//! - **lifecycle**: Open/configure/close and the per-session receive loop

pub mod client;
pub mod lifecycle;
pub mod protocol;
pub mod state_machine;

pub use client::OpenAiRealtimeConnector;
pub use lifecycle::ConnectionLifecycleManager;
