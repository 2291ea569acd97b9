//! # Call Session State
//!
//! One [`Session`] exists per active telephony stream. It correlates the
//! stream id with the negotiated audio format, the realtime connection (once
//! started), the inbound buffer, and the event state machine.
//!
//! ## Session Lifecycle:
//! 1. **Registered**: Created on the stream's `start` frame, default µ-law/8kHz format
//! 2. **Configuring**: Realtime connection attached, waiting for the handshake
//! 3. **Ready**: Handshake acknowledged; audio flows both ways
//! 4. **Closed**: Connection detached during teardown
//!
//! ## Thread Safety:
//! The worker task, the receive loop, and debounce tasks all hold an
//! `Arc<Session>`. Each piece of mutable state has its own lock, and no lock is
//! held across an `.await`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::BridgeStats;
use crate::audio::codec::{self, AudioFormat};
use crate::audio::AudioBufferAggregator;
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::realtime::client::RealtimeSender;
use crate::realtime::protocol::ServerEvent;
use crate::realtime::state_machine::{Effect, RemoteEventStateMachine, SessionPhase};
use crate::telephony::{OutboundMediaFrame, TelephonySender};

/// Sample rates on each side of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRates {
    pub telephony: u32,
    pub ai_input: u32,
    pub ai_output: u32,
}

impl From<&BridgeConfig> for AudioRates {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            telephony: config.telephony_sample_rate,
            ai_input: config.ai_input_sample_rate,
            ai_output: config.ai_output_sample_rate,
        }
    }
}

/// Realtime connection resources owned by a started session.
pub struct ActiveConnection {
    pub sender: RealtimeSender,
    pub buffer: AudioBufferAggregator,
    pub receive_task: JoinHandle<()>,
}

/// State of one call.
pub struct Session {
    stream_id: String,
    telephony: TelephonySender,
    rates: AudioRates,
    audio_format: RwLock<AudioFormat>,
    connection: Mutex<Option<ActiveConnection>>,
    machine: Mutex<RemoteEventStateMachine>,
    phase: watch::Sender<SessionPhase>,
    stats: Arc<BridgeStats>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        stream_id: impl Into<String>,
        telephony: TelephonySender,
        rates: AudioRates,
        stats: Arc<BridgeStats>,
    ) -> Self {
        let stream_id = stream_id.into();
        let (phase, _) = watch::channel(SessionPhase::Configuring);
        Self {
            machine: Mutex::new(RemoteEventStateMachine::new(stream_id.clone())),
            stream_id,
            telephony,
            rates,
            audio_format: RwLock::new(AudioFormat::default()),
            connection: Mutex::new(None),
            phase,
            stats,
            created_at: Utc::now(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stats(&self) -> &Arc<BridgeStats> {
        &self.stats
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn audio_format(&self) -> AudioFormat {
        *self.audio_format.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies to chunks forwarded from now on.
    pub fn set_audio_format(&self, format: AudioFormat) {
        *self.audio_format.write().unwrap_or_else(PoisonError::into_inner) = format;
    }

    /// Install the realtime connection; returns any connection it replaces.
    pub fn attach(&self, connection: ActiveConnection) -> Option<ActiveConnection> {
        self.lock_connection().replace(connection)
    }

    /// Take the realtime connection out for teardown.
    pub fn detach(&self) -> Option<ActiveConnection> {
        self.lock_connection().take()
    }

    #[cfg(test)]
    pub fn has_connection(&self) -> bool {
        self.lock_connection().is_some()
    }

    /// Inbound buffer of the attached connection.
    pub fn buffer(&self) -> Option<AudioBufferAggregator> {
        self.lock_connection().as_ref().map(|c| c.buffer.clone())
    }

    /// Transcode one decoded telephony chunk and hand it to the inbound buffer.
    ///
    /// Chunks arriving before the realtime connection is attached are dropped.
    pub fn forward_inbound(&self, chunk: &[u8]) -> BridgeResult<()> {
        let Some(buffer) = self.buffer() else {
            debug!(stream_id = %self.stream_id, "No realtime connection yet, dropping chunk");
            return Ok(());
        };

        let format = self.audio_format();
        let pcm = codec::to_linear16(chunk, format.encoding(), format.sample_rate(), self.rates.ai_input);
        buffer.append(pcm);
        self.stats.media_frames_in.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Transcode one base64 AI audio delta to µ-law and send it to the caller.
    pub fn forward_outbound(&self, delta_b64: &str) -> BridgeResult<()> {
        let pcm = STANDARD.decode(delta_b64)?;
        let ulaw = codec::from_linear16(&pcm, self.rates.ai_output, self.rates.telephony);
        if ulaw.is_empty() {
            return Ok(());
        }

        let frame = OutboundMediaFrame::new(self.stream_id.as_str(), STANDARD.encode(ulaw));
        self.telephony.send_media(&frame)?;
        self.stats.media_frames_out.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn apply_event(&self, event: &ServerEvent) -> Vec<Effect> {
        self.lock_machine().apply(event)
    }

    /// Handshake acknowledged; wakes the ack waiter.
    pub fn mark_ready(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::Configuring {
                *phase = SessionPhase::Ready;
                true
            } else {
                false
            }
        });
    }

    pub fn mark_closed(&self) {
        self.lock_machine().close();
        self.phase.send_replace(SessionPhase::Closed);
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn awaiting_response(&self) -> bool {
        self.lock_machine().awaiting_response()
    }

    /// Ask the telephony actor to close the caller's socket.
    pub fn close_telephony(&self) -> BridgeResult<()> {
        self.telephony.close()
    }

    fn lock_connection(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_machine(&self) -> MutexGuard<'_, RemoteEventStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
