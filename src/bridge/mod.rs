//! # Session Bridge
//!
//! Integration point between the telephony media stream and the realtime AI
//! service. Owns the registry of active calls and sequences every per-call
//! operation: registration, audio-format negotiation, start, audio forwarding
//! in both directions, and teardown.
//!
//! ## Registry:
//! `RwLock<HashMap<stream_id, Arc<Session>>>`. Lookups clone the `Arc` and
//! release the lock immediately; no registry lock is held across an `.await`.
//!
//! ## Teardown order:
//! 1. Remove the session from the registry (a second `terminate` is a no-op)
//! 2. Close the realtime side (cancel pending flush, final flush, close socket)
//! 3. Clear the conversation context
//! 4. Close the caller's socket, whether or not step 2 succeeded

pub mod session;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::context::ContextStore;
use crate::error::{BridgeError, BridgeResult};
use crate::realtime::lifecycle::{ConnectionLifecycleManager, OutboundAudio};
use crate::telephony::TelephonySender;
use session::{AudioRates, Session};

/// Bridge-wide counters, shared with every session.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub sessions_started: AtomicU64,
    pub sessions_terminated: AtomicU64,
    pub media_frames_in: AtomicU64,
    pub media_frames_out: AtomicU64,
    /// Shared with each session's inbound buffer
    pub flushes: Arc<AtomicU64>,
    pub errors: AtomicU64,
}

impl BridgeStats {
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BridgeStatsSnapshot {
        BridgeStatsSnapshot {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_terminated: self.sessions_terminated.load(Ordering::Relaxed),
            media_frames_in: self.media_frames_in.load(Ordering::Relaxed),
            media_frames_out: self.media_frames_out.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`BridgeStats`] for the health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatsSnapshot {
    pub sessions_started: u64,
    pub sessions_terminated: u64,
    pub media_frames_in: u64,
    pub media_frames_out: u64,
    pub flushes: u64,
    pub errors: u64,
}

/// Registry and orchestrator of active calls.
pub struct SessionBridge {
    registry: RwLock<HashMap<String, Arc<Session>>>,
    lifecycle: ConnectionLifecycleManager,
    context: Arc<dyn ContextStore>,
    settings: BridgeConfig,
    stats: Arc<BridgeStats>,
}

impl SessionBridge {
    pub fn new(lifecycle: ConnectionLifecycleManager, context: Arc<dyn ContextStore>, settings: BridgeConfig) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            lifecycle,
            context,
            settings,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    /// Create session state for `stream_id` with the default audio format.
    ///
    /// Re-registering an id replaces the old session after closing its
    /// realtime connection. New ids beyond the session cap are rejected.
    pub fn register(&self, stream_id: &str, telephony: TelephonySender) -> BridgeResult<Arc<Session>> {
        let session = Arc::new(Session::new(
            stream_id,
            telephony,
            AudioRates::from(&self.settings),
            Arc::clone(&self.stats),
        ));

        let previous = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            if !registry.contains_key(stream_id) && registry.len() >= self.settings.max_concurrent_sessions {
                self.stats.record_error();
                return Err(BridgeError::CapacityExceeded(self.settings.max_concurrent_sessions));
            }
            registry.insert(stream_id.to_string(), Arc::clone(&session))
        };

        if let Some(previous) = previous {
            warn!(stream_id, "Stream re-registered, replacing previous session");
            if let Err(err) = self.lifecycle.close(&previous) {
                warn!(stream_id, error = %err, "Previous realtime connection did not close cleanly");
            }
        }

        debug!(stream_id, "Session registered");
        Ok(session)
    }

    /// Record the audio format the telephony side announced.
    ///
    /// Unsupported formats are rejected and the previous format is kept.
    pub fn configure_audio(&self, stream_id: &str, encoding: &str, sample_rate: u32) -> BridgeResult<()> {
        let session = self.lookup(stream_id)?;
        let format = crate::audio::AudioFormat::parse(encoding, sample_rate)?;
        session.set_audio_format(format);
        debug!(stream_id, encoding, sample_rate, "Audio format configured");
        Ok(())
    }

    /// Open the realtime connection; on failure the session is torn down.
    ///
    /// AI audio for the session is routed back through
    /// [`forward_outbound`](Self::forward_outbound).
    pub async fn start(self: &Arc<Self>, stream_id: &str) -> BridgeResult<()> {
        let session = self.lookup(stream_id)?;
        let bridge: Weak<SessionBridge> = Arc::downgrade(self);
        let outbound: Weak<dyn OutboundAudio> = bridge;

        match self.lifecycle.open(&session, outbound).await {
            Ok(()) => {
                self.stats.sessions_started.fetch_add(1, Ordering::Relaxed);
                info!(stream_id, "Session started");
                Ok(())
            }
            Err(err) => {
                self.stats.record_error();
                // The id may have been terminated or re-registered while opening;
                // only the session this call started is torn down
                let teardown = if self.remove_if_current(&session) {
                    self.tear_down(&session)
                } else {
                    self.lifecycle.close(&session)
                };
                if let Err(teardown) = teardown {
                    warn!(stream_id, error = %teardown, "Teardown after failed start reported errors");
                }
                Err(err)
            }
        }
    }

    /// Forward one base64 media payload from the caller.
    pub fn forward_inbound(&self, stream_id: &str, payload_b64: &str) -> BridgeResult<()> {
        let session = self.lookup(stream_id)?;
        let chunk = STANDARD.decode(payload_b64).map_err(|err| {
            self.stats.record_error();
            BridgeError::from(err)
        })?;
        session.forward_inbound(&chunk)
    }

    /// Forward one base64 PCM16 audio delta from the AI service to the caller.
    pub fn forward_outbound(&self, stream_id: &str, delta_b64: &str) -> BridgeResult<()> {
        self.lookup(stream_id)?.forward_outbound(delta_b64)
    }

    /// Tear the session down. Unknown or already terminated ids are a no-op.
    pub fn terminate(&self, stream_id: &str) -> BridgeResult<()> {
        let removed = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_id);
        let Some(session) = removed else {
            debug!(stream_id, "Terminate for inactive stream ignored");
            return Ok(());
        };
        self.tear_down(&session)
    }

    /// Remove `session` from the registry only if it is still the one
    /// registered under its id.
    fn remove_if_current(&self, session: &Arc<Session>) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        match registry.get(session.stream_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                registry.remove(session.stream_id());
                true
            }
            _ => false,
        }
    }

    /// Release everything a removed session holds. Every step runs even when
    /// an earlier one fails.
    fn tear_down(&self, session: &Session) -> BridgeResult<()> {
        let stream_id = session.stream_id();
        let awaiting_response = session.awaiting_response();
        let mut failures = Vec::new();
        if let Err(err) = self.lifecycle.close(session) {
            failures.push(err.to_string());
        }
        self.context.clear(stream_id);
        if let Err(err) = session.close_telephony() {
            failures.push(format!("close telephony: {}", err));
        }

        self.stats.sessions_terminated.fetch_add(1, Ordering::Relaxed);
        let duration = Utc::now().signed_duration_since(session.created_at());
        info!(stream_id, duration_secs = duration.num_seconds(), awaiting_response, "Session terminated");

        if failures.is_empty() {
            Ok(())
        } else {
            self.stats.record_error();
            Err(BridgeError::Teardown(failures.join("; ")))
        }
    }

    /// Tear down every active session (server shutdown).
    pub fn terminate_all(&self) {
        let ids: Vec<String> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for id in ids {
            if let Err(err) = self.terminate(&id) {
                warn!(stream_id = %id, error = %err, "Teardown reported errors");
            }
        }
    }

    pub fn session(&self, stream_id: &str) -> Option<Arc<Session>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_id)
            .cloned()
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn max_sessions(&self) -> usize {
        self.settings.max_concurrent_sessions
    }

    pub fn stats(&self) -> BridgeStatsSnapshot {
        self.stats.snapshot()
    }

    fn lookup(&self, stream_id: &str) -> BridgeResult<Arc<Session>> {
        self.session(stream_id)
            .ok_or_else(|| BridgeError::SessionNotFound(stream_id.to_string()))
    }
}

impl OutboundAudio for SessionBridge {
    fn forward_outbound(&self, stream_id: &str, delta_b64: &str) -> BridgeResult<()> {
        SessionBridge::forward_outbound(self, stream_id, delta_b64)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::audio::codec::AudioEncoding;
    use crate::audio::AudioFormat;
    use crate::config::RealtimeConfig;
    use crate::context::{InMemoryContextStore, LAST_AI_RESPONSE};
    use crate::realtime::client::testing::FakeConnector;
    use crate::realtime::client::Outgoing;
    use crate::telephony::TelephonyOutbound;
    use serde_json::{json, Value};
    use std::time::Duration;

    /// Bridge wired to an acknowledging fake realtime service.
    pub(crate) fn test_bridge() -> (Arc<SessionBridge>, Arc<FakeConnector>) {
        test_bridge_with(FakeConnector::acking(), BridgeConfig::default())
    }

    pub(crate) fn test_bridge_with(
        connector: FakeConnector,
        settings: BridgeConfig,
    ) -> (Arc<SessionBridge>, Arc<FakeConnector>) {
        let connector = Arc::new(connector);
        let context: Arc<dyn ContextStore> = Arc::new(InMemoryContextStore::new("Base prompt."));
        let lifecycle = ConnectionLifecycleManager::new(
            connector.clone(),
            Arc::clone(&context),
            RealtimeConfig::default(),
            &settings,
        );
        (Arc::new(SessionBridge::new(lifecycle, context, settings)), connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_audio_both_ways() {
        let (bridge, connector) = test_bridge();
        let (telephony, mut telephony_rx) = TelephonySender::channel();

        bridge.register("CA123", telephony).unwrap();
        bridge.configure_audio("CA123", "audio/x-mulaw", 8000).unwrap();
        bridge.start("CA123").await.unwrap();

        bridge
            .forward_inbound("CA123", &STANDARD.encode(vec![0xFFu8; 4000]))
            .unwrap();
        let buffer = bridge.session("CA123").unwrap().buffer().unwrap();
        assert_eq!(buffer.pending_samples(), 8000);
        assert!(buffer.has_scheduled_flush());

        let mut remote = connector.take_remote().unwrap();
        remote.push_event(json!({"type": "response.output_audio.delta", "delta": STANDARD.encode(vec![0u8; 480])}));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let TelephonyOutbound::Media(text) = telephony_rx.try_recv().unwrap() else {
            panic!("expected media frame");
        };
        let frame: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["streamSid"], "CA123");
        assert!(telephony_rx.try_recv().is_err());

        // Debounced flush delivers the buffered chunk
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(buffer.pending_samples(), 0);
        let appends = remote
            .sent_types()
            .into_iter()
            .filter(|kind| kind == "input_audio_buffer.append")
            .count();
        assert_eq!(appends, 1);

        let stats = bridge.stats();
        assert_eq!(stats.sessions_started, 1);
        assert_eq!(stats.media_frames_in, 1);
        assert_eq!(stats.media_frames_out, 1);
        assert_eq!(stats.flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_twice_is_noop() {
        let (bridge, connector) = test_bridge();
        let (telephony, mut telephony_rx) = TelephonySender::channel();
        bridge.register("CA1", telephony).unwrap();
        bridge.start("CA1").await.unwrap();
        let mut remote = connector.take_remote().unwrap();
        remote.drain();

        bridge.terminate("CA1").unwrap();
        assert_eq!(bridge.active_sessions(), 0);
        assert_eq!(remote.drain(), vec![Outgoing::Close]);
        assert_eq!(telephony_rx.try_recv().unwrap(), TelephonyOutbound::Close);

        bridge.terminate("CA1").unwrap();
        assert!(remote.drain().is_empty());
        assert!(telephony_rx.try_recv().is_err());
        assert_eq!(bridge.stats().sessions_terminated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_clears_context() {
        let (bridge, connector) = test_bridge();
        let (telephony, _rx) = TelephonySender::channel();
        bridge.register("CA1", telephony).unwrap();
        bridge.start("CA1").await.unwrap();

        let remote = connector.take_remote().unwrap();
        remote.push_event(json!({"type": "response.output_text.delta", "delta": "Noted."}));
        remote.push_event(json!({"type": "response.done"}));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bridge.context.get("CA1", LAST_AI_RESPONSE).as_deref(), Some("Noted."));

        bridge.terminate("CA1").unwrap();
        assert_eq!(bridge.context.get("CA1", LAST_AI_RESPONSE), None);
    }

    #[tokio::test]
    async fn test_failed_start_leaves_nothing_registered() {
        let connector = FakeConnector::default();
        connector.refuse.store(true, std::sync::atomic::Ordering::SeqCst);
        let (bridge, _connector) = test_bridge_with(connector, BridgeConfig::default());
        let (telephony, mut telephony_rx) = TelephonySender::channel();

        bridge.register("CA1", telephony).unwrap();
        let err = bridge.start("CA1").await.unwrap_err();

        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(bridge.active_sessions(), 0);
        assert_eq!(telephony_rx.try_recv().unwrap(), TelephonyOutbound::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_during_start_closes_late_connection() {
        let connector = FakeConnector::acking().with_connect_delay(Duration::from_millis(100));
        let (bridge, connector) = test_bridge_with(connector, BridgeConfig::default());
        let (telephony, mut telephony_rx) = TelephonySender::channel();
        let session = bridge.register("CA1", telephony).unwrap();

        let starting = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.start("CA1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        bridge.terminate("CA1").unwrap();
        assert_eq!(telephony_rx.try_recv().unwrap(), TelephonyOutbound::Close);

        let result = starting.await.unwrap();
        assert!(matches!(result, Err(BridgeError::Connection(_))));
        assert_eq!(bridge.active_sessions(), 0);
        assert!(!session.has_connection());

        // The connection that finished after terminate is closed, not orphaned
        let mut remote = connector.take_remote().unwrap();
        assert_eq!(remote.drain(), vec![Outgoing::Close]);
        assert!(telephony_rx.try_recv().is_err());
        assert_eq!(bridge.stats().sessions_terminated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_spares_reregistered_session() {
        let connector = FakeConnector::acking().with_connect_delay(Duration::from_millis(100));
        let (bridge, connector) = test_bridge_with(connector, BridgeConfig::default());
        let (first, mut first_rx) = TelephonySender::channel();
        let (second, mut second_rx) = TelephonySender::channel();
        bridge.register("CA1", first).unwrap();

        let starting = tokio::spawn({
            let bridge = Arc::clone(&bridge);
            async move { bridge.start("CA1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let replacement = bridge.register("CA1", second).unwrap();

        assert!(starting.await.unwrap().is_err());
        assert_eq!(bridge.active_sessions(), 1);
        assert!(Arc::ptr_eq(&bridge.session("CA1").unwrap(), &replacement));
        assert!(first_rx.try_recv().is_err());
        assert!(second_rx.try_recv().is_err());
        assert_eq!(connector.take_remote().unwrap().drain(), vec![Outgoing::Close]);
        assert_eq!(bridge.stats().sessions_terminated, 0);
    }

    #[tokio::test]
    async fn test_configure_audio_rejects_unknown_encoding() {
        let (bridge, _connector) = test_bridge();
        let (telephony, _rx) = TelephonySender::channel();
        let session = bridge.register("CA1", telephony).unwrap();

        bridge.configure_audio("CA1", "audio/x-alaw", 8000).unwrap();
        let err = bridge.configure_audio("CA1", "audio/opus", 48000).unwrap_err();
        assert_eq!(err, BridgeError::UnsupportedEncoding("audio/opus".to_string()));
        assert_eq!(
            session.audio_format(),
            AudioFormat::new(AudioEncoding::Alaw, 8000).unwrap()
        );

        assert!(matches!(
            bridge.configure_audio("CA404", "audio/x-mulaw", 8000),
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let settings = BridgeConfig {
            max_concurrent_sessions: 1,
            ..BridgeConfig::default()
        };
        let (bridge, _connector) = test_bridge_with(FakeConnector::acking(), settings);

        let (first, _rx1) = TelephonySender::channel();
        let (second, _rx2) = TelephonySender::channel();
        let (again, _rx3) = TelephonySender::channel();
        bridge.register("CA1", first).unwrap();
        assert!(matches!(
            bridge.register("CA2", second),
            Err(BridgeError::CapacityExceeded(1))
        ));
        // Re-registering an existing id is not a new session
        assert!(bridge.register("CA1", again).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_closes_previous_connection() {
        let (bridge, connector) = test_bridge();
        let (telephony, _rx) = TelephonySender::channel();
        bridge.register("CA1", telephony.clone()).unwrap();
        bridge.start("CA1").await.unwrap();
        let mut first = connector.take_remote().unwrap();
        first.drain();

        bridge.register("CA1", telephony).unwrap();
        assert_eq!(first.drain(), vec![Outgoing::Close]);
        assert_eq!(bridge.active_sessions(), 1);
        assert!(!bridge.session("CA1").unwrap().has_connection());
    }

    #[tokio::test]
    async fn test_forward_to_unknown_stream() {
        let (bridge, _connector) = test_bridge();
        assert!(matches!(
            bridge.forward_inbound("nope", "AAAA"),
            Err(BridgeError::SessionNotFound(_))
        ));
        assert!(matches!(
            bridge.forward_outbound("nope", "AAAA"),
            Err(BridgeError::SessionNotFound(_))
        ));
    }
}
