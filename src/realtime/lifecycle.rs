//! # Realtime Connection Lifecycle
//!
//! Opens, configures, and closes the realtime AI connection of a session, and
//! runs the background receive loop that feeds the session's state machine.
//!
//! ## Opening a connection:
//! 1. Connect through the configured [`RealtimeConnector`]
//! 2. Send `session.update` (instructions, voice, PCM16 both ways, transcription, server VAD)
//! 3. Spawn the receive loop and attach the connection to the session
//! 4. Wait (bounded) for `session.updated`
//! 5. Send the system message and, if enabled, a `response.create`
//!
//! ## Closing:
//! Abort the receive loop, flush or discard buffered audio, close the socket.
//! Every step runs even if an earlier one fails.

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::client::{RealtimeConnector, RealtimeLink};
use super::protocol::{ClientMessage, ConversationItem, ResponseOptions, ServerEvent, SessionConfig};
use super::state_machine::{Effect, SessionPhase};
use crate::audio::{AudioBufferAggregator, FlushPolicy};
use crate::bridge::session::{ActiveConnection, Session};
use crate::config::{BridgeConfig, RealtimeConfig};
use crate::context::{ContextStore, LAST_AI_RESPONSE};
use crate::error::{BridgeError, BridgeResult};

/// Delivers AI audio deltas to the caller of a stream.
///
/// Implemented by [`SessionBridge`](crate::bridge::SessionBridge); the receive
/// loop holds it weakly so a running loop never keeps the bridge alive.
pub trait OutboundAudio: Send + Sync {
    fn forward_outbound(&self, stream_id: &str, delta_b64: &str) -> BridgeResult<()>;
}

/// Opens and closes realtime connections for sessions.
pub struct ConnectionLifecycleManager {
    connector: Arc<dyn RealtimeConnector>,
    context: Arc<dyn ContextStore>,
    settings: RealtimeConfig,
    flush_policy: FlushPolicy,
    ack_timeout: Duration,
}

impl ConnectionLifecycleManager {
    pub fn new(
        connector: Arc<dyn RealtimeConnector>,
        context: Arc<dyn ContextStore>,
        settings: RealtimeConfig,
        bridge: &BridgeConfig,
    ) -> Self {
        Self {
            connector,
            context,
            settings,
            flush_policy: FlushPolicy {
                threshold_samples: bridge.flush_threshold_samples,
                debounce: bridge.flush_debounce(),
            },
            ack_timeout: bridge.ack_timeout(),
        }
    }

    /// Connect and configure the realtime side of `session`.
    ///
    /// ## Errors:
    /// `Connection` if connecting or the configuration update fails, or if the
    /// session is closed while opening; nothing stays attached to the session in
    /// those cases. A missing acknowledgement is only logged.
    pub async fn open(&self, session: &Arc<Session>, outbound: Weak<dyn OutboundAudio>) -> BridgeResult<()> {
        let stream_id = session.stream_id();
        let RealtimeLink { sender, inbound } = self.connector.connect(stream_id).await?;

        if session.phase() == SessionPhase::Closed {
            debug!(stream_id, "Session closed while connecting, dropping connection");
            let _ = sender.close();
            return Err(closed_while_opening());
        }

        let instructions = self.context.instructions_for(stream_id);
        let update = ClientMessage::SessionUpdate {
            session: SessionConfig::from_settings(&self.settings, instructions),
        };
        if let Err(err) = sender.send(&update) {
            let _ = sender.close();
            return Err(err);
        }
        debug!(stream_id, "Session configuration sent");

        let buffer = AudioBufferAggregator::with_flush_counter(
            stream_id,
            Arc::new(sender.clone()),
            self.flush_policy.clone(),
            Arc::clone(&session.stats().flushes),
        );
        let mut phase = session.subscribe_phase();
        let receive_task = tokio::spawn(receive_loop(
            Arc::clone(session),
            inbound,
            Arc::clone(&self.context),
            outbound,
        ));

        if let Some(stale) = session.attach(ActiveConnection {
            sender: sender.clone(),
            buffer,
            receive_task,
        }) {
            warn!(stream_id, "Replacing an existing realtime connection");
            if let Err(err) = shut_down(stream_id, stale) {
                warn!(stream_id, error = %err, "Stale realtime connection did not close cleanly");
            }
        }

        // close() marks the phase before detaching: either it took this
        // connection, or the phase already reads Closed here
        if session.phase() == SessionPhase::Closed {
            discard(session);
            return Err(closed_while_opening());
        }

        let acknowledged = tokio::time::timeout(
            self.ack_timeout,
            phase.wait_for(|phase| *phase != SessionPhase::Configuring),
        )
        .await
        .map(|changed| changed.is_ok());

        match acknowledged {
            Ok(true) if session.phase() == SessionPhase::Closed => {
                discard(session);
                return Err(closed_while_opening());
            }
            Ok(true) => info!(stream_id, "Realtime session ready"),
            Ok(false) => {
                discard(session);
                return Err(BridgeError::Connection(
                    "session dropped during configuration".to_string(),
                ));
            }
            Err(_) => {
                let err = BridgeError::AckTimeout(self.ack_timeout);
                warn!(stream_id, error = %err, "Continuing without acknowledgement");
            }
        }

        if !self.settings.system_message.is_empty() {
            sender.send(&ClientMessage::ConversationItemCreate {
                item: ConversationItem::system_text(self.settings.system_message.as_str()),
            })?;
        }

        if self.settings.request_initial_response {
            sender.send(&ClientMessage::ResponseCreate {
                response: ResponseOptions {
                    instructions: self.settings.reinforcement_instructions.clone(),
                },
            })?;
        }

        Ok(())
    }

    /// Tear down the realtime side of `session`.
    ///
    /// ## Errors:
    /// `Teardown` listing every step that failed; all steps are attempted.
    pub fn close(&self, session: &Session) -> BridgeResult<()> {
        // Closed before detach, so an open() racing with us cannot attach unseen
        session.mark_closed();
        match session.detach() {
            Some(connection) => shut_down(session.stream_id(), connection),
            None => Ok(()),
        }
    }
}

fn closed_while_opening() -> BridgeError {
    BridgeError::Connection("session closed during configuration".to_string())
}

/// Shut down whatever connection `open` left attached before failing.
fn discard(session: &Session) {
    if let Some(connection) = session.detach() {
        if let Err(err) = shut_down(session.stream_id(), connection) {
            warn!(stream_id = %session.stream_id(), error = %err, "Abandoned realtime connection did not close cleanly");
        }
    }
}

fn shut_down(stream_id: &str, connection: ActiveConnection) -> BridgeResult<()> {
    let ActiveConnection {
        sender,
        buffer,
        receive_task,
    } = connection;
    let mut failures = Vec::new();

    receive_task.abort();

    debug!(stream_id, pending_samples = buffer.pending_samples(), "Closing realtime connection");
    match buffer.cancel_and_flush_if_ready() {
        Ok(chunks) if chunks > 0 => debug!(stream_id, chunks, "Final audio flush"),
        Ok(_) => {}
        Err(err) => failures.push(format!("final flush: {}", err)),
    }

    if let Err(err) = sender.close() {
        failures.push(format!("close connection: {}", err));
    }

    if failures.is_empty() {
        info!(stream_id, "Realtime connection closed");
        Ok(())
    } else {
        Err(BridgeError::Teardown(failures.join("; ")))
    }
}

/// Consume realtime events for one session until the connection ends.
///
/// When the service drops the connection, the caller's socket is closed,
/// which in turn drives the normal teardown path.
pub async fn receive_loop(
    session: Arc<Session>,
    mut inbound: BoxStream<'static, BridgeResult<String>>,
    context: Arc<dyn ContextStore>,
    outbound: Weak<dyn OutboundAudio>,
) {
    let stream_id = session.stream_id().to_string();

    while let Some(frame) = inbound.next().await {
        let text = match frame {
            Ok(text) => text,
            Err(err) => {
                warn!(stream_id = %stream_id, error = %err, "Realtime connection failed");
                break;
            }
        };

        let event = match ServerEvent::parse(&text) {
            Ok(ServerEvent::Unknown) => {
                debug!(stream_id = %stream_id, event_type = %ServerEvent::raw_type(&text), "Ignoring realtime event");
                continue;
            }
            Ok(event) => event,
            Err(err) => {
                warn!(stream_id = %stream_id, error = %err, "Skipping undecodable realtime event");
                continue;
            }
        };

        for effect in session.apply_event(&event) {
            match effect {
                Effect::ConfigAcknowledged => session.mark_ready(),
                Effect::ForwardAudio(delta) => {
                    let Some(outbound) = outbound.upgrade() else {
                        debug!(stream_id = %stream_id, "Bridge shut down, dropping AI audio delta");
                        continue;
                    };
                    if let Err(err) = outbound.forward_outbound(&stream_id, &delta) {
                        warn!(stream_id = %stream_id, error = %err, "Dropping AI audio delta");
                    }
                }
                Effect::PersistTranscript(text) => {
                    debug!(stream_id = %stream_id, chars = text.len(), "Storing AI response");
                    context.record(&stream_id, LAST_AI_RESPONSE, &text);
                }
                Effect::ReportError(message) => {
                    session.stats().record_error();
                    error!(stream_id = %stream_id, error = %message, "Realtime service reported an error");
                }
            }
        }
    }

    info!(stream_id = %stream_id, "Realtime event stream ended");
    if let Err(err) = session.close_telephony() {
        debug!(stream_id = %stream_id, error = %err, "Telephony socket already closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::session::AudioRates;
    use crate::bridge::BridgeStats;
    use crate::context::InMemoryContextStore;
    use crate::realtime::client::testing::FakeConnector;
    use crate::realtime::client::Outgoing;
    use crate::telephony::{TelephonyOutbound, TelephonySender};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    struct Harness {
        manager: ConnectionLifecycleManager,
        connector: Arc<FakeConnector>,
        context: Arc<InMemoryContextStore>,
        session: Arc<Session>,
        telephony_rx: mpsc::UnboundedReceiver<TelephonyOutbound>,
    }

    impl Harness {
        /// Audio deltas go straight to the session, standing in for the bridge.
        fn outlet(&self) -> Weak<dyn OutboundAudio> {
            let session: Weak<Session> = Arc::downgrade(&self.session);
            session
        }
    }

    impl OutboundAudio for Session {
        fn forward_outbound(&self, _stream_id: &str, delta_b64: &str) -> BridgeResult<()> {
            Session::forward_outbound(self, delta_b64)
        }
    }

    fn harness(connector: FakeConnector, settings: RealtimeConfig) -> Harness {
        let connector = Arc::new(connector);
        let context = Arc::new(InMemoryContextStore::new("Base prompt."));
        let config = BridgeConfig::default();
        let manager = ConnectionLifecycleManager::new(connector.clone(), context.clone(), settings, &config);
        let (telephony, telephony_rx) = TelephonySender::channel();
        let session = Arc::new(Session::new(
            "CA1",
            telephony,
            AudioRates::from(&config),
            Arc::new(BridgeStats::default()),
        ));
        Harness {
            manager,
            connector,
            context,
            session,
            telephony_rx,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_sends_configuration_then_system_message() {
        let h = harness(FakeConnector::acking(), RealtimeConfig::default());
        h.manager.open(&h.session, h.outlet()).await.unwrap();

        assert_eq!(h.session.phase(), SessionPhase::Ready);
        assert!(h.session.has_connection());

        let mut remote = h.connector.take_remote().unwrap();
        assert_eq!(
            remote.sent_types(),
            vec!["session.update".to_string(), "conversation.item.create".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_uses_context_instructions_and_optional_response() {
        let settings = RealtimeConfig {
            request_initial_response: true,
            ..RealtimeConfig::default()
        };
        let h = harness(FakeConnector::acking(), settings);
        h.context.record("CA1", crate::context::CONTEXT_KEY, "VIP caller.");
        h.manager.open(&h.session, h.outlet()).await.unwrap();

        let mut remote = h.connector.take_remote().unwrap();
        let sent = remote.drain();
        let Outgoing::Text(update) = &sent[0] else {
            panic!("expected session.update");
        };
        let update: serde_json::Value = serde_json::from_str(update).unwrap();
        assert_eq!(update["session"]["instructions"], "Base prompt.\nVIP caller.");

        let Outgoing::Text(last) = sent.last().unwrap() else {
            panic!("expected response.create");
        };
        assert!(last.contains("response.create"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_times_out_but_proceeds() {
        let h = harness(FakeConnector::default(), RealtimeConfig::default());
        let started = tokio::time::Instant::now();
        h.manager.open(&h.session, h.outlet()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(h.session.phase(), SessionPhase::Configuring);
        let mut remote = h.connector.take_remote().unwrap();
        assert_eq!(remote.sent_types().len(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_attaches_nothing() {
        let connector = FakeConnector::default();
        connector.refuse.store(true, Ordering::SeqCst);
        let h = harness(connector, RealtimeConfig::default());

        let err = h.manager.open(&h.session, h.outlet()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(!h.session.has_connection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_drives_effects() {
        let mut h = harness(FakeConnector::acking(), RealtimeConfig::default());
        h.manager.open(&h.session, h.outlet()).await.unwrap();
        let mut remote = h.connector.take_remote().unwrap();

        remote.push_event(json!({"type": "response.created", "response": {"id": "r1"}}));
        remote.push_event(json!({"type": "response.output_text.delta", "delta": "Hi there"}));
        remote.push_raw("garbage");
        remote.push_event(json!({"type": "response.audio.delta", "delta": "AAAAAAAA"}));
        remote.push_event(json!({"type": "response.done", "response": {"id": "r1"}}));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(matches!(h.telephony_rx.try_recv(), Ok(TelephonyOutbound::Media(_))));
        assert_eq!(
            h.context.get("CA1", LAST_AI_RESPONSE).as_deref(),
            Some("Hi there")
        );
        assert!(!h.session.awaiting_response());

        // Service hangs up: the caller's socket is asked to close
        remote.drop_connection();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.telephony_rx.try_recv().unwrap(), TelephonyOutbound::Close);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_and_closes_once() {
        let h = harness(FakeConnector::acking(), RealtimeConfig::default());
        h.manager.open(&h.session, h.outlet()).await.unwrap();
        let mut remote = h.connector.take_remote().unwrap();
        remote.drain();

        h.session.forward_inbound(&[0xFFu8; 2000]).unwrap();
        h.manager.close(&h.session).unwrap();

        let sent = remote.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], Outgoing::Close);
        assert_eq!(h.session.phase(), SessionPhase::Closed);

        // Second close has nothing left to do
        h.manager.close(&h.session).unwrap();
        assert!(remote.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reports_flush_failure() {
        let h = harness(FakeConnector::acking(), RealtimeConfig::default());
        h.manager.open(&h.session, h.outlet()).await.unwrap();
        h.session.forward_inbound(&[0xFFu8; 2000]).unwrap();

        // Service side gone: the final flush cannot be delivered
        drop(h.connector.take_remote());

        let err = h.manager.close(&h.session).unwrap_err();
        assert!(matches!(err, BridgeError::Teardown(ref msg) if msg.contains("final flush")));
        assert_eq!(h.session.phase(), SessionPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_handshake_releases_connection() {
        let mut h = harness(FakeConnector::default(), RealtimeConfig::default());

        let (opened, closed) = tokio::join!(h.manager.open(&h.session, h.outlet()), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            h.manager.close(&h.session)
        });

        assert!(matches!(opened, Err(BridgeError::Connection(_))));
        assert!(closed.is_ok());
        assert!(!h.session.has_connection());
        assert_eq!(h.session.phase(), SessionPhase::Closed);

        let mut remote = h.connector.take_remote().unwrap();
        let sent = remote.drain();
        assert_eq!(sent.iter().filter(|item| **item == Outgoing::Close).count(), 1);
        assert_eq!(sent.last(), Some(&Outgoing::Close));
        // Closing the caller's socket is the bridge's job
        assert!(h.telephony_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_open_after_close_never_attaches() {
        let h = harness(FakeConnector::acking(), RealtimeConfig::default());
        h.manager.close(&h.session).unwrap();

        let err = h.manager.open(&h.session, h.outlet()).await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(!h.session.has_connection());

        let mut remote = h.connector.take_remote().unwrap();
        assert_eq!(remote.drain(), vec![Outgoing::Close]);
    }
}
