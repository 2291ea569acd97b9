//! # Telephony WebSocket Handler
//!
//! Accepts the telephony provider's media-stream connection at `/twilio/stream`.
//!
//! ## Structure:
//! - **TelephonyWebSocket actor**: Owns the socket. It is the socket's only writer
//! - **Stream worker task**: Receives the actor's text frames over a channel and
//!   drives the [`SessionBridge`](crate::bridge::SessionBridge) in arrival order
//! - **Outbound channel**: The bridge sends media frames and the final close back
//!   to the actor through a [`TelephonySender`]
//!
//! When the socket closes, the actor drops its frame channel; the worker sees the
//! channel end and terminates the session. When the worker finishes, every
//! `TelephonySender` is gone, the outbound stream ends, and the actor stops.
//!
//! ## Heartbeat:
//! The actor pings every `heartbeat_interval_secs` and stops the connection if
//! nothing has been received for `heartbeat_timeout_secs`.

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::TelephonyConfig;
use crate::state::AppState;
use crate::telephony::{run_stream_worker, TelephonyOutbound, TelephonySender};

/// WebSocket actor for one telephony media stream.
pub struct TelephonyWebSocket {
    connection_id: Uuid,

    /// Text frames for the stream worker; dropped when the socket stops
    frames: Option<mpsc::UnboundedSender<String>>,

    /// Outbound frames from the bridge, attached to the context on start
    outbound: Option<mpsc::UnboundedReceiver<TelephonyOutbound>>,

    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
    last_heartbeat: Instant,
}

impl TelephonyWebSocket {
    pub fn new(
        connection_id: Uuid,
        frames: mpsc::UnboundedSender<String>,
        outbound: mpsc::UnboundedReceiver<TelephonyOutbound>,
        config: &TelephonyConfig,
    ) -> Self {
        Self {
            connection_id,
            frames: Some(frames),
            outbound: Some(outbound),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_secs),
            last_heartbeat: Instant::now(),
        }
    }

    /// True when the peer has been silent for longer than the timeout.
    fn heartbeat_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_heartbeat) > self.heartbeat_timeout
    }

    fn forward_frame(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let delivered = self
            .frames
            .as_ref()
            .map_or(false, |frames| frames.send(text).is_ok());
        if !delivered {
            warn!(connection_id = %self.connection_id, "Stream worker gone, closing socket");
            ctx.stop();
        }
    }
}

impl Actor for TelephonyWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Telephony WebSocket connection started");

        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if act.heartbeat_expired(Instant::now()) {
                warn!(connection_id = %act.connection_id, "Telephony heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Telephony WebSocket connection stopped");
        // Ends the worker's frame loop, which terminates the session
        self.frames.take();
    }
}

/// Frames from the telephony provider.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TelephonyWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.forward_frame(text.to_string(), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                debug!(connection_id = %self.connection_id, bytes = data.len(), "Ignoring binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, reason = ?reason, "Telephony WebSocket closed by peer");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "Telephony WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Frames from the bridge to the caller.
///
/// The default `finished` stops the actor once every sender is gone.
impl StreamHandler<TelephonyOutbound> for TelephonyWebSocket {
    fn handle(&mut self, msg: TelephonyOutbound, ctx: &mut Self::Context) {
        match msg {
            TelephonyOutbound::Media(json) => ctx.text(json),
            TelephonyOutbound::Close => {
                debug!(connection_id = %self.connection_id, "Closing telephony socket");
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler for `GET /twilio/stream`.
///
/// ## HTTP to WebSocket Upgrade:
/// Spawns the stream worker, then upgrades the request; the actor and the
/// worker are connected by two channels.
pub async fn twilio_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let connection_id = Uuid::new_v4();
    info!(
        connection_id = %connection_id,
        peer = ?req.connection_info().peer_addr(),
        "New telephony stream connection"
    );

    let (outbound, outbound_rx) = TelephonySender::channel();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    tokio::spawn(
        run_stream_worker(app_state.bridge.clone(), outbound, frames_rx)
            .instrument(info_span!("telephony_stream", %connection_id)),
    );

    let config = app_state.get_config();
    let websocket = TelephonyWebSocket::new(connection_id, frames_tx, outbound_rx, &config.telephony);
    ws::start(websocket, &req, stream)
}
