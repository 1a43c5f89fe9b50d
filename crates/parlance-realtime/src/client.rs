//! The public voice client: one connection, one session, one conversation.
//!
//! [`VoiceClient`] wires the connection manager, capture and playback
//! pipelines, session state machine and event dispatcher together. A single
//! routing task funnels every component notice through the state machine, so
//! session state only ever changes in one place.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use parlance_realtime_types::protocol::{ClientEnvelope, SessionContext, SetupParams, TurnEnd};
use parlance_realtime_types::{ConversationMessage, Role};

use crate::audio;
use crate::capture::{AudioSource, CaptureNotice, CapturePipeline};
use crate::config::ClientConfig;
use crate::connection::{
    ConnectionManager, ConnectionNotice, ConnectionSettings, ConnectionStatus,
};
use crate::dispatcher::{ClientEvent, EventDispatcher, EventKind, SubscriptionId};
use crate::error::ClientError;
use crate::lock_poisoned;
use crate::playback::{AudioSink, PlaybackNotice, PlaybackPipeline};
use crate::state::{SessionState, SessionStateMachine, StateSnapshot};
use crate::stats::{SessionStats, StatsTracker};
use crate::transport::{VoiceTransport, WebSocketTransport};

use parlance_realtime_types::protocol::ServerEnvelope;

const NOTICE_QUEUE: usize = 64;

/// Duplex streaming client for the Parlance voice service.
///
/// Construction wires the pipelines and spawns the routing task, so a
/// client must be built inside a Tokio runtime. Nothing touches the network
/// until [`connect`](VoiceClient::connect).
pub struct VoiceClient {
    config: ClientConfig,
    dispatcher: Arc<EventDispatcher>,
    machine: Arc<SessionStateMachine>,
    connection: ConnectionManager,
    capture: Arc<CapturePipeline>,
    playback: Arc<PlaybackPipeline>,
    stats: Arc<StatsTracker>,
    source: Arc<dyn AudioSource>,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl VoiceClient {
    /// A client talking to the real service over websocket.
    pub fn new(config: ClientConfig, source: Arc<dyn AudioSource>, sink: Arc<dyn AudioSink>) -> Self {
        Self::with_transport(config, Arc::new(WebSocketTransport::new()), source, sink)
    }

    /// A client over a caller-supplied transport.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn VoiceTransport>,
        source: Arc<dyn AudioSource>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let machine = Arc::new(SessionStateMachine::new(dispatcher.clone()));
        let stats = Arc::new(StatsTracker::new());

        let (connection_tx, connection_rx) = mpsc::channel(NOTICE_QUEUE);
        let (capture_tx, capture_rx) = mpsc::channel(NOTICE_QUEUE);
        let (playback_tx, playback_rx) = mpsc::channel(NOTICE_QUEUE);

        let connection =
            ConnectionManager::new(transport, ConnectionSettings::from(&config), connection_tx);
        let capture = Arc::new(CapturePipeline::new(
            config.window_samples(),
            config.sample_rate_hz,
            stats.clone(),
            capture_tx,
        ));
        let playback = Arc::new(PlaybackPipeline::spawn(
            sink,
            config.sample_rate_hz,
            playback_tx,
        ));

        let router = tokio::spawn(route_notices(
            RouterContext {
                dispatcher: dispatcher.clone(),
                machine: machine.clone(),
                connection: connection.clone(),
                capture: capture.clone(),
                playback: playback.clone(),
                stats: stats.clone(),
            },
            connection_rx,
            capture_rx,
            playback_rx,
        ));

        Self {
            config,
            dispatcher,
            machine,
            connection,
            capture,
            playback,
            stats,
            source,
            router: Mutex::new(Some(router)),
        }
    }

    /// Validates configuration, opens the connection, and primes the remote
    /// session with `context`.
    ///
    /// Configuration problems fail here, before any network activity, and
    /// are also emitted as a fatal `error` event.
    pub async fn connect(&self, context: SessionContext) -> Result<(), ClientError> {
        if let Err(error) = self.config.validate() {
            self.dispatcher.emit(ClientEvent::Error {
                error: error.clone(),
                fatal: true,
            });
            return Err(error);
        }
        self.machine.begin_connect()?;

        let setup = SetupParams {
            model: self.config.model.clone(),
            voice: self.config.voice.clone(),
            language: self.config.language.clone(),
            sample_rate_hz: self.config.sample_rate_hz,
            context,
        };
        match self.connection.connect(setup).await {
            Ok(()) => {
                self.stats.session_started();
                self.machine.connect_succeeded();
                self.dispatcher.emit(ClientEvent::Connected);
                info!("voice session connected");
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "connect failed");
                self.machine.connect_failed(&error);
                self.dispatcher.emit(ClientEvent::Error {
                    error: error.clone(),
                    fatal: true,
                });
                Err(error)
            }
        }
    }

    /// Tears the session down: closes the connection, releases the audio
    /// devices, clears history. Idempotent; `disconnected` fires at most
    /// once per live session.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
        self.capture.abort().await;
        self.playback.flush().await;

        if self.machine.state() != SessionState::Disconnected {
            let stats = self.stats.snapshot(self.machine.history_len());
            self.dispatcher.emit(ClientEvent::SessionStatsUpdate(stats));
        }
        if self.machine.disconnected() {
            self.dispatcher.emit(ClientEvent::Disconnected);
            info!("voice session disconnected");
        }
        self.stats.session_ended();
    }

    /// Opens the microphone and starts streaming capture windows.
    ///
    /// Legal while idle, or while the assistant is speaking: that is a
    /// barge-in, which flushes all queued playback first.
    pub async fn start_recording(&self) -> Result<(), ClientError> {
        let state = self.machine.state();
        if !matches!(state, SessionState::Connected | SessionState::Speaking) {
            return Err(ClientError::InvalidState {
                op: "start_recording",
                state,
            });
        }

        let frames = match self.source.open(self.config.sample_rate_hz).await {
            Ok(frames) => frames,
            Err(error) => {
                warn!(error = %error, "audio source failed to open");
                self.dispatcher.emit(ClientEvent::Error {
                    error: error.clone(),
                    fatal: false,
                });
                return Err(error);
            }
        };

        let interrupted = self.machine.start_listening()?;
        if interrupted {
            let cleared = self.playback.flush().await;
            debug!(cleared, "barge-in flushed playback");
        }
        self.capture.start(frames, self.connection.clone());
        Ok(())
    }

    /// Ends the user's turn: flushes the partial capture window, closes the
    /// microphone, and tells the service the turn is over.
    pub async fn stop_recording(&self) -> Result<(), ClientError> {
        let state = self.machine.state();
        if state != SessionState::Listening {
            return Err(ClientError::InvalidState {
                op: "stop_recording",
                state,
            });
        }

        self.capture.stop().await;
        // Send before committing: if the outbound queue refuses the frame the
        // session stays in `listening` and the call can simply be retried.
        let message_id = Uuid::new_v4();
        self.connection
            .send(&ClientEnvelope::TurnEnd(TurnEnd { message_id }))?;
        self.machine.user_turn_ended(message_id)?;
        Ok(())
    }

    /// Current flattened session snapshot.
    pub fn state(&self) -> StateSnapshot {
        self.machine.snapshot()
    }

    /// Current position in the session lifecycle.
    pub fn session_state(&self) -> SessionState {
        self.machine.state()
    }

    /// Current connection health.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Copy of the conversation so far.
    pub fn history(&self) -> Vec<ConversationMessage> {
        self.machine.history()
    }

    /// Current session counters.
    pub fn session_stats(&self) -> SessionStats {
        self.stats.snapshot(self.machine.history_len())
    }

    /// Subscribes a callback to one event channel.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.dispatcher.on(kind, handler)
    }

    /// Removes a subscription made with [`on`](VoiceClient::on).
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.dispatcher.off(id)
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        if let Some(router) = lock_poisoned(&self.router).take() {
            router.abort();
        }
        self.connection.shutdown();
        self.capture.shutdown();
        self.playback.shutdown();
    }
}

struct RouterContext {
    dispatcher: Arc<EventDispatcher>,
    machine: Arc<SessionStateMachine>,
    connection: ConnectionManager,
    capture: Arc<CapturePipeline>,
    playback: Arc<PlaybackPipeline>,
    stats: Arc<StatsTracker>,
}

/// Funnels component notices into state changes and subscriber events.
async fn route_notices(
    ctx: RouterContext,
    mut connection_rx: mpsc::Receiver<ConnectionNotice>,
    mut capture_rx: mpsc::Receiver<CaptureNotice>,
    mut playback_rx: mpsc::Receiver<PlaybackNotice>,
) {
    loop {
        tokio::select! {
            Some(notice) = connection_rx.recv() => handle_connection_notice(&ctx, notice).await,
            Some(notice) = capture_rx.recv() => handle_capture_notice(&ctx, notice).await,
            Some(notice) = playback_rx.recv() => handle_playback_notice(&ctx, notice),
            else => break,
        }
    }
    debug!("notice router stopped");
}

async fn handle_connection_notice(ctx: &RouterContext, notice: ConnectionNotice) {
    match notice {
        ConnectionNotice::Inbound(envelope) => route_envelope(ctx, envelope).await,
        ConnectionNotice::Malformed(detail) => {
            ctx.dispatcher.emit(ClientEvent::Error {
                error: ClientError::Protocol(detail),
                fatal: false,
            });
        }
        ConnectionNotice::StatusChanged(status) => {
            ctx.dispatcher
                .emit(ClientEvent::ConnectionStateChange(status));
        }
        ConnectionNotice::ChannelLost { reason } => {
            let was_recording = ctx.machine.connection_lost();
            if was_recording {
                ctx.capture.abort().await;
            }
            ctx.playback.flush().await;
            // Whatever is in history now (including a partially spoken
            // assistant turn) is what reconnection will replay.
            ctx.connection.update_context(ctx.machine.history());
            ctx.dispatcher.emit(ClientEvent::Error {
                error: ClientError::Connection(reason),
                fatal: false,
            });
        }
        ConnectionNotice::AttemptFailed { attempt, error } => {
            debug!(attempt, "reconnect attempt failed");
            ctx.dispatcher.emit(ClientEvent::Error {
                error,
                fatal: false,
            });
        }
        ConnectionNotice::Reconnected => {
            ctx.machine.reconnected();
            ctx.dispatcher.emit(ClientEvent::Connected);
        }
        ConnectionNotice::GaveUp { error } => {
            ctx.capture.abort().await;
            ctx.playback.flush().await;
            ctx.machine.retries_exhausted(&error);
            ctx.dispatcher.emit(ClientEvent::Error { error, fatal: true });
        }
    }
}

async fn route_envelope(ctx: &RouterContext, envelope: ServerEnvelope) {
    match envelope {
        ServerEnvelope::Ready(_) => warn!("unexpected ready frame on a live session"),
        ServerEnvelope::Audio(payload) => match audio::decode_pcm16(&payload.data) {
            Ok(samples) if samples.is_empty() => {}
            Ok(samples) => {
                // A chunk straggling in after a barge-in must not play over
                // the user's new turn.
                if ctx.machine.response_started() {
                    ctx.stats.record_chunk_received();
                    ctx.playback.enqueue(samples, payload.seq);
                } else {
                    debug!(seq = payload.seq, "dropping audio outside of an assistant turn");
                }
            }
            Err(error) => {
                warn!(seq = payload.seq, error = %error, "dropping undecodable audio chunk");
                ctx.dispatcher.emit(ClientEvent::Error {
                    error,
                    fatal: false,
                });
            }
        },
        ServerEnvelope::Text(text) => match text.role {
            Role::User => match text.message_id {
                Some(id) => {
                    if !ctx.machine.resolve_user_transcript(id, &text.text) {
                        warn!(%id, "transcript for an unknown message");
                    }
                }
                None => warn!("user transcript without a message id"),
            },
            Role::Assistant => ctx.machine.append_assistant_text(&text.text),
        },
        ServerEnvelope::TurnComplete => ctx.machine.service_turn_complete(),
        ServerEnvelope::ResponseComplete => {
            // Chunk numbering starts over with the next response.
            ctx.playback.end_of_response();
            if ctx.machine.response_completed() {
                ctx.stats.record_turn();
            }
            ctx.connection.update_context(ctx.machine.history());
            let stats = ctx.stats.snapshot(ctx.machine.history_len());
            ctx.dispatcher.emit(ClientEvent::SessionStatsUpdate(stats));
        }
        ServerEnvelope::Error(err) => {
            warn!(code = ?err.code, message = %err.message, "service reported an error");
            let detail = match err.code {
                Some(code) => format!("service error {code}: {}", err.message),
                None => format!("service error: {}", err.message),
            };
            ctx.dispatcher.emit(ClientEvent::Error {
                error: ClientError::Connection(detail),
                fatal: false,
            });
        }
    }
}

async fn handle_capture_notice(ctx: &RouterContext, notice: CaptureNotice) {
    match notice {
        CaptureNotice::DeviceFailed(detail) => {
            // The task is already gone; this just clears the worker slot.
            ctx.capture.abort().await;
            ctx.machine.recording_failed();
            ctx.dispatcher.emit(ClientEvent::Error {
                error: ClientError::Device(detail),
                fatal: false,
            });
        }
    }
}

fn handle_playback_notice(ctx: &RouterContext, notice: PlaybackNotice) {
    match notice {
        PlaybackNotice::Started => ctx.machine.set_playing(true),
        PlaybackNotice::Idle => ctx.machine.set_playing(false),
        PlaybackNotice::DeviceFailed(detail) => {
            ctx.dispatcher.emit(ClientEvent::Error {
                error: ClientError::Device(detail),
                fatal: false,
            });
        }
    }
}
