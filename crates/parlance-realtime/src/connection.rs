//! Connection lifecycle: handshake, keep-alive, send gating and reconnects.
//!
//! The manager owns exactly one duplex channel at a time. Lifecycle
//! operations (connect, disconnect, each reconnect attempt) serialize on an
//! async mutex so two handshakes can never run concurrently, and every
//! installed channel carries an epoch so a stale reader can never act on a
//! connection it no longer owns.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use parlance_realtime_types::protocol::{
    ClientEnvelope, ServerEnvelope, SetupParams, parse_server_envelope,
};
use parlance_realtime_types::ConversationMessage;

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::ClientError;
use crate::lock_poisoned;
use crate::transport::{ConnectRequest, DuplexChannel, VoiceTransport, WireFrame};

/// Keep-alive round trips kept for the quality average.
const RTT_WINDOW: usize = 5;
/// Average RTT at or under this is an excellent connection.
const EXCELLENT_RTT: Duration = Duration::from_millis(150);
/// Average RTT at or under this is still good; above is poor.
const GOOD_RTT: Duration = Duration::from_millis(400);
/// Consecutive missed keep-alives at which the link counts as unstable.
const UNSTABLE_AFTER: u32 = 3;

/// Wire-level connection state, independent of the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{name}")
    }
}

/// Subjective health of the link, derived from keep-alive round trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Average round trip at or under 150ms.
    Excellent,
    /// Average round trip at or under 400ms, or no samples yet.
    Good,
    /// Slow round trips or one or two missed keep-alives.
    Poor,
    /// Three or more consecutive missed keep-alives.
    Unstable,
}

impl fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionQuality::Excellent => "excellent",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Unstable => "unstable",
        };
        write!(f, "{name}")
    }
}

/// Public connection health, as returned by `connection_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    /// A channel is currently open and past its handshake.
    pub connected: bool,
    /// When the service last acknowledged a keep-alive.
    pub last_ping_time: Option<DateTime<Utc>>,
    /// Reconnect attempts used since the drop; zero on a healthy link.
    pub reconnect_attempts: u32,
    pub quality: ConnectionQuality,
}

/// What the manager reports to the client's routing loop.
pub(crate) enum ConnectionNotice {
    /// A parsed inbound envelope.
    Inbound(ServerEnvelope),
    /// An inbound frame that failed to parse; the connection stays up.
    Malformed(String),
    /// Connection health changed.
    StatusChanged(ConnectionStatus),
    /// The channel dropped unexpectedly; reconnection is starting.
    ChannelLost { reason: String },
    /// One reconnect attempt failed; more may follow.
    AttemptFailed { attempt: u32, error: ClientError },
    /// A reconnect attempt succeeded; the session context was re-primed.
    Reconnected,
    /// Every reconnect attempt failed; the connection is gone for good.
    GaveUp { error: ClientError },
}

/// Connection knobs, snapshotted from [`ClientConfig`] at client build time.
#[derive(Clone)]
pub(crate) struct ConnectionSettings {
    pub endpoint: String,
    pub api_key: SecretString,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub send_queue_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl From<&ClientConfig> for ConnectionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            handshake_timeout: config.handshake_timeout,
            ping_interval: config.ping_interval,
            send_queue_capacity: config.send_queue_capacity,
            reconnect: config.reconnect.clone(),
        }
    }
}

struct StatusInner {
    state: ConnectionState,
    last_ping_time: Option<DateTime<Utc>>,
    rtts: VecDeque<Duration>,
    consecutive_failures: u32,
    reconnect_attempts: u32,
    quality: ConnectionQuality,
}

impl StatusInner {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_ping_time: None,
            rtts: VecDeque::new(),
            consecutive_failures: 0,
            reconnect_attempts: 0,
            quality: ConnectionQuality::Good,
        }
    }

    fn reset_keepalive(&mut self) {
        self.last_ping_time = None;
        self.rtts.clear();
        self.consecutive_failures = 0;
        self.quality = ConnectionQuality::Good;
    }
}

#[derive(Default)]
struct TaskSet {
    reader: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct ConnShared {
    /// Serializes connect, disconnect and reconnect attempts.
    lifecycle: tokio::sync::Mutex<()>,
    status: Mutex<StatusInner>,
    outbound: Mutex<Option<mpsc::Sender<WireFrame>>>,
    /// Setup parameters of the live session, replayed on reconnect with
    /// refreshed conversation history.
    setup: Mutex<Option<SetupParams>>,
    /// Bumped whenever a channel is installed or torn down; readers from
    /// older epochs stand down instead of acting.
    epoch: AtomicU64,
    user_closed: AtomicBool,
    tasks: Mutex<TaskSet>,
}

/// Owns the single connection to the voice service.
#[derive(Clone)]
pub(crate) struct ConnectionManager {
    transport: Arc<dyn VoiceTransport>,
    settings: ConnectionSettings,
    notices: mpsc::Sender<ConnectionNotice>,
    shared: Arc<ConnShared>,
}

impl ConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn VoiceTransport>,
        settings: ConnectionSettings,
        notices: mpsc::Sender<ConnectionNotice>,
    ) -> Self {
        Self {
            transport,
            settings,
            notices,
            shared: Arc::new(ConnShared {
                lifecycle: tokio::sync::Mutex::new(()),
                status: Mutex::new(StatusInner::new()),
                outbound: Mutex::new(None),
                setup: Mutex::new(None),
                epoch: AtomicU64::new(0),
                user_closed: AtomicBool::new(false),
                tasks: Mutex::new(TaskSet::default()),
            }),
        }
    }

    /// Opens a channel and completes the setup handshake. On success the
    /// inbound reader is running and `send` is live.
    pub(crate) async fn connect(&self, setup: SetupParams) -> Result<(), ClientError> {
        let _guard = self.shared.lifecycle.lock().await;
        if lock_poisoned(&self.shared.status).state != ConnectionState::Disconnected {
            return Err(ClientError::Connection(
                "a connection is already active".to_string(),
            ));
        }
        self.shared.user_closed.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting).await;

        match open_and_handshake(self.transport.as_ref(), &self.settings, &setup).await {
            Ok(channel) => {
                *lock_poisoned(&self.shared.setup) = Some(setup);
                self.install(channel);
                self.notify_status().await;
                Ok(())
            }
            Err(error) => {
                self.set_state(ConnectionState::Disconnected).await;
                Err(error)
            }
        }
    }

    /// Tears the connection down. Safe to call at any time, in any state.
    pub(crate) async fn disconnect(&self) {
        self.shared.user_closed.store(true, Ordering::SeqCst);
        let (reader, reconnect) = {
            let mut tasks = lock_poisoned(&self.shared.tasks);
            (tasks.reader.take(), tasks.reconnect.take())
        };
        // Cancel a sleeping reconnect before taking the lifecycle lock so it
        // cannot slip in one more handshake.
        if let Some(handle) = reconnect {
            handle.abort();
        }

        let _guard = self.shared.lifecycle.lock().await;
        if let Some(handle) = reader {
            handle.abort();
        }
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(sender) = lock_poisoned(&self.shared.outbound).take() {
            // Best effort close frame before the last sender drops.
            let _ = sender.try_send(WireFrame::Close(None));
        }
        *lock_poisoned(&self.shared.setup) = None;

        let changed = {
            let mut status = lock_poisoned(&self.shared.status);
            let changed = status.state != ConnectionState::Disconnected;
            status.state = ConnectionState::Disconnected;
            status.reconnect_attempts = 0;
            status.reset_keepalive();
            changed
        };
        if changed {
            self.notify_status().await;
        }
    }

    /// Synchronous teardown for drop paths: no close frame, no notices.
    pub(crate) fn shutdown(&self) {
        self.shared.user_closed.store(true, Ordering::SeqCst);
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        let mut tasks = lock_poisoned(&self.shared.tasks);
        if let Some(handle) = tasks.reader.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.reconnect.take() {
            handle.abort();
        }
        drop(tasks);
        *lock_poisoned(&self.shared.outbound) = None;
    }

    /// Queues one envelope for the service without blocking.
    ///
    /// Fails with [`ClientError::NotConnected`] unless a handshaken channel
    /// is live, and with [`ClientError::Backpressure`] when the outbound
    /// queue is full; the payload is dropped in both cases.
    pub(crate) fn send(&self, envelope: &ClientEnvelope) -> Result<(), ClientError> {
        if lock_poisoned(&self.shared.status).state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let payload = serde_json::to_string(envelope)
            .map_err(|e| ClientError::Protocol(format!("failed to encode envelope: {e}")))?;
        let sender = lock_poisoned(&self.shared.outbound)
            .as_ref()
            .cloned()
            .ok_or(ClientError::NotConnected)?;
        sender
            .try_send(WireFrame::Text(payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClientError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => {
                    ClientError::Connection("outbound channel closed".to_string())
                }
            })
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        let inner = lock_poisoned(&self.shared.status);
        ConnectionStatus {
            connected: inner.state == ConnectionState::Connected,
            last_ping_time: inner.last_ping_time,
            reconnect_attempts: inner.reconnect_attempts,
            quality: inner.quality,
        }
    }

    /// Refreshes the conversation history replayed on the next reconnect.
    pub(crate) fn update_context(&self, history: Vec<ConversationMessage>) {
        if let Some(setup) = lock_poisoned(&self.shared.setup).as_mut() {
            setup.context.conversation_history = history;
        }
    }

    /// Installs a handshaken channel and starts its reader. Caller must hold
    /// the lifecycle lock and report the status change afterwards. Kept
    /// synchronous: the reader it spawns eventually spawns the reconnect
    /// task, which calls back into `install`, and awaiting here would close
    /// that loop into a future type the compiler cannot resolve.
    fn install(&self, channel: DuplexChannel) {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *lock_poisoned(&self.shared.outbound) = Some(channel.outbound.clone());
        {
            let mut status = lock_poisoned(&self.shared.status);
            status.state = ConnectionState::Connected;
            status.reconnect_attempts = 0;
            status.reset_keepalive();
        }
        let reader = tokio::spawn(run_reader(
            self.clone(),
            channel.inbound,
            channel.outbound,
            epoch,
        ));
        lock_poisoned(&self.shared.tasks).reader = Some(reader);
    }

    /// True once a disconnect or a newer channel has overtaken `epoch`;
    /// recovery work spawned for an older channel must stand down.
    fn superseded(&self, epoch: u64) -> bool {
        self.shared.user_closed.load(Ordering::SeqCst)
            || self.shared.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn set_state(&self, state: ConnectionState) {
        {
            let mut status = lock_poisoned(&self.shared.status);
            if status.state == state {
                return;
            }
            debug!(from = %status.state, to = %state, "connection state change");
            status.state = state;
        }
        self.notify_status().await;
    }

    async fn notify_status(&self) {
        let status = self.status();
        let _ = self
            .notices
            .send(ConnectionNotice::StatusChanged(status))
            .await;
    }

    async fn record_pong(&self, rtt: Duration) {
        let changed = {
            let mut status = lock_poisoned(&self.shared.status);
            status.last_ping_time = Some(Utc::now());
            status.consecutive_failures = 0;
            status.rtts.push_back(rtt);
            while status.rtts.len() > RTT_WINDOW {
                status.rtts.pop_front();
            }
            let quality = classify_quality(average(&status.rtts), 0);
            let changed = quality != status.quality;
            status.quality = quality;
            changed
        };
        debug!(?rtt, "keep-alive acknowledged");
        if changed {
            self.notify_status().await;
        }
    }

    async fn record_missed_pong(&self) {
        let (failures, changed) = {
            let mut status = lock_poisoned(&self.shared.status);
            status.consecutive_failures += 1;
            let quality = classify_quality(average(&status.rtts), status.consecutive_failures);
            let changed = quality != status.quality;
            status.quality = quality;
            (status.consecutive_failures, changed)
        };
        warn!(failures, "keep-alive went unanswered");
        if changed {
            self.notify_status().await;
        }
    }
}

/// Opens a channel and runs the setup/ready handshake against it.
async fn open_and_handshake(
    transport: &dyn VoiceTransport,
    settings: &ConnectionSettings,
    setup: &SetupParams,
) -> Result<DuplexChannel, ClientError> {
    let mut channel = transport
        .open(ConnectRequest {
            endpoint: settings.endpoint.clone(),
            api_key: settings.api_key.clone(),
            send_queue_capacity: settings.send_queue_capacity,
        })
        .await?;

    let frame = serde_json::to_string(&ClientEnvelope::Setup(setup.clone()))
        .map_err(|e| ClientError::Protocol(format!("failed to encode setup frame: {e}")))?;
    channel
        .outbound
        .send(WireFrame::Text(frame))
        .await
        .map_err(|_| ClientError::Connection("channel closed before setup".to_string()))?;

    let deadline = tokio::time::Instant::now() + settings.handshake_timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, channel.inbound.recv())
            .await
            .map_err(|_| ClientError::HandshakeTimeout(settings.handshake_timeout))?
            .ok_or_else(|| {
                ClientError::Connection("channel closed during handshake".to_string())
            })?;
        match frame {
            WireFrame::Text(text) => match parse_server_envelope(&text) {
                Ok(ServerEnvelope::Ready(params)) => {
                    debug!(session_id = ?params.session_id, "session ready");
                    return Ok(channel);
                }
                Ok(ServerEnvelope::Error(err)) => {
                    return Err(ClientError::Connection(format!(
                        "service rejected setup: {}",
                        err.message
                    )));
                }
                Ok(_) => warn!("ignoring envelope received before ready"),
                Err(e) => return Err(ClientError::Protocol(e.to_string())),
            },
            WireFrame::Ping(_) | WireFrame::Pong(_) => {}
            WireFrame::Binary(_) => {
                return Err(ClientError::Protocol(
                    "unexpected binary frame during handshake".to_string(),
                ));
            }
            WireFrame::Close(reason) => {
                return Err(ClientError::Connection(format!(
                    "closed during handshake: {}",
                    reason.unwrap_or_else(|| "no reason given".to_string())
                )));
            }
        }
    }
}

/// Drives one installed channel: parses inbound frames, runs keep-alive,
/// and kicks off reconnection when the channel drops out from under us.
async fn run_reader(
    manager: ConnectionManager,
    mut inbound: mpsc::Receiver<WireFrame>,
    outbound: mpsc::Sender<WireFrame>,
    epoch: u64,
) {
    let mut ping = tokio::time::interval(manager.settings.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_pong: Option<tokio::time::Instant> = None;

    let reason = loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(WireFrame::Text(text)) => match parse_server_envelope(&text) {
                    Ok(envelope) => {
                        if manager.notices.send(ConnectionNotice::Inbound(envelope)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "ignoring malformed inbound frame");
                        if manager.notices.send(ConnectionNotice::Malformed(e.to_string())).await.is_err() {
                            return;
                        }
                    }
                },
                Some(WireFrame::Pong(_)) => {
                    if let Some(sent) = awaiting_pong.take() {
                        manager.record_pong(sent.elapsed()).await;
                    }
                }
                Some(WireFrame::Ping(_)) => {}
                Some(WireFrame::Binary(_)) => {
                    let malformed = ConnectionNotice::Malformed("unexpected binary frame".to_string());
                    if manager.notices.send(malformed).await.is_err() {
                        return;
                    }
                }
                Some(WireFrame::Close(reason)) => {
                    break reason.unwrap_or_else(|| "closed by service".to_string());
                }
                None => break "connection ended".to_string(),
            },
            _ = ping.tick() => {
                if awaiting_pong.take().is_some() {
                    manager.record_missed_pong().await;
                }
                let payload = Utc::now().timestamp_millis().to_be_bytes().to_vec();
                if outbound.try_send(WireFrame::Ping(payload)).is_ok() {
                    awaiting_pong = Some(tokio::time::Instant::now());
                } else {
                    warn!("keep-alive ping not queued");
                }
            }
        }
    };

    // A disconnect or a newer channel may have superseded this reader while
    // it was noticing the closure; if so it must not start a reconnect.
    if manager.superseded(epoch) {
        return;
    }

    info!(reason = %reason, "connection lost, starting recovery");
    {
        let mut status = lock_poisoned(&manager.shared.status);
        status.state = ConnectionState::Reconnecting;
        status.reconnect_attempts = 0;
    }
    *lock_poisoned(&manager.shared.outbound) = None;
    manager.notify_status().await;
    let lost = ConnectionNotice::ChannelLost {
        reason: reason.clone(),
    };
    if manager.notices.send(lost).await.is_err() {
        return;
    }

    if manager.settings.reconnect.max_attempts == 0 {
        lock_poisoned(&manager.shared.status).state = ConnectionState::Disconnected;
        manager.notify_status().await;
        let _ = manager
            .notices
            .send(ConnectionNotice::GaveUp {
                error: ClientError::Connection(reason),
            })
            .await;
        return;
    }

    // Publish the handle under the task-set lock: a concurrent disconnect
    // either set `user_closed` before sweeping (seen here, stand down) or
    // sweeps after the store and aborts the task like any other.
    let mut tasks = lock_poisoned(&manager.shared.tasks);
    if manager.superseded(epoch) {
        return;
    }
    tasks.reconnect = Some(tokio::spawn(run_reconnect(manager.clone(), epoch)));
}

/// Walks the backoff schedule until a handshake succeeds or attempts run out.
/// `epoch` is the lost channel's; a disconnect or fresh connect in the
/// meantime supersedes it and the task stands down without dialing.
async fn run_reconnect(manager: ConnectionManager, epoch: u64) {
    let policy = manager.settings.reconnect.clone();
    let mut last_error = ClientError::Connection("connection lost".to_string());

    for attempt in 1..=policy.max_attempts {
        if manager.superseded(epoch) {
            return;
        }
        lock_poisoned(&manager.shared.status).reconnect_attempts = attempt;
        manager.notify_status().await;

        let delay = backoff_delay(&policy, attempt);
        debug!(attempt, ?delay, "scheduling reconnect attempt");
        tokio::time::sleep(delay).await;

        let guard = manager.shared.lifecycle.lock().await;
        if manager.superseded(epoch) {
            return;
        }
        let Some(setup) = lock_poisoned(&manager.shared.setup).clone() else {
            return;
        };
        match open_and_handshake(manager.transport.as_ref(), &manager.settings, &setup).await {
            Ok(channel) => {
                manager.install(channel);
                drop(guard);
                manager.notify_status().await;
                info!(attempt, "reconnected to voice service");
                let _ = manager.notices.send(ConnectionNotice::Reconnected).await;
                return;
            }
            Err(error) => {
                drop(guard);
                warn!(attempt, error = %error, "reconnect attempt failed");
                last_error = error.clone();
                let failed = ConnectionNotice::AttemptFailed { attempt, error };
                if manager.notices.send(failed).await.is_err() {
                    return;
                }
            }
        }
    }

    lock_poisoned(&manager.shared.status).state = ConnectionState::Disconnected;
    *lock_poisoned(&manager.shared.outbound) = None;
    manager.notify_status().await;
    let _ = manager
        .notices
        .send(ConnectionNotice::GaveUp { error: last_error })
        .await;
}

/// Delay before reconnect attempt `attempt` (1-based): base times two to
/// the attempt, capped at the policy maximum.
fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let factor = 1u32 << exponent;
    policy.base_delay.saturating_mul(factor).min(policy.max_delay)
}

fn average(rtts: &VecDeque<Duration>) -> Option<Duration> {
    if rtts.is_empty() {
        return None;
    }
    Some(rtts.iter().sum::<Duration>() / rtts.len() as u32)
}

fn classify_quality(average_rtt: Option<Duration>, consecutive_failures: u32) -> ConnectionQuality {
    if consecutive_failures >= UNSTABLE_AFTER {
        return ConnectionQuality::Unstable;
    }
    if consecutive_failures > 0 {
        return ConnectionQuality::Poor;
    }
    match average_rtt {
        None => ConnectionQuality::Good,
        Some(rtt) if rtt <= EXCELLENT_RTT => ConnectionQuality::Excellent,
        Some(rtt) if rtt <= GOOD_RTT => ConnectionQuality::Good,
        Some(_) => ConnectionQuality::Poor,
    }
}
