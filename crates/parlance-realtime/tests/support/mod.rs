//! In-process doubles for the transport, microphone and speaker, plus an
//! event recorder. Tests script the service side of the duplex channel the
//! same way the client's own connection tests do.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use parlance_realtime::{
    AudioFrame, AudioSink, AudioSource, ClientConfig, ClientError, ClientEvent, ConnectRequest,
    DuplexChannel, EventKind, ReconnectPolicy, VoiceClient, VoiceInteraction, VoiceTransport,
    WireFrame,
};
use parlance_realtime_types::protocol::ClientEnvelope;

static TRACING: Once = Once::new();

/// Installs a test subscriber honoring `RUST_LOG`; safe to call repeatedly.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Client configuration tuned for scripted tests: local endpoint, short
/// handshake timeout, two fast reconnect attempts.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new("test-key");
    config.endpoint = "ws://localhost:9030/v1/converse".to_string();
    config.handshake_timeout = Duration::from_millis(250);
    config.reconnect = ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts: 2,
    };
    config
}

/// Polls `cond` until it holds. Meant for `start_paused` tests, where the
/// sleeps auto-advance and the loop settles in microseconds of real time.
pub async fn settle(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..5_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("timed out waiting for {what}");
}

/// The service's view of one opened connection.
pub struct ServiceLink {
    pub from_client: mpsc::Receiver<WireFrame>,
    pub to_client: mpsc::Sender<WireFrame>,
}

impl ServiceLink {
    /// Next JSON envelope from the client, skipping keep-alive frames.
    pub async fn expect_envelope(&mut self) -> ClientEnvelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
                .await
                .expect("timed out waiting for a client frame")
                .expect("client closed the channel");
            match frame {
                WireFrame::Text(text) => {
                    return serde_json::from_str(&text).expect("client sent invalid JSON");
                }
                WireFrame::Ping(_) | WireFrame::Pong(_) => {}
                other => panic!("unexpected frame from client: {other:?}"),
            }
        }
    }

    /// Reads the client's turn: audio windows followed by `turn_end`.
    /// Returns the window count and the turn's message id.
    pub async fn drain_user_turn(&mut self) -> (usize, Uuid) {
        let mut windows = 0;
        loop {
            match self.expect_envelope().await {
                ClientEnvelope::Audio(_) => windows += 1,
                ClientEnvelope::TurnEnd(turn) => return (windows, turn.message_id),
                other => panic!("unexpected envelope mid-turn: {other:?}"),
            }
        }
    }

    pub async fn send_json(&self, raw: &str) {
        self.to_client
            .send(WireFrame::Text(raw.to_string()))
            .await
            .expect("client went away");
    }

    /// Closes the channel from the service side.
    pub async fn close(&self, reason: &str) {
        let _ = self
            .to_client
            .send(WireFrame::Close(Some(reason.to_string())))
            .await;
    }
}

/// Transport double. Each accepted `open` yields a channel pair and parks
/// the service side for the test to script; `set_refuse` makes future opens
/// fail, for reconnect scenarios.
pub struct ScriptedTransport {
    refuse: AtomicBool,
    opens: AtomicUsize,
    links: Mutex<Vec<ServiceLink>>,
}

impl ScriptedTransport {
    /// A transport that accepts every open and acknowledges the handshake
    /// with `ready` immediately.
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            refuse: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Open calls seen so far, refused ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// The service side of the oldest unclaimed open. Panics when there is
    /// none; use [`wait_for_link`](Self::wait_for_link) for opens that
    /// happen asynchronously.
    pub fn take_link(&self) -> ServiceLink {
        let mut links = self.links.lock().unwrap();
        assert!(!links.is_empty(), "no connection was opened");
        links.remove(0)
    }

    pub async fn wait_for_link(&self) -> ServiceLink {
        for _ in 0..5_000 {
            {
                let mut links = self.links.lock().unwrap();
                if !links.is_empty() {
                    return links.remove(0);
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no new connection was opened");
    }
}

#[async_trait]
impl VoiceTransport for ScriptedTransport {
    async fn open(&self, request: ConnectRequest) -> Result<DuplexChannel, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ClientError::Connection("service unavailable".to_string()));
        }
        let (out_tx, out_rx) = mpsc::channel(request.send_queue_capacity);
        let (in_tx, in_rx) = mpsc::channel(64);
        in_tx
            .send(WireFrame::Text(r#"{"type":"ready"}"#.to_string()))
            .await
            .expect("prime ready");
        self.links.lock().unwrap().push(ServiceLink {
            from_client: out_rx,
            to_client: in_tx,
        });
        Ok(DuplexChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Microphone double. `open` hands out a fresh frame stream; the test
/// pushes frames with [`feed`](Self::feed) and can kill the device with
/// [`fail`](Self::fail).
pub struct ScriptedMic {
    deny: bool,
    tx: Mutex<Option<mpsc::Sender<AudioFrame>>>,
    opens: AtomicUsize,
}

impl ScriptedMic {
    pub fn granted() -> Arc<Self> {
        Arc::new(Self {
            deny: false,
            tx: Mutex::new(None),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn denied() -> Arc<Self> {
        Arc::new(Self {
            deny: true,
            tx: Mutex::new(None),
            opens: AtomicUsize::new(0),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub async fn feed(&self, samples: Vec<f32>, sequence: u64) {
        let tx = self
            .tx
            .lock()
            .unwrap()
            .clone()
            .expect("microphone is not open");
        tx.send(AudioFrame {
            samples,
            elapsed: Duration::from_millis(sequence * 20),
            sequence,
        })
        .await
        .expect("capture went away");
    }

    /// Ends the frame stream mid-recording, like a device being unplugged.
    pub fn fail(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[async_trait]
impl AudioSource for ScriptedMic {
    async fn open(&self, _sample_rate_hz: u32) -> Result<mpsc::Receiver<AudioFrame>, ClientError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.deny {
            return Err(ClientError::Permission(
                "microphone access denied".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }
}

/// Speaker double counting plays and cancels.
pub struct CountingSink {
    plays: AtomicUsize,
    cancels: AtomicUsize,
}

impl CountingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            plays: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSink for CountingSink {
    async fn play(&self, _samples: Vec<f32>, _sample_rate_hz: u32) -> Result<(), ClientError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cancel(&self) -> Result<(), ClientError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every event the client emits, across all channels.
pub struct EventLog {
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

impl EventLog {
    pub fn attach(client: &VoiceClient) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in EventKind::ALL {
            let sink = events.clone();
            client.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        }
        Self { events }
    }

    pub fn snapshot(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&ClientEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn connected(&self) -> usize {
        self.count(|e| matches!(e, ClientEvent::Connected))
    }

    pub fn disconnected(&self) -> usize {
        self.count(|e| matches!(e, ClientEvent::Disconnected))
    }

    pub fn fatal_errors(&self) -> usize {
        self.count(|e| matches!(e, ClientEvent::Error { fatal: true, .. }))
    }

    pub fn saw_interaction(&self, which: VoiceInteraction) -> bool {
        self.count(|e| matches!(e, ClientEvent::VoiceInteraction(v) if *v == which)) > 0
    }
}
