//! Transport seam between the connection manager and the network.
//!
//! The manager only ever sees a [`DuplexChannel`] of [`WireFrame`]s, so the
//! real websocket can be swapped for a scripted double in tests. The
//! production implementation is [`WebSocketTransport`], which bridges the
//! channel pair onto a `tokio-tungstenite` stream with a single pump task.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use crate::error::ClientError;

const INBOUND_QUEUE: usize = 64;

/// What the connection manager asks a transport to open.
#[derive(Clone)]
pub struct ConnectRequest {
    /// `ws://` or `wss://` endpoint, without the credential.
    pub endpoint: String,
    /// Credential appended as the `key` query parameter.
    pub api_key: SecretString,
    /// Capacity of the outbound frame queue; sends beyond it fail fast.
    pub send_queue_capacity: usize,
}

/// One frame in either direction, transport-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    /// A JSON envelope.
    Text(String),
    /// Raw bytes; the protocol never uses these, so inbound ones are faults.
    Binary(Bytes),
    /// Keep-alive ping. Inbound pings are answered by the transport itself.
    Ping(Vec<u8>),
    /// Keep-alive answer, echoing the ping payload.
    Pong(Vec<u8>),
    /// The peer closed the channel, with an optional reason.
    Close(Option<String>),
}

/// Both directions of one open connection.
///
/// Dropping the outbound sender closes the connection gracefully; the
/// inbound receiver yields `Close` (or ends) when the peer goes away.
pub struct DuplexChannel {
    pub outbound: mpsc::Sender<WireFrame>,
    pub inbound: mpsc::Receiver<WireFrame>,
}

/// Opens duplex channels to the voice service.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn open(&self, request: ConnectRequest) -> Result<DuplexChannel, ClientError>;
}

/// Production transport over `tokio-tungstenite`.
#[derive(Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VoiceTransport for WebSocketTransport {
    async fn open(&self, request: ConnectRequest) -> Result<DuplexChannel, ClientError> {
        // The URL carries the credential, so it must never be logged.
        let url = format!(
            "{}?key={}",
            request.endpoint,
            request.api_key.expose_secret()
        );
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| ClientError::Connection(e.to_string()))?;
        info!(endpoint = %request.endpoint, "websocket connected");

        let (ws_tx, ws_rx) = stream.split();
        let (out_tx, out_rx) = mpsc::channel(request.send_queue_capacity);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(pump(ws_tx, ws_rx, out_rx, in_tx));

        Ok(DuplexChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Shuttles frames between the socket and the channel pair until either
/// side closes.
async fn pump(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    mut out_rx: mpsc::Receiver<WireFrame>,
    in_tx: mpsc::Sender<WireFrame>,
) {
    loop {
        tokio::select! {
            outbound = out_rx.recv() => match outbound {
                Some(frame) => {
                    let closing = matches!(frame, WireFrame::Close(_));
                    if let Err(e) = ws_tx.send(to_ws_message(frame)).await {
                        warn!(error = %e, "websocket send failed");
                        break;
                    }
                    if closing {
                        break;
                    }
                }
                None => {
                    // All senders dropped: close the session politely.
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            inbound = ws_rx.next() => match inbound {
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = ws_tx.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Ok(message)) => {
                    let closing = matches!(message, WsMessage::Close(_));
                    if in_tx.send(to_wire_frame(message)).await.is_err() || closing {
                        break;
                    }
                }
                Some(Err(e)) => {
                    let _ = in_tx.send(WireFrame::Close(Some(e.to_string()))).await;
                    break;
                }
                None => {
                    let _ = in_tx.send(WireFrame::Close(None)).await;
                    break;
                }
            },
        }
    }
    debug!("websocket pump stopped");
}

fn to_ws_message(frame: WireFrame) -> WsMessage {
    match frame {
        WireFrame::Text(text) => WsMessage::Text(text),
        WireFrame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        WireFrame::Ping(payload) => WsMessage::Ping(payload),
        WireFrame::Pong(payload) => WsMessage::Pong(payload),
        WireFrame::Close(reason) => WsMessage::Close(reason.map(|reason| CloseFrame {
            code: CloseCode::Normal,
            reason: reason.into(),
        })),
    }
}

fn to_wire_frame(message: WsMessage) -> WireFrame {
    match message {
        WsMessage::Text(text) => WireFrame::Text(text),
        WsMessage::Binary(bytes) => WireFrame::Binary(Bytes::from(bytes)),
        WsMessage::Ping(payload) => WireFrame::Ping(payload),
        WsMessage::Pong(payload) => WireFrame::Pong(payload),
        WsMessage::Close(frame) => WireFrame::Close(frame.map(|f| f.reason.into_owned())),
        // Raw frames never surface from a read with defaults.
        WsMessage::Frame(_) => WireFrame::Close(Some("unexpected raw frame".to_string())),
    }
}
