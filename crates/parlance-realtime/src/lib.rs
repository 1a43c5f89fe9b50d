//! Realtime voice streaming client for the Parlance conversation service.
//!
//! The crate is organised around [`VoiceClient`]: applications construct it
//! with a [`ClientConfig`] plus their platform's [`AudioSource`] and
//! [`AudioSink`], subscribe to [`ClientEvent`]s, and drive the session with
//! `connect` / `start_recording` / `stop_recording` / `disconnect`. The
//! client owns the websocket, the capture and playback pipelines, automatic
//! reconnection, and the conversation history.
//!
//! Wire types live in the companion `parlance-realtime-types` crate and are
//! re-exported here for convenience.

pub mod audio;
pub mod capture;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod playback;
pub mod state;
pub mod stats;
pub mod transport;

pub use capture::{AudioFrame, AudioSource};
pub use client::VoiceClient;
pub use config::{ClientConfig, ReconnectPolicy};
pub use connection::{ConnectionQuality, ConnectionStatus};
pub use dispatcher::{ClientEvent, EventKind, SubscriptionId, VoiceInteraction};
pub use error::ClientError;
pub use playback::AudioSink;
pub use state::{SessionState, StateSnapshot};
pub use stats::SessionStats;
pub use transport::{ConnectRequest, DuplexChannel, VoiceTransport, WebSocketTransport, WireFrame};

pub use parlance_realtime_types::{ConversationMessage, Role, SessionContext};

/// Locks a mutex, recovering the guard if a panicking event handler
/// poisoned it. Subscriber callbacks may panic, and none of the protected
/// state is left half-updated by the panicking sections.
pub(crate) fn lock_poisoned<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
