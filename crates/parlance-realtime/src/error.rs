//! Error taxonomy for the voice client.

use std::time::Duration;
use thiserror::Error;

use crate::state::SessionState;

/// Everything that can go wrong while driving a voice session.
///
/// Errors are [`Clone`] because the same failure is both returned from the
/// failing operation and broadcast on the `error` event channel.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    /// Invalid or missing configuration, detected before any network work.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The platform refused access to an audio device.
    #[error("audio permission denied: {0}")]
    Permission(String),

    /// The operation needs a live connection and there is none.
    #[error("not connected to the voice service")]
    NotConnected,

    /// The operation is not legal in the current session state.
    #[error("{op} is not valid while the session is {state}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },

    /// The outbound queue is full; the payload was not sent.
    #[error("outbound queue is full")]
    Backpressure,

    /// A frame violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The transport failed or the service reported a fault.
    #[error("connection failure: {0}")]
    Connection(String),

    /// The service never acknowledged the session setup.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// An audio device stopped working mid-session.
    #[error("audio device failure: {0}")]
    Device(String),
}

impl ClientError {
    /// True for failures that end the session rather than a single operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Configuration(_) | ClientError::HandshakeTimeout(_)
        )
    }
}
