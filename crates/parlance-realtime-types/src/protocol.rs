//! Wire protocol spoken with the voice service.
//!
//! Every frame is a JSON object tagged by `type`. [`ClientEnvelope`] covers
//! the client-to-service direction, [`ServerEnvelope`] the reverse. Audio
//! rides inside text frames as base64 PCM16 so the whole protocol stays
//! inspectable on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

use crate::message::{ConversationMessage, Role};

/// Frames sent from the client to the voice service.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// First frame after the channel opens; primes the remote session.
    Setup(SetupParams),
    /// One encoded window of microphone audio.
    Audio(AudioPayload),
    /// Marks the end of the user's spoken turn.
    TurnEnd(TurnEnd),
}

/// Frames sent from the voice service to the client.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// Handshake acknowledgment; the first frame of a healthy session.
    Ready(ReadyParams),
    /// One encoded chunk of synthesized speech.
    Audio(AudioPayload),
    /// Transcript text, either the user's turn or the assistant's reply.
    Text(TextPayload),
    /// The service has heard the full user turn and started composing.
    TurnComplete,
    /// The assistant's response is finished; no more frames for this turn.
    ResponseComplete,
    /// A service-side failure report.
    Error(ServiceError),
}

/// Session parameters delivered with the opening `setup` frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetupParams {
    pub model: String,
    pub voice: String,
    /// BCP-47 language tag, e.g. `en-US`.
    pub language: String,
    pub sample_rate_hz: u32,
    pub context: SessionContext,
}

/// Conversation context restored into the remote session on (re)connect.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default)]
    pub conversation_history: Vec<ConversationMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    /// Deduplicated, order-independent set of goals for the session.
    #[serde(default)]
    pub learning_goals: BTreeSet<String>,
}

/// One chunk of audio in either direction.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AudioPayload {
    /// Encoding tag, e.g. `audio/pcm;rate=16000`.
    pub format: String,
    /// Base64-encoded little-endian PCM16 samples.
    pub data: String,
    /// Per-direction sequence number, starting at zero each turn.
    pub seq: u64,
}

/// End-of-turn marker carrying the id of the history entry the turn becomes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TurnEnd {
    pub message_id: Uuid,
}

/// Payload of the `ready` handshake acknowledgment.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReadyParams {
    /// Service-assigned session id, when the service reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
}

/// Transcript frame for one side of the conversation.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TextPayload {
    pub role: Role,
    pub text: String,
    /// For user transcripts, echoes the `message_id` from the `turn_end`
    /// frame so the client can resolve the matching history entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
}

/// Error report from the service; the channel usually stays open.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// The PCM16 encoding tag for a given sample rate.
pub fn pcm16_mime(sample_rate_hz: u32) -> String {
    format!("audio/pcm;rate={sample_rate_hz}")
}

/// Failure to interpret an inbound text frame.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

/// Parses one inbound text frame into a [`ServerEnvelope`].
pub fn parse_server_envelope(raw: &str) -> Result<ServerEnvelope, EnvelopeError> {
    serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))
}
