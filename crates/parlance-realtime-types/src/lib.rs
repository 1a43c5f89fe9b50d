//! Shared wire and conversation types for the Parlance realtime voice client.
//!
//! The [`protocol`] module defines the JSON envelopes exchanged with the
//! voice service; [`message`] defines the conversation history entries that
//! travel inside them and live in the client's session state.

pub mod message;
pub mod protocol;

pub use message::{ConversationMessage, Role};
pub use protocol::{
    AudioPayload, ClientEnvelope, EnvelopeError, ReadyParams, ServerEnvelope, ServiceError,
    SessionContext, SetupParams, TextPayload, TurnEnd, parse_server_envelope, pcm16_mime,
};
