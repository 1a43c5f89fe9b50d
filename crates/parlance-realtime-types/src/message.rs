//! Conversation history entries shared between the client and the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Who produced a conversation message.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One entry of session history.
///
/// User entries are appended as soon as the user ends a turn, before the
/// service has transcribed the audio. Until the transcript arrives the entry
/// carries empty text and `pending_transcript = true`; the service echoes the
/// entry's `id` on its transcript frame so the text can be filled in later.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConversationMessage {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pending_transcript: bool,
    pub timestamp: DateTime<Utc>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl ConversationMessage {
    /// A completed user entry with known text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::User,
            text: text.into(),
            pending_transcript: false,
            timestamp: Utc::now(),
        }
    }

    /// A user entry awaiting its transcript from the service, keyed by the
    /// id the service echoes back on the transcript frame.
    pub fn pending_user(id: Uuid) -> Self {
        Self {
            id,
            role: Role::User,
            text: String::new(),
            pending_transcript: true,
            timestamp: Utc::now(),
        }
    }

    /// A completed assistant entry.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role: Role::Assistant,
            text: text.into(),
            pending_transcript: false,
            timestamp: Utc::now(),
        }
    }

    /// Fills in the transcript for a pending entry.
    pub fn resolve(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.pending_transcript = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_displays_as_lowercase() {
        assert_eq!(Role::User.to_string(), "user");
        assert_eq!(Role::Assistant.to_string(), "assistant");
    }

    #[test]
    fn pending_user_entry_starts_empty() {
        let id = Uuid::new_v4();
        let message = ConversationMessage::pending_user(id);
        assert_eq!(message.id, id);
        assert_eq!(message.role, Role::User);
        assert!(message.text.is_empty());
        assert!(message.pending_transcript);
    }

    #[test]
    fn resolve_fills_text_and_clears_pending() {
        let mut message = ConversationMessage::pending_user(Uuid::new_v4());
        message.resolve("table for two");
        assert_eq!(message.text, "table for two");
        assert!(!message.pending_transcript);
    }

    #[test]
    fn pending_flag_is_omitted_when_false() {
        let message = ConversationMessage::assistant("hello");
        let json = serde_json::to_value(&message).expect("serialize");
        assert!(json.get("pending_transcript").is_none());
        assert_eq!(json["role"], "assistant");
    }

    #[test]
    fn pending_flag_round_trips_when_true() {
        let message = ConversationMessage::pending_user(Uuid::new_v4());
        let json = serde_json::to_string(&message).expect("serialize");
        let back: ConversationMessage = serde_json::from_str(&json).expect("deserialize");
        assert!(back.pending_transcript);
        assert_eq!(back.id, message.id);
    }
}
