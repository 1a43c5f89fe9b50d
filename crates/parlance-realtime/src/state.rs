//! Session lifecycle state machine and conversation history.
//!
//! Components never mutate session state directly. They report what happened
//! (connect succeeded, turn ended, channel dropped) and the machine decides
//! the resulting state, updates history, and emits the matching events. Every
//! observable change produces a fresh [`StateSnapshot`] so subscribers never
//! see a half-applied update.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use parlance_realtime_types::{ConversationMessage, Role};

use crate::dispatcher::{ClientEvent, EventDispatcher, VoiceInteraction};
use crate::error::ClientError;
use crate::lock_poisoned;

/// Where the session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No connection; the idle and terminal resting state.
    Disconnected,
    /// `connect` is in flight: validation passed, handshake pending.
    Connecting,
    /// Live connection, idle between turns.
    Connected,
    /// Microphone is open; the user is speaking.
    Listening,
    /// User turn ended; waiting for the assistant's response.
    Processing,
    /// Assistant audio is queued or playing.
    Speaking,
    /// The connection dropped; automatic reattempts are running.
    Reconnecting,
    /// Reconnection gave up. Terminal until the next `connect`.
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Listening => "listening",
            SessionState::Processing => "processing",
            SessionState::Speaking => "speaking",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Flattened view of the session, emitted with every `state_changed` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    /// A connection is live (any state from connected through speaking).
    pub is_connected: bool,
    /// The microphone is open and windows are streaming out.
    pub is_recording: bool,
    /// Assistant audio is audibly playing right now.
    pub is_playing: bool,
    /// Something is pending: connecting, reconnecting or awaiting a response.
    pub is_loading: bool,
    /// Message of the last session-ending failure, until the next connect.
    pub error: Option<String>,
}

struct MachineInner {
    state: SessionState,
    playing: bool,
    last_error: Option<String>,
    history: Vec<ConversationMessage>,
    pending_user: Option<Uuid>,
    assistant_text: String,
    assistant_active: bool,
}

impl MachineInner {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            is_connected: matches!(
                self.state,
                SessionState::Connected
                    | SessionState::Listening
                    | SessionState::Processing
                    | SessionState::Speaking
            ),
            is_recording: self.state == SessionState::Listening,
            is_playing: self.playing,
            is_loading: matches!(
                self.state,
                SessionState::Connecting | SessionState::Reconnecting | SessionState::Processing
            ),
            error: self.last_error.clone(),
        }
    }

    fn transition(&mut self, next: SessionState, events: &mut Vec<ClientEvent>) {
        if self.state == next {
            return;
        }
        debug!(from = %self.state, to = %next, "session state change");
        self.state = next;
        events.push(ClientEvent::SessionStateChange(next));
        events.push(ClientEvent::StateChanged(self.snapshot()));
    }

    /// Closes the assistant's in-progress turn into a history entry.
    fn finalize_assistant(&mut self, events: &mut Vec<ClientEvent>) -> bool {
        if !self.assistant_active {
            return false;
        }
        let message = ConversationMessage::assistant(std::mem::take(&mut self.assistant_text));
        self.assistant_active = false;
        self.history.push(message.clone());
        events.push(ClientEvent::Message(message));
        true
    }
}

/// Owns the session state, emitting events through the dispatcher.
pub(crate) struct SessionStateMachine {
    dispatcher: Arc<EventDispatcher>,
    inner: Mutex<MachineInner>,
}

impl SessionStateMachine {
    pub(crate) fn new(dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            dispatcher,
            inner: Mutex::new(MachineInner {
                state: SessionState::Disconnected,
                playing: false,
                last_error: None,
                history: Vec::new(),
                pending_user: None,
                assistant_text: String::new(),
                assistant_active: false,
            }),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        lock_poisoned(&self.inner).state
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        lock_poisoned(&self.inner).snapshot()
    }

    pub(crate) fn history(&self) -> Vec<ConversationMessage> {
        lock_poisoned(&self.inner).history.clone()
    }

    pub(crate) fn history_len(&self) -> usize {
        lock_poisoned(&self.inner).history.len()
    }

    /// Leaves the resting state for `connecting`. Legal from `disconnected`
    /// and from `error`, where it also clears the recorded failure.
    pub(crate) fn begin_connect(&self) -> Result<(), ClientError> {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if !matches!(
                inner.state,
                SessionState::Disconnected | SessionState::Error
            ) {
                return Err(ClientError::InvalidState {
                    op: "connect",
                    state: inner.state,
                });
            }
            inner.last_error = None;
            let mut events = Vec::new();
            inner.transition(SessionState::Connecting, &mut events);
            events
        };
        self.emit_all(events);
        Ok(())
    }

    pub(crate) fn connect_succeeded(&self) {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.state != SessionState::Connecting {
                warn!(state = %inner.state, "connect succeeded outside of connecting");
            }
            let mut events = Vec::new();
            inner.transition(SessionState::Connected, &mut events);
            events
        };
        self.emit_all(events);
    }

    pub(crate) fn connect_failed(&self, error: &ClientError) {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            inner.last_error = Some(error.to_string());
            let mut events = Vec::new();
            inner.transition(SessionState::Disconnected, &mut events);
            events
        };
        self.emit_all(events);
    }

    /// Opens the user's turn. Legal while idle (`connected`) or as a
    /// barge-in while the assistant is speaking; returns whether the
    /// assistant was interrupted.
    pub(crate) fn start_listening(&self) -> Result<bool, ClientError> {
        let (events, interrupted) = {
            let mut inner = lock_poisoned(&self.inner);
            let interrupted = match inner.state {
                SessionState::Connected => false,
                SessionState::Speaking => true,
                state => {
                    return Err(ClientError::InvalidState {
                        op: "start_recording",
                        state,
                    });
                }
            };
            let mut events = Vec::new();
            if interrupted {
                inner.finalize_assistant(&mut events);
                inner.playing = false;
                events.push(ClientEvent::VoiceInteraction(VoiceInteraction::Interrupted));
            }
            events.push(ClientEvent::VoiceInteraction(
                VoiceInteraction::UserSpeechStarted,
            ));
            inner.transition(SessionState::Listening, &mut events);
            (events, interrupted)
        };
        self.emit_all(events);
        Ok(interrupted)
    }

    /// Closes the user's turn: appends a pending history entry keyed by `id`
    /// (the id already sent to the service in the `turn_end` frame) and moves
    /// to `processing`.
    pub(crate) fn user_turn_ended(&self, id: Uuid) -> Result<(), ClientError> {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.state != SessionState::Listening {
                return Err(ClientError::InvalidState {
                    op: "stop_recording",
                    state: inner.state,
                });
            }
            let message = ConversationMessage::pending_user(id);
            inner.pending_user = Some(id);
            inner.history.push(message.clone());

            let mut events = vec![
                ClientEvent::Message(message),
                ClientEvent::VoiceInteraction(VoiceInteraction::UserSpeechEnded),
            ];
            inner.transition(SessionState::Processing, &mut events);
            events
        };
        self.emit_all(events);
        Ok(())
    }

    /// Falls back to idle after the input device failed mid-turn.
    pub(crate) fn recording_failed(&self) {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.state != SessionState::Listening {
                return;
            }
            let mut events = Vec::new();
            inner.transition(SessionState::Connected, &mut events);
            events
        };
        self.emit_all(events);
    }

    /// Service acknowledgment that the user turn was fully received. The
    /// turn was already closed locally by `stop_recording`, so a repeat is
    /// a no-op.
    pub(crate) fn service_turn_complete(&self) {
        let inner = lock_poisoned(&self.inner);
        if inner.state != SessionState::Processing {
            warn!(state = %inner.state, "turn_complete outside of processing");
        }
    }

    /// First assistant audio for the turn arrived. Returns whether the
    /// session is in (or just entered) the assistant's turn; audio arriving
    /// outside of one must not be played.
    pub(crate) fn response_started(&self) -> bool {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            match inner.state {
                SessionState::Speaking => return true,
                SessionState::Processing => {}
                state => {
                    warn!(state = %state, "assistant audio outside of a response");
                    return false;
                }
            }
            inner.assistant_active = true;
            let mut events = vec![ClientEvent::VoiceInteraction(
                VoiceInteraction::AssistantSpeechStarted,
            )];
            inner.transition(SessionState::Speaking, &mut events);
            events
        };
        self.emit_all(events);
        true
    }

    /// Buffers assistant transcript text until the turn completes.
    pub(crate) fn append_assistant_text(&self, text: &str) {
        let mut inner = lock_poisoned(&self.inner);
        inner.assistant_active = true;
        inner.assistant_text.push_str(text);
    }

    /// Closes the assistant's turn. Returns true when this completed a full
    /// turn cycle (the state returned to idle).
    pub(crate) fn response_completed(&self) -> bool {
        let (events, cycled) = {
            let mut inner = lock_poisoned(&self.inner);
            let mut events = Vec::new();
            inner.finalize_assistant(&mut events);
            let cycled = match inner.state {
                SessionState::Processing | SessionState::Speaking => {
                    events.push(ClientEvent::VoiceInteraction(
                        VoiceInteraction::AssistantSpeechEnded,
                    ));
                    inner.transition(SessionState::Connected, &mut events);
                    true
                }
                // The user barged in; a late completion only settles history.
                SessionState::Listening => false,
                state => {
                    warn!(state = %state, "response_complete outside of a turn");
                    false
                }
            };
            (events, cycled)
        };
        self.emit_all(events);
        cycled
    }

    /// Resolves a pending user entry with its transcript from the service.
    pub(crate) fn resolve_user_transcript(&self, id: Uuid, text: &str) -> bool {
        let (events, found) = {
            let mut inner = lock_poisoned(&self.inner);
            let resolved = inner
                .history
                .iter_mut()
                .find(|message| message.id == id && message.role == Role::User)
                .map(|message| {
                    message.resolve(text);
                    message.clone()
                });
            if inner.pending_user == Some(id) {
                inner.pending_user = None;
            }
            match resolved {
                Some(message) => (vec![ClientEvent::Message(message)], true),
                None => (Vec::new(), false),
            }
        };
        self.emit_all(events);
        found
    }

    /// The connection dropped unexpectedly. Returns whether the user was
    /// mid-recording, so the caller can shut the capture path down.
    pub(crate) fn connection_lost(&self) -> bool {
        let (events, was_recording) = {
            let mut inner = lock_poisoned(&self.inner);
            if !matches!(
                inner.state,
                SessionState::Connected
                    | SessionState::Listening
                    | SessionState::Processing
                    | SessionState::Speaking
            ) {
                return false;
            }
            let was_recording = inner.state == SessionState::Listening;
            let mut events = Vec::new();
            // Keep whatever the assistant said so far; the reconnect setup
            // frame replays history to the service.
            inner.finalize_assistant(&mut events);
            inner.playing = false;
            inner.transition(SessionState::Reconnecting, &mut events);
            (events, was_recording)
        };
        self.emit_all(events);
        was_recording
    }

    pub(crate) fn reconnected(&self) {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.state != SessionState::Reconnecting {
                warn!(state = %inner.state, "reconnected outside of reconnecting");
                return;
            }
            let mut events = Vec::new();
            inner.transition(SessionState::Connected, &mut events);
            events
        };
        self.emit_all(events);
    }

    /// Reconnection gave up; the session lands in the terminal error state.
    pub(crate) fn retries_exhausted(&self, error: &ClientError) {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.state != SessionState::Reconnecting {
                warn!(state = %inner.state, "retries exhausted outside of reconnecting");
            }
            inner.last_error = Some(error.to_string());
            inner.playing = false;
            let mut events = Vec::new();
            inner.transition(SessionState::Error, &mut events);
            events
        };
        self.emit_all(events);
    }

    /// User-initiated teardown. Clears history and returns whether there was
    /// a session to tear down, so `disconnected` fires at most once.
    pub(crate) fn disconnected(&self) -> bool {
        let (events, was_active) = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.state == SessionState::Disconnected {
                return false;
            }
            inner.history.clear();
            inner.pending_user = None;
            inner.assistant_text.clear();
            inner.assistant_active = false;
            inner.playing = false;
            inner.last_error = None;
            let mut events = Vec::new();
            inner.transition(SessionState::Disconnected, &mut events);
            (events, true)
        };
        self.emit_all(events);
        was_active
    }

    /// Playback started or stopped; only the snapshot changes.
    pub(crate) fn set_playing(&self, playing: bool) {
        let events = {
            let mut inner = lock_poisoned(&self.inner);
            if inner.playing == playing {
                return;
            }
            inner.playing = playing;
            vec![ClientEvent::StateChanged(inner.snapshot())]
        };
        self.emit_all(events);
    }

    fn emit_all(&self, events: Vec<ClientEvent>) {
        for event in events {
            self.dispatcher.emit(event);
        }
    }
}
