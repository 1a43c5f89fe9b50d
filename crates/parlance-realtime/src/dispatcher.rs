//! Synchronous event fan-out to subscriber callbacks.
//!
//! The dispatcher owns nothing about session semantics. It maps each event to
//! its channel, keeps subscribers in registration order, and isolates
//! panicking callbacks so one bad subscriber cannot take down the others.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::error;

use parlance_realtime_types::ConversationMessage;

use crate::connection::ConnectionStatus;
use crate::error::ClientError;
use crate::lock_poisoned;
use crate::state::{SessionState, StateSnapshot};
use crate::stats::SessionStats;

/// Everything the client reports to its subscribers.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection (initial or re-established) is live.
    Connected,
    /// The user's `disconnect` completed; emitted once per live session.
    Disconnected,
    /// An operational failure. `fatal` marks errors that ended the session.
    Error { error: ClientError, fatal: bool },
    /// A conversation history entry was added or its transcript resolved.
    Message(ConversationMessage),
    /// A fresh snapshot after any observable state change.
    StateChanged(StateSnapshot),
    /// Connection health changed: state, attempts or quality.
    ConnectionStateChange(ConnectionStatus),
    /// The session state machine moved to a new state.
    SessionStateChange(SessionState),
    /// A voice interaction milestone, e.g. the user started speaking.
    VoiceInteraction(VoiceInteraction),
    /// Updated session counters, emitted after each completed turn.
    SessionStatsUpdate(SessionStats),
}

/// Milestones of the spoken exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceInteraction {
    UserSpeechStarted,
    UserSpeechEnded,
    AssistantSpeechStarted,
    AssistantSpeechEnded,
    /// The user barged in while the assistant was speaking.
    Interrupted,
}

/// Subscription channels, one per [`ClientEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Error,
    Message,
    StateChanged,
    ConnectionStateChange,
    SessionStateChange,
    VoiceInteraction,
    SessionStatsUpdate,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::Connected,
        EventKind::Disconnected,
        EventKind::Error,
        EventKind::Message,
        EventKind::StateChanged,
        EventKind::ConnectionStateChange,
        EventKind::SessionStateChange,
        EventKind::VoiceInteraction,
        EventKind::SessionStatsUpdate,
    ];

    /// The channel an event is delivered on.
    pub fn of(event: &ClientEvent) -> EventKind {
        match event {
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::Disconnected => EventKind::Disconnected,
            ClientEvent::Error { .. } => EventKind::Error,
            ClientEvent::Message(_) => EventKind::Message,
            ClientEvent::StateChanged(_) => EventKind::StateChanged,
            ClientEvent::ConnectionStateChange(_) => EventKind::ConnectionStateChange,
            ClientEvent::SessionStateChange(_) => EventKind::SessionStateChange,
            ClientEvent::VoiceInteraction(_) => EventKind::VoiceInteraction,
            ClientEvent::SessionStatsUpdate(_) => EventKind::SessionStatsUpdate,
        }
    }
}

/// Handle returned by [`EventDispatcher::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Registry of event subscribers.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    channels: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback for one event channel.
    ///
    /// Handlers on the same channel run in registration order. Registering
    /// the same closure twice yields two independent subscriptions.
    pub fn on(
        &self,
        kind: EventKind,
        handler: impl Fn(&ClientEvent) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock_poisoned(&self.channels)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one subscription. Returns false when the id is unknown.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut channels = lock_poisoned(&self.channels);
        for handlers in channels.values_mut() {
            if let Some(index) = handlers.iter().position(|(sub, _)| *sub == id) {
                handlers.remove(index);
                return true;
            }
        }
        false
    }

    /// Delivers an event to every subscriber of its channel, in order.
    ///
    /// The subscriber list is snapshotted before the first callback runs, so
    /// handlers may subscribe or unsubscribe freely without deadlocking; such
    /// changes take effect from the next emission.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let kind = EventKind::of(&event);
        let handlers: Vec<Handler> = lock_poisoned(&self.channels)
            .get(&kind)
            .map(|subs| subs.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(?kind, "event subscriber panicked");
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, kind: EventKind) -> usize {
        lock_poisoned(&self.channels)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}
