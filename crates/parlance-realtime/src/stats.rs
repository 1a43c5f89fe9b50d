//! Session counters reported on the `session_stats_update` channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::lock_poisoned;

/// Point-in-time counters for the current session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    /// When the session connected; `None` before the first connect.
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds since `started_at`.
    pub duration_secs: u64,
    /// Completed user/assistant turn cycles.
    pub turns_completed: u64,
    /// Entries currently in conversation history.
    pub messages: usize,
    /// Capture windows delivered to the service.
    pub chunks_sent: u64,
    /// Assistant audio chunks accepted for playback.
    pub chunks_received: u64,
    /// Capture windows dropped to backpressure.
    pub chunks_dropped: u64,
    /// Loudest absolute input sample seen this session, in `[0.0, 1.0]`.
    pub peak_input_level: f32,
}

/// Lock-free accumulation of session counters.
///
/// The capture task is the only writer of the peak level, so a plain
/// load/store pair is enough there; everything else is a counter.
#[derive(Default)]
pub(crate) struct StatsTracker {
    started_at: Mutex<Option<DateTime<Utc>>>,
    turns_completed: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    chunks_dropped: AtomicU64,
    peak_bits: AtomicU32,
}

impl StatsTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks the session start and zeroes every counter.
    pub(crate) fn session_started(&self) {
        *lock_poisoned(&self.started_at) = Some(Utc::now());
        self.turns_completed.store(0, Ordering::Relaxed);
        self.chunks_sent.store(0, Ordering::Relaxed);
        self.chunks_received.store(0, Ordering::Relaxed);
        self.chunks_dropped.store(0, Ordering::Relaxed);
        self.peak_bits.store(0, Ordering::Relaxed);
    }

    pub(crate) fn session_ended(&self) {
        *lock_poisoned(&self.started_at) = None;
    }

    pub(crate) fn record_turn(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_chunk_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_input_level(&self, peak: f32) {
        let current = f32::from_bits(self.peak_bits.load(Ordering::Relaxed));
        if peak > current {
            self.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, messages: usize) -> SessionStats {
        let started_at = *lock_poisoned(&self.started_at);
        let duration_secs = started_at
            .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
            .unwrap_or(0);
        SessionStats {
            started_at,
            duration_secs,
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            messages,
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            peak_input_level: f32::from_bits(self.peak_bits.load(Ordering::Relaxed)),
        }
    }
}
