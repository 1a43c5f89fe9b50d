//! Ordered, gapless playback of assistant audio.
//!
//! Chunks are queued in arrival order. Each chunk's start time is the
//! scheduled end of its predecessor (or now, when the queue ran dry), so
//! consecutive chunks play back to back without gaps or overlap. A barge-in
//! flush bumps the queue epoch: the scheduler abandons whatever it was
//! waiting on the moment it wakes, and stale entries never reach the device.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::audio;
use crate::error::ClientError;
use crate::lock_poisoned;

/// An output device for synthesized speech.
///
/// `play` must return promptly; the pipeline paces wall-clock time itself,
/// so implementations just hand samples to the device buffer. `cancel`
/// drops whatever the device still holds, for barge-in.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, samples: Vec<f32>, sample_rate_hz: u32) -> Result<(), ClientError>;
    async fn cancel(&self) -> Result<(), ClientError>;
}

/// What the playback path reports to the client's routing loop.
#[derive(Debug, PartialEq)]
pub(crate) enum PlaybackNotice {
    /// Audio is audibly playing.
    Started,
    /// The queue drained; waiting for more audio. Not an error.
    Idle,
    /// The output device rejected a chunk; playback continues.
    DeviceFailed(String),
}

struct PlaybackEntry {
    samples: Vec<f32>,
    sequence: u64,
    starts_at: Instant,
    duration: Duration,
}

struct SchedState {
    queue: VecDeque<PlaybackEntry>,
    /// Scheduled end of the last queued chunk; start of the next one.
    tail_end: Option<Instant>,
    last_seq: Option<u64>,
}

struct PlayShared {
    sample_rate_hz: u32,
    sink: Arc<dyn AudioSink>,
    sched: Mutex<SchedState>,
    /// Bumped by each flush; the scheduler discards entries from older
    /// epochs instead of playing them.
    epoch: AtomicU64,
    playing: AtomicBool,
    shutdown: AtomicBool,
    wake: Notify,
}

/// Owns the playback queue and its scheduler task.
pub(crate) struct PlaybackPipeline {
    shared: Arc<PlayShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackPipeline {
    pub(crate) fn spawn(
        sink: Arc<dyn AudioSink>,
        sample_rate_hz: u32,
        notices: mpsc::Sender<PlaybackNotice>,
    ) -> Self {
        let shared = Arc::new(PlayShared {
            sample_rate_hz,
            sink,
            sched: Mutex::new(SchedState {
                queue: VecDeque::new(),
                tail_end: None,
                last_seq: None,
            }),
            epoch: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        });
        let task = tokio::spawn(run_playback(shared.clone(), notices));
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queues one decoded chunk behind everything already scheduled.
    pub(crate) fn enqueue(&self, samples: Vec<f32>, sequence: u64) {
        if samples.is_empty() {
            return;
        }
        let duration = audio::duration_of(samples.len(), self.shared.sample_rate_hz);
        let now = Instant::now();
        {
            let mut sched = lock_poisoned(&self.shared.sched);
            if let Some(last) = sched.last_seq {
                if sequence <= last {
                    warn!(sequence, last, "audio chunk arrived out of order");
                }
            }
            sched.last_seq = Some(sequence);
            let starts_at = match sched.tail_end {
                Some(end) if end > now => end,
                _ => now,
            };
            sched.tail_end = Some(starts_at + duration);
            sched.queue.push_back(PlaybackEntry {
                samples,
                sequence,
                starts_at,
                duration,
            });
        }
        self.shared.wake.notify_one();
    }

    /// Drops every queued chunk and whatever the device still buffers.
    /// Returns how many queued chunks were discarded.
    pub(crate) async fn flush(&self) -> usize {
        let cleared = {
            let mut sched = lock_poisoned(&self.shared.sched);
            let cleared = sched.queue.len();
            sched.queue.clear();
            sched.tail_end = None;
            sched.last_seq = None;
            cleared
        };
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        if let Err(error) = self.shared.sink.cancel().await {
            warn!(error = %error, "output device cancel failed");
        }
        debug!(cleared, "playback queue flushed");
        cleared
    }

    /// Marks the end of a response. The service numbers each response's
    /// chunks from zero, so the ordering check restarts here; the scheduled
    /// tail is kept so trailing audio still plays out gaplessly.
    pub(crate) fn end_of_response(&self) {
        lock_poisoned(&self.shared.sched).last_seq = None;
    }

    #[cfg(test)]
    fn last_seq(&self) -> Option<u64> {
        lock_poisoned(&self.shared.sched).last_seq
    }

    #[cfg(test)]
    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        lock_poisoned(&self.shared.sched).queue.len()
    }

    /// Drop-path teardown; does not wait for the task.
    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
        if let Some(task) = lock_poisoned(&self.task).take() {
            task.abort();
        }
    }

    #[cfg(test)]
    fn scheduled(&self) -> Vec<(u64, Instant, Duration)> {
        lock_poisoned(&self.shared.sched)
            .queue
            .iter()
            .map(|entry| (entry.sequence, entry.starts_at, entry.duration))
            .collect()
    }
}

async fn run_playback(shared: Arc<PlayShared>, notices: mpsc::Sender<PlaybackNotice>) {
    loop {
        // The epoch is read before the pop: if a flush lands in between, the
        // mismatch below discards the entry instead of playing stale audio.
        let (entry, entry_epoch) = loop {
            if shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let epoch_before = shared.epoch.load(Ordering::SeqCst);
            let popped = lock_poisoned(&shared.sched).queue.pop_front();
            if let Some(entry) = popped {
                break (entry, epoch_before);
            }
            if shared.playing.swap(false, Ordering::SeqCst) {
                let _ = notices.send(PlaybackNotice::Idle).await;
            }
            shared.wake.notified().await;
        };

        if !wait_until(&shared, entry.starts_at, entry_epoch).await {
            continue;
        }

        if !shared.playing.swap(true, Ordering::SeqCst) {
            let _ = notices.send(PlaybackNotice::Started).await;
        }
        debug!(seq = entry.sequence, samples = entry.samples.len(), "playing chunk");
        let ends_at = entry.starts_at + entry.duration;
        if let Err(error) = shared.sink.play(entry.samples, shared.sample_rate_hz).await {
            warn!(error = %error, "output device rejected chunk");
            let failed = PlaybackNotice::DeviceFailed(error.to_string());
            let _ = notices.send(failed).await;
        }

        // Pace real time so the successor starts exactly when this chunk ends.
        wait_until(&shared, ends_at, entry_epoch).await;
    }
}

/// Sleeps until `deadline`, waking early on flush or shutdown. Returns
/// whether the wait ran to the deadline within the same epoch.
async fn wait_until(shared: &Arc<PlayShared>, deadline: Instant, epoch: u64) -> bool {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if shared.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        if Instant::now() >= deadline {
            return true;
        }
        tokio::select! {
            _ = sleep_until(deadline) => {}
            _ = shared.wake.notified() => {}
        }
    }
}
