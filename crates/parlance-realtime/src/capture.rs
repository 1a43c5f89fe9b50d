//! Microphone capture: fixed windows, strict ordering, lossy under pressure.
//!
//! An [`AudioSource`] produces raw frames of whatever size the device likes;
//! the accumulator re-cuts them into fixed windows which are encoded and
//! handed to the connection in capture order. A full outbound queue drops
//! the window (live audio is worthless late); everything else is delivered
//! exactly as captured.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use parlance_realtime_types::protocol::{AudioPayload, ClientEnvelope, pcm16_mime};

use crate::audio;
use crate::connection::ConnectionManager;
use crate::error::ClientError;
use crate::lock_poisoned;
use crate::stats::StatsTracker;

/// One batch of samples from an input device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono samples in `[-1.0, 1.0]`.
    pub samples: Vec<f32>,
    /// Time since the device started producing, for diagnostics.
    pub elapsed: Duration,
    /// Device-assigned frame counter; gaps mean the device dropped audio.
    pub sequence: u64,
}

/// A source of microphone audio.
///
/// `open` requests device access and starts production; it must fail with
/// [`ClientError::Permission`] when the platform denies the microphone.
/// Opening while already granted succeeds without prompting again. Dropping
/// the returned receiver releases the device.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn open(&self, sample_rate_hz: u32) -> Result<mpsc::Receiver<AudioFrame>, ClientError>;
}

/// One outbound window, already encoded for the wire.
pub(crate) struct EncodedWindow {
    pub seq: u64,
    pub data: String,
}

/// Re-cuts arbitrary device frames into fixed windows.
pub(crate) struct WindowAccumulator {
    window_len: usize,
    pending: Vec<f32>,
    next_seq: u64,
}

impl WindowAccumulator {
    pub(crate) fn new(window_len: usize) -> Self {
        Self {
            window_len: window_len.max(1),
            pending: Vec::new(),
            next_seq: 0,
        }
    }

    /// Consumes one frame, returning every full window it completed.
    pub(crate) fn push(&mut self, frame: AudioFrame) -> Vec<EncodedWindow> {
        self.pending.extend(frame.samples);
        let mut windows = Vec::new();
        while self.pending.len() >= self.window_len {
            let rest = self.pending.split_off(self.window_len);
            let samples = std::mem::replace(&mut self.pending, rest);
            windows.push(self.encode(&samples));
        }
        windows
    }

    /// Closes out a partial window by padding it to full length with
    /// trailing silence, so the final spoken samples are never discarded.
    pub(crate) fn flush(&mut self) -> Option<EncodedWindow> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending.resize(self.window_len, 0.0);
        let samples = std::mem::take(&mut self.pending);
        Some(self.encode(&samples))
    }

    fn encode(&mut self, samples: &[f32]) -> EncodedWindow {
        let seq = self.next_seq;
        self.next_seq += 1;
        EncodedWindow {
            seq,
            data: audio::encode_pcm16(samples),
        }
    }
}

/// Why the capture task wound down.
enum CaptureEnd {
    Stopped,
    DeviceFailed,
    ConnectionClosed,
}

/// What the capture path reports to the client's routing loop.
pub(crate) enum CaptureNotice {
    /// The device stopped producing mid-turn.
    DeviceFailed(String),
}

struct CaptureWorker {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Owns the capture task for the current recording, if any.
pub(crate) struct CapturePipeline {
    window_samples: usize,
    sample_rate_hz: u32,
    stats: Arc<StatsTracker>,
    notices: mpsc::Sender<CaptureNotice>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<CaptureWorker>>,
}

impl CapturePipeline {
    pub(crate) fn new(
        window_samples: usize,
        sample_rate_hz: u32,
        stats: Arc<StatsTracker>,
        notices: mpsc::Sender<CaptureNotice>,
    ) -> Self {
        Self {
            window_samples,
            sample_rate_hz,
            stats,
            notices,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    /// Starts streaming the given frames to the service.
    pub(crate) fn start(&self, frames: mpsc::Receiver<AudioFrame>, connection: ConnectionManager) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("capture already running");
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let context = CaptureContext {
            frames,
            connection,
            accumulator: WindowAccumulator::new(self.window_samples),
            sample_rate_hz: self.sample_rate_hz,
            last_sequence: None,
            stats: self.stats.clone(),
            notices: self.notices.clone(),
            running: self.running.clone(),
        };
        let task = tokio::spawn(run_capture(context, stop_rx));
        *lock_poisoned(&self.worker) = Some(CaptureWorker {
            stop: stop_tx,
            task,
        });
    }

    /// Stops capture gracefully: drains pending frames, flushes the partial
    /// window, and waits for the task so every window is on the wire (or
    /// counted dropped) before this returns.
    pub(crate) async fn stop(&self) {
        let worker = lock_poisoned(&self.worker).take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(true);
            let _ = worker.task.await;
        }
    }

    /// Kills capture without flushing, releasing the device.
    pub(crate) async fn abort(&self) {
        let worker = lock_poisoned(&self.worker).take();
        if let Some(worker) = worker {
            worker.task.abort();
            let _ = worker.task.await;
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drop-path teardown; does not wait for the task.
    pub(crate) fn shutdown(&self) {
        if let Some(worker) = lock_poisoned(&self.worker).take() {
            worker.task.abort();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

struct CaptureContext {
    frames: mpsc::Receiver<AudioFrame>,
    connection: ConnectionManager,
    accumulator: WindowAccumulator,
    sample_rate_hz: u32,
    last_sequence: Option<u64>,
    stats: Arc<StatsTracker>,
    notices: mpsc::Sender<CaptureNotice>,
    running: Arc<AtomicBool>,
}

async fn run_capture(mut ctx: CaptureContext, mut stop: watch::Receiver<bool>) {
    let end = 'run: loop {
        tokio::select! {
            _ = stop.changed() => {
                // Frames the device produced before the stop still belong
                // to this turn; drain them before flushing.
                while let Ok(frame) = ctx.frames.try_recv() {
                    if let Err(end) = handle_frame(&mut ctx, frame) {
                        break 'run end;
                    }
                }
                if let Some(window) = ctx.accumulator.flush() {
                    if let Err(end) = forward_window(&mut ctx, window) {
                        break 'run end;
                    }
                }
                break CaptureEnd::Stopped;
            }
            frame = ctx.frames.recv() => match frame {
                Some(frame) => {
                    if let Err(end) = handle_frame(&mut ctx, frame) {
                        break 'run end;
                    }
                }
                None => break CaptureEnd::DeviceFailed,
            }
        }
    };

    ctx.running.store(false, Ordering::SeqCst);
    match end {
        CaptureEnd::Stopped => debug!("capture stopped"),
        CaptureEnd::DeviceFailed => {
            warn!("input stream ended unexpectedly");
            let failed =
                CaptureNotice::DeviceFailed("input stream ended unexpectedly".to_string());
            let _ = ctx.notices.send(failed).await;
        }
        CaptureEnd::ConnectionClosed => debug!("capture ended with the connection"),
    }
}

fn handle_frame(ctx: &mut CaptureContext, frame: AudioFrame) -> Result<(), CaptureEnd> {
    if let Some(last) = ctx.last_sequence {
        if frame.sequence != last.wrapping_add(1) {
            warn!(
                expected = last.wrapping_add(1),
                got = frame.sequence,
                elapsed = ?frame.elapsed,
                "device dropped frames"
            );
        }
    }
    ctx.last_sequence = Some(frame.sequence);
    ctx.stats.observe_input_level(audio::peak_level(&frame.samples));
    for window in ctx.accumulator.push(frame) {
        forward_window(ctx, window)?;
    }
    Ok(())
}

fn forward_window(ctx: &mut CaptureContext, window: EncodedWindow) -> Result<(), CaptureEnd> {
    let envelope = ClientEnvelope::Audio(AudioPayload {
        format: pcm16_mime(ctx.sample_rate_hz),
        data: window.data,
        seq: window.seq,
    });
    match ctx.connection.send(&envelope) {
        Ok(()) => {
            ctx.stats.record_chunk_sent();
            Ok(())
        }
        Err(ClientError::Backpressure) => {
            ctx.stats.record_chunk_dropped();
            warn!(seq = window.seq, "outbound queue full, dropping capture window");
            Ok(())
        }
        Err(error) => {
            debug!(error = %error, "stopping capture, connection unavailable");
            Err(CaptureEnd::ConnectionClosed)
        }
    }
}
