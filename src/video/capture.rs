//! Paced frame capture
//!
//! [`CaptureSource`] pulls frames from a [`FrameReader`] at a fixed rate and
//! publishes them on a bounded queue exposed as [`Frames`]. Pacing uses an
//! absolute schedule (`1000 / fps` ms apart), so time spent reading and
//! forwarding a frame is subtracted from the next wait instead of adding up.

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::format::Resolution;
use super::frame::Frame;
use crate::error::{AppError, Result};

/// Default depth of the queue between capture and consumer
pub const DEFAULT_FRAME_QUEUE: usize = 2;

/// Source of raw frames (a camera, a test pattern)
#[async_trait]
pub trait FrameReader: Send {
    /// Human readable source name for logs
    fn describe(&self) -> String;

    /// Size of the frames this reader produces
    fn resolution(&self) -> Resolution;

    /// Read the next frame. An error ends the capture loop.
    async fn read_frame(&mut self) -> Result<Frame>;

    /// Release the underlying device
    fn close(&mut self) {}
}

/// Capture loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Not started, or stopped on request
    Stopped,
    /// Producing frames
    Running,
    /// Loop ended on a read error
    Error,
    /// Loop ended because the device disappeared
    DeviceLost,
}

/// Capture statistics
#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    /// Frames handed to the consumer
    pub frames_produced: u64,
    /// Frames dropped because the consumer queue was full
    pub frames_dropped: u64,
    /// Measured output rate over the last second
    pub current_fps: f32,
}

/// Lazy frame sequence; ends when capture stops or fails
pub struct Frames {
    rx: mpsc::Receiver<Frame>,
}

impl Frames {
    /// Build a frame sequence fed by the returned sender
    pub fn channel(capacity: usize) -> (mpsc::Sender<Frame>, Frames) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Frames { rx })
    }

    /// Next frame, `None` once the sequence is closed
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }
}

impl Stream for Frames {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

/// Owns a frame reader and produces frames at a steady rate
pub struct CaptureSource {
    resolution: Resolution,
    fps: u32,
    reader: Mutex<Option<Box<dyn FrameReader>>>,
    frame_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    frames: Mutex<Option<Frames>>,
    state: Arc<watch::Sender<CaptureState>>,
    state_rx: watch::Receiver<CaptureState>,
    stats: Arc<Mutex<CaptureStats>>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl CaptureSource {
    /// Wrap a reader. `queue` bounds the frames waiting for the consumer.
    pub fn new(reader: Box<dyn FrameReader>, fps: u32, queue: usize, span: Span) -> Self {
        let resolution = reader.resolution();
        let (frame_tx, frames) = Frames::channel(queue);
        let (state_tx, state_rx) = watch::channel(CaptureState::Stopped);

        Self {
            resolution,
            fps: fps.max(1),
            reader: Mutex::new(Some(reader)),
            frame_tx: Mutex::new(Some(frame_tx)),
            frames: Mutex::new(Some(frames)),
            state: Arc::new(state_tx),
            state_rx,
            stats: Arc::new(Mutex::new(CaptureStats::default())),
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
            span,
        }
    }

    pub fn size(&self) -> Resolution {
        self.resolution
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Spacing between frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps as u64)
    }

    /// Take the frame sequence. Only the first call returns it.
    pub fn frames(&self) -> Option<Frames> {
        self.frames.lock().take()
    }

    pub fn state(&self) -> CaptureState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats.lock().clone()
    }

    /// Start the capture loop
    ///
    /// A source runs once; after stop or failure it has to be recreated.
    pub async fn start(&self) -> Result<()> {
        let reader = self.reader.lock().take();
        let frame_tx = self.frame_tx.lock().take();
        let (reader, frame_tx) = match (reader, frame_tx) {
            (Some(reader), Some(frame_tx)) => (reader, frame_tx),
            _ => {
                return Err(AppError::VideoError(
                    "capture source already started".to_string(),
                ))
            }
        };

        info!(
            "Starting capture from {} at {} @ {} fps",
            reader.describe(),
            self.resolution,
            self.fps
        );
        let _ = self.state.send(CaptureState::Running);

        let task = CaptureLoop {
            reader,
            frame_tx,
            interval: self.frame_interval(),
            state: self.state.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(task.run().instrument(self.span.clone()));
        *self.handle.lock().await = Some(handle);

        Ok(())
    }

    /// Stop capturing and close the frame sequence
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        // Never started: close the queue so a waiting consumer sees the end
        self.frame_tx.lock().take();
        self.reader.lock().take();
    }
}

struct CaptureLoop {
    reader: Box<dyn FrameReader>,
    frame_tx: mpsc::Sender<Frame>,
    interval: Duration,
    state: Arc<watch::Sender<CaptureState>>,
    stats: Arc<Mutex<CaptureStats>>,
    cancel: CancellationToken,
}

impl CaptureLoop {
    async fn run(mut self) {
        let mut deadline = Instant::now() + self.interval;
        let mut sequence = 0u64;
        let mut fps_window_start = Instant::now();
        let mut fps_frames = 0u32;
        let mut final_state = CaptureState::Stopped;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.reader.read_frame() => result,
            };

            let frame = match result {
                Ok(frame) => frame.with_sequence(sequence),
                Err(e) => {
                    final_state = match e {
                        AppError::VideoDeviceLost { .. } => CaptureState::DeviceLost,
                        _ => CaptureState::Error,
                    };
                    error!("Capture read failed, ending frame sequence: {}", e);
                    break;
                }
            };
            sequence += 1;

            match self.frame_tx.try_send(frame) {
                Ok(()) => {
                    self.stats.lock().frames_produced += 1;
                    fps_frames += 1;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.lock().frames_dropped += 1;
                    debug!("Frame consumer busy, dropping frame {}", sequence - 1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Frame consumer gone, stopping capture");
                    break;
                }
            }

            let now = Instant::now();
            let window = now.duration_since(fps_window_start);
            if window >= Duration::from_secs(1) {
                self.stats.lock().current_fps = fps_frames as f32 / window.as_secs_f32();
                fps_frames = 0;
                fps_window_start = now;
            }

            deadline += self.interval;
            if now > deadline + self.interval {
                warn!(
                    "Capture fell {:?} behind schedule, resyncing",
                    now.duration_since(deadline)
                );
                deadline = now;
            }
        }

        self.reader.close();
        let _ = self.state.send(final_state);
        info!("Capture loop ended after {} frames", sequence);
    }
}
