//! Encode-once fan-out to every connected viewer
//!
//! ```text
//! CaptureSource --Frames--> StreamFanout (single task)
//!                              | encode once
//!                              v
//!                    +---------+---------+
//!                    v         v         v
//!                Session1  Session2  Session3 ...
//! ```
//!
//! The fan-out runs as one task owning the encoder and the session registry.
//! Register/unregister requests and frames are serialized through that task,
//! so the set of sessions written to in a cycle is a stable snapshot and no
//! session is written to while being torn down.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use super::session::ViewerSession;
use crate::error::{AppError, Result};
use crate::utils::LogThrottler;
use crate::video::capture::Frames;
use crate::video::encoder::FrameEncoder;
use crate::video::frame::{EncodedSample, Frame};

/// Fan-out tuning
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// A sink write taking longer than this counts as a failure
    pub write_timeout: Duration,
    /// Depth of the control request queue
    pub control_queue: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_millis(500),
            control_queue: 64,
        }
    }
}

/// Fan-out statistics
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    /// Frames taken from the capture sequence
    pub frames_received: u64,
    /// Samples produced by the encoder
    pub samples_produced: u64,
    /// Frames for which the encoder produced nothing
    pub frames_without_sample: u64,
    /// Frames the encoder failed on
    pub encode_errors: u64,
    /// Sessions dropped because a write failed
    pub write_failures: u64,
    /// Currently registered sessions
    pub active_sessions: usize,
    /// Capture sequence has ended
    pub source_ended: bool,
}

enum FanoutCommand {
    Start {
        frames: Frames,
        ack: oneshot::Sender<Result<()>>,
    },
    Register {
        session: Arc<ViewerSession>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        session_id: String,
        ack: oneshot::Sender<bool>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the fan-out task
///
/// Cheap to clone; every clone talks to the same task.
#[derive(Clone)]
pub struct StreamFanout {
    tx: mpsc::Sender<FanoutCommand>,
    cancel: CancellationToken,
    handle: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
    stats: Arc<Mutex<FanoutStats>>,
    stopped: Arc<AtomicBool>,
    throttler: Arc<LogThrottler>,
}

impl StreamFanout {
    /// Spawn the fan-out task around an encoder
    ///
    /// Frames are not consumed until [`start`](Self::start) is called.
    pub fn new(encoder: Box<dyn FrameEncoder>, config: FanoutConfig, span: Span) -> Self {
        let (tx, rx) = mpsc::channel(config.control_queue.max(1));
        let cancel = CancellationToken::new();
        let stats = Arc::new(Mutex::new(FanoutStats::default()));
        let throttler = Arc::new(LogThrottler::with_secs(5));

        let actor = FanoutActor {
            rx,
            cancel: cancel.clone(),
            encoder,
            frames: None,
            sessions: HashMap::new(),
            config,
            stats: stats.clone(),
            throttler: throttler.clone(),
        };
        let handle = tokio::spawn(actor.run().instrument(span));

        Self {
            tx,
            cancel,
            handle: Arc::new(tokio::sync::Mutex::new(Some(handle))),
            stats,
            stopped: Arc::new(AtomicBool::new(false)),
            throttler,
        }
    }

    /// Begin consuming the capture frame sequence
    pub async fn start(&self, frames: Frames) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.request(FanoutCommand::Start { frames, ack }).await?;
        done.await.map_err(|_| AppError::FanoutStopped)?
    }

    /// Add a session; it receives samples from the next processed frame on
    pub async fn register_session(&self, session: Arc<ViewerSession>) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.request(FanoutCommand::Register { session, ack }).await?;
        done.await.map_err(|_| AppError::FanoutStopped)
    }

    /// Remove a session by identity
    ///
    /// Returns whether it was registered. Removing an absent session is a no-op.
    pub async fn unregister_session(&self, session_id: &str) -> Result<bool> {
        let (ack, done) = oneshot::channel();
        self.request(FanoutCommand::Unregister {
            session_id: session_id.to_string(),
            ack,
        })
        .await?;
        done.await.map_err(|_| AppError::FanoutStopped)
    }

    /// Identities of the registered sessions
    pub async fn session_ids(&self) -> Result<Vec<String>> {
        let (reply, done) = oneshot::channel();
        self.request(FanoutCommand::Sessions { reply }).await?;
        done.await.map_err(|_| AppError::FanoutStopped)
    }

    pub fn stats(&self) -> FanoutStats {
        self.stats.lock().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop the task, release every session and close the encoder
    ///
    /// Later requests fail with [`AppError::FanoutStopped`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn request(&self, command: FanoutCommand) -> Result<()> {
        if self.is_stopped() {
            return Err(AppError::FanoutStopped);
        }
        self.tx
            .send(command)
            .await
            .map_err(|_| AppError::FanoutStopped)
    }
}

struct FanoutActor {
    rx: mpsc::Receiver<FanoutCommand>,
    cancel: CancellationToken,
    encoder: Box<dyn FrameEncoder>,
    frames: Option<Frames>,
    sessions: HashMap<String, Arc<ViewerSession>>,
    config: FanoutConfig,
    stats: Arc<Mutex<FanoutStats>>,
    throttler: Arc<LogThrottler>,
}

impl FanoutActor {
    async fn run(mut self) {
        info!(
            "Stream fan-out ready ({} {} via {})",
            self.encoder.codec(),
            self.encoder.resolution(),
            self.encoder.name()
        );

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                frame = next_frame(&mut self.frames), if self.frames.is_some() => match frame {
                    Some(frame) => self.process_frame(frame).await,
                    None => {
                        info!("Frame sequence ended, fan-out idle until stopped");
                        self.frames = None;
                        self.stats.lock().source_ended = true;
                    }
                },
            }
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: FanoutCommand) {
        match command {
            FanoutCommand::Start { frames, ack } => {
                let result = if self.frames.is_some() {
                    Err(AppError::VideoError("fan-out already started".to_string()))
                } else {
                    info!("Fan-out consuming frames");
                    self.frames = Some(frames);
                    Ok(())
                };
                let _ = ack.send(result);
            }
            FanoutCommand::Register { session, ack } => {
                let id = session.id().to_string();
                if self.sessions.insert(id.clone(), session).is_none() {
                    self.encoder.request_keyframe();
                    info!("Session {} registered ({} active)", id, self.sessions.len());
                }
                self.stats.lock().active_sessions = self.sessions.len();
                let _ = ack.send(());
            }
            FanoutCommand::Unregister { session_id, ack } => {
                let removed = match self.sessions.remove(&session_id) {
                    Some(session) => {
                        session.begin_close();
                        session.mark_closed();
                        info!(
                            "Session {} unregistered ({} active)",
                            session_id,
                            self.sessions.len()
                        );
                        true
                    }
                    None => {
                        debug!("Unregister of unknown session {} ignored", session_id);
                        false
                    }
                };
                self.stats.lock().active_sessions = self.sessions.len();
                let _ = ack.send(removed);
            }
            FanoutCommand::Sessions { reply } => {
                let _ = reply.send(self.sessions.keys().cloned().collect());
            }
        }
    }

    async fn process_frame(&mut self, frame: Frame) {
        self.stats.lock().frames_received += 1;

        let sample = match self.encoder.encode(&frame) {
            Ok(Some(sample)) => sample,
            Ok(None) => {
                self.stats.lock().frames_without_sample += 1;
                return;
            }
            Err(e) => {
                self.stats.lock().encode_errors += 1;
                if let Some(suppressed) = self.throttler.admit("encode") {
                    warn!("Encoding frame {} failed: {} (suppressed {})", frame.sequence, e, suppressed);
                }
                return;
            }
        };
        self.stats.lock().samples_produced += 1;

        if self.sessions.is_empty() {
            return;
        }

        let failed = self.deliver(&sample).await;
        for (session_id, reason) in failed {
            if let Some(session) = self.sessions.remove(&session_id) {
                if let Some(suppressed) = self.throttler.admit("write") {
                    warn!(
                        "Dropping session {} after write failure: {} (suppressed {})",
                        session_id, reason, suppressed
                    );
                }
                session.begin_close();
                session.mark_closed();
            }
            self.stats.lock().write_failures += 1;
        }
        self.stats.lock().active_sessions = self.sessions.len();
    }

    /// Write to a snapshot of the registry; returns the sessions that failed
    async fn deliver(&self, sample: &EncodedSample) -> Vec<(String, String)> {
        let timeout = self.config.write_timeout;
        let snapshot: Vec<Arc<ViewerSession>> = self.sessions.values().cloned().collect();

        let writes = snapshot.iter().map(|session| async move {
            let outcome = match tokio::time::timeout(timeout, session.write_sample(sample)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!("write timed out after {:?}", timeout)),
            };
            outcome.map(|reason| (session.id().to_string(), reason))
        });

        join_all(writes).await.into_iter().flatten().collect()
    }

    fn shutdown(&mut self) {
        for (_, session) in self.sessions.drain() {
            session.begin_close();
            session.mark_closed();
        }
        self.frames = None;
        {
            let mut stats = self.stats.lock();
            stats.active_sessions = 0;
        }

        if let Err(e) = self.encoder.close() {
            debug!("Encoder close on shutdown: {}", e);
        }
        info!("Stream fan-out stopped");
    }
}

async fn next_frame(frames: &mut Option<Frames>) -> Option<Frame> {
    match frames {
        Some(frames) => frames.next_frame().await,
        None => std::future::pending().await,
    }
}
