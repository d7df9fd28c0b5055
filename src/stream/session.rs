//! Viewer sessions
//!
//! A [`ViewerSession`] is created by the negotiator once an offer has been
//! accepted and is handed to the fan-out when its transport connects. The
//! fan-out is the only component that removes it from delivery.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::debug;

use super::sink::SampleSink;
use crate::error::{AppError, Result};
use crate::video::frame::EncodedSample;

/// Media direction of the viewer's track, from this side's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransceiverDirection {
    /// Viewer offered `recvonly`: we only send
    SendOnly,
    /// Viewer offered `sendrecv`
    SendRecv,
    /// No media flows
    Inactive,
}

impl TransceiverDirection {
    /// Whether samples may be written to a track with this direction
    pub fn can_send(&self) -> bool {
        matches!(self, TransceiverDirection::SendOnly | TransceiverDirection::SendRecv)
    }
}

impl fmt::Display for TransceiverDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransceiverDirection::SendOnly => write!(f, "sendonly"),
            TransceiverDirection::SendRecv => write!(f, "sendrecv"),
            TransceiverDirection::Inactive => write!(f, "inactive"),
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Negotiating,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Negotiating => write!(f, "negotiating"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// One negotiated viewer
pub struct ViewerSession {
    id: String,
    correlation_id: String,
    direction: TransceiverDirection,
    sink: Arc<dyn SampleSink>,
    state: watch::Sender<SessionState>,
    created_at: Instant,
    samples_sent: AtomicU64,
}

impl ViewerSession {
    /// New session with a generated identity
    pub fn new(
        correlation_id: impl Into<String>,
        direction: TransceiverDirection,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            correlation_id,
            direction,
            sink,
        )
    }

    pub fn with_id(
        id: impl Into<String>,
        correlation_id: impl Into<String>,
        direction: TransceiverDirection,
        sink: Arc<dyn SampleSink>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Negotiating);
        Self {
            id: id.into(),
            correlation_id: correlation_id.into(),
            direction,
            sink,
            state,
            created_at: Instant::now(),
            samples_sent: AtomicU64::new(0),
        }
    }

    /// Identity used as the fan-out registry key
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Signaling correlation id of the viewer
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn direction(&self) -> TransceiverDirection {
        self.direction
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub fn samples_sent(&self) -> u64 {
        self.samples_sent.load(Ordering::Relaxed)
    }

    /// Transport connected. Returns false if the session is already winding down.
    pub fn activate(&self) -> bool {
        self.advance(SessionState::Active)
    }

    pub fn begin_close(&self) -> bool {
        self.advance(SessionState::Closing)
    }

    pub fn mark_closed(&self) -> bool {
        self.advance(SessionState::Closed)
    }

    /// States only move forward
    fn advance(&self, next: SessionState) -> bool {
        let id = &self.id;
        self.state.send_if_modified(|current| {
            if next > *current {
                debug!("Session {} {} -> {}", id, current, next);
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Write a sample to the viewer's sink
    pub async fn write_sample(&self, sample: &EncodedSample) -> Result<()> {
        self.sink
            .write_sample(sample)
            .await
            .map_err(|e| AppError::SinkWrite {
                session: self.id.clone(),
                reason: e.to_string(),
            })?;
        self.samples_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerSession")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}
