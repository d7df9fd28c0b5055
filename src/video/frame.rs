//! Raw frames and encoded samples

use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;

use super::format::Resolution;

/// A raw RGB24 image produced by the capture source
///
/// Cheap to clone: the pixel buffer is reference counted.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Sequence number assigned by the capture loop
    pub sequence: u64,
    /// Monotonic capture timestamp
    pub capture_ts: Instant,
}

impl Frame {
    pub fn new(data: Bytes, resolution: Resolution, sequence: u64) -> Self {
        Self {
            data,
            resolution,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    pub fn from_vec(data: Vec<u8>, resolution: Resolution, sequence: u64) -> Self {
        Self::new(Bytes::from(data), resolution, sequence)
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the buffer holds exactly `width * height * 3` bytes
    pub fn is_complete(&self) -> bool {
        self.data.len() as u64 == self.resolution.pixels() * 3
    }

    /// Time since capture
    pub fn age(&self) -> Duration {
        self.capture_ts.elapsed()
    }
}

/// One compressed access unit ready to be written to viewer tracks
///
/// Shared read-only by every session receiving it in a fan-out cycle.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Encoded payload (Annex B for H264)
    pub data: Bytes,
    /// Intended playout duration
    pub duration: Duration,
    /// Whether this sample starts a new GOP
    pub key_frame: bool,
    /// Sequence of the frame this sample was produced from
    pub sequence: u64,
    /// Capture timestamp of the source frame
    pub capture_ts: Instant,
}

impl EncodedSample {
    pub fn new(data: Bytes, duration: Duration, key_frame: bool, source: &Frame) -> Self {
        Self {
            data,
            duration,
            key_frame,
            sequence: source.sequence,
            capture_ts: source.capture_ts,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
