//! Encoder traits and common types

use std::time::Duration;

use super::codec::VideoCodec;
use crate::error::Result;
use crate::video::format::Resolution;
use crate::video::frame::{EncodedSample, Frame};

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Target codec
    pub codec: VideoCodec,
    /// Requested resolution (snapped to the profile table on construction)
    pub resolution: Resolution,
    /// Target frame rate
    pub fps: u32,
    /// Codec profile/level used to pick the size table
    pub profile: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            resolution: Resolution::HD720,
            fps: 30,
            profile: "3.1".to_string(),
        }
    }
}

impl EncoderConfig {
    pub fn h264(resolution: Resolution, fps: u32) -> Self {
        Self {
            codec: VideoCodec::H264,
            resolution,
            fps,
            ..Default::default()
        }
    }

    /// Playout duration of one frame, `1000 / fps` whole milliseconds
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }
}

/// Stateful codec adapter
///
/// Turns one raw frame into zero or one compressed samples.
/// Note: Not Sync, encoders are owned by a single task.
pub trait FrameEncoder: Send {
    /// Encoder name for logs
    fn name(&self) -> &str;

    /// Codec produced by this encoder
    fn codec(&self) -> VideoCodec;

    /// Effective resolution after snapping. May differ from the request.
    fn resolution(&self) -> Resolution;

    /// Encode a frame. `Ok(None)` means the codec produced nothing for it.
    fn encode(&mut self, frame: &Frame) -> Result<Option<EncodedSample>>;

    /// Make the next produced sample a keyframe
    fn request_keyframe(&mut self) {}

    /// Release codec resources. Every later call fails with `EncoderClosed`.
    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_duration_whole_millis() {
        assert_eq!(
            EncoderConfig::h264(Resolution::HD720, 30).frame_duration(),
            Duration::from_millis(33)
        );
        assert_eq!(
            EncoderConfig::h264(Resolution::HD720, 12).frame_duration(),
            Duration::from_millis(83)
        );
        let zero = EncoderConfig {
            fps: 0,
            ..Default::default()
        };
        assert_eq!(zero.frame_duration(), Duration::from_secs(1));
    }
}
