//! H.264 software encoder (OpenH264)
//!
//! Frames arrive as RGB24 at capture size. They are scaled to the snapped
//! encoder size when needed, converted to I420 and handed to OpenH264. The
//! bitstream comes back in Annex B form, which is what the RTP payloader of
//! the WebRTC track expects.

use bytes::Bytes;
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, trace};

use openh264::encoder::{Encoder as OpenH264Encoder, FrameType};
use openh264::formats::YUVBuffer;

use super::codec::VideoCodec;
use super::resolution::snap_h264;
use super::traits::{EncoderConfig, FrameEncoder};
use crate::error::{AppError, Result};
use crate::video::convert;
use crate::video::format::Resolution;
use crate::video::frame::{EncodedSample, Frame};

/// H.264 encoder backed by OpenH264
pub struct H264Encoder {
    /// `None` once closed
    inner: Option<OpenH264Encoder>,
    resolution: Resolution,
    frame_duration: Duration,
    force_keyframe: bool,
    frames_encoded: u64,
}

impl H264Encoder {
    /// Create an encoder; the requested size is snapped to the profile table
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let resolution = snap_h264(config.resolution, &config.profile)?;
        if resolution != config.resolution {
            info!(
                "H264 size {} not supported by level {}, using {}",
                config.resolution, config.profile, resolution
            );
        }

        let inner = OpenH264Encoder::new()
            .map_err(|e| AppError::EncoderError(format!("Failed to create H264 encoder: {}", e)))?;

        info!(
            "H264 encoder ready: {} @ {} fps (level {})",
            resolution, config.fps, config.profile
        );

        Ok(Self {
            inner: Some(inner),
            resolution,
            frame_duration: config.frame_duration(),
            force_keyframe: false,
            frames_encoded: 0,
        })
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }
}

impl FrameEncoder for H264Encoder {
    fn name(&self) -> &str {
        "openh264"
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::H264
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn encode(&mut self, frame: &Frame) -> Result<Option<EncodedSample>> {
        let target = self.resolution;
        let inner = self.inner.as_mut().ok_or(AppError::EncoderClosed)?;

        let rgb: Cow<'_, [u8]> = if frame.resolution == target {
            Cow::Borrowed(frame.data())
        } else {
            Cow::Owned(convert::resize_rgb24(frame.data(), frame.resolution, target)?)
        };
        let yuv = convert::rgb24_to_i420(&rgb, target)?;
        let buffer = YUVBuffer::from_vec(yuv, target.width as usize, target.height as usize);

        if self.force_keyframe {
            inner.force_intra_frame();
            self.force_keyframe = false;
        }

        let bitstream = inner
            .encode(&buffer)
            .map_err(|e| AppError::EncoderError(format!("H264 encoding failed: {}", e)))?;

        let frame_type = bitstream.frame_type();
        if matches!(frame_type, FrameType::Skip | FrameType::Invalid) {
            trace!("H264 encoder skipped frame {}", frame.sequence);
            return Ok(None);
        }

        let data = bitstream.to_vec();
        if data.is_empty() {
            return Ok(None);
        }

        self.frames_encoded += 1;
        let key_frame = matches!(frame_type, FrameType::IDR | FrameType::I);
        if key_frame {
            debug!("H264 keyframe at frame {} ({} bytes)", frame.sequence, data.len());
        }

        Ok(Some(EncodedSample::new(
            Bytes::from(data),
            self.frame_duration,
            key_frame,
            frame,
        )))
    }

    fn request_keyframe(&mut self) {
        self.force_keyframe = true;
    }

    fn close(&mut self) -> Result<()> {
        match self.inner.take() {
            Some(encoder) => {
                drop(encoder);
                info!("H264 encoder closed after {} frames", self.frames_encoded);
                Ok(())
            }
            None => Err(AppError::EncoderClosed),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}
