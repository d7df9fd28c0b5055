use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::stream::fanout::FanoutConfig;
use crate::video::capture::DEFAULT_FRAME_QUEUE;
use crate::video::device::DeviceConfig;
use crate::video::encoder::{h264_profile_sizes, EncoderConfig, EncoderService};
use crate::video::format::{PixelFormat, Resolution};

// Re-export WebRtcConfig from webrtc module
pub use crate::webrtc::config::{TurnServer, WebRtcConfig};

/// Capture device name selecting the test-pattern source
pub const SYNTHETIC_DEVICE: &str = "synthetic";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling server settings
    pub signaling: SignalingConfig,
    /// ICE servers and outbound track settings
    pub webrtc: WebRtcConfig,
    /// Camera settings
    pub capture: CaptureConfig,
    /// Encoder settings
    pub encoder: EncoderSettings,
    /// Fan-out settings
    pub fanout: FanoutSettings,
}

impl AppConfig {
    /// Reject settings the pipeline cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.signaling.url.trim().is_empty() {
            return Err(AppError::Config(
                "signaling url is required (WEBSOCKET_URL or --signaling-url)".to_string(),
            ));
        }
        if self.capture.fps == 0 {
            return Err(AppError::Config("capture.fps must be at least 1".to_string()));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(AppError::Config(format!(
                "capture size {}x{} is invalid",
                self.capture.width, self.capture.height
            )));
        }
        if !EncoderService::supports(self.webrtc.video_codec) {
            return Err(AppError::Config(format!(
                "no encoder available for {}",
                self.webrtc.video_codec
            )));
        }
        h264_profile_sizes(&self.encoder.profile)
            .map_err(|e| AppError::Config(e.to_string()))?;
        Ok(())
    }

    /// Encoder parameters for the configured capture size
    pub fn encoder_config(&self) -> EncoderConfig {
        EncoderConfig {
            codec: self.webrtc.video_codec,
            resolution: self.capture.resolution(),
            fps: self.capture.fps,
            profile: self.encoder.profile.clone(),
        }
    }

    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            write_timeout: Duration::from_millis(self.fanout.write_timeout_ms),
            ..Default::default()
        }
    }
}

/// Signaling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Websocket URL of the signaling server
    pub url: String,
    /// Announce readiness on connect
    pub send_connected: bool,
    /// Start with several viewers per correlation id allowed
    pub double_streamer: bool,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            send_connected: true,
            double_streamer: false,
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Video device path, or "synthetic" for a test pattern
    pub device: String,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Frame rate
    pub fps: u32,
    /// Pixel format requested from the device
    pub format: PixelFormat,
    /// Number of mmap buffers
    pub buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            fps: 12,
            format: PixelFormat::Mjpeg,
            buffer_count: 4,
        }
    }
}

impl CaptureConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn is_synthetic(&self) -> bool {
        self.device == SYNTHETIC_DEVICE
    }

    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            path: self.device.clone().into(),
            resolution: self.resolution(),
            format: self.format,
            fps: self.fps,
            buffer_count: self.buffer_count,
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderSettings {
    /// H.264 level whose size table is used
    pub profile: String,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            profile: "3.1".to_string(),
        }
    }
}

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutSettings {
    /// A viewer write slower than this drops the viewer
    pub write_timeout_ms: u64,
    /// Frames buffered between capture and fan-out
    pub frame_queue: usize,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            write_timeout_ms: 500,
            frame_queue: DEFAULT_FRAME_QUEUE,
        }
    }
}
