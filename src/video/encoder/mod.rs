//! Video encoders
//!
//! - `codec`: codec identifiers shared with the WebRTC side
//! - `resolution`: profile size tables and size snapping
//! - `h264`: software H.264 via OpenH264
//!
//! VP8 can be negotiated but has no encoder backend, so [`EncoderService`]
//! reports it as unsupported.

pub mod codec;
pub mod h264;
pub mod resolution;
pub mod traits;

pub use codec::VideoCodec;
pub use h264::H264Encoder;
pub use resolution::{h264_profile_sizes, snap_h264, snap_resolution};
pub use traits::{EncoderConfig, FrameEncoder};

use crate::error::{AppError, Result};

/// Entry point for building encoders by codec
pub struct EncoderService;

impl EncoderService {
    /// Whether an encoder backend exists for `codec`
    pub fn supports(codec: VideoCodec) -> bool {
        matches!(codec, VideoCodec::H264)
    }

    /// Codecs that can actually be produced
    pub fn available_codecs() -> Vec<VideoCodec> {
        [VideoCodec::H264, VideoCodec::VP8]
            .into_iter()
            .filter(|c| Self::supports(*c))
            .collect()
    }

    /// Build an encoder for the configured codec
    pub fn create(config: &EncoderConfig) -> Result<Box<dyn FrameEncoder>> {
        match config.codec {
            VideoCodec::H264 => Ok(Box::new(H264Encoder::new(config)?)),
            VideoCodec::VP8 => Err(AppError::UnsupportedCodec(format!(
                "no {} encoder available",
                config.codec
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::format::Resolution;

    #[test]
    fn test_supported_codecs() {
        assert!(EncoderService::supports(VideoCodec::H264));
        assert!(!EncoderService::supports(VideoCodec::VP8));
        assert_eq!(EncoderService::available_codecs(), vec![VideoCodec::H264]);
    }

    #[test]
    fn test_vp8_unsupported() {
        let config = EncoderConfig {
            codec: VideoCodec::VP8,
            ..Default::default()
        };
        assert!(matches!(
            EncoderService::create(&config),
            Err(AppError::UnsupportedCodec(_))
        ));
    }

    #[test]
    fn test_create_h264() {
        let encoder = EncoderService::create(&EncoderConfig::h264(Resolution::HD720, 30)).unwrap();
        assert_eq!(encoder.codec(), VideoCodec::H264);
        assert_eq!(encoder.resolution(), Resolution::HD720);
    }
}
