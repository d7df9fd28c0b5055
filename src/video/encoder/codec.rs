//! Video codec identifiers shared by the encoder and the WebRTC side

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// Codecs a viewer track can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    VP8,
}

impl VideoCodec {
    /// Codec name as it appears in SDP `a=rtpmap` lines
    pub fn sdp_name(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "H264",
            VideoCodec::VP8 => "VP8",
        }
    }

    /// RTP mime type
    pub fn mime_type(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "video/H264",
            VideoCodec::VP8 => "video/VP8",
        }
    }

    /// fmtp line advertised on our outbound track
    pub fn sdp_fmtp(&self) -> &'static str {
        match self {
            VideoCodec::H264 => {
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            }
            VideoCodec::VP8 => "",
        }
    }

    /// RTP clock rate (90 kHz for all video codecs)
    pub fn clock_rate(&self) -> u32 {
        90000
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::VP8 => write!(f, "VP8"),
        }
    }
}

impl FromStr for VideoCodec {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h264" | "h.264" | "avc" => Ok(VideoCodec::H264),
            "vp8" => Ok(VideoCodec::VP8),
            _ => Err(AppError::UnsupportedCodec(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_names() {
        assert_eq!(VideoCodec::H264.mime_type(), "video/H264");
        assert_eq!(VideoCodec::VP8.sdp_name(), "VP8");
        assert!(VideoCodec::H264.sdp_fmtp().contains("packetization-mode=1"));
        assert_eq!(VideoCodec::default(), VideoCodec::H264);
    }

    #[test]
    fn test_codec_parse() {
        assert_eq!("H264".parse::<VideoCodec>().unwrap(), VideoCodec::H264);
        assert_eq!("vp8".parse::<VideoCodec>().unwrap(), VideoCodec::VP8);
        assert!(matches!(
            "av1".parse::<VideoCodec>(),
            Err(AppError::UnsupportedCodec(_))
        ));
    }
}
