//! Outbound video track
//!
//! Wraps a `TrackLocalStaticSample`, which packetizes each written access
//! unit into RTP for every binding the peer connection creates.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{AppError, Result};
use crate::stream::sink::SampleSink;
use crate::video::encoder::VideoCodec;
use crate::video::frame::EncodedSample;

/// Video track configuration
#[derive(Debug, Clone)]
pub struct VideoTrackConfig {
    pub track_id: String,
    pub stream_id: String,
    pub codec: VideoCodec,
}

impl Default for VideoTrackConfig {
    fn default() -> Self {
        Self {
            track_id: "video".to_string(),
            stream_id: "camstream".to_string(),
            codec: VideoCodec::H264,
        }
    }
}

/// RTP codec capability advertised for `codec`
pub fn video_codec_capability(codec: VideoCodec) -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: codec.mime_type().to_string(),
        clock_rate: codec.clock_rate(),
        channels: 0,
        sdp_fmtp_line: codec.sdp_fmtp().to_string(),
        rtcp_feedback: vec![],
    }
}

/// Track statistics
#[derive(Debug, Clone, Default)]
pub struct VideoTrackStats {
    pub samples_sent: u64,
    pub bytes_sent: u64,
    pub keyframes_sent: u64,
}

/// Video track for one viewer
pub struct RtcVideoTrack {
    track: Arc<TrackLocalStaticSample>,
    codec: VideoCodec,
    samples_sent: AtomicU64,
    bytes_sent: AtomicU64,
    keyframes_sent: AtomicU64,
}

impl RtcVideoTrack {
    pub fn new(config: &VideoTrackConfig) -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            video_codec_capability(config.codec),
            config.track_id.clone(),
            config.stream_id.clone(),
        ));

        Self {
            track,
            codec: config.codec,
            samples_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            keyframes_sent: AtomicU64::new(0),
        }
    }

    /// Track handle for `add_track`
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    pub fn stats(&self) -> VideoTrackStats {
        VideoTrackStats {
            samples_sent: self.samples_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            keyframes_sent: self.keyframes_sent.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl SampleSink for RtcVideoTrack {
    async fn write_sample(&self, sample: &EncodedSample) -> Result<()> {
        let rtp_sample = Sample {
            data: sample.data.clone(),
            duration: sample.duration,
            ..Default::default()
        };

        self.track
            .write_sample(&rtp_sample)
            .await
            .map_err(|e| AppError::WebRtcError(format!("write_sample failed: {}", e)))?;

        self.samples_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sample.len() as u64, Ordering::Relaxed);
        if sample.key_frame {
            self.keyframes_sent.fetch_add(1, Ordering::Relaxed);
        }
        trace!(
            "{} sample {}: {} bytes, keyframe={}",
            self.codec,
            sample.sequence,
            sample.len(),
            sample.key_frame
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_capability() {
        let cap = video_codec_capability(VideoCodec::H264);
        assert_eq!(cap.mime_type, "video/H264");
        assert_eq!(cap.clock_rate, 90000);
        assert!(cap.sdp_fmtp_line.contains("packetization-mode=1"));
    }

    #[test]
    fn test_track_identity() {
        let track = RtcVideoTrack::new(&VideoTrackConfig::default());
        let local = track.as_track_local();
        assert_eq!(local.id(), "video");
        assert_eq!(local.stream_id(), "camstream");
        assert_eq!(track.stats().samples_sent, 0);
    }
}
