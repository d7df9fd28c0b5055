//! Offer inspection
//!
//! Only the parts of an offer the negotiator decides on are read here: the
//! media direction of the video section and the video codecs offered with
//! their format parameters. Everything else is left to the transport.

use std::collections::HashMap;

use crate::error::{AppError, Result};
use crate::stream::session::TransceiverDirection;
use crate::video::encoder::VideoCodec;

/// One `a=rtpmap` entry of the video section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedCodec {
    pub payload_type: u8,
    /// Encoding name as written in the offer (`H264`, `VP8`, ...)
    pub name: String,
    pub clock_rate: u32,
    /// `a=fmtp` parameters, keys lowercased
    pub fmtp: HashMap<String, String>,
}

impl OfferedCodec {
    /// The matching codec, if it is one we know
    pub fn codec(&self) -> Option<VideoCodec> {
        match self.name.to_ascii_uppercase().as_str() {
            "H264" => Some(VideoCodec::H264),
            "VP8" => Some(VideoCodec::VP8),
            _ => None,
        }
    }

    /// Whether our encoder output can be sent with these parameters
    ///
    /// H.264 needs non-interleaved packetization and a (constrained) baseline
    /// profile; VP8 has no parameters that matter.
    pub fn is_acceptable(&self) -> bool {
        match self.codec() {
            Some(VideoCodec::H264) => {
                let mode = self.fmtp.get("packetization-mode").map(String::as_str);
                if mode != Some("1") {
                    return false;
                }
                match self.fmtp.get("profile-level-id") {
                    Some(id) => is_baseline_profile(id),
                    // RFC 6184 default is 420010
                    None => true,
                }
            }
            Some(VideoCodec::VP8) => true,
            None => false,
        }
    }
}

/// What the negotiator needs to know about an offer
#[derive(Debug, Clone)]
pub struct OfferSummary {
    /// Direction of the video section from the viewer's side, `None` if absent
    pub offered_direction: Option<String>,
    pub codecs: Vec<OfferedCodec>,
}

impl OfferSummary {
    /// Parse the SDP text of an offer
    pub fn parse(sdp: &str) -> Result<Self> {
        let mut session_direction = None;
        let mut in_video = false;
        let mut seen_video = false;
        let mut media_direction = None;
        let mut rtpmap: Vec<(u8, String, u32)> = Vec::new();
        let mut fmtp: HashMap<u8, HashMap<String, String>> = HashMap::new();

        for line in sdp.lines().map(str::trim) {
            if let Some(media) = line.strip_prefix("m=") {
                // Only the first video section is considered
                in_video = !seen_video && media.starts_with("video");
                seen_video |= in_video;
                continue;
            }

            let Some(attribute) = line.strip_prefix("a=") else {
                continue;
            };

            if is_direction(attribute) {
                if in_video {
                    media_direction = Some(attribute.to_string());
                } else if !seen_video {
                    session_direction = Some(attribute.to_string());
                }
                continue;
            }

            if !in_video {
                continue;
            }

            if let Some(value) = attribute.strip_prefix("rtpmap:") {
                if let Some(entry) = parse_rtpmap(value) {
                    rtpmap.push(entry);
                }
            } else if let Some(value) = attribute.strip_prefix("fmtp:") {
                if let Some((pt, params)) = parse_fmtp(value) {
                    fmtp.insert(pt, params);
                }
            }
        }

        if !seen_video {
            return Err(AppError::Negotiation("offer has no video section".to_string()));
        }

        let codecs = rtpmap
            .into_iter()
            .map(|(payload_type, name, clock_rate)| OfferedCodec {
                payload_type,
                name,
                clock_rate,
                fmtp: fmtp.remove(&payload_type).unwrap_or_default(),
            })
            .collect();

        Ok(Self {
            offered_direction: media_direction.or(session_direction),
            codecs,
        })
    }

    /// Direction this side takes for the viewer's track
    ///
    /// `recvonly` from the viewer means we only send; `sendrecv` means both.
    /// Anything else cannot carry our video.
    pub fn answer_direction(&self) -> Result<TransceiverDirection> {
        match self.offered_direction.as_deref() {
            Some("recvonly") => Ok(TransceiverDirection::SendOnly),
            Some("sendrecv") => Ok(TransceiverDirection::SendRecv),
            Some(other) => Err(AppError::Negotiation(format!(
                "unsupported media direction '{}'",
                other
            ))),
            None => Err(AppError::Negotiation(
                "offer has no recvonly or sendrecv direction".to_string(),
            )),
        }
    }

    /// First acceptable offered entry for `codec`
    pub fn select_codec(&self, codec: VideoCodec) -> Result<&OfferedCodec> {
        self.codecs
            .iter()
            .find(|c| c.codec() == Some(codec) && c.is_acceptable())
            .ok_or_else(|| {
                AppError::Negotiation(format!("codec mismatch: viewer does not accept {}", codec))
            })
    }
}

fn is_direction(attribute: &str) -> bool {
    matches!(attribute, "sendrecv" | "sendonly" | "recvonly" | "inactive")
}

/// `96 H264/90000`
fn parse_rtpmap(value: &str) -> Option<(u8, String, u32)> {
    let (pt, encoding) = value.split_once(' ')?;
    let mut parts = encoding.trim().split('/');
    let name = parts.next()?.to_string();
    let clock_rate = parts.next().and_then(|c| c.parse().ok()).unwrap_or(90000);
    Some((pt.trim().parse().ok()?, name, clock_rate))
}

/// `96 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f`
fn parse_fmtp(value: &str) -> Option<(u8, HashMap<String, String>)> {
    let (pt, params) = value.split_once(' ')?;
    let params = params
        .split(';')
        .filter_map(|p| p.split_once('='))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    Some((pt.trim().parse().ok()?, params))
}

/// Baseline or constrained baseline `profile-level-id`
fn is_baseline_profile(profile_level_id: &str) -> bool {
    if profile_level_id.len() != 6 {
        return false;
    }
    let Ok(value) = u32::from_str_radix(profile_level_id, 16) else {
        return false;
    };
    let profile_idc = (value >> 16) as u8;
    let profile_iop = (value >> 8) as u8;

    match profile_idc {
        0x42 => true,
        // Main or extended with the constrained-baseline constraint flags
        0x4d => profile_iop & 0x80 != 0,
        0x58 => profile_iop & 0xc0 == 0xc0,
        _ => false,
    }
}
