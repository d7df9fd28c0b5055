//! WebRTC signaling types and messages
//!
//! Every message on the signaling channel is one JSON envelope:
//!
//! ```text
//! { "sender": bool, "type": "Connected"|"SDP"|"ICE"|"Error",
//!   "sdp": base64(JSON(SdpDocument)), "data": string, "id": string }
//! ```
//!
//! Older peers send the same envelope with capitalized field names
//! (`Sender`, `WSType`, `SDP`, `Data`); both spellings are accepted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Advisory carried in a `Connected` message's data
pub const DOUBLE_STREAMER: &str = "double streamer";

/// Envelope kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Connected,
    #[serde(rename = "SDP")]
    Sdp,
    #[serde(rename = "ICE")]
    Ice,
    Error,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Connected
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Connected => write!(f, "Connected"),
            MessageType::Sdp => write!(f, "SDP"),
            MessageType::Ice => write!(f, "ICE"),
            MessageType::Error => write!(f, "Error"),
        }
    }
}

/// Signaling envelope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingMessage {
    /// Set on messages produced by this side
    #[serde(alias = "Sender")]
    pub sender: bool,
    #[serde(rename = "type", alias = "WSType")]
    pub kind: MessageType,
    /// base64(JSON(SdpDocument)), empty unless `kind` is SDP
    #[serde(alias = "SDP")]
    pub sdp: String,
    /// Free-form payload: advisory flag, ICE candidate JSON or error text
    #[serde(alias = "Data")]
    pub data: String,
    /// Correlation id of the viewer
    #[serde(alias = "Id", alias = "ID")]
    pub id: String,
}

impl SignalingMessage {
    /// Readiness announcement sent once on startup
    pub fn connected(double_streamer: bool) -> Self {
        Self {
            sender: true,
            kind: MessageType::Connected,
            data: if double_streamer {
                DOUBLE_STREAMER.to_string()
            } else {
                String::new()
            },
            ..Default::default()
        }
    }

    /// Offer from a viewer
    pub fn offer(id: impl Into<String>, sdp: impl Into<String>) -> Result<Self> {
        Ok(Self {
            sender: false,
            kind: MessageType::Sdp,
            sdp: encode(&SdpDocument::offer(sdp))?,
            id: id.into(),
            ..Default::default()
        })
    }

    /// Answer for the viewer with correlation id `id`
    pub fn answer(id: impl Into<String>, sdp: impl Into<String>) -> Result<Self> {
        Ok(Self {
            sender: true,
            kind: MessageType::Sdp,
            sdp: encode(&SdpDocument::answer(sdp))?,
            id: id.into(),
            ..Default::default()
        })
    }

    /// One remote ICE candidate
    pub fn ice(id: impl Into<String>, candidate: &IceCandidate) -> Result<Self> {
        Ok(Self {
            sender: false,
            kind: MessageType::Ice,
            data: serde_json::to_string(candidate)?,
            id: id.into(),
            ..Default::default()
        })
    }

    /// Diagnostic for a failed negotiation
    pub fn error(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            sender: true,
            kind: MessageType::Error,
            data: text.into(),
            id: id.into(),
            ..Default::default()
        }
    }

    /// Whether this message carries the double-streamer advisory
    pub fn is_double_streamer(&self) -> bool {
        self.data.trim() == DOUBLE_STREAMER
    }

    /// Decode the SDP document carried by an SDP message
    pub fn sdp_document(&self) -> Result<SdpDocument> {
        if self.sdp.is_empty() {
            return Err(AppError::Signaling("SDP message without document".to_string()));
        }
        decode(&self.sdp)
    }

    /// Decode the candidate carried by an ICE message
    pub fn ice_candidate(&self) -> Result<IceCandidate> {
        Ok(serde_json::from_str(&self.data)?)
    }

    /// Serialize for a text frame
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Kind of SDP document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description as exchanged inside the envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpDocument {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SdpDocument {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Transport connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// `base64(json(value))`
pub fn encode<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_vec(value)?;
    Ok(STANDARD.encode(json))
}

/// Exact inverse of [`encode`]
pub fn decode<T: DeserializeOwned>(input: &str) -> Result<T> {
    let bytes = STANDARD.decode(input.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}
