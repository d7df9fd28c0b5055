//! WebRTC configuration

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::video::encoder::VideoCodec;

/// WebRTC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Codec offered to viewers
    pub video_codec: VideoCodec,
    /// Outbound track ID
    pub track_id: String,
    /// Outbound stream ID
    pub stream_id: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
            video_codec: VideoCodec::H264,
            track_id: "video".to_string(),
            stream_id: "camstream".to_string(),
        }
    }
}

impl WebRtcConfig {
    /// Replace the STUN list with a single URL; an empty URL clears it
    pub fn set_stun_url(&mut self, url: &str) {
        let url = url.trim();
        self.stun_servers = if url.is_empty() {
            vec![]
        } else {
            vec![url.to_string()]
        };
    }

    /// ICE server list handed to every peer connection
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut ice_servers = vec![];

        for stun_url in self.stun_servers.iter().filter(|u| !u.is_empty()) {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            ice_servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        ice_servers
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs, tried in order
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    pub fn new(url: impl Into<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers() {
        let mut config = WebRtcConfig::default();
        config.turn_servers.push(TurnServer::new("turn:relay.local:3478", "user", "secret"));

        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(servers[1].username, "user");
    }

    #[test]
    fn test_empty_stun_url_clears_servers() {
        let mut config = WebRtcConfig::default();
        config.set_stun_url("  ");
        assert!(config.ice_servers().is_empty());

        config.set_stun_url("stun:example.org:3478");
        assert_eq!(config.stun_servers, vec!["stun:example.org:3478"]);
    }
}
