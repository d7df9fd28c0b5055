//! WebRTC peer connection management
//!
//! [`TransportPeer`] is the narrow surface the negotiator drives; [`RtcPeer`]
//! implements it on top of webrtc-rs. Tests substitute scripted peers through
//! [`PeerFactory`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, Instrument, Span};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::config::WebRtcConfig;
use super::signaling::{ConnectionState, IceCandidate, SdpDocument, SdpType};
use super::track::{RtcVideoTrack, VideoTrackConfig};
use crate::error::{AppError, Result};
use crate::stream::sink::SampleSink;

/// One viewer's transport, as seen by the negotiator
#[async_trait]
pub trait TransportPeer: Send + Sync {
    /// Attach a new outbound video track; samples written to the returned sink
    /// reach the viewer once connected
    async fn add_outbound_track(&self, config: &VideoTrackConfig) -> Result<Arc<dyn SampleSink>>;

    async fn set_remote_description(&self, offer: &SdpDocument) -> Result<()>;

    async fn create_answer(&self) -> Result<SdpDocument>;

    /// Apply the answer and start ICE gathering
    async fn set_local_description(&self, answer: &SdpDocument) -> Result<()>;

    /// Resolve once ICE gathering has completed
    async fn gathering_complete(&self);

    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Result<SdpDocument>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Connectivity updates
    fn state_watch(&self) -> watch::Receiver<ConnectionState>;

    /// Release the transport; pending waits on it end
    async fn close(&self) -> Result<()>;
}

/// Creates transport peers
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create_peer(&self, session_id: &str) -> Result<Arc<dyn TransportPeer>>;
}

/// Builds [`RtcPeer`]s sharing one webrtc API instance
pub struct RtcPeerFactory {
    api: API,
    config: WebRtcConfig,
    span: Span,
}

impl RtcPeerFactory {
    pub fn new(config: WebRtcConfig, span: Span) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(|e| {
            AppError::WebRtcError(format!("Failed to register interceptors: {}", e))
        })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, config, span })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create_peer(&self, session_id: &str) -> Result<Arc<dyn TransportPeer>> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };

        let pc = self.api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?;

        let peer = RtcPeer::new(Arc::new(pc), session_id.to_string(), self.span.clone());
        Ok(Arc::new(peer))
    }
}

/// Peer connection wrapper with event handling
pub struct RtcPeer {
    session_id: String,
    pc: Arc<RTCPeerConnection>,
    state_rx: watch::Receiver<ConnectionState>,
    gather_complete: Mutex<Option<mpsc::Receiver<()>>>,
    span: Span,
}

impl RtcPeer {
    fn new(pc: Arc<RTCPeerConnection>, session_id: String, span: Span) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);
        let state = Arc::new(state_tx);

        let handler_session = session_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = state.clone();
            let session_id = handler_session.clone();

            Box::pin(async move {
                let new_state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };

                info!("Peer {} connection state: {}", session_id, new_state);
                let _ = state.send(new_state);
            })
        }));

        Self {
            session_id,
            pc,
            state_rx,
            gather_complete: Mutex::new(None),
            span,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

fn to_rtc_description(doc: &SdpDocument) -> Result<RTCSessionDescription> {
    let sdp = doc.sdp.clone();
    let description = match doc.kind {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(AppError::Negotiation("rollback is not supported".to_string()))
        }
    };
    description.map_err(|e| AppError::Negotiation(format!("Invalid SDP {:?}: {}", doc.kind, e)))
}

fn from_rtc_description(description: &RTCSessionDescription) -> Result<SdpDocument> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(AppError::WebRtcError(format!(
                "Unexpected description type {}",
                other
            )))
        }
    };
    Ok(SdpDocument {
        kind,
        sdp: description.sdp.clone(),
    })
}

#[async_trait]
impl TransportPeer for RtcPeer {
    async fn add_outbound_track(&self, config: &VideoTrackConfig) -> Result<Arc<dyn SampleSink>> {
        let track = Arc::new(RtcVideoTrack::new(config));

        let rtp_sender = self
            .pc
            .add_track(track.as_track_local())
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add video track: {}", e)))?;

        // RTCP has to be read for the interceptors (NACK, reports) to run
        let session_id = self.session_id.clone();
        tokio::spawn(
            async move {
                let mut buf = vec![0u8; 1500];
                while rtp_sender.read(&mut buf).await.is_ok() {}
                debug!("RTCP reader for {} stopped", session_id);
            }
            .instrument(self.span.clone()),
        );

        info!("{} track added to peer {}", config.codec, self.session_id);
        Ok(track)
    }

    async fn set_remote_description(&self, offer: &SdpDocument) -> Result<()> {
        let description = to_rtc_description(offer)?;
        self.pc.set_remote_description(description).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set remote description: {}", e))
        })
    }

    async fn create_answer(&self) -> Result<SdpDocument> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        from_rtc_description(&answer)
    }

    async fn set_local_description(&self, answer: &SdpDocument) -> Result<()> {
        let description = to_rtc_description(answer)?;

        // The promise has to exist before gathering starts
        *self.gather_complete.lock().await = Some(self.pc.gathering_complete_promise().await);

        self.pc.set_local_description(description).await.map_err(|e| {
            AppError::Negotiation(format!("Failed to set local description: {}", e))
        })
    }

    async fn gathering_complete(&self) {
        let receiver = self.gather_complete.lock().await.take();
        if let Some(mut receiver) = receiver {
            let _ = receiver.recv().await;
        }
    }

    async fn local_description(&self) -> Result<SdpDocument> {
        let description = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| AppError::Negotiation("No local description".to_string()))?;
        from_rtc_description(&description)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to add ICE candidate: {}", e)))
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollback_rejected() {
        let rollback = SdpDocument {
            kind: SdpType::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(&rollback).is_err());
    }

    #[tokio::test]
    async fn test_factory_creates_peer() {
        let factory = RtcPeerFactory::new(WebRtcConfig::default(), Span::none()).unwrap();
        let peer = factory.create_peer("session-1").await.unwrap();
        assert_eq!(*peer.state_watch().borrow(), ConnectionState::New);

        let sink = peer.add_outbound_track(&VideoTrackConfig::default()).await;
        assert!(sink.is_ok());
        peer.close().await.unwrap();
    }
}
