//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

use camstream::stream::SampleSink;
use camstream::video::encoder::{FrameEncoder, VideoCodec};
use camstream::video::{EncodedSample, Frame, Resolution};
use camstream::webrtc::{
    ConnectionState, IceCandidate, PeerFactory, SdpDocument, SignalingChannel, SignalingMessage,
    TransportPeer, VideoTrackConfig,
};
use camstream::{AppError, Result};

/// Turns every frame into a sample carrying the frame sequence
#[derive(Default)]
pub struct PassthroughEncoder {
    closed: bool,
}

impl FrameEncoder for PassthroughEncoder {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn codec(&self) -> VideoCodec {
        VideoCodec::H264
    }

    fn resolution(&self) -> Resolution {
        Resolution::new(64, 48)
    }

    fn encode(&mut self, frame: &Frame) -> Result<Option<EncodedSample>> {
        if self.closed {
            return Err(AppError::EncoderClosed);
        }
        Ok(Some(EncodedSample::new(
            Bytes::from(frame.sequence.to_be_bytes().to_vec()),
            Duration::from_millis(33),
            frame.sequence == 0,
            frame,
        )))
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(AppError::EncoderClosed);
        }
        self.closed = true;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Records the frame sequence of every sample written to it
#[derive(Default)]
pub struct RecordingSink {
    sequences: Mutex<Vec<u64>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn received(&self) -> Vec<u64> {
        self.sequences.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.sequences.lock().len()
    }

    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl SampleSink for RecordingSink {
    async fn write_sample(&self, sample: &EncodedSample) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::WebRtcError("broken pipe".to_string()));
        }
        self.sequences.lock().push(sample.sequence);
        Ok(())
    }
}

/// Transport peer whose connectivity is driven by the test
pub struct ScriptedPeer {
    pub session_id: String,
    pub sink: Arc<RecordingSink>,
    state: watch::Sender<ConnectionState>,
    remote: Mutex<Option<SdpDocument>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
    gathering: Option<Notify>,
}

impl ScriptedPeer {
    fn new(session_id: &str, hold_gathering: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            session_id: session_id.to_string(),
            sink: Arc::new(RecordingSink::default()),
            state,
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gathering: hold_gathering.then(Notify::new),
        }
    }

    /// Let a held ICE gathering complete
    pub fn finish_gathering(&self) {
        if let Some(gathering) = &self.gathering {
            gathering.notify_one();
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SdpDocument> {
        self.remote.lock().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }
}

#[async_trait]
impl TransportPeer for ScriptedPeer {
    async fn add_outbound_track(&self, _config: &VideoTrackConfig) -> Result<Arc<dyn SampleSink>> {
        Ok(self.sink.clone())
    }

    async fn set_remote_description(&self, offer: &SdpDocument) -> Result<()> {
        *self.remote.lock() = Some(offer.clone());
        Ok(())
    }

    async fn create_answer(&self) -> Result<SdpDocument> {
        Ok(SdpDocument::answer(format!("v=0\r\ns={}\r\n", self.session_id)))
    }

    async fn set_local_description(&self, _answer: &SdpDocument) -> Result<()> {
        Ok(())
    }

    async fn gathering_complete(&self) {
        if let Some(gathering) = &self.gathering {
            gathering.notified().await;
        }
    }

    async fn local_description(&self) -> Result<SdpDocument> {
        Ok(SdpDocument::answer(format!(
            "v=0\r\ns={}\r\na=candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host\r\n",
            self.session_id
        )))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Closed);
        Ok(())
    }
}

/// Hands out scripted peers and keeps them for inspection
#[derive(Default)]
pub struct ScriptedFactory {
    peers: Mutex<Vec<Arc<ScriptedPeer>>>,
    hold_gathering: bool,
}

impl ScriptedFactory {
    /// Peers whose ICE gathering waits for [`ScriptedPeer::finish_gathering`]
    pub fn holding_gathering() -> Self {
        Self {
            hold_gathering: true,
            ..Default::default()
        }
    }

    pub fn peer(&self, index: usize) -> Arc<ScriptedPeer> {
        self.peers.lock()[index].clone()
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerFactory for ScriptedFactory {
    async fn create_peer(&self, session_id: &str) -> Result<Arc<dyn TransportPeer>> {
        let peer = Arc::new(ScriptedPeer::new(session_id, self.hold_gathering));
        self.peers.lock().push(peer.clone());
        Ok(peer)
    }
}

/// Browser-like offer with the given direction line (may be empty)
pub fn offer_sdp(direction: &str) -> String {
    offer_with_codecs(
        direction,
        "a=rtpmap:102 H264/90000\r\n\
         a=fmtp:102 level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f\r\n\
         a=rtpmap:96 VP8/90000\r\n",
    )
}

pub fn offer_with_codecs(direction: &str, codecs: &str) -> String {
    format!(
        "v=0\r\n\
         o=- 8231796240212930811 2 IN IP4 127.0.0.1\r\n\
         s=-\r\n\
         t=0 0\r\n\
         a=group:BUNDLE 0\r\n\
         m=video 9 UDP/TLS/RTP/SAVPF 102 96\r\n\
         c=IN IP4 0.0.0.0\r\n\
         a=mid:0\r\n\
         {direction}{codecs}"
    )
}

/// Next message from the negotiator side, failing the test after a second
pub async fn next_message(remote: &mut SignalingChannel) -> SignalingMessage {
    tokio::time::timeout(Duration::from_secs(1), remote.recv())
        .await
        .expect("timed out waiting for signaling message")
        .expect("signaling channel closed")
}

/// Assert nothing arrives for a short while
pub async fn assert_silent(remote: &mut SignalingChannel) {
    let next = tokio::time::timeout(Duration::from_millis(100), remote.recv()).await;
    assert!(next.is_err(), "unexpected message: {:?}", next);
}

/// Poll `condition` until it holds, failing after two seconds
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
