//! Session negotiation over an in-memory signaling channel

mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::Span;

use camstream::stream::{FanoutConfig, StreamFanout, TransceiverDirection};
use camstream::video::{Frame, Frames, Resolution};
use camstream::webrtc::{
    ConnectionState, IceCandidate, MessageType, NegotiationState, NegotiatorConfig, SdpType,
    SessionNegotiator, SignalingChannel, SignalingMessage,
};
use common::{
    assert_silent, next_message, offer_sdp, offer_with_codecs, wait_until, PassthroughEncoder,
    ScriptedFactory,
};

struct Harness {
    factory: Arc<ScriptedFactory>,
    fanout: StreamFanout,
    negotiator: Arc<SessionNegotiator>,
    remote: SignalingChannel,
    run: JoinHandle<camstream::Result<()>>,
}

impl Harness {
    fn new(config: NegotiatorConfig) -> Self {
        Self::with_factory(config, ScriptedFactory::default())
    }

    fn with_factory(config: NegotiatorConfig, factory: ScriptedFactory) -> Self {
        let factory = Arc::new(factory);
        let fanout = StreamFanout::new(
            Box::new(PassthroughEncoder::default()),
            FanoutConfig::default(),
            Span::none(),
        );
        let (mut local, remote) = SignalingChannel::in_memory();
        let negotiator = Arc::new(SessionNegotiator::new(
            factory.clone(),
            fanout.clone(),
            local.sender(),
            config,
            Span::none(),
        ));

        let runner = negotiator.clone();
        let run = tokio::spawn(async move { runner.run(&mut local).await });

        Self {
            factory,
            fanout,
            negotiator,
            remote,
            run,
        }
    }

    /// Harness with the readiness announcement already consumed
    async fn ready(config: NegotiatorConfig) -> Self {
        let mut harness = Self::new(config);
        let hello = next_message(&mut harness.remote).await;
        assert_eq!(hello.kind, MessageType::Connected);
        harness
    }

    async fn offer(&self, id: &str, sdp: String) {
        self.remote
            .send(SignalingMessage::offer(id, sdp).unwrap())
            .await
            .unwrap();
    }

    /// Send a recvonly offer and wait for its answer
    async fn negotiate(&mut self, id: &str) -> SignalingMessage {
        self.offer(id, offer_sdp("a=recvonly\r\n")).await;
        let answer = next_message(&mut self.remote).await;
        assert_eq!(answer.kind, MessageType::Sdp);
        answer
    }

    fn active_sessions(&self) -> usize {
        self.fanout.stats().active_sessions
    }

    fn states(&self) -> Vec<NegotiationState> {
        self.negotiator
            .snapshot()
            .into_iter()
            .map(|s| s.state)
            .collect()
    }
}

fn viewer_message(kind: MessageType, id: &str, data: &str) -> SignalingMessage {
    SignalingMessage {
        sender: false,
        kind,
        data: data.to_string(),
        id: id.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn announces_readiness_then_answers_offer() {
    let mut h = Harness::new(NegotiatorConfig::default());

    let hello = next_message(&mut h.remote).await;
    assert_eq!(hello.kind, MessageType::Connected);
    assert!(hello.sender);
    assert!(hello.data.is_empty());

    let answer = h.negotiate("viewer-1").await;
    assert!(answer.sender);
    assert_eq!(answer.id, "viewer-1");
    let document = answer.sdp_document().unwrap();
    assert_eq!(document.kind, SdpType::Answer);
    assert!(document.sdp.contains("a=candidate:"));

    assert_eq!(h.factory.created(), 1);
    let remote = h.factory.peer(0).remote_description().unwrap();
    assert_eq!(remote.kind, SdpType::Offer);

    let snapshot = h.negotiator.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].correlation_id, "viewer-1");
    assert_eq!(snapshot[0].state, NegotiationState::Negotiating);
    assert_eq!(snapshot[0].direction, Some(TransceiverDirection::SendOnly));

    assert_silent(&mut h.remote).await;
}

#[tokio::test]
async fn sendrecv_offer_is_answered_both_ways() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.offer("viewer-1", offer_sdp("a=sendrecv\r\n")).await;

    let answer = next_message(&mut h.remote).await;
    assert_eq!(answer.kind, MessageType::Sdp);
    assert_eq!(
        h.negotiator.snapshot()[0].direction,
        Some(TransceiverDirection::SendRecv)
    );
}

#[tokio::test]
async fn offer_without_direction_gets_one_error() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.offer("viewer-1", offer_sdp("")).await;

    let reply = next_message(&mut h.remote).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.id, "viewer-1");
    assert!(reply.data.contains("direction"), "{}", reply.data);
    assert_silent(&mut h.remote).await;

    assert_eq!(h.factory.created(), 0);
    wait_until(|| h.states() == vec![NegotiationState::Failed]).await;
}

#[tokio::test]
async fn offer_without_acceptable_codec_gets_error() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.offer(
        "viewer-1",
        offer_with_codecs(
            "a=recvonly\r\n",
            "a=rtpmap:102 H264/90000\r\n\
             a=fmtp:102 packetization-mode=0;profile-level-id=42e01f\r\n\
             a=rtpmap:96 VP8/90000\r\n",
        ),
    )
    .await;

    let reply = next_message(&mut h.remote).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert!(reply.data.contains("codec mismatch"), "{}", reply.data);
    assert_silent(&mut h.remote).await;
}

#[tokio::test]
async fn connectivity_drives_fanout_registration() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;
    let peer = h.factory.peer(0);
    assert_eq!(h.active_sessions(), 0);

    peer.set_state(ConnectionState::Connecting);
    peer.set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;
    wait_until(|| h.states() == vec![NegotiationState::Connected]).await;

    peer.set_state(ConnectionState::Disconnected);
    wait_until(|| h.active_sessions() == 0).await;
    wait_until(|| peer.is_closed()).await;
    wait_until(|| h.states() == vec![NegotiationState::Disconnected]).await;
    assert_silent(&mut h.remote).await;
}

#[tokio::test]
async fn transport_failure_ends_failed() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;
    let peer = h.factory.peer(0);

    peer.set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;
    peer.set_state(ConnectionState::Failed);

    wait_until(|| h.states() == vec![NegotiationState::Failed]).await;
    assert_eq!(h.active_sessions(), 0);
    assert!(peer.is_closed());
}

#[tokio::test]
async fn repeat_offer_replaces_previous_negotiation() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;
    h.factory.peer(0).set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;

    h.negotiate("viewer-1").await;
    assert_eq!(h.factory.created(), 2);

    let first = h.factory.peer(0);
    let second = h.factory.peer(1);
    assert!(first.is_closed());
    assert!(!second.is_closed());
    assert_eq!(h.active_sessions(), 0);

    second.set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;
    assert_eq!(
        h.states(),
        vec![NegotiationState::Disconnected, NegotiationState::Connected]
    );
}

#[tokio::test]
async fn replaced_unanswered_offer_still_gets_a_reply() {
    let mut h = Harness::with_factory(
        NegotiatorConfig::default(),
        ScriptedFactory::holding_gathering(),
    );
    let hello = next_message(&mut h.remote).await;
    assert_eq!(hello.kind, MessageType::Connected);

    h.offer("viewer-1", offer_sdp("a=recvonly\r\n")).await;
    wait_until(|| h.factory.created() == 1).await;
    h.offer("viewer-1", offer_sdp("a=recvonly\r\n")).await;

    let first = next_message(&mut h.remote).await;
    assert_eq!(first.kind, MessageType::Error);
    assert_eq!(first.id, "viewer-1");
    assert!(first.data.contains("superseded"), "{}", first.data);
    assert!(h.factory.peer(0).is_closed());

    wait_until(|| h.factory.created() == 2).await;
    h.factory.peer(1).finish_gathering();
    let second = next_message(&mut h.remote).await;
    assert_eq!(second.kind, MessageType::Sdp);
    assert_eq!(second.id, "viewer-1");
    assert_eq!(second.sdp_document().unwrap().kind, SdpType::Answer);

    assert_silent(&mut h.remote).await;
    assert_eq!(
        h.states(),
        vec![NegotiationState::Disconnected, NegotiationState::Negotiating]
    );
}

#[tokio::test]
async fn shutdown_before_answer_stays_silent() {
    let mut h = Harness::with_factory(
        NegotiatorConfig::default(),
        ScriptedFactory::holding_gathering(),
    );
    next_message(&mut h.remote).await;

    h.offer("viewer-1", offer_sdp("a=recvonly\r\n")).await;
    wait_until(|| h.factory.created() == 1).await;
    h.negotiator.shutdown().await;

    assert!(h.factory.peer(0).is_closed());
    assert_silent(&mut h.remote).await;
}

#[tokio::test]
async fn double_streamer_keeps_concurrent_viewers() {
    let config = NegotiatorConfig {
        double_streamer: true,
        ..Default::default()
    };
    let mut h = Harness::new(config);
    let hello = next_message(&mut h.remote).await;
    assert!(hello.is_double_streamer());

    h.negotiate("viewer-1").await;
    h.negotiate("viewer-1").await;
    assert_eq!(h.factory.created(), 2);
    assert!(!h.factory.peer(0).is_closed());

    h.factory.peer(0).set_state(ConnectionState::Connected);
    h.factory.peer(1).set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 2).await;
}

#[tokio::test]
async fn double_streamer_advisory_from_remote() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    assert!(!h.negotiator.double_streamer());

    h.remote
        .send(viewer_message(MessageType::Connected, "", "double streamer"))
        .await
        .unwrap();
    wait_until(|| h.negotiator.double_streamer()).await;

    h.negotiate("viewer-1").await;
    h.negotiate("viewer-1").await;
    assert!(!h.factory.peer(0).is_closed());
}

#[tokio::test]
async fn double_streamer_offer_leaves_connected_viewer_alone() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;
    let first = h.factory.peer(0);
    first.set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;

    let mut offer = SignalingMessage::offer("viewer-1", offer_sdp("a=recvonly\r\n")).unwrap();
    offer.data = "double streamer".to_string();
    h.remote.send(offer).await.unwrap();
    let answer = next_message(&mut h.remote).await;
    assert_eq!(answer.kind, MessageType::Sdp);
    assert_eq!(answer.id, "viewer-1");

    assert!(h.negotiator.double_streamer());
    assert!(!first.is_closed());
    assert_eq!(h.active_sessions(), 1);

    h.factory.peer(1).set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 2).await;
    assert_eq!(
        h.states(),
        vec![NegotiationState::Connected, NegotiationState::Connected]
    );
}

#[tokio::test]
async fn remote_candidates_reach_latest_peer() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;

    let candidate =
        IceCandidate::new("candidate:1 1 udp 2122260223 192.168.1.20 54321 typ host").with_mid("0", 0);
    h.remote
        .send(SignalingMessage::ice("viewer-1", &candidate).unwrap())
        .await
        .unwrap();
    h.remote
        .send(SignalingMessage::ice("someone-else", &candidate).unwrap())
        .await
        .unwrap();

    let peer = h.factory.peer(0);
    wait_until(|| peer.candidates().len() == 1).await;
    let applied = &peer.candidates()[0];
    assert_eq!(applied.candidate, candidate.candidate);
    assert_eq!(applied.sdp_mid.as_deref(), Some("0"));
    assert_silent(&mut h.remote).await;
}

#[tokio::test]
async fn viewer_error_terminates_negotiation() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;
    let peer = h.factory.peer(0);
    peer.set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;

    h.remote
        .send(viewer_message(MessageType::Error, "viewer-1", "camera tab closed"))
        .await
        .unwrap();

    wait_until(|| peer.is_closed()).await;
    wait_until(|| h.states() == vec![NegotiationState::Disconnected]).await;
    assert_eq!(h.active_sessions(), 0);
    assert_silent(&mut h.remote).await;
}

#[tokio::test]
async fn own_messages_and_answers_are_ignored() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;

    // Echo of something this side sent
    h.remote
        .send(SignalingMessage::answer("viewer-1", "v=0\r\n").unwrap())
        .await
        .unwrap();
    // A viewer answer has nothing to answer
    let mut answer = SignalingMessage::answer("viewer-1", "v=0\r\n").unwrap();
    answer.sender = false;
    h.remote.send(answer).await.unwrap();

    assert_silent(&mut h.remote).await;
    assert_eq!(h.factory.created(), 0);
    assert!(h.negotiator.snapshot().is_empty());
}

#[tokio::test]
async fn malformed_offer_gets_error() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    let message = SignalingMessage {
        sender: false,
        kind: MessageType::Sdp,
        sdp: "%%% not base64 %%%".to_string(),
        id: "viewer-1".to_string(),
        ..Default::default()
    };
    h.remote.send(message).await.unwrap();

    let reply = next_message(&mut h.remote).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert!(reply.data.starts_with("malformed offer"), "{}", reply.data);
    assert_eq!(h.factory.created(), 0);

    let snapshot = h.negotiator.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].correlation_id, "viewer-1");
    assert_eq!(snapshot[0].state, NegotiationState::Failed);
    assert_eq!(snapshot[0].direction, None);
}

#[tokio::test]
async fn shutdown_releases_every_peer() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    h.negotiate("viewer-1").await;
    h.negotiate("viewer-2").await;
    h.factory.peer(0).set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;

    h.negotiator.shutdown().await;

    assert!(h.factory.peer(0).is_closed());
    assert!(h.factory.peer(1).is_closed());
    assert_eq!(h.active_sessions(), 0);
    let result = tokio::time::timeout(Duration::from_secs(1), h.run).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}

#[tokio::test]
async fn run_ends_when_channel_closes() {
    let h = Harness::ready(NegotiatorConfig::default()).await;
    drop(h.remote);
    let result = tokio::time::timeout(Duration::from_secs(1), h.run).await;
    assert!(matches!(result, Ok(Ok(Ok(())))));
}

#[tokio::test]
async fn connected_viewer_receives_frames() {
    let mut h = Harness::ready(NegotiatorConfig::default()).await;
    let (frame_tx, frames) = Frames::channel(8);
    h.fanout.start(frames).await.unwrap();

    h.negotiate("viewer-1").await;
    let peer = h.factory.peer(0);

    // Not connected yet: nothing is delivered
    frame_tx
        .send(Frame::from_vec(vec![0; 48], Resolution::new(4, 4), 0))
        .await
        .unwrap();
    wait_until(|| h.fanout.stats().frames_received == 1).await;
    assert_eq!(peer.sink.count(), 0);

    peer.set_state(ConnectionState::Connected);
    wait_until(|| h.active_sessions() == 1).await;
    for sequence in 1..4 {
        frame_tx
            .send(Frame::from_vec(vec![0; 48], Resolution::new(4, 4), sequence))
            .await
            .unwrap();
    }
    wait_until(|| peer.sink.count() == 3).await;
    assert_eq!(peer.sink.received(), vec![1, 2, 3]);

    h.negotiator.shutdown().await;
    h.fanout.stop().await;
}
