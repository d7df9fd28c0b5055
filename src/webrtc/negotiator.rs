//! Per-viewer session negotiation
//!
//! Each accepted offer runs as its own task:
//!
//! ```text
//! AwaitingOffer -> Negotiating -> Connected -> Disconnected
//!                       |              |
//!                       +-> Failed <---+
//! ```
//!
//! The task decides direction and codec from the offer, builds the transport
//! peer, answers once ICE gathering is complete and then follows the peer's
//! connectivity: connected registers the viewer with the fan-out, anything
//! terminal unregisters it and releases the peer. Cancelling the task (viewer
//! error, replacement offer, shutdown) takes the same cleanup path.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use super::channel::{SignalingChannel, SignalingSender};
use super::config::WebRtcConfig;
use super::peer::{PeerFactory, TransportPeer};
use super::sdp::OfferSummary;
use super::signaling::{ConnectionState, MessageType, SdpDocument, SdpType, SignalingMessage};
use super::track::VideoTrackConfig;
use crate::error::{AppError, Result};
use crate::stream::fanout::StreamFanout;
use crate::stream::session::{TransceiverDirection, ViewerSession};
use crate::video::encoder::VideoCodec;

/// Negotiation lifecycle of one offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    AwaitingOffer,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Disconnected | NegotiationState::Failed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::AwaitingOffer => write!(f, "awaiting-offer"),
            NegotiationState::Negotiating => write!(f, "negotiating"),
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Disconnected => write!(f, "disconnected"),
            NegotiationState::Failed => write!(f, "failed"),
        }
    }
}

/// Negotiator settings
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    /// Codec the viewer must accept
    pub codec: VideoCodec,
    /// Outbound track identity
    pub track: VideoTrackConfig,
    /// Announce readiness with a `Connected` message when run starts
    pub send_connected: bool,
    /// Allow several concurrent negotiations per correlation id from the start
    pub double_streamer: bool,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            track: VideoTrackConfig::default(),
            send_connected: true,
            double_streamer: false,
        }
    }
}

impl NegotiatorConfig {
    pub fn from_webrtc(config: &WebRtcConfig) -> Self {
        Self {
            codec: config.video_codec,
            track: VideoTrackConfig {
                track_id: config.track_id.clone(),
                stream_id: config.stream_id.clone(),
                codec: config.video_codec,
            },
            ..Default::default()
        }
    }
}

/// Point-in-time view of one negotiation
#[derive(Debug, Clone)]
pub struct NegotiationSnapshot {
    pub session_id: String,
    pub correlation_id: String,
    pub state: NegotiationState,
    pub direction: Option<TransceiverDirection>,
}

type PeerSlot = Arc<Mutex<Option<Arc<dyn TransportPeer>>>>;

struct Negotiation {
    correlation_id: String,
    order: u64,
    state: watch::Receiver<NegotiationState>,
    direction: Arc<Mutex<Option<TransceiverDirection>>>,
    peer: PeerSlot,
    cancel: CancellationToken,
    /// Set when a newer offer for the same viewer cancels this one
    superseded: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Negotiation {
    fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

/// Drives SDP offer/answer for every viewer on a signaling channel
pub struct SessionNegotiator {
    factory: Arc<dyn PeerFactory>,
    fanout: StreamFanout,
    sender: SignalingSender,
    config: NegotiatorConfig,
    negotiations: Mutex<HashMap<String, Negotiation>>,
    next_order: AtomicU64,
    double_streamer: AtomicBool,
    cancel: CancellationToken,
    span: Span,
}

impl SessionNegotiator {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        fanout: StreamFanout,
        sender: SignalingSender,
        config: NegotiatorConfig,
        span: Span,
    ) -> Self {
        let double_streamer = AtomicBool::new(config.double_streamer);
        Self {
            factory,
            fanout,
            sender,
            config,
            negotiations: Mutex::new(HashMap::new()),
            next_order: AtomicU64::new(0),
            double_streamer,
            cancel: CancellationToken::new(),
            span,
        }
    }

    /// Consume the channel until it closes or [`shutdown`](Self::shutdown) is called
    pub async fn run(&self, channel: &mut SignalingChannel) -> Result<()> {
        if self.config.send_connected {
            self.sender
                .send(SignalingMessage::connected(self.config.double_streamer))
                .await?;
        }

        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = channel.recv() => message,
            };
            match message {
                Some(message) => self.handle_message(message).await,
                None => {
                    info!("Signaling channel closed");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Process one inbound signaling message
    pub async fn handle_message(&self, message: SignalingMessage) {
        if message.sender {
            trace!("Ignoring own {} echo", message.kind);
            return;
        }

        match message.kind {
            MessageType::Connected => {
                if message.is_double_streamer() {
                    info!("Double streamer announced, repeat offers add viewers");
                    self.double_streamer.store(true, Ordering::SeqCst);
                } else {
                    debug!("Remote side connected");
                }
            }
            MessageType::Sdp => self.handle_sdp(message).await,
            MessageType::Ice => self.handle_ice(message).await,
            MessageType::Error => {
                warn!("Viewer {:?} reported error: {}", message.id, message.data);
                self.terminate(&message.id);
            }
        }
    }

    async fn handle_sdp(&self, message: SignalingMessage) {
        let document = match message.sdp_document() {
            Ok(document) => document,
            Err(e) => {
                warn!("Malformed offer from {:?}: {}", message.id, e);
                self.record_failed(&message.id);
                self.reply_error(&message.id, format!("malformed offer: {}", e))
                    .await;
                return;
            }
        };

        if document.kind != SdpType::Offer {
            warn!("Ignoring {:?} description from {:?}", document.kind, message.id);
            return;
        }
        if self.cancel.is_cancelled() {
            warn!("Negotiator shutting down, dropping offer from {:?}", message.id);
            return;
        }
        if message.is_double_streamer() {
            self.double_streamer.store(true, Ordering::SeqCst);
        }

        self.start_negotiation(message.id, document);
    }

    fn start_negotiation(&self, correlation_id: String, offer: SdpDocument) {
        let session_id = uuid::Uuid::new_v4().to_string();
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        let (state_tx, state_rx) = watch::channel(NegotiationState::AwaitingOffer);
        let direction = Arc::new(Mutex::new(None));
        let peer: PeerSlot = Arc::new(Mutex::new(None));
        let cancel = self.cancel.child_token();
        let superseded = Arc::new(AtomicBool::new(false));

        let mut negotiations = self.negotiations.lock();
        negotiations.retain(|_, n| !n.is_finished());

        let mut previous = Vec::new();
        if !self.double_streamer.load(Ordering::SeqCst) {
            for existing in negotiations
                .values_mut()
                .filter(|n| n.correlation_id == correlation_id)
            {
                info!("Repeat offer from {:?} replaces the previous negotiation", correlation_id);
                existing.superseded.store(true, Ordering::SeqCst);
                existing.cancel.cancel();
                previous.extend(existing.handle.take());
            }
        }

        let task = NegotiationTask {
            session_id: session_id.clone(),
            correlation_id: correlation_id.clone(),
            offer,
            factory: self.factory.clone(),
            fanout: self.fanout.clone(),
            sender: self.sender.clone(),
            config: self.config.clone(),
            state: state_tx,
            direction: direction.clone(),
            peer: peer.clone(),
            cancel: cancel.clone(),
            superseded: superseded.clone(),
            answered: AtomicBool::new(false),
        };
        let span = info_span!(
            parent: &self.span,
            "negotiation",
            viewer = %correlation_id,
            session = %session_id
        );
        let handle = tokio::spawn(
            async move {
                for handle in previous {
                    let _ = handle.await;
                }
                task.run().await;
            }
            .instrument(span),
        );

        negotiations.insert(
            session_id,
            Negotiation {
                correlation_id,
                order,
                state: state_rx,
                direction,
                peer,
                cancel,
                superseded,
                handle: Some(handle),
            },
        );
    }

    /// Keep an offer that could not be decoded visible as failed
    fn record_failed(&self, correlation_id: &str) {
        let (_, state) = watch::channel(NegotiationState::Failed);
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        self.negotiations.lock().insert(
            uuid::Uuid::new_v4().to_string(),
            Negotiation {
                correlation_id: correlation_id.to_string(),
                order,
                state,
                direction: Arc::new(Mutex::new(None)),
                peer: Arc::new(Mutex::new(None)),
                cancel: CancellationToken::new(),
                superseded: Arc::new(AtomicBool::new(false)),
                handle: None,
            },
        );
    }

    async fn handle_ice(&self, message: SignalingMessage) {
        let candidate = match message.ice_candidate() {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Malformed ICE candidate from {:?}: {}", message.id, e);
                return;
            }
        };

        let peer = {
            let negotiations = self.negotiations.lock();
            negotiations
                .values()
                .filter(|n| n.correlation_id == message.id && !n.is_finished())
                .max_by_key(|n| n.order)
                .and_then(|n| n.peer.lock().clone())
        };

        match peer {
            Some(peer) => {
                if let Err(e) = peer.add_ice_candidate(candidate).await {
                    warn!("Failed to apply candidate for {:?}: {}", message.id, e);
                }
            }
            None => debug!("No live negotiation for {:?}, dropping candidate", message.id),
        }
    }

    /// Cancel every live negotiation of a viewer
    fn terminate(&self, correlation_id: &str) {
        let negotiations = self.negotiations.lock();
        for negotiation in negotiations
            .values()
            .filter(|n| n.correlation_id == correlation_id)
        {
            negotiation.cancel.cancel();
        }
    }

    async fn reply_error(&self, correlation_id: &str, text: String) {
        if let Err(e) = self
            .sender
            .send(SignalingMessage::error(correlation_id, text))
            .await
        {
            warn!("Failed to send error to {:?}: {}", correlation_id, e);
        }
    }

    /// State of every known negotiation, oldest first
    pub fn snapshot(&self) -> Vec<NegotiationSnapshot> {
        let negotiations = self.negotiations.lock();
        let mut entries: Vec<(u64, NegotiationSnapshot)> = negotiations
            .iter()
            .map(|(session_id, n)| {
                (
                    n.order,
                    NegotiationSnapshot {
                        session_id: session_id.clone(),
                        correlation_id: n.correlation_id.clone(),
                        state: *n.state.borrow(),
                        direction: *n.direction.lock(),
                    },
                )
            })
            .collect();
        entries.sort_by_key(|(order, _)| *order);
        entries.into_iter().map(|(_, snapshot)| snapshot).collect()
    }

    /// Whether repeat offers currently add viewers instead of replacing them
    pub fn double_streamer(&self) -> bool {
        self.double_streamer.load(Ordering::SeqCst)
    }

    /// Cancel every negotiation and wait for their cleanup
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut negotiations = self.negotiations.lock();
            negotiations
                .values_mut()
                .filter_map(|n| n.handle.take())
                .collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("Session negotiator stopped");
    }
}

struct NegotiationTask {
    session_id: String,
    correlation_id: String,
    offer: SdpDocument,
    factory: Arc<dyn PeerFactory>,
    fanout: StreamFanout,
    sender: SignalingSender,
    config: NegotiatorConfig,
    state: watch::Sender<NegotiationState>,
    direction: Arc<Mutex<Option<TransceiverDirection>>>,
    peer: PeerSlot,
    cancel: CancellationToken,
    superseded: Arc<AtomicBool>,
    answered: AtomicBool,
}

impl NegotiationTask {
    async fn run(self) {
        self.state.send_replace(NegotiationState::Negotiating);

        let established = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.establish() => Some(result),
        };

        let terminal = match established {
            Some(Ok((peer, session))) => self.follow(&peer, &session).await,
            Some(Err(e)) => {
                warn!("Negotiation failed: {}", e);
                self.reply_error(&e).await;
                NegotiationState::Failed
            }
            None => {
                debug!("Negotiation cancelled before connecting");
                // A replaced offer that was never answered still gets its one reply
                if self.superseded.load(Ordering::SeqCst) && !self.answered.load(Ordering::SeqCst) {
                    self.reply_error(&AppError::Negotiation(
                        "superseded by a newer offer".to_string(),
                    ))
                    .await;
                }
                NegotiationState::Disconnected
            }
        };

        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                debug!("Closing peer: {}", e);
            }
        }
        self.state.send_replace(terminal);
        info!("Negotiation ended: {}", terminal);
    }

    /// Offer to sent answer
    async fn establish(&self) -> Result<(Arc<dyn TransportPeer>, Arc<ViewerSession>)> {
        let summary = OfferSummary::parse(&self.offer.sdp)?;
        let direction = summary.answer_direction()?;
        let offered = summary.select_codec(self.config.codec)?;
        debug!(
            "Offer accepted: {} as payload type {}, answering {}",
            self.config.codec, offered.payload_type, direction
        );
        *self.direction.lock() = Some(direction);

        let peer = self.factory.create_peer(&self.session_id).await?;
        *self.peer.lock() = Some(peer.clone());

        let sink = peer.add_outbound_track(&self.config.track).await?;
        let session = Arc::new(ViewerSession::with_id(
            self.session_id.clone(),
            self.correlation_id.clone(),
            direction,
            sink,
        ));

        peer.set_remote_description(&self.offer).await?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(&answer).await?;

        // No trickle: the answer goes out with the full candidate set
        peer.gathering_complete().await;
        let local = peer.local_description().await?;

        self.sender
            .send(SignalingMessage::answer(self.correlation_id.clone(), local.sdp)?)
            .await?;
        self.answered.store(true, Ordering::SeqCst);
        info!("Answer sent");

        Ok((peer, session))
    }

    /// Track connectivity until the transport ends or the task is cancelled
    async fn follow(
        &self,
        peer: &Arc<dyn TransportPeer>,
        session: &Arc<ViewerSession>,
    ) -> NegotiationState {
        let mut state_rx = peer.state_watch();
        let mut registered = false;

        let terminal = loop {
            let current = *state_rx.borrow_and_update();
            match current {
                ConnectionState::Connected if !registered => {
                    session.activate();
                    if let Err(e) = self.fanout.register_session(session.clone()).await {
                        warn!("Cannot register viewer: {}", e);
                        break NegotiationState::Failed;
                    }
                    registered = true;
                    self.state.send_replace(NegotiationState::Connected);
                    info!("Viewer connected");
                }
                ConnectionState::Disconnected | ConnectionState::Closed => {
                    break NegotiationState::Disconnected
                }
                ConnectionState::Failed => break NegotiationState::Failed,
                _ => {}
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break NegotiationState::Disconnected,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break NegotiationState::Disconnected;
                    }
                }
            }
        };

        if registered {
            match self.fanout.unregister_session(session.id()).await {
                Ok(_) | Err(AppError::FanoutStopped) => {}
                Err(e) => warn!("Unregistering viewer: {}", e),
            }
        }
        session.begin_close();
        session.mark_closed();
        terminal
    }

    async fn reply_error(&self, error: &AppError) {
        let text = match error {
            AppError::Negotiation(reason) => reason.clone(),
            other => other.to_string(),
        };
        if let Err(e) = self
            .sender
            .send(SignalingMessage::error(self.correlation_id.clone(), text))
            .await
        {
            warn!("Failed to send error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(NegotiationState::Failed.is_terminal());
        assert!(NegotiationState::Disconnected.is_terminal());
        assert!(!NegotiationState::Connected.is_terminal());
        assert_eq!(NegotiationState::AwaitingOffer.to_string(), "awaiting-offer");
    }

    #[test]
    fn test_config_follows_webrtc_settings() {
        let webrtc = WebRtcConfig {
            track_id: "cam".to_string(),
            ..Default::default()
        };
        let config = NegotiatorConfig::from_webrtc(&webrtc);
        assert_eq!(config.track.track_id, "cam");
        assert_eq!(config.track.codec, config.codec);
        assert!(config.send_connected);
    }
}
