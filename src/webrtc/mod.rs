//! WebRTC viewer negotiation
//!
//! # Architecture
//!
//! ```text
//! SignalingChannel --> SessionNegotiator --(per offer)--> TransportPeer
//!                                |                            |
//!                                | register / unregister      | RtcVideoTrack
//!                                v                            v
//!                          StreamFanout  ---- samples ---> SampleSink
//! ```

pub mod channel;
pub mod config;
pub mod negotiator;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod track;

pub use channel::{SignalingChannel, SignalingSender};
pub use config::{TurnServer, WebRtcConfig};
pub use negotiator::{
    NegotiationSnapshot, NegotiationState, NegotiatorConfig, SessionNegotiator,
};
pub use peer::{PeerFactory, RtcPeer, RtcPeerFactory, TransportPeer};
pub use sdp::{OfferSummary, OfferedCodec};
pub use signaling::{
    decode, encode, ConnectionState, IceCandidate, MessageType, SdpDocument, SdpType,
    SignalingMessage,
};
pub use track::{RtcVideoTrack, VideoTrackConfig};
