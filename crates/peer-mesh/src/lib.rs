//! Peer session orchestration for rooms whose participants negotiate direct
//! WebRTC connections through a relay that only forwards opaque envelopes.
//!
//! The relay channel ([`signaling`]) feeds a single per-room event loop
//! ([`session::RoomSession`]) which tracks membership ([`membership`]) and
//! drives one negotiation state machine per remote participant. Transport
//! construction is delegated to a
//! [`connection::PeerConnector`]; [`rtc::RtcConnector`] is the webrtc-rs backed
//! implementation.

pub mod candidates;
pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod membership;
pub mod rtc;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::MeshConfig;
pub use connection::{
    ConnectionEvents, IceCandidate, PeerConnection, PeerConnector, RemoteTrack, SdpKind,
    SessionDescription, TransportState,
};
pub use error::{MeshError, MeshResult};
pub use media::{LocalTrack, MediaKind, MediaSource, StaticMediaSource, SyntheticMediaSource};
pub use session::{
    Disposition, NegotiationState, PeerRole, RoomSession, SessionEnd, SessionHandle,
    SessionNotice, SessionSnapshot, SessionState, SuppressReason,
};
pub use signaling::{Envelope, EnvelopeKind, RelayEvent, Signal, SignalSink};

/// Opaque participant identifier, unique within a room.
pub type PeerId = String;
