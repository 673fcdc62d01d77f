use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::media::{LocalTrack, MediaKind};
use crate::session::{PeerEvent, PeerEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Negotiation description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    #[serde(default)]
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connectivity candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
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
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
}

/// Callback fan-in for a single connection handle.
///
/// Implementations of [`PeerConnector`] hand these to the underlying
/// transport's callbacks; every call becomes a message on the owning room's
/// event queue, tagged with the record generation it was created for.
#[derive(Clone)]
pub struct ConnectionEvents {
    peer_id: String,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl ConnectionEvents {
    pub(crate) fn new(peer_id: String, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            peer_id,
            generation,
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.post(PeerEventKind::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.post(PeerEventKind::RemoteTrack(track));
    }

    pub fn state_changed(&self, state: TransportState) {
        self.post(PeerEventKind::TransportState(state));
    }

    pub(crate) fn post(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            kind,
        };
        if self.tx.send(event).is_err() {
            tracing::trace!(
                target: "mesh::peer",
                peer_id = %self.peer_id,
                "room event queue closed; dropping connection event"
            );
        }
    }
}

/// The point-to-point connection a peer record owns.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> MeshResult<()>;
    async fn create_offer(&self) -> MeshResult<SessionDescription>;
    async fn create_answer(&self) -> MeshResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()>;
    async fn add_candidate(&self, candidate: IceCandidate) -> MeshResult<()>;
    async fn close(&self) -> MeshResult<()>;
}

/// Factory for connection handles. `create` must register the candidate,
/// remote-track and state callbacks on `events` before returning.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(
        &self,
        peer_id: &str,
        events: ConnectionEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptions_use_browser_field_names() {
        let offer = SessionDescription::offer("v=0");
        assert_eq!(
            serde_json::to_value(&offer).unwrap(),
            json!({ "type": "offer", "sdp": "v=0" })
        );
        let parsed: SessionDescription =
            serde_json::from_value(json!({ "type": "answer", "sdp": "v=0" })).unwrap();
        assert_eq!(parsed.kind, SdpKind::Answer);
    }

    #[test]
    fn candidates_accept_null_fields_from_browsers() {
        let parsed: IceCandidate = serde_json::from_value(json!({
            "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0,
            "usernameFragment": null
        }))
        .unwrap();
        assert_eq!(parsed.sdp_mid.as_deref(), Some("0"));
        assert_eq!(parsed.sdp_mline_index, Some(0));
        assert!(parsed.username_fragment.is_none());

        let encoded = serde_json::to_value(IceCandidate::new("candidate:x")).unwrap();
        assert_eq!(encoded, json!({ "candidate": "candidate:x" }));
    }
}
