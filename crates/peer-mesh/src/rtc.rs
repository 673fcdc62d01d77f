//! webrtc-rs backed connection handles.

use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::connection::{
    ConnectionEvents, IceCandidate, PeerConnection, PeerConnector, RemoteTrack, SdpKind,
    SessionDescription, TransportState,
};
use crate::error::{MeshError, MeshResult};
use crate::media::{LocalTrack, MediaKind};

fn build_api() -> MeshResult<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> MeshError {
    MeshError::Setup(err.to_string())
}

/// Builds one `RTCPeerConnection` per remote participant.
pub struct RtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> MeshResult<Self> {
        Ok(Self {
            api: build_api()?,
            ice_servers,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        if self.ice_servers.is_empty() {
            return RTCConfiguration::default();
        }
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn create(
        &self,
        peer_id: &str,
        events: ConnectionEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.local_candidate(from_rtc_candidate(init)),
                    Err(err) => tracing::warn!(
                        target: "mesh::rtc",
                        peer_id = %events.peer_id(),
                        error = %err,
                        "failed to encode local candidate"
                    ),
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let events = track_events.clone();
            Box::pin(async move {
                events.remote_track(RemoteTrack {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: MediaKind::from(track.kind()),
                });
            })
        }));

        let state_events = events;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                if let Some(state) = transport_state(state) {
                    events.state_changed(state);
                }
            })
        }));

        tracing::debug!(target: "mesh::rtc", peer_id = %peer_id, "peer connection created");
        Ok(Arc::new(RtcPeerConnection {
            peer_id: peer_id.to_string(),
            pc,
        }))
    }
}

pub struct RtcPeerConnection {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerConnection {
    fn negotiation_error(&self, err: impl std::fmt::Display) -> MeshError {
        MeshError::negotiation(&self.peer_id, err)
    }

    fn to_rtc(&self, description: SessionDescription) -> MeshResult<RTCSessionDescription> {
        let SessionDescription { kind, sdp } = description;
        let parsed = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp),
            SdpKind::Answer => RTCSessionDescription::answer(sdp),
            SdpKind::Pranswer => RTCSessionDescription::pranswer(sdp),
            SdpKind::Rollback => {
                return Err(self.negotiation_error("rollback descriptions are not supported"))
            }
        };
        parsed.map_err(|err| self.negotiation_error(err))
    }

    fn from_rtc(&self, description: RTCSessionDescription) -> MeshResult<SessionDescription> {
        let kind = match description.sdp_type {
            RTCSdpType::Offer => SdpKind::Offer,
            RTCSdpType::Answer => SdpKind::Answer,
            RTCSdpType::Pranswer => SdpKind::Pranswer,
            RTCSdpType::Rollback => SdpKind::Rollback,
            RTCSdpType::Unspecified => {
                return Err(self.negotiation_error("unspecified description type"))
            }
        };
        Ok(SessionDescription {
            kind,
            sdp: description.sdp,
        })
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> MeshResult<()> {
        self.pc
            .add_track(track.rtc_track())
            .await
            .map(|_| ())
            .map_err(|err| self.negotiation_error(err))
    }

    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|err| self.negotiation_error(err))?;
        self.from_rtc(offer)
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|err| self.negotiation_error(err))?;
        self.from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()> {
        let description = self.to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(|err| self.negotiation_error(err))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        let description = self.to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|err| self.negotiation_error(err))
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        self.pc
            .add_ice_candidate(to_rtc_candidate(candidate))
            .await
            .map_err(|err| self.negotiation_error(err))
    }

    async fn close(&self) -> MeshResult<()> {
        self.pc
            .close()
            .await
            .map_err(|err| self.negotiation_error(err))
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}
