//! Relay wire format and the channel that carries it.
//!
//! Every frame on the relay socket is one JSON [`Envelope`]. The relay routes
//! envelopes by room and recipient; it never looks inside `payload.signal`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::connection::{IceCandidate, SessionDescription};
use crate::error::{MeshError, MeshResult};
use crate::PeerId;

mod channel;

pub use channel::{RelayChannel, RelayEvents};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeKind {
    JoinRoom,
    JoinedRoom,
    UserJoined,
    UserLeft,
    Signal,
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    fn bare(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            token: None,
            from: None,
            user_id: None,
            payload: None,
        }
    }

    pub fn join_room(token: &str, room_id: &str) -> Self {
        Self {
            token: Some(token.to_string()),
            payload: Some(json!({ "roomId": room_id })),
            ..Self::bare(EnvelopeKind::JoinRoom)
        }
    }

    pub fn signal(token: &str, from: &str, room_id: &str, to: &str, signal: &Signal) -> Self {
        let signal = serde_json::to_value(signal).unwrap_or(Value::Null);
        Self {
            token: Some(token.to_string()),
            from: Some(from.to_string()),
            payload: Some(json!({ "roomId": room_id, "to": to, "signal": signal })),
            ..Self::bare(EnvelopeKind::Signal)
        }
    }

    pub fn to_text(&self) -> MeshResult<String> {
        serde_json::to_string(self).map_err(|err| MeshError::Protocol(err.to_string()))
    }

    fn payload_str(&self, field: &str) -> Option<String> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get(field))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// Negotiation data exchanged between two peers. Opaque to the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl Signal {
    pub fn description(description: SessionDescription) -> Self {
        Self {
            sdp: Some(description),
            candidate: None,
        }
    }

    pub fn candidate(candidate: IceCandidate) -> Self {
        Self {
            sdp: None,
            candidate: Some(candidate),
        }
    }
}

/// Typed inbound relay event.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    JoinedRoom { room_id: Option<String> },
    UserJoined(PeerId),
    UserLeft(PeerId),
    Signal { from: PeerId, signal: Signal },
    Unauthorized,
    /// Terminal: the socket closed. Nothing follows on the same stream.
    Disconnected,
}

impl RelayEvent {
    pub fn decode(text: &str) -> MeshResult<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|err| MeshError::Protocol(err.to_string()))?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> MeshResult<Self> {
        match envelope.kind {
            EnvelopeKind::JoinedRoom => Ok(RelayEvent::JoinedRoom {
                room_id: envelope.payload_str("roomId"),
            }),
            EnvelopeKind::UserJoined => envelope
                .from
                .map(RelayEvent::UserJoined)
                .ok_or_else(|| MeshError::Protocol("USER_JOINED without from".into())),
            EnvelopeKind::UserLeft => envelope
                .user_id
                .map(RelayEvent::UserLeft)
                .ok_or_else(|| MeshError::Protocol("USER_LEFT without userId".into())),
            EnvelopeKind::Signal => {
                let from = envelope
                    .from
                    .ok_or_else(|| MeshError::Protocol("SIGNAL without from".into()))?;
                let raw = envelope
                    .payload
                    .and_then(|mut payload| payload.get_mut("signal").map(Value::take))
                    .filter(|value| !value.is_null())
                    .ok_or_else(|| MeshError::Protocol("SIGNAL without payload.signal".into()))?;
                let signal = serde_json::from_value(raw)
                    .map_err(|err| MeshError::Protocol(format!("bad signal: {err}")))?;
                Ok(RelayEvent::Signal { from, signal })
            }
            EnvelopeKind::Unauthorized => Ok(RelayEvent::Unauthorized),
            EnvelopeKind::JoinRoom => Err(MeshError::Protocol(
                "JOIN_ROOM is client-to-relay only".into(),
            )),
        }
    }
}

/// Where outbound envelopes go. Fire-and-forget: the relay acknowledges
/// nothing, so implementations must not block.
pub trait SignalSink: Send + Sync {
    fn send(&self, envelope: Envelope);
}

/// Stamps outbound envelopes with the session's credential and identity.
#[derive(Clone)]
pub struct Outbox {
    sink: Arc<dyn SignalSink>,
    token: String,
    room_id: String,
    local_id: PeerId,
}

impl Outbox {
    pub fn new(
        sink: Arc<dyn SignalSink>,
        token: impl Into<String>,
        room_id: impl Into<String>,
        local_id: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            token: token.into(),
            room_id: room_id.into(),
            local_id: local_id.into(),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn join_room(&self) {
        self.sink
            .send(Envelope::join_room(&self.token, &self.room_id));
    }

    pub fn signal(&self, to: &str, signal: &Signal) {
        self.sink.send(Envelope::signal(
            &self.token,
            &self.local_id,
            &self.room_id,
            to,
            signal,
        ));
    }
}
