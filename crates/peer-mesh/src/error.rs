use thiserror::Error;

use crate::PeerId;

#[derive(Debug, Error)]
pub enum MeshError {
    /// Relay could not be reached. Callers decide whether to reconnect.
    #[error("relay channel unavailable: {0}")]
    ChannelUnavailable(String),
    #[error("relay channel closed")]
    ChannelClosed,
    /// Credential rejected by the relay. Retrying with the same token is pointless.
    #[error("relay rejected credentials")]
    Unauthorized,
    #[error("local media unavailable: {0}")]
    MediaUnavailable(String),
    #[error("negotiation with {peer_id} failed: {reason}")]
    Negotiation { peer_id: PeerId, reason: String },
    #[error("setup failed: {0}")]
    Setup(String),
    #[error("relay protocol error: {0}")]
    Protocol(String),
}

pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub fn negotiation(peer_id: &str, reason: impl ToString) -> Self {
        MeshError::Negotiation {
            peer_id: peer_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Session-scoped failures end the session; everything else is contained.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, MeshError::Unauthorized | MeshError::ChannelClosed)
    }
}
