use crate::candidates::CandidateQueue;
use crate::connection::TransportState;
use crate::PeerId;

use super::worker::{PeerLink, PeerOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferPending,
    OfferSent,
    AnswerPending,
    Connected,
    Closed,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Closed | NegotiationState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Offerer,
    Answerer,
}

/// Progress of the remote description on the connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemoteDescription {
    Unset,
    /// Handed to the worker; candidates keep buffering until it reports back.
    Applying,
    Set,
}

/// Everything the room knows about one remote participant.
pub(crate) struct PeerRecord {
    pub(crate) peer_id: PeerId,
    pub(crate) role: PeerRole,
    pub(crate) generation: u64,
    pub(crate) state: NegotiationState,
    pub(crate) remote: RemoteDescription,
    pub(crate) has_pending_offer: bool,
    pub(crate) pending: CandidateQueue,
    pub(crate) transport: Option<TransportState>,
    link: Option<PeerLink>,
}

impl PeerRecord {
    pub(crate) fn new(peer_id: PeerId, role: PeerRole, generation: u64, link: PeerLink) -> Self {
        Self {
            peer_id,
            role,
            generation,
            state: NegotiationState::New,
            remote: RemoteDescription::Unset,
            has_pending_offer: false,
            pending: CandidateQueue::new(),
            transport: None,
            link: Some(link),
        }
    }

    /// Move to `next`. Terminal states are final; returns `false` if the
    /// record already reached one.
    pub(crate) fn transition(&mut self, next: NegotiationState) -> bool {
        if self.state.is_terminal() {
            tracing::debug!(
                target: "mesh::peer",
                peer_id = %self.peer_id,
                state = ?self.state,
                next = ?next,
                "ignoring transition on terminal record"
            );
            return false;
        }
        tracing::debug!(
            target: "mesh::peer",
            peer_id = %self.peer_id,
            generation = self.generation,
            from = ?self.state,
            to = ?next,
            "negotiation state"
        );
        self.state = next;
        if !matches!(
            next,
            NegotiationState::OfferPending | NegotiationState::OfferSent
        ) {
            self.has_pending_offer = false;
        }
        true
    }

    pub(crate) fn push(&self, op: PeerOp) -> bool {
        match &self.link {
            Some(link) => link.push(op),
            None => false,
        }
    }

    /// Mark the remote description usable and hand every buffered candidate
    /// to the worker, behind the description it belongs to.
    pub(crate) fn remote_ready(&mut self) -> usize {
        self.remote = RemoteDescription::Set;
        let Some(link) = self.link.as_ref() else {
            return self.pending.discard();
        };
        self.pending
            .drain_into(|candidate| {
                link.push(PeerOp::AddCandidate(candidate));
            })
    }

    /// Terminal teardown: discard buffered candidates, cancel the worker (which
    /// closes the connection handle) and settle in `terminal`. Returns the
    /// worker so callers that need to can wait for the close to finish.
    pub(crate) fn close(&mut self, terminal: NegotiationState) -> Option<PeerLink> {
        let discarded = self.pending.discard();
        self.transition(terminal);
        self.has_pending_offer = false;
        if discarded > 0 {
            tracing::debug!(
                target: "mesh::peer",
                peer_id = %self.peer_id,
                discarded,
                "discarded buffered candidates"
            );
        }
        self.link.take()
    }
}
