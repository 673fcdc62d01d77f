use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{
    ConnectionEvents, PeerConnector, SdpKind, SessionDescription, TransportState,
};
use crate::media::LocalTrack;
use crate::signaling::{Outbox, Signal};
use crate::telemetry;
use crate::PeerId;

use super::peer::{NegotiationState, PeerRecord, PeerRole, RemoteDescription};
use super::worker::{PeerLink, PeerOp};
use super::{PeerEvent, PeerEventKind, PeerSummary, SessionNotice};

/// Result of feeding an event to the manager. Suppression is expected
/// traffic, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Suppressed(SuppressReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    DuplicateJoin,
    DuplicateOffer,
    StrayAnswer,
    UnknownPeer,
    DepartedPeer,
    SelfEcho,
    UnsupportedDescription,
    TerminalPeer,
}

/// Owns every peer record of one room and drives their negotiation.
///
/// All methods run on the room's event loop. Connection work happens on the
/// per-peer workers; their results come back through [`Self::on_peer_event`]
/// tagged with the generation of the record that issued them.
pub(crate) struct PeerSessionManager {
    outbox: Outbox,
    connector: Arc<dyn PeerConnector>,
    tracks: Arc<Vec<LocalTrack>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    peers: HashMap<PeerId, PeerRecord>,
    departed: Tombstones,
    next_generation: u64,
}

/// Most departed peers remembered at once. The oldest is forgotten first.
const DEPARTED_CAPACITY: usize = 256;

/// Peers that left the room, so their in-flight signals can be dropped.
#[derive(Default)]
struct Tombstones {
    order: VecDeque<PeerId>,
    set: HashSet<PeerId>,
}

impl Tombstones {
    fn insert(&mut self, peer_id: &str) {
        if !self.set.insert(peer_id.to_string()) {
            return;
        }
        self.order.push_back(peer_id.to_string());
        if self.order.len() > DEPARTED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    fn remove(&mut self, peer_id: &str) {
        if self.set.remove(peer_id) {
            self.order.retain(|id| id != peer_id);
        }
    }

    fn contains(&self, peer_id: &str) -> bool {
        self.set.contains(peer_id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.set.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}

impl PeerSessionManager {
    pub(crate) fn new(
        outbox: Outbox,
        connector: Arc<dyn PeerConnector>,
        tracks: Vec<LocalTrack>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            outbox,
            connector,
            tracks: Arc::new(tracks),
            events_tx,
            peers: HashMap::new(),
            departed: Tombstones::default(),
            next_generation: 0,
        }
    }

    pub(crate) fn contains(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub(crate) fn summaries(&self) -> Vec<PeerSummary> {
        let mut summaries: Vec<_> = self
            .peers
            .values()
            .map(|record| PeerSummary {
                peer_id: record.peer_id.clone(),
                role: record.role,
                state: record.state,
                transport: record.transport,
                buffered_candidates: record.pending.len(),
            })
            .collect();
        summaries.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        summaries
    }

    pub(crate) fn on_peer_joined(&mut self, peer_id: &str) -> Disposition {
        if peer_id == self.outbox.local_id() {
            return Disposition::Suppressed(SuppressReason::SelfEcho);
        }
        if self.peers.contains_key(peer_id) {
            return self.suppress(peer_id, SuppressReason::DuplicateJoin);
        }
        self.departed.remove(peer_id);

        let record = self.spawn_record(peer_id, PeerRole::Offerer);
        record.transition(NegotiationState::OfferPending);
        record.has_pending_offer = true;
        record.push(PeerOp::Offer);
        Disposition::Applied
    }

    pub(crate) fn on_signal(&mut self, from: &str, signal: Signal) -> Disposition {
        if from == self.outbox.local_id() {
            return Disposition::Suppressed(SuppressReason::SelfEcho);
        }
        if self.departed.contains(from) {
            return self.suppress(from, SuppressReason::DepartedPeer);
        }
        if signal.sdp.is_none() && signal.candidate.is_none() {
            return self.suppress(from, SuppressReason::UnsupportedDescription);
        }

        if !self.peers.contains_key(from) {
            let opens_session = signal.candidate.is_some()
                || matches!(signal.sdp.as_ref().map(|sdp| sdp.kind), Some(SdpKind::Offer));
            if !opens_session {
                let reason = match signal.sdp.as_ref().map(|sdp| sdp.kind) {
                    Some(SdpKind::Answer) => SuppressReason::StrayAnswer,
                    _ => SuppressReason::UnsupportedDescription,
                };
                return self.suppress(from, reason);
            }
            tracing::debug!(target: "mesh::peer", peer_id = %from, "signal from unknown peer; answering");
            self.spawn_record(from, PeerRole::Answerer);
        }

        if let Some(description) = signal.sdp {
            let disposition = match description.kind {
                SdpKind::Offer => self.accept_offer(from, description),
                SdpKind::Answer => self.accept_answer(from, description),
                SdpKind::Pranswer | SdpKind::Rollback => {
                    SuppressReason::UnsupportedDescription.into()
                }
            };
            if let Disposition::Suppressed(reason) = disposition {
                self.suppress(from, reason);
                // A candidate riding along is still valid for the record.
                if signal.candidate.is_none() {
                    return Disposition::Suppressed(reason);
                }
            }
        }

        if let Some(candidate) = signal.candidate {
            let Some(record) = self.peers.get_mut(from) else {
                return Disposition::Suppressed(SuppressReason::UnknownPeer);
            };
            if record.remote == RemoteDescription::Set {
                record.push(PeerOp::AddCandidate(candidate));
            } else {
                record.pending.enqueue(candidate);
                tracing::trace!(
                    target: "mesh::peer",
                    peer_id = %from,
                    buffered = record.pending.len(),
                    "buffered remote candidate"
                );
            }
        }
        Disposition::Applied
    }

    fn accept_offer(&mut self, from: &str, offer: SessionDescription) -> Disposition {
        let Some(record) = self.peers.get_mut(from) else {
            return SuppressReason::UnknownPeer.into();
        };
        if record.state.is_terminal() {
            return SuppressReason::TerminalPeer.into();
        }
        if record.state == NegotiationState::AnswerPending || record.remote == RemoteDescription::Applying {
            return SuppressReason::DuplicateOffer.into();
        }
        if record.state == NegotiationState::OfferSent || record.state == NegotiationState::OfferPending {
            tracing::warn!(
                target: "mesh::peer",
                peer_id = %from,
                state = ?record.state,
                "offer received while our own offer is outstanding"
            );
        }
        record.transition(NegotiationState::AnswerPending);
        record.remote = RemoteDescription::Applying;
        record.push(PeerOp::Answer(offer));
        Disposition::Applied
    }

    fn accept_answer(&mut self, from: &str, answer: SessionDescription) -> Disposition {
        let Some(record) = self.peers.get_mut(from) else {
            return SuppressReason::StrayAnswer.into();
        };
        if record.state != NegotiationState::OfferSent || record.remote != RemoteDescription::Unset {
            return SuppressReason::StrayAnswer.into();
        }
        record.remote = RemoteDescription::Applying;
        record.push(PeerOp::ApplyAnswer(answer));
        Disposition::Applied
    }

    /// `was_member` tells whether the room still listed the peer. Only peers
    /// we knew about are remembered as departed.
    pub(crate) fn on_peer_left(&mut self, peer_id: &str, was_member: bool) -> Disposition {
        if peer_id == self.outbox.local_id() {
            return Disposition::Suppressed(SuppressReason::SelfEcho);
        }
        let record = self.peers.remove(peer_id);
        if record.is_some() || was_member {
            self.departed.insert(peer_id);
        }
        match record {
            Some(mut record) => {
                record.close(NegotiationState::Closed);
                tracing::info!(target: "mesh::peer", peer_id = %peer_id, "peer left; connection released");
                Disposition::Applied
            }
            None => Disposition::Suppressed(SuppressReason::UnknownPeer),
        }
    }

    /// Apply a connection callback or worker result. Events from a record
    /// that is gone or was recreated since are dropped.
    pub(crate) fn on_peer_event(&mut self, event: PeerEvent) -> Option<SessionNotice> {
        let PeerEvent {
            peer_id,
            generation,
            kind,
        } = event;
        let Some(record) = self.peers.get_mut(&peer_id) else {
            tracing::trace!(target: "mesh::peer", peer_id = %peer_id, "event for removed peer dropped");
            return None;
        };
        if record.generation != generation {
            tracing::trace!(
                target: "mesh::peer",
                peer_id = %peer_id,
                generation,
                current = record.generation,
                "stale peer event dropped"
            );
            return None;
        }

        match kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.outbox.signal(&peer_id, &Signal::candidate(candidate));
                None
            }
            PeerEventKind::RemoteTrack(track) => {
                tracing::info!(
                    target: "mesh::peer",
                    peer_id = %peer_id,
                    track_id = %track.id,
                    kind = ?track.kind,
                    "remote track"
                );
                Some(SessionNotice::RemoteTrack { peer_id, track })
            }
            PeerEventKind::TransportState(state) => {
                record.transport = Some(state);
                tracing::debug!(target: "mesh::peer", peer_id = %peer_id, state = ?state, "transport state");
                if state == TransportState::Failed {
                    return self.fail(&peer_id, "transport failed".to_string());
                }
                Some(SessionNotice::TransportState { peer_id, state })
            }
            PeerEventKind::OfferReady(offer) => {
                if record.state != NegotiationState::OfferPending {
                    tracing::debug!(
                        target: "mesh::peer",
                        peer_id = %peer_id,
                        state = ?record.state,
                        "offer no longer wanted"
                    );
                    return None;
                }
                self.outbox.signal(&peer_id, &Signal::description(offer));
                record.transition(NegotiationState::OfferSent);
                None
            }
            PeerEventKind::AnswerReady(answer) => {
                if record.state != NegotiationState::AnswerPending {
                    return None;
                }
                self.outbox.signal(&peer_id, &Signal::description(answer));
                record.transition(NegotiationState::Connected);
                let drained = record.remote_ready();
                tracing::info!(target: "mesh::peer", peer_id = %peer_id, drained, "answer sent");
                Some(SessionNotice::PeerConnected { peer_id })
            }
            PeerEventKind::AnswerApplied => {
                if record.state != NegotiationState::OfferSent {
                    return None;
                }
                record.transition(NegotiationState::Connected);
                let drained = record.remote_ready();
                tracing::info!(target: "mesh::peer", peer_id = %peer_id, drained, "answer applied");
                Some(SessionNotice::PeerConnected { peer_id })
            }
            PeerEventKind::Failed(err) => self.fail(&peer_id, err.to_string()),
        }
    }

    fn fail(&mut self, peer_id: &str, reason: String) -> Option<SessionNotice> {
        let mut record = self.peers.remove(peer_id)?;
        record.close(NegotiationState::Failed);
        telemetry::increment(telemetry::NEGOTIATION_FAILURES);
        tracing::warn!(target: "mesh::peer", peer_id = %peer_id, reason = %reason, "peer failed");
        Some(SessionNotice::PeerFailed {
            peer_id: peer_id.to_string(),
            reason,
        })
    }

    /// Tear down every record. Returns the workers so the caller can bound
    /// how long it waits for their connections to close.
    pub(crate) fn shutdown(&mut self) -> Vec<JoinHandle<()>> {
        let workers: Vec<_> = self
            .peers
            .drain()
            .filter_map(|(_, mut record)| record.close(NegotiationState::Closed))
            .map(PeerLink::cancel)
            .collect();
        self.departed.clear();
        workers
    }

    fn spawn_record(&mut self, peer_id: &str, role: PeerRole) -> &mut PeerRecord {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events = ConnectionEvents::new(peer_id.to_string(), generation, self.events_tx.clone());
        let link = PeerLink::spawn(Arc::clone(&self.connector), Arc::clone(&self.tracks), events);
        tracing::debug!(
            target: "mesh::peer",
            peer_id = %peer_id,
            role = ?role,
            generation,
            "peer record created"
        );
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerRecord::new(peer_id.to_string(), role, generation, link))
    }

    fn suppress(&self, peer_id: &str, reason: SuppressReason) -> Disposition {
        telemetry::increment(telemetry::SUPPRESSED_DUPLICATES);
        tracing::debug!(target: "mesh::peer", peer_id = %peer_id, reason = ?reason, "suppressed");
        Disposition::Suppressed(reason)
    }
}

impl From<SuppressReason> for Disposition {
    fn from(reason: SuppressReason) -> Self {
        Disposition::Suppressed(reason)
    }
}
