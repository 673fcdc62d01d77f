//! The per-room event loop.
//!
//! [`RoomSession::run`] is the only place room state is mutated. Relay events,
//! connection callbacks, per-peer worker results and handle commands all
//! arrive on queues it selects over, so no peer record is ever touched from two
//! places at once while slow negotiations of one peer never hold up another.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::join_all;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::MeshConfig;
use crate::connection::{
    IceCandidate, PeerConnector, RemoteTrack, SessionDescription, TransportState,
};
use crate::error::{MeshError, MeshResult};
use crate::media::MediaSource;
use crate::membership::MembershipTracker;
use crate::signaling::{Outbox, RelayChannel, RelayEvent, RelayEvents, SignalSink};
use crate::PeerId;

mod manager;
mod peer;
mod worker;

use manager::PeerSessionManager;
pub use manager::{Disposition, SuppressReason};
pub use peer::{NegotiationState, PeerRole};

const RECENT_EVENTS: usize = 5;
const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Disconnected,
    Unauthorized,
}

/// Why [`RoomSession::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Left,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    Joined { room_id: String },
    PeerJoined { peer_id: PeerId },
    PeerLeft { peer_id: PeerId },
    PeerConnected { peer_id: PeerId },
    PeerFailed { peer_id: PeerId, reason: String },
    RemoteTrack { peer_id: PeerId, track: RemoteTrack },
    TransportState { peer_id: PeerId, state: TransportState },
}

impl SessionNotice {
    fn describe(&self) -> String {
        match self {
            SessionNotice::Joined { room_id } => format!("joined room {room_id}"),
            SessionNotice::PeerJoined { peer_id } => format!("{peer_id} joined"),
            SessionNotice::PeerLeft { peer_id } => format!("{peer_id} left"),
            SessionNotice::PeerConnected { peer_id } => format!("{peer_id} connected"),
            SessionNotice::PeerFailed { peer_id, reason } => format!("{peer_id} failed: {reason}"),
            SessionNotice::RemoteTrack { peer_id, track } => {
                format!("{peer_id} sent {:?} track {}", track.kind, track.id)
            }
            SessionNotice::TransportState { peer_id, state } => {
                format!("{peer_id} transport {state:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub role: PeerRole,
    pub state: NegotiationState,
    pub transport: Option<TransportState>,
    pub buffered_candidates: usize,
}

#[derive(Debug, Clone)]
pub struct RecentEvent {
    pub at: SystemTime,
    pub summary: String,
}

/// Point-in-time view of a room session, for debugging and display.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub room_id: String,
    pub local_id: PeerId,
    pub state: SessionState,
    pub members: Vec<PeerId>,
    pub peers: Vec<PeerSummary>,
    pub recent: Vec<RecentEvent>,
}

/// Connection callbacks and worker results, tagged with the record
/// generation that produced them.
#[derive(Debug)]
pub(crate) struct PeerEvent {
    pub(crate) peer_id: PeerId,
    pub(crate) generation: u64,
    pub(crate) kind: PeerEventKind,
}

#[derive(Debug)]
pub(crate) enum PeerEventKind {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    TransportState(TransportState),
    OfferReady(SessionDescription),
    AnswerReady(SessionDescription),
    AnswerApplied,
    Failed(MeshError),
}

enum Command {
    Leave,
    Snapshot(oneshot::Sender<SessionSnapshot>),
}

/// Cloneable control surface of a running [`RoomSession`].
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionHandle {
    /// Ask the session to leave the room. Returns `false` if it already ended.
    pub fn leave(&self) -> bool {
        self.commands.send(Command::Leave).is_ok()
    }

    pub async fn snapshot(&self) -> MeshResult<SessionSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply_tx))
            .map_err(|_| MeshError::ChannelClosed)?;
        reply_rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }
}

/// One membership in one room.
pub struct RoomSession {
    config: MeshConfig,
    state: SessionState,
    channel: Arc<RelayChannel>,
    relay: RelayEvents,
    media: Arc<dyn MediaSource>,
    manager: PeerSessionManager,
    members: MembershipTracker,
    peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    handle: SessionHandle,
    recent: VecDeque<RecentEvent>,
}

impl RoomSession {
    /// Connect to the relay, borrow local media and ask to join the room.
    ///
    /// Media failure is not fatal: the session joins without local tracks.
    pub async fn join(
        config: MeshConfig,
        connector: Arc<dyn PeerConnector>,
        media: Arc<dyn MediaSource>,
    ) -> MeshResult<(Self, SessionHandle)> {
        config.validate()?;
        let (channel, relay) =
            RelayChannel::connect(&config.relay_url, config.heartbeat_interval).await?;

        let tracks = match media.acquire().await {
            Ok(tracks) => tracks,
            Err(err) => {
                tracing::warn!(target: "mesh::session", error = %err, "joining without local media");
                Vec::new()
            }
        };

        let sink: Arc<dyn SignalSink> = channel.clone();
        let outbox = Outbox::new(sink, &config.token, &config.room_id, &config.local_id);
        outbox.join_room();
        tracing::info!(
            target: "mesh::session",
            room_id = %config.room_id,
            local_id = %config.local_id,
            tracks = tracks.len(),
            "joining room"
        );

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);
        let handle = SessionHandle {
            commands: command_tx,
            notices: notice_tx,
        };

        let session = Self {
            manager: PeerSessionManager::new(outbox, connector, tracks, peer_tx),
            config,
            state: SessionState::Connecting,
            channel,
            relay,
            media,
            members: MembershipTracker::new(),
            peer_rx,
            commands: command_rx,
            handle: handle.clone(),
            recent: VecDeque::with_capacity(RECENT_EVENTS),
        };
        Ok((session, handle))
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the room until it is left, the relay goes away or the relay
    /// rejects the credential. Always tears everything down before returning.
    pub async fn run(mut self) -> MeshResult<SessionEnd> {
        let outcome = self.drive().await;
        self.teardown().await;
        match &outcome {
            Ok(end) => tracing::info!(target: "mesh::session", room_id = %self.config.room_id, end = ?end, "session ended"),
            Err(err) => tracing::warn!(target: "mesh::session", room_id = %self.config.room_id, error = %err, "session ended"),
        }
        outcome
    }

    async fn drive(&mut self) -> MeshResult<SessionEnd> {
        loop {
            tokio::select! {
                event = self.relay.next() => match event {
                    None | Some(RelayEvent::Disconnected) => {
                        self.state = SessionState::Disconnected;
                        return Ok(SessionEnd::Disconnected);
                    }
                    Some(RelayEvent::Unauthorized) => {
                        self.state = SessionState::Unauthorized;
                        tracing::error!(target: "mesh::session", "relay rejected credentials");
                        return Err(MeshError::Unauthorized);
                    }
                    Some(event) => self.on_relay_event(event),
                },
                Some(event) = self.peer_rx.recv() => {
                    if let Some(notice) = self.manager.on_peer_event(event) {
                        self.notify(notice);
                    }
                }
                command = self.commands.recv() => match command {
                    None | Some(Command::Leave) => return Ok(SessionEnd::Left),
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(self.snapshot());
                    }
                },
            }
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::JoinedRoom { room_id } => {
                self.state = SessionState::Joined;
                let room_id = room_id.unwrap_or_else(|| self.config.room_id.clone());
                tracing::info!(target: "mesh::session", room_id = %room_id, "joined room");
                self.notify(SessionNotice::Joined { room_id });
            }
            RelayEvent::UserJoined(peer_id) => {
                if self.is_self(&peer_id) {
                    return;
                }
                if self.members.add(&peer_id) {
                    self.notify(SessionNotice::PeerJoined {
                        peer_id: peer_id.clone(),
                    });
                }
                self.manager.on_peer_joined(&peer_id);
            }
            RelayEvent::UserLeft(peer_id) => {
                if self.is_self(&peer_id) {
                    return;
                }
                let was_member = self.members.remove(&peer_id);
                self.manager.on_peer_left(&peer_id, was_member);
                if was_member {
                    self.notify(SessionNotice::PeerLeft { peer_id });
                }
            }
            RelayEvent::Signal { from, signal } => {
                if self.is_self(&from) {
                    return;
                }
                self.manager.on_signal(&from, signal);
                if self.manager.contains(&from) && self.members.add(&from) {
                    self.notify(SessionNotice::PeerJoined { peer_id: from });
                }
            }
            RelayEvent::Unauthorized | RelayEvent::Disconnected => {}
        }
    }

    fn is_self(&self, peer_id: &str) -> bool {
        let echo = peer_id == self.config.local_id;
        if echo {
            tracing::trace!(target: "mesh::session", "ignoring our own relay echo");
        }
        echo
    }

    fn notify(&mut self, notice: SessionNotice) {
        if self.recent.len() == RECENT_EVENTS {
            self.recent.pop_front();
        }
        self.recent.push_back(RecentEvent {
            at: SystemTime::now(),
            summary: notice.describe(),
        });
        let _ = self.handle.notices.send(notice);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            room_id: self.config.room_id.clone(),
            local_id: self.config.local_id.clone(),
            state: self.state,
            members: self.members.snapshot(),
            peers: self.manager.summaries(),
            recent: self.recent.iter().cloned().collect(),
        }
    }

    /// Peers first, then local media, then the relay. Each step is
    /// best-effort and never blocks the next.
    async fn teardown(&mut self) {
        let workers = self.manager.shutdown();
        let closing = workers.len();
        if closing > 0
            && tokio::time::timeout(self.config.shutdown_grace, join_all(workers))
                .await
                .is_err()
        {
            tracing::warn!(
                target: "mesh::session",
                peers = closing,
                "peer connections still closing after grace period"
            );
        }
        self.members.clear();
        self.media.release();
        self.channel.close().await;
        tracing::debug!(target: "mesh::session", peers = closing, "session torn down");
    }
}
