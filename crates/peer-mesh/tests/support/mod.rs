use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    State,
};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

use peer_mesh::{
    ConnectionEvents, IceCandidate, LocalTrack, MeshConfig, MeshResult, PeerConnection,
    PeerConnector, SessionDescription, SessionNotice, TransportState,
};

pub const ROOM: &str = "room-1";

/// In-process stand-in for the room relay: `JOIN_ROOM` with a
/// `token-<id>` credential joins `<id>`, anything else is unauthorized.
pub struct RelayStub {
    pub url: String,
    state: Arc<AsyncMutex<Relay>>,
}

#[derive(Default)]
struct Relay {
    rooms: HashMap<String, HashMap<String, mpsc::UnboundedSender<WsMessage>>>,
    inbound: Vec<Value>,
}

impl Relay {
    fn sender_for(&self, user: &str) -> Option<mpsc::UnboundedSender<WsMessage>> {
        self.rooms
            .values()
            .find_map(|members| members.get(user).cloned())
    }
}

impl RelayStub {
    pub async fn spawn() -> Self {
        let state = Arc::new(AsyncMutex::new(Relay::default()));
        let app = Router::new()
            .route("/chat/", get(ws_handler))
            .with_state(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind relay stub");
        let addr = listener.local_addr().expect("relay stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}/chat/"),
            state,
        }
    }

    pub fn config(&self, local: &str) -> MeshConfig {
        let mut config = MeshConfig::new(self.url.clone(), ROOM, local, format!("token-{local}"))
            .with_ice_servers(Vec::new())
            .with_heartbeat(Duration::from_secs(5));
        config.shutdown_grace = Duration::from_millis(500);
        config
    }

    /// Push a raw envelope to a joined user, bypassing routing.
    pub async fn deliver(&self, to: &str, envelope: Value) {
        let sender = self.state.lock().await.sender_for(to);
        let sender = sender.unwrap_or_else(|| panic!("{to} is not in any room"));
        send_json(&sender, envelope);
    }

    /// Close a user's socket from the relay side.
    pub async fn kick(&self, user: &str) {
        if let Some(sender) = self.state.lock().await.sender_for(user) {
            let _ = sender.send(WsMessage::Close(None));
        }
    }

    pub async fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self
            .state
            .lock()
            .await
            .rooms
            .get(ROOM)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// `SIGNAL`s the relay received from `from` to `to`, payload only.
    pub async fn signals(&self, from: &str, to: &str) -> Vec<Value> {
        self.state
            .lock()
            .await
            .inbound
            .iter()
            .filter(|env| env["type"] == "SIGNAL" && env["from"] == from)
            .filter(|env| env["payload"]["to"] == to)
            .map(|env| env["payload"]["signal"].clone())
            .collect()
    }

    pub async fn wait_for_members(&self, expected: &[&str]) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if self.members().await == expected {
                return;
            }
            if Instant::now() >= deadline {
                panic!("relay members never became {expected:?}");
            }
            sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AsyncMutex<Relay>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AsyncMutex<Relay>>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut joined: Option<(String, String)> = None;
    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let mut relay = state.lock().await;
        relay.inbound.push(value.clone());
        match value["type"].as_str() {
            Some("JOIN_ROOM") => {
                let user = value["token"]
                    .as_str()
                    .and_then(|token| token.strip_prefix("token-"));
                let room = value["payload"]["roomId"].as_str();
                let (Some(user), Some(room)) = (user, room) else {
                    debug!("stub: rejecting join");
                    send_json(&tx, json!({ "type": "UNAUTHORIZED" }));
                    continue;
                };
                debug!("stub: {user} joined {room}");
                let members = relay.rooms.entry(room.to_string()).or_default();
                for peer in members.values() {
                    send_json(peer, json!({ "type": "USER_JOINED", "from": user }));
                }
                members.insert(user.to_string(), tx.clone());
                send_json(&tx, json!({ "type": "JOINED_ROOM", "payload": { "roomId": room } }));
                joined = Some((room.to_string(), user.to_string()));
            }
            Some("SIGNAL") => {
                let Some((room, _)) = joined.as_ref() else {
                    continue;
                };
                let target = value["payload"]["to"]
                    .as_str()
                    .and_then(|to| relay.rooms.get(room).and_then(|m| m.get(to)));
                if let Some(target) = target {
                    send_json(target, value.clone());
                }
            }
            _ => {}
        }
    }

    if let Some((room, user)) = joined {
        let mut relay = state.lock().await;
        if let Some(members) = relay.rooms.get_mut(&room) {
            members.remove(&user);
            for peer in members.values() {
                send_json(peer, json!({ "type": "USER_LEFT", "userId": user }));
            }
        }
    }
    send_task.abort();
}

fn send_json(tx: &mpsc::UnboundedSender<WsMessage>, value: Value) {
    let _ = tx.send(WsMessage::Text(value.to_string()));
}

/// Ordered record of every connection-handle call, as `"<remote>:<call>"`.
#[derive(Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    fn push(&self, entry: String) {
        self.0.lock().push(entry);
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn for_peer(&self, peer_id: &str) -> Vec<String> {
        let prefix = format!("{peer_id}:");
        self.all()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, peer_id: &str, call: &str) -> usize {
        self.for_peer(peer_id).iter().filter(|c| *c == call).count()
    }
}

#[derive(Clone, Copy, Default)]
pub struct Behavior {
    /// Emit a local candidate while the remote offer is being applied, so it
    /// reaches the offerer ahead of the answer.
    pub candidate_before_answer: bool,
    /// Never finish building an answer.
    pub stall_answer: bool,
}

/// In-memory connection handles that follow the negotiation calls without
/// any real transport behind them.
pub struct ScriptedConnector {
    local: String,
    behavior: Behavior,
    pub log: Arc<CallLog>,
}

impl ScriptedConnector {
    pub fn new(local: &str) -> Arc<Self> {
        Self::with_behavior(local, Behavior::default())
    }

    pub fn with_behavior(local: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            local: local.to_string(),
            behavior,
            log: Arc::new(CallLog::default()),
        })
    }
}

#[async_trait]
impl PeerConnector for ScriptedConnector {
    async fn create(
        &self,
        peer_id: &str,
        events: ConnectionEvents,
    ) -> MeshResult<Arc<dyn PeerConnection>> {
        self.log.push(format!("{peer_id}:create"));
        Ok(Arc::new(ScriptedConnection {
            local: self.local.clone(),
            peer_id: peer_id.to_string(),
            behavior: self.behavior,
            log: Arc::clone(&self.log),
            events,
        }))
    }
}

struct ScriptedConnection {
    local: String,
    peer_id: String,
    behavior: Behavior,
    log: Arc<CallLog>,
    events: ConnectionEvents,
}

impl ScriptedConnection {
    fn record(&self, call: impl std::fmt::Display) {
        self.log.push(format!("{}:{call}", self.peer_id));
    }

    fn candidate(&self) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{}-{}", self.local, self.peer_id),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

#[async_trait]
impl PeerConnection for ScriptedConnection {
    async fn add_track(&self, track: &LocalTrack) -> MeshResult<()> {
        self.record(format!("track:{}", track.id()));
        Ok(())
    }

    async fn create_offer(&self) -> MeshResult<SessionDescription> {
        self.record("create_offer");
        Ok(SessionDescription::offer(format!("offer {}->{}", self.local, self.peer_id)))
    }

    async fn create_answer(&self) -> MeshResult<SessionDescription> {
        self.record("create_answer");
        if self.behavior.stall_answer {
            std::future::pending::<()>().await;
        }
        Ok(SessionDescription::answer(format!("answer {}->{}", self.local, self.peer_id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> MeshResult<()> {
        self.record(format!("local:{:?}", description.kind));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> MeshResult<()> {
        self.record(format!("remote:{:?}", description.kind));
        if self.behavior.candidate_before_answer {
            self.events.local_candidate(self.candidate());
        }
        self.events.state_changed(TransportState::Connecting);
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) -> MeshResult<()> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> MeshResult<()> {
        self.record("close");
        Ok(())
    }
}

pub async fn wait_for_notice<F>(
    notices: &mut broadcast::Receiver<SessionNotice>,
    mut matches: F,
) -> SessionNotice
where
    F: FnMut(&SessionNotice) -> bool,
{
    let deadline = Duration::from_secs(5);
    timeout(deadline, async {
        loop {
            match notices.recv().await {
                Ok(notice) if matches(&notice) => return notice,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("notice stream closed"),
            }
        }
    })
    .await
    .expect("notice never arrived")
}

pub async fn wait_until<F>(mut check: F, what: &str)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}
