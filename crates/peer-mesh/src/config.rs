use std::env;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::error::{MeshError, MeshResult};

pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8080/chat/";
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];
const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 3_000;

/// Everything a room session needs before it can join.
///
/// `token` and `local_id` come from whatever authenticated the user; the
/// orchestrator never interprets them.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub relay_url: String,
    pub room_id: String,
    pub local_id: String,
    pub token: String,
    pub ice_servers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub shutdown_grace: Duration,
}

impl MeshConfig {
    pub fn new(
        relay_url: impl Into<String>,
        room_id: impl Into<String>,
        local_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            relay_url: relay_url.into(),
            room_id: room_id.into(),
            local_id: local_id.into(),
            token: token.into(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Load configuration from `MESH_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let relay_url = non_empty("MESH_RELAY_URL").unwrap_or_else(|| DEFAULT_RELAY_URL.into());
        let room_id = non_empty("MESH_ROOM_ID").unwrap_or_default();
        let local_id = non_empty("MESH_PEER_ID").unwrap_or_else(|| Uuid::new_v4().to_string());
        let token = non_empty("MESH_TOKEN").unwrap_or_default();

        let disable_stun = lookup("MESH_DISABLE_STUN")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let ice_servers = if disable_stun {
            Vec::new()
        } else {
            match non_empty("MESH_ICE_SERVERS") {
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            }
        };

        let heartbeat_interval = lookup("MESH_HEARTBEAT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_HEARTBEAT_SECS));

        Self {
            relay_url,
            room_id,
            local_id,
            token,
            ice_servers,
            heartbeat_interval,
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
        }
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.room_id.is_empty() {
            return Err(MeshError::Setup("room id is required".into()));
        }
        if self.token.is_empty() {
            return Err(MeshError::Setup("relay token is required".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(MeshError::Setup("heartbeat interval must be positive".into()));
        }
        websocket_url(&self.relay_url).map(|_| ())
    }
}

/// Normalise a relay address to a WebSocket URL. `http(s)` schemes are
/// rewritten to `ws(s)`.
pub fn websocket_url(raw: &str) -> MeshResult<Url> {
    let mut url = Url::parse(raw)
        .map_err(|err| MeshError::Setup(format!("invalid relay url {raw}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "http" => "ws",
        "https" => "wss",
        other => {
            return Err(MeshError::Setup(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| MeshError::Setup(format!("cannot rewrite scheme for {raw}")))?;
    Ok(url)
}
