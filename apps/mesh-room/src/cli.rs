use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser};
use peer_mesh::config::{DEFAULT_RELAY_URL, DEFAULT_STUN_SERVERS};
use peer_mesh::telemetry::logging::{LogConfig, LogLevel};
use peer_mesh::MeshConfig;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "mesh-room",
    about = "Join a room and negotiate direct WebRTC sessions with everyone in it",
    version
)]
pub struct Cli {
    #[arg(long, env = "MESH_RELAY_URL", default_value = DEFAULT_RELAY_URL)]
    pub relay_url: String,

    #[arg(long, env = "MESH_ROOM_ID")]
    pub room: String,

    #[arg(long, env = "MESH_PEER_ID", help = "Identity announced to the room (random if unset)")]
    pub peer_id: Option<String>,

    #[arg(long, env = "MESH_TOKEN", hide_env_values = true)]
    pub token: String,

    #[arg(
        long = "ice-server",
        env = "MESH_ICE_SERVERS",
        value_delimiter = ',',
        help = "STUN/TURN URL; repeat or comma separate"
    )]
    pub ice_servers: Vec<String>,

    #[arg(long, env = "MESH_DISABLE_STUN", help = "Use host candidates only")]
    pub disable_stun: bool,

    #[arg(long, env = "MESH_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    #[arg(long, default_value_t = 5, help = "Relay reconnect attempts before giving up")]
    pub max_reconnects: u32,

    #[arg(long, value_name = "SECS", help = "Log a session snapshot at this interval")]
    pub snapshot_every: Option<u64>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "MESH_LOG_LEVEL",
        default_value_t = LogLevel::Info,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(long = "log-file", value_name = "PATH", env = "MESH_LOG_FILE")]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    pub fn mesh_config(&self) -> MeshConfig {
        let local_id = self
            .peer_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let ice_servers = if self.disable_stun {
            Vec::new()
        } else if self.ice_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
        } else {
            self.ice_servers.clone()
        };
        MeshConfig::new(&self.relay_url, &self.room, local_id, &self.token)
            .with_ice_servers(ice_servers)
            .with_heartbeat(Duration::from_secs(self.heartbeat_secs.max(1)))
    }
}
