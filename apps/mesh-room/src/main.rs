mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use peer_mesh::rtc::RtcConnector;
use peer_mesh::telemetry::{self, logging};
use peer_mesh::{
    MediaSource, MeshError, PeerConnector, RoomSession, SessionEnd, SessionHandle, SessionNotice,
    SyntheticMediaSource,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("initialise logging")?;
    debug!(log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");

    let config = cli.mesh_config();
    config.validate()?;
    let connector: Arc<dyn PeerConnector> =
        Arc::new(RtcConnector::new(config.ice_servers.clone())?);
    let media: Arc<dyn MediaSource> = Arc::new(SyntheticMediaSource::new(config.local_id.clone()));

    let mut attempt = 0u32;
    loop {
        let joined = RoomSession::join(config.clone(), Arc::clone(&connector), Arc::clone(&media)).await;
        let (session, handle) = match joined {
            Ok(joined) => joined,
            Err(MeshError::ChannelUnavailable(reason)) if attempt < cli.max_reconnects => {
                attempt += 1;
                let delay = backoff(attempt);
                warn!(%reason, attempt, ?delay, "relay unavailable; retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        info!(room = %config.room_id, peer_id = %config.local_id, "joined relay");
        attempt = 0;

        let notices = tokio::spawn(log_notices(handle.subscribe()));
        let snapshots = cli
            .snapshot_every
            .map(|secs| tokio::spawn(log_snapshots(handle.clone(), Duration::from_secs(secs.max(1)))));

        let mut running = tokio::spawn(session.run());
        let outcome = tokio::select! {
            outcome = &mut running => outcome?,
            _ = tokio::signal::ctrl_c() => {
                info!("leaving room");
                handle.leave();
                running.await?
            }
        };
        notices.abort();
        if let Some(snapshots) = snapshots {
            snapshots.abort();
        }

        match outcome {
            Ok(SessionEnd::Left) => return Ok(()),
            Ok(SessionEnd::Disconnected) if attempt < cli.max_reconnects => {
                attempt += 1;
                let delay = backoff(attempt);
                warn!(attempt, ?delay, "relay connection lost; rejoining");
                tokio::time::sleep(delay).await;
            }
            Ok(SessionEnd::Disconnected) => bail!("relay connection lost"),
            Err(MeshError::Unauthorized) => {
                bail!("relay rejected the token; sign in again to get a fresh one")
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt.min(5)))
}

async fn log_notices(mut notices: broadcast::Receiver<SessionNotice>) {
    loop {
        match notices.recv().await {
            Ok(SessionNotice::Joined { room_id }) => info!(%room_id, "in room"),
            Ok(SessionNotice::PeerJoined { peer_id }) => info!(%peer_id, "participant joined"),
            Ok(SessionNotice::PeerLeft { peer_id }) => info!(%peer_id, "participant left"),
            Ok(SessionNotice::PeerConnected { peer_id }) => info!(%peer_id, "negotiated"),
            Ok(SessionNotice::PeerFailed { peer_id, reason }) => {
                warn!(%peer_id, %reason, "negotiation failed")
            }
            Ok(SessionNotice::RemoteTrack { peer_id, track }) => {
                info!(%peer_id, track = %track.id, kind = ?track.kind, "receiving media")
            }
            Ok(SessionNotice::TransportState { peer_id, state }) => {
                debug!(%peer_id, ?state, "transport")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "notice log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn log_snapshots(handle: SessionHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Ok(snapshot) = handle.snapshot().await else {
            break;
        };
        info!(
            room = %snapshot.room_id,
            state = ?snapshot.state,
            members = ?snapshot.members,
            "session snapshot"
        );
        for peer in &snapshot.peers {
            info!(
                peer_id = %peer.peer_id,
                role = ?peer.role,
                state = ?peer.state,
                transport = ?peer.transport,
                buffered = peer.buffered_candidates,
                "  peer"
            );
        }
        for (label, count) in telemetry::counters() {
            debug!(counter = label, count, "  counter");
        }
    }
}
