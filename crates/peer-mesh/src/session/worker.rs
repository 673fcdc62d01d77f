use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::connection::{
    ConnectionEvents, IceCandidate, PeerConnection, PeerConnector, SessionDescription,
};
use crate::error::{MeshError, MeshResult};
use crate::media::LocalTrack;

use super::PeerEventKind;

/// Work the room hands to a peer's worker. Executed strictly in order.
#[derive(Debug)]
pub(crate) enum PeerOp {
    Offer,
    Answer(SessionDescription),
    ApplyAnswer(SessionDescription),
    AddCandidate(IceCandidate),
}

/// The room's end of a per-peer worker task. Dropping it cancels the worker.
pub(crate) struct PeerLink {
    ops: mpsc::UnboundedSender<PeerOp>,
    _cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl PeerLink {
    pub(crate) fn spawn(
        connector: Arc<dyn PeerConnector>,
        tracks: Arc<Vec<LocalTrack>>,
        events: ConnectionEvents,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task = tokio::spawn(run_worker(connector, tracks, events, ops_rx, cancel_rx));
        Self {
            ops: ops_tx,
            _cancel: cancel_tx,
            task,
        }
    }

    pub(crate) fn push(&self, op: PeerOp) -> bool {
        self.ops.send(op).is_ok()
    }

    /// Cancel the worker and return its task so the caller can wait for the
    /// connection handle to close.
    pub(crate) fn cancel(self) -> JoinHandle<()> {
        let PeerLink { task, .. } = self;
        task
    }
}

async fn run_worker(
    connector: Arc<dyn PeerConnector>,
    tracks: Arc<Vec<LocalTrack>>,
    events: ConnectionEvents,
    mut ops: mpsc::UnboundedReceiver<PeerOp>,
    mut cancel: oneshot::Receiver<()>,
) {
    let peer_id = events.peer_id().to_string();
    let created = tokio::select! {
        biased;
        _ = &mut cancel => return,
        created = connector.create(&peer_id, events.clone()) => created,
    };
    let connection = match created {
        Ok(connection) => connection,
        Err(err) => {
            events.post(PeerEventKind::Failed(peer_error(&peer_id, err)));
            return;
        }
    };

    // From here on the handle exists and must be closed on every exit.
    let attached = tokio::select! {
        biased;
        _ = &mut cancel => None,
        attached = attach_tracks(connection.as_ref(), &tracks) => Some(attached),
    };
    match attached {
        Some(Ok(())) => run_ops(connection.as_ref(), &events, &mut ops, &mut cancel).await,
        Some(Err(err)) => events.post(PeerEventKind::Failed(peer_error(&peer_id, err))),
        None => tracing::trace!(target: "mesh::peer", peer_id = %peer_id, "cancelled while attaching tracks"),
    }

    if let Err(err) = connection.close().await {
        tracing::debug!(target: "mesh::peer", peer_id = %peer_id, error = %err, "close failed");
    } else {
        tracing::trace!(target: "mesh::peer", peer_id = %peer_id, "connection closed");
    }
}

async fn attach_tracks(connection: &dyn PeerConnection, tracks: &[LocalTrack]) -> MeshResult<()> {
    for track in tracks {
        connection.add_track(track).await?;
    }
    Ok(())
}

async fn run_ops(
    connection: &dyn PeerConnection,
    events: &ConnectionEvents,
    ops: &mut mpsc::UnboundedReceiver<PeerOp>,
    cancel: &mut oneshot::Receiver<()>,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = &mut *cancel => return,
            op = ops.recv() => match op {
                Some(op) => op,
                None => return,
            },
        };
        tracing::trace!(target: "mesh::peer", peer_id = %events.peer_id(), op = ?op, "running peer op");
        let outcome = tokio::select! {
            biased;
            _ = &mut *cancel => return,
            outcome = execute(connection, op) => outcome,
        };
        match outcome {
            Ok(Some(kind)) => events.post(kind),
            Ok(None) => {}
            Err(err) => {
                events.post(PeerEventKind::Failed(peer_error(events.peer_id(), err)));
                return;
            }
        }
    }
}

async fn execute(connection: &dyn PeerConnection, op: PeerOp) -> MeshResult<Option<PeerEventKind>> {
    match op {
        PeerOp::Offer => {
            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            Ok(Some(PeerEventKind::OfferReady(offer)))
        }
        PeerOp::Answer(offer) => {
            connection.set_remote_description(offer).await?;
            let answer = connection.create_answer().await?;
            connection.set_local_description(answer.clone()).await?;
            Ok(Some(PeerEventKind::AnswerReady(answer)))
        }
        PeerOp::ApplyAnswer(answer) => {
            connection.set_remote_description(answer).await?;
            Ok(Some(PeerEventKind::AnswerApplied))
        }
        PeerOp::AddCandidate(candidate) => {
            connection.add_candidate(candidate).await?;
            Ok(None)
        }
    }
}

fn peer_error(peer_id: &str, err: MeshError) -> MeshError {
    match err {
        MeshError::Negotiation { .. } => err,
        other => MeshError::negotiation(peer_id, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaSource, SyntheticMediaSource};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Calls(Mutex<Vec<&'static str>>);

    impl Calls {
        fn push(&self, call: &'static str) {
            self.0.lock().push(call);
        }

        fn all(&self) -> Vec<&'static str> {
            self.0.lock().clone()
        }
    }

    /// Hands out connections whose `add_track` never completes.
    struct StallingConnector(Arc<Calls>);

    struct StallingConnection(Arc<Calls>);

    #[async_trait]
    impl PeerConnector for StallingConnector {
        async fn create(
            &self,
            _peer_id: &str,
            _events: ConnectionEvents,
        ) -> MeshResult<Arc<dyn PeerConnection>> {
            self.0.push("create");
            Ok(Arc::new(StallingConnection(Arc::clone(&self.0))))
        }
    }

    fn unused() -> MeshError {
        MeshError::Setup("not reached while attaching tracks".into())
    }

    #[async_trait]
    impl PeerConnection for StallingConnection {
        async fn add_track(&self, _track: &LocalTrack) -> MeshResult<()> {
            self.0.push("add_track");
            std::future::pending::<()>().await;
            Ok(())
        }

        async fn create_offer(&self) -> MeshResult<SessionDescription> {
            self.0.push("create_offer");
            Err(unused())
        }

        async fn create_answer(&self) -> MeshResult<SessionDescription> {
            Err(unused())
        }

        async fn set_local_description(&self, _description: SessionDescription) -> MeshResult<()> {
            Err(unused())
        }

        async fn set_remote_description(&self, _description: SessionDescription) -> MeshResult<()> {
            Err(unused())
        }

        async fn add_candidate(&self, _candidate: IceCandidate) -> MeshResult<()> {
            Err(unused())
        }

        async fn close(&self) -> MeshResult<()> {
            self.0.push("close");
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancel_while_attaching_tracks_still_closes_the_handle() {
        let calls = Arc::new(Calls::default());
        let tracks = SyntheticMediaSource::new("local").acquire().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = ConnectionEvents::new("p2".into(), 1, tx);

        let link = PeerLink::spawn(
            Arc::new(StallingConnector(Arc::clone(&calls))),
            Arc::new(tracks),
            events,
        );
        assert!(link.push(PeerOp::Offer));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.all(), vec!["create", "add_track"]);

        tokio::time::timeout(Duration::from_secs(1), link.cancel())
            .await
            .expect("worker exits after cancel")
            .unwrap();
        assert_eq!(calls.all(), vec!["create", "add_track", "close"]);
        assert!(rx.try_recv().is_err());
    }
}
