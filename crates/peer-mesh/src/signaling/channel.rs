use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{error::ProtocolError, Error as WsError, Message},
};
use url::Url;

use super::{Envelope, RelayEvent, SignalSink};
use crate::config::websocket_url;
use crate::error::{MeshError, MeshResult};
use crate::telemetry;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// One WebSocket connection to the room relay.
///
/// Dropping or closing the channel ends the paired [`RelayEvents`] stream.
/// A fresh [`RelayChannel::connect`] is the only way to get a new one.
pub struct RelayChannel {
    url: Url,
    send_tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Inbound side of a [`RelayChannel`]. Yields [`RelayEvent::Disconnected`]
/// once when the socket goes away, then `None`.
pub struct RelayEvents {
    rx: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelayEvents {
    pub async fn next(&mut self) -> Option<RelayEvent> {
        self.rx.recv().await
    }
}

impl RelayChannel {
    pub async fn connect(
        relay_url: &str,
        heartbeat: Duration,
    ) -> MeshResult<(Arc<Self>, RelayEvents)> {
        let url = websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| MeshError::ChannelUnavailable(format!("{url}: {err}")))?;
        tracing::debug!(target: "mesh::relay", url = %url, "relay websocket connected");

        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<RelayEvent>();
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(err) = ws_write.send(message).await {
                    tracing::debug!(target: "mesh::relay", error = %err, "relay write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        let reader_open = Arc::clone(&open);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            telemetry::increment(telemetry::UNDECODABLE_ENVELOPES);
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target: "mesh::relay", "relay websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target: "mesh::relay", "relay websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                tracing::trace!(target: "mesh::relay", event = "ws_in", len = text.len());
                match RelayEvent::decode(&text) {
                    Ok(RelayEvent::Disconnected) => {}
                    Ok(event) => {
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        telemetry::increment(telemetry::UNDECODABLE_ENVELOPES);
                        tracing::debug!(target: "mesh::relay", error = %err, "skipping relay message");
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = event_tx.send(RelayEvent::Disconnected);
        });

        let heartbeat_tx = send_tx.clone();
        let heartbeat_open = Arc::clone(&open);
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !heartbeat_open.load(Ordering::SeqCst)
                    || heartbeat_tx.send(Message::Ping(Vec::new())).is_err()
                {
                    break;
                }
            }
        });

        let channel = Arc::new(Self {
            url,
            send_tx,
            open,
            writer: Mutex::new(Some(writer)),
            tasks: Mutex::new(vec![reader, heartbeat_task]),
        });
        Ok((channel, RelayEvents { rx: event_rx }))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Send a close frame, give the writer a moment to flush it, then stop
    /// every task. Safe to call more than once.
    pub async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.send_tx.send(Message::Close(None));
        }
        let writer = self.writer.lock().take();
        if let Some(mut writer) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                writer.abort();
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::debug!(target: "mesh::relay", url = %self.url, "relay channel closed");
    }
}

impl SignalSink for RelayChannel {
    fn send(&self, envelope: Envelope) {
        if !self.is_open() {
            telemetry::increment(telemetry::DROPPED_SENDS);
            tracing::warn!(
                target: "mesh::relay",
                kind = ?envelope.kind,
                "relay channel not open; dropping envelope"
            );
            return;
        }
        let text = match envelope.to_text() {
            Ok(text) => text,
            Err(err) => {
                telemetry::increment(telemetry::DROPPED_SENDS);
                tracing::warn!(target: "mesh::relay", error = %err, "failed to encode envelope");
                return;
            }
        };
        if self.send_tx.send(Message::Text(text)).is_err() {
            telemetry::increment(telemetry::DROPPED_SENDS);
            tracing::warn!(target: "mesh::relay", "relay writer gone; dropping envelope");
        }
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().take() {
            writer.abort();
        }
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
