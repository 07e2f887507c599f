//! WebSocket telemetry feed
//!
//! [`WsSink`] is a telemetry sink that fans records out to every connected
//! consumer through a broadcast channel. [`serve`] accepts consumers on a
//! listener until cancelled. A consumer that falls behind loses the oldest
//! records rather than slowing the publisher.

use aerotask_fleet::{PublishError, TelemetryEvent, TelemetrySink};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::contract::{Envelope, SCHEMA_VERSION};
use crate::error::WsError;

/// Control messages sent outside the record stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsControl {
    /// Sent once after the handshake
    Ack {
        /// Record layout version that follows
        schema_version: u32,
        /// Human-readable greeting
        message: String,
    },
}

/// Broadcasting telemetry sink
#[derive(Debug)]
pub struct WsSink {
    tx: broadcast::Sender<Arc<str>>,
}

impl WsSink {
    /// Sink retaining up to `capacity` records per lagging consumer
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every record published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Connected consumers
    pub fn consumers(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl TelemetrySink for WsSink {
    fn try_publish(&self, event: TelemetryEvent) -> Result<(), PublishError> {
        let json = match Envelope::from(&event).to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(vehicle_id = %event.vehicle_id(), error = %e, "Telemetry record not encodable");
                return Err(PublishError::Closed);
            }
        };
        // Sending with no consumers connected is not a failure
        let _ = self.tx.send(Arc::from(json));
        Ok(())
    }

    fn name(&self) -> &str {
        "websocket"
    }
}

/// Bind the telemetry listener
pub async fn bind(addr: &str) -> Result<TcpListener, WsError> {
    TcpListener::bind(addr).await.map_err(WsError::Bind)
}

/// Accept consumers until `cancel` fires
pub async fn serve(listener: TcpListener, sink: Arc<WsSink>, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!(%addr, "WebSocket telemetry listening"),
        Err(e) => warn!(error = %e, "WebSocket telemetry listening on unknown address"),
    }
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let records = sink.subscribe();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, records, cancel).await {
                        warn!(%peer, error = %e, "WebSocket consumer dropped");
                    }
                });
            }
            Err(e) => error!(error = %e, "Failed to accept WebSocket consumer"),
        }
    }
    info!("WebSocket telemetry stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    mut records: broadcast::Receiver<Arc<str>>,
    cancel: CancellationToken,
) -> Result<(), WsError> {
    let ws = accept_async(stream).await?;
    let (mut outbound, mut inbound) = ws.split();
    info!(%peer, "WebSocket consumer connected");

    let ack = WsControl::Ack {
        schema_version: SCHEMA_VERSION,
        message: "AeroTask telemetry feed".into(),
    };
    outbound.send(Message::Text(serde_json::to_string(&ack)?)).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = outbound.send(Message::Close(None)).await;
                break;
            }
            msg = inbound.next() => match msg {
                Some(Ok(Message::Close(_))) | None => {
                    info!(%peer, "WebSocket consumer disconnected");
                    break;
                }
                Some(Ok(Message::Ping(payload))) => outbound.send(Message::Pong(payload)).await?,
                Some(Ok(other)) => debug!(%peer, kind = ?other, "Ignoring inbound message"),
                Some(Err(e)) => return Err(e.into()),
            },
            record = records.recv() => match record {
                Ok(json) => outbound.send(Message::Text(json.to_string())).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer, skipped, "WebSocket consumer lagging, records dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}
