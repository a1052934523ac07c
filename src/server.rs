//! WebSocket front door
//!
//! Binds the listening socket, upgrades connections, and shuttles frames
//! between each client and the registry. Every connection gets a writer
//! task that serializes outbound events; the reader side parses frames
//! inline and dispatches them. Either side stopping tears the whole
//! connection down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, ProtocolError};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::provider::SessionProvider;
use crate::registry::ConnectionRegistry;

/// Outbound event buffer per connection. A client that stops reading gets
/// this much slack before its session backs up.
const OUTBOUND_CAPACITY: usize = 256;

/// How long one outbound frame may take to hand to the socket before the
/// connection is considered dead.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Gateway {
    registry: Arc<ConnectionRegistry>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Gateway {
    /// Binds the listening socket. Nothing is accepted until
    /// [`run`](Self::run) is called.
    pub async fn bind(
        config: &GatewayConfig,
        provider: Arc<dyn SessionProvider>,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(&config.listen).await.map_err(|source| {
            GatewayError::Bind {
                addr: config.listen.clone(),
                source,
            }
        })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind {
            addr: config.listen.clone(),
            source,
        })?;
        Ok(Self {
            registry: Arc::new(ConnectionRegistry::new(config, provider)),
            listener,
            local_addr,
        })
    }

    /// Address the gateway actually listens on. Differs from the
    /// configured one when port 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Accept loop. Runs until the task is dropped.
    pub async fn run(self) {
        info!("gateway listening on {}", self.local_addr);
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        serve_connection(stream, peer, registry).await;
                    });
                }
                Err(e) => {
                    warn!("TCP accept error: {e}");
                }
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WS handshake with {peer} failed: {e}");
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    info!("connection {conn_id} open from {peer}");

    let (sink, mut frames) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);

    // Register before reading the first frame so early traffic has a
    // connection to answer on.
    registry.register(&conn_id, out_tx);
    let mut writer = tokio::spawn(write_events(sink, out_rx, conn_id.clone()));

    // Reader and writer live and die together; a writer that gave up on a
    // stalled socket ends the connection too.
    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => registry.dispatch(&conn_id, event).await,
                    Err(e) => {
                        let err = ProtocolError::Malformed(e);
                        debug!("connection {conn_id}: dropping frame: {err}");
                    }
                },
                Some(Ok(Message::Binary(_))) => {
                    debug!(
                        "connection {conn_id}: dropping frame: {}",
                        ProtocolError::BinaryFrame
                    );
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("connection {conn_id}: WS error: {e}");
                    break;
                }
            },
            _ = &mut writer => {
                debug!("connection {conn_id}: writer stopped");
                break;
            }
        }
    }

    registry.unregister(&conn_id);
    writer.abort();
    info!("connection {conn_id} closed");
}

/// Drains the outbound channel onto the socket, one JSON text frame per
/// event.
async fn write_events(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut events: mpsc::Receiver<ServerEvent>,
    conn_id: String,
) {
    while let Some(event) = events.recv().await {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("connection {conn_id}: failed to encode event: {e}");
                continue;
            }
        };
        match tokio::time::timeout(SEND_TIMEOUT, sink.send(Message::Text(json.into()))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("connection {conn_id}: write failed: {e}");
                break;
            }
            Err(_) => {
                warn!("connection {conn_id}: write stalled, dropping connection");
                break;
            }
        }
    }
}
