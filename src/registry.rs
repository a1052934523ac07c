//! Connection registry
//!
//! Tracks every client connection and the session generation living on it.
//! All parsed client events dispatch through here: connect events spawn
//! (and supersede) sessions, session traffic routes to the live session's
//! mailbox, and events with no live session to land on are answered with a
//! no-route event.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, GatewayConfig, SessionLimits};
use crate::protocol::{ClientEvent, ServerEvent};
use crate::provider::SessionProvider;
use crate::session::{
    ClientSink, Session, SessionEvent, SessionParams, ShutdownKind, SESSION_MAILBOX_CAPACITY,
};

/// Handle the registry keeps on a spawned session.
struct SessionControl {
    generation: u64,
    events: mpsc::Sender<SessionEvent>,
    shutdown: Option<oneshot::Sender<ShutdownKind>>,
}

impl SessionControl {
    fn signal_shutdown(&mut self, kind: ShutdownKind) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(kind);
        }
    }

    fn is_live(&self) -> bool {
        !self.events.is_closed()
    }
}

struct ConnectionEntry {
    outbound: mpsc::Sender<ServerEvent>,
    /// Current session generation on this connection. Sinks from older
    /// generations compare against it and drop their emissions.
    generation: Arc<AtomicU64>,
    session: Option<SessionControl>,
}

/// Decrements the live session count when a session task ends, however it
/// ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(current.saturating_sub(1))
        });
    }
}

/// Shared state for all connections served by one gateway.
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
    active_sessions: Arc<AtomicUsize>,
    /// Serializes session admission so the limit check and the spawn are
    /// one step.
    admit_lock: Mutex<()>,
    limits: SessionLimits,
    max_sessions: usize,
    provider: Arc<dyn SessionProvider>,
}

impl ConnectionRegistry {
    pub fn new(config: &GatewayConfig, provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            connections: DashMap::new(),
            active_sessions: Arc::new(AtomicUsize::new(0)),
            admit_lock: Mutex::new(()),
            limits: config.session_limits(),
            max_sessions: config.max_sessions,
            provider,
        }
    }

    /// Registers a connection. Must happen before its first frame is read
    /// so early traffic has somewhere to answer to.
    pub fn register(&self, conn_id: &str, outbound: mpsc::Sender<ServerEvent>) {
        self.connections.insert(
            conn_id.to_string(),
            ConnectionEntry {
                outbound,
                generation: Arc::new(AtomicU64::new(0)),
                session: None,
            },
        );
        debug!("connection registered: {conn_id}");
    }

    /// Removes a connection, shutting down whatever session lives on it.
    /// Safe to call more than once.
    pub fn unregister(&self, conn_id: &str) {
        let Some((_, mut entry)) = self.connections.remove(conn_id) else {
            return;
        };
        if let Some(mut control) = entry.session.take() {
            control.signal_shutdown(ShutdownKind::Disconnected);
        }
        debug!("connection unregistered: {conn_id}");
    }

    /// Routes one parsed client event to wherever it belongs.
    pub async fn dispatch(&self, conn_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Connect(config) => self.open_session(conn_id, config),
            ClientEvent::AuthResponse(response) => {
                self.route(conn_id, SessionEvent::AuthResponse(response)).await
            }
            ClientEvent::ShellInput(data) => self.route(conn_id, SessionEvent::Input(data)).await,
            ClientEvent::Resize(geometry) => {
                self.route(conn_id, SessionEvent::Resize(geometry)).await
            }
            ClientEvent::Disconnect => self.close_session(conn_id),
        }
    }

    /// Spawns a new session generation on the connection, superseding any
    /// live one. The superseded session is signalled and winds down on its
    /// own task; its emissions are dropped by the generation guard from
    /// here on.
    fn open_session(&self, conn_id: &str, config: ConnectionConfig) {
        let _admit = self.admit_lock.lock();

        let Some(mut entry) = self.connections.get_mut(conn_id) else {
            warn!("connect event for unknown connection {conn_id}");
            return;
        };

        // The limit check runs before any supersession so a rejected
        // connect leaves the existing session untouched. A live session
        // about to be replaced does not count against its replacement.
        let replacing = entry
            .session
            .as_ref()
            .map(|control| control.is_live())
            .unwrap_or(false);
        let occupied = self
            .active_sessions
            .load(Ordering::SeqCst)
            .saturating_sub(replacing as usize);
        if occupied >= self.max_sessions {
            warn!(
                "connection {conn_id}: session limit reached ({occupied}/{})",
                self.max_sessions
            );
            let _ = entry.outbound.try_send(ServerEvent::SessionError {
                reason: format!("session limit reached ({} active)", self.max_sessions),
            });
            return;
        }

        if let Some(mut control) = entry.session.take() {
            if control.is_live() {
                info!(
                    "connection {conn_id}: superseding session generation {}",
                    control.generation
                );
            }
            control.signal_shutdown(ShutdownKind::Superseded);
        }

        let generation = entry.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = ClientSink::new(
            conn_id,
            generation,
            entry.generation.clone(),
            entry.outbound.clone(),
        );
        let session = Session::new(SessionParams {
            conn_id: conn_id.to_string(),
            generation,
            config,
            limits: self.limits,
            provider: self.provider.clone(),
            sink,
        });

        let (events, mailbox) = mpsc::channel(SESSION_MAILBOX_CAPACITY);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        entry.session = Some(SessionControl {
            generation,
            events,
            shutdown: Some(shutdown_tx),
        });

        self.active_sessions.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(self.active_sessions.clone());
        tokio::spawn(async move {
            let _guard = guard;
            session.run(mailbox, shutdown_rx).await;
        });
        info!("connection {conn_id}: session generation {generation} spawned");
    }

    /// Closes the live session without touching the connection itself.
    fn close_session(&self, conn_id: &str) {
        let Some(mut entry) = self.connections.get_mut(conn_id) else {
            return;
        };
        match entry.session.take() {
            Some(mut control) => {
                info!(
                    "connection {conn_id}: client closed session generation {}",
                    control.generation
                );
                control.signal_shutdown(ShutdownKind::ClientClosed);
            }
            None => debug!("connection {conn_id}: disconnect with no session"),
        }
    }

    async fn route(&self, conn_id: &str, event: SessionEvent) {
        let target = self.connections.get(conn_id).and_then(|entry| {
            entry
                .session
                .as_ref()
                .and_then(|control| control.is_live().then(|| control.events.clone()))
        });

        let Some(events) = target else {
            self.no_route(conn_id).await;
            return;
        };
        if events.send(event).await.is_err() {
            // The session ended while the event was in flight.
            self.no_route(conn_id).await;
        }
    }

    async fn no_route(&self, conn_id: &str) {
        debug!("connection {conn_id}: no live session for event");
        let Some(outbound) = self
            .connections
            .get(conn_id)
            .map(|entry| entry.outbound.clone())
        else {
            return;
        };
        let _ = outbound.send(ServerEvent::NoRoute).await;
    }

    /// Winds down every connection. Used on process shutdown.
    pub fn shutdown_all(&self) {
        let ids: Vec<String> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        info!("shutting down {} connection(s)", ids.len());
        for conn_id in ids {
            self.unregister(&conn_id);
        }
    }

    /// Waits for spawned session tasks to finish winding down, up to
    /// `timeout`. Returns false if any were still running when it expired.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_sessions.load(Ordering::SeqCst) != 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Number of session tasks still running.
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }

    /// Whether the connection currently has a live session.
    pub fn session_live(&self, conn_id: &str) -> bool {
        self.connections
            .get(conn_id)
            .and_then(|entry| entry.session.as_ref().map(SessionControl::is_live))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
