//! Session lifecycle: one task per remote shell.
//!
//! A session walks `Idle → Connecting → Authenticating → ShellOpen →
//! Closing → Closed`, with `Failed` reachable from every non-terminal
//! state. The whole lifecycle runs on a single task: client traffic comes
//! in through a mailbox, shutdown through a oneshot, and every await point
//! honors both, so nothing ever observes a half-finished transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthStop};
use crate::config::{ConnectionConfig, SessionLimits};
use crate::error::{AuthError, ConnectError, SessionError, ShellError, StreamError};
use crate::mux::{self, StopReason};
use crate::protocol::{AuthResponse, Geometry, ServerEvent};
use crate::provider::{ProviderSession, SessionProvider, ShellChannel, ShellCommand};

/// Capacity of the per-session client event mailbox. When it fills, the
/// connection's reader blocks, pushing backpressure to the socket.
pub const SESSION_MAILBOX_CAPACITY: usize = 256;

/// Lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    ShellOpen,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Legal moves in the lifecycle graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle, Connecting) => true,
            (Connecting, Authenticating) => true,
            (Authenticating, ShellOpen) => true,
            (Idle | Connecting | Authenticating | ShellOpen, Closing) => true,
            (Closing, Closed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::ShellOpen => "shell-open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a session was told to wind down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    /// The client connection went away.
    Disconnected,

    /// A newer session generation took over the connection.
    Superseded,

    /// The client asked for the session to close.
    ClientClosed,
}

impl std::fmt::Display for ShutdownKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            ShutdownKind::Disconnected => "connection closed",
            ShutdownKind::Superseded => "superseded by a newer session",
            ShutdownKind::ClientClosed => "closed by client",
        };
        f.write_str(reason)
    }
}

/// Client traffic routed into a session's mailbox.
#[derive(Debug)]
pub enum SessionEvent {
    AuthResponse(AuthResponse),
    Input(String),
    Resize(Geometry),
}

/// Generation-guarded path from a session task to its client.
///
/// Each session carries the generation it was spawned under; once the
/// connection's current generation moves past it, emissions are dropped so
/// a superseded session can wind down without leaking output into its
/// replacement.
#[derive(Clone)]
pub struct ClientSink {
    conn_id: String,
    generation: u64,
    current: Arc<AtomicU64>,
    outbound: mpsc::Sender<ServerEvent>,
}

impl ClientSink {
    pub fn new(
        conn_id: impl Into<String>,
        generation: u64,
        current: Arc<AtomicU64>,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            conn_id: conn_id.into(),
            generation,
            current,
            outbound,
        }
    }

    pub async fn emit(&self, event: ServerEvent) {
        if self.current.load(Ordering::SeqCst) != self.generation {
            debug!(
                "dropping event from stale generation {} on {}",
                self.generation, self.conn_id
            );
            return;
        }
        if self.outbound.send(event).await.is_err() {
            debug!("client channel gone on {}, event dropped", self.conn_id);
        }
    }
}

/// Construction arguments for a session task.
pub struct SessionParams {
    pub conn_id: String,
    pub generation: u64,
    pub config: ConnectionConfig,
    pub limits: SessionLimits,
    pub provider: Arc<dyn SessionProvider>,
    pub sink: ClientSink,
}

enum Ending {
    Closed,
    Failed(SessionError),
}

/// One session from connect request to terminal state.
pub struct Session {
    conn_id: String,
    generation: u64,
    config: ConnectionConfig,
    limits: SessionLimits,
    provider: Arc<dyn SessionProvider>,
    sink: ClientSink,
    state: SessionState,
    pending_geometry: Option<Geometry>,
    banner_sent: bool,
}

impl Session {
    pub fn new(params: SessionParams) -> Self {
        Self {
            conn_id: params.conn_id,
            generation: params.generation,
            config: params.config,
            limits: params.limits,
            provider: params.provider,
            sink: params.sink,
            state: SessionState::Idle,
            pending_geometry: None,
            banner_sent: false,
        }
    }

    /// Drives the session to a terminal state, emitting exactly one of the
    /// session error or session closed events along the way.
    pub async fn run(
        mut self,
        mut mailbox: mpsc::Receiver<SessionEvent>,
        mut shutdown: oneshot::Receiver<ShutdownKind>,
    ) {
        info!(
            "session {}#{} starting toward {}:{}",
            self.conn_id, self.generation, self.config.host, self.config.port
        );

        let (ending, handle) = match self.establish(&mut mailbox, &mut shutdown).await {
            Ok((handle, shell, geometry)) => {
                self.set_state(SessionState::ShellOpen);
                self.sink.emit(ServerEvent::ShellReady).await;
                self.sink.emit(ServerEvent::Title(self.config.title())).await;
                info!("session {}#{} shell ready", self.conn_id, self.generation);

                let stop = mux::pump(mailbox, shutdown, shell, self.sink.clone(), geometry).await;
                let ending = match stop {
                    StopReason::ProviderClosed => {
                        debug!(
                            "session {}#{}: remote stream ended",
                            self.conn_id, self.generation
                        );
                        Ending::Closed
                    }
                    StopReason::Shutdown(kind) => {
                        debug!("session {}#{}: {}", self.conn_id, self.generation, kind);
                        Ending::Closed
                    }
                    StopReason::Stream(err) => Ending::Failed(err.into()),
                };
                (ending, Some(handle))
            }
            Err(outcome) => outcome,
        };

        self.finish(ending, handle).await;
    }

    /// Connect, authenticate and open the shell, honoring the overall
    /// deadline and the shutdown signal at every await.
    #[allow(clippy::type_complexity)]
    async fn establish(
        &mut self,
        mailbox: &mut mpsc::Receiver<SessionEvent>,
        shutdown: &mut oneshot::Receiver<ShutdownKind>,
    ) -> Result<
        (Box<dyn ProviderSession>, ShellChannel, Geometry),
        (Ending, Option<Box<dyn ProviderSession>>),
    > {
        if let Err(reason) = self.config.validate() {
            return Err((
                Ending::Failed(ConnectError::InvalidConfig(reason).into()),
                None,
            ));
        }

        let deadline = Instant::now() + self.limits.connect_timeout;
        self.set_state(SessionState::Connecting);

        let mut handle = {
            let connecting = self.provider.connect(&self.config);
            tokio::select! {
                result = tokio::time::timeout_at(deadline, connecting) => match result {
                    Ok(Ok(handle)) => handle,
                    Ok(Err(err)) => return Err((Ending::Failed(err.into()), None)),
                    Err(_) => return Err((Ending::Failed(AuthError::Timeout.into()), None)),
                },
                kind = drain_until_shutdown(shutdown, mailbox, &mut self.pending_geometry) => {
                    debug!(
                        "session {}#{} shut down while connecting: {}",
                        self.conn_id, self.generation, kind
                    );
                    return Err((Ending::Closed, None));
                }
            }
        };

        self.set_state(SessionState::Authenticating);

        if let Some(text) = handle.take_banner() {
            self.send_banner(text).await;
        }

        let exchange = auth::Exchange {
            sink: &self.sink,
            mailbox,
            shutdown,
            pending_geometry: &mut self.pending_geometry,
            banner_sent: &mut self.banner_sent,
            challenge_timeout: self.limits.challenge_timeout,
            deadline,
        };
        match auth::negotiate(handle.as_mut(), &self.config, exchange).await {
            Ok(()) => {}
            Err(AuthStop::Failed(err)) => return Err((Ending::Failed(err.into()), Some(handle))),
            Err(AuthStop::Shutdown(kind)) => {
                debug!(
                    "session {}#{} shut down during authentication: {}",
                    self.conn_id, self.generation, kind
                );
                return Err((Ending::Closed, Some(handle)));
            }
        }

        if let Some(text) = handle.take_banner() {
            self.send_banner(text).await;
        }

        let geometry = self.pending_geometry.take().unwrap_or_default();
        let shell = {
            let opening = handle.open_shell(geometry);
            tokio::select! {
                result = tokio::time::timeout_at(deadline, opening) => match result {
                    Ok(Ok(shell)) => shell,
                    Ok(Err(err)) => return Err((Ending::Failed(err.into()), Some(handle))),
                    Err(_) => return Err((
                        Ending::Failed(ShellError::Open("timed out waiting for shell channel".into()).into()),
                        Some(handle),
                    )),
                },
                kind = drain_until_shutdown(shutdown, mailbox, &mut self.pending_geometry) => {
                    debug!(
                        "session {}#{} shut down while opening shell: {}",
                        self.conn_id, self.generation, kind
                    );
                    return Err((Ending::Closed, Some(handle)));
                }
            }
        };

        // A resize may have landed while the shell was opening. Apply it now
        // so the pump starts from the geometry the client last asked for.
        let mut last_geometry = geometry;
        if let Some(g) = self.pending_geometry.take() {
            if g != last_geometry {
                last_geometry = g;
                if shell.cmd_tx.send(ShellCommand::Resize(g)).await.is_err() {
                    return Err((
                        Ending::Failed(
                            StreamError::Write("shell command channel closed".into()).into(),
                        ),
                        Some(handle),
                    ));
                }
            }
        }

        Ok((handle, shell, last_geometry))
    }

    async fn finish(&mut self, ending: Ending, handle: Option<Box<dyn ProviderSession>>) {
        match ending {
            Ending::Failed(err) => {
                self.set_state(SessionState::Failed);
                warn!(
                    "session {}#{} failed: {}",
                    self.conn_id, self.generation, err
                );
                self.sink
                    .emit(ServerEvent::SessionError {
                        reason: err.to_string(),
                    })
                    .await;
                self.release(handle).await;
            }
            Ending::Closed => {
                self.set_state(SessionState::Closing);
                self.release(handle).await;
                self.set_state(SessionState::Closed);
                self.sink.emit(ServerEvent::SessionClosed).await;
                info!("session {}#{} closed", self.conn_id, self.generation);
            }
        }
    }

    /// Best-effort provider teardown, bounded so a wedged transport cannot
    /// hold the session open.
    async fn release(&mut self, handle: Option<Box<dyn ProviderSession>>) {
        let Some(mut handle) = handle else { return };
        if tokio::time::timeout(self.limits.teardown_timeout, handle.close())
            .await
            .is_err()
        {
            warn!(
                "session {}#{}: provider release timed out",
                self.conn_id, self.generation
            );
        }
    }

    async fn send_banner(&mut self, text: String) {
        if self.banner_sent {
            debug!(
                "session {}#{}: dropping extra banner text",
                self.conn_id, self.generation
            );
            return;
        }
        self.banner_sent = true;
        self.sink.emit(ServerEvent::Banner(text)).await;
    }

    fn set_state(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "session {}#{}: illegal transition {} -> {}",
                self.conn_id, self.generation, self.state, next
            );
        }
        debug!(
            "session {}#{}: {} -> {}",
            self.conn_id, self.generation, self.state, next
        );
        self.state = next;
    }
}

/// Waits for a shutdown signal while keeping the mailbox drained so the
/// connection reader never backs up against a busy session. Resizes are
/// buffered most-recent-wins; everything else is dropped.
pub(crate) async fn drain_until_shutdown(
    shutdown: &mut oneshot::Receiver<ShutdownKind>,
    mailbox: &mut mpsc::Receiver<SessionEvent>,
    pending_geometry: &mut Option<Geometry>,
) -> ShutdownKind {
    loop {
        tokio::select! {
            kind = &mut *shutdown => return kind.unwrap_or(ShutdownKind::Disconnected),
            event = mailbox.recv() => match event {
                Some(SessionEvent::Resize(geometry)) => *pending_geometry = Some(geometry),
                Some(SessionEvent::Input(_)) => debug!("dropping shell input, shell not open"),
                Some(SessionEvent::AuthResponse(_)) => {
                    debug!("dropping auth response, no challenge outstanding")
                }
                None => return ShutdownKind::Disconnected,
            },
        }
    }
}
