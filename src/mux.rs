//! Stream multiplexer for an open shell.
//!
//! The two directions run as independent tasks so neither can starve the
//! other: client input (with resize coalescing) flows into the provider's
//! command channel, shell output flows back to the client as events. The
//! pump stops both tasks before returning, so the session state machine
//! never advances while either direction is still moving bytes.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::StreamError;
use crate::protocol::{Geometry, ServerEvent};
use crate::provider::{ShellChannel, ShellCommand, ShellEvent};
use crate::session::{ClientSink, SessionEvent, ShutdownKind};

/// Why the pump stopped.
#[derive(Debug)]
pub enum StopReason {
    /// The remote stream ended (EOF or channel close).
    ProviderClosed,

    /// The session was told to wind down.
    Shutdown(ShutdownKind),

    /// One of the directions failed mid-stream.
    Stream(StreamError),
}

/// Moves traffic in both directions until the shell ends, a direction
/// fails, or the session is shut down.
pub async fn pump(
    mailbox: mpsc::Receiver<SessionEvent>,
    mut shutdown: oneshot::Receiver<ShutdownKind>,
    shell: ShellChannel,
    sink: ClientSink,
    opened: Geometry,
) -> StopReason {
    let ShellChannel { cmd_tx, event_rx } = shell;
    let mut inbound = tokio::spawn(run_inbound(mailbox, cmd_tx, opened));
    let mut outbound = tokio::spawn(run_outbound(event_rx, sink));

    tokio::select! {
        result = &mut inbound => {
            outbound.abort();
            let _ = (&mut outbound).await;
            flatten(result)
        }
        result = &mut outbound => {
            inbound.abort();
            let _ = (&mut inbound).await;
            flatten(result)
        }
        kind = &mut shutdown => {
            inbound.abort();
            outbound.abort();
            let _ = (&mut inbound).await;
            let _ = (&mut outbound).await;
            StopReason::Shutdown(kind.unwrap_or(ShutdownKind::Disconnected))
        }
    }
}

fn flatten(result: Result<StopReason, tokio::task::JoinError>) -> StopReason {
    result.unwrap_or_else(|e| {
        StopReason::Stream(StreamError::Provider(format!("stream task failed: {e}")))
    })
}

/// Client events into shell commands. Identical consecutive resizes are
/// coalesced; input is forwarded verbatim and flow-controlled by the
/// command channel, never dropped.
async fn run_inbound(
    mut mailbox: mpsc::Receiver<SessionEvent>,
    cmd_tx: mpsc::Sender<ShellCommand>,
    mut last_geometry: Geometry,
) -> StopReason {
    while let Some(event) = mailbox.recv().await {
        match event {
            SessionEvent::Input(data) => {
                if cmd_tx
                    .send(ShellCommand::Data(Bytes::from(data.into_bytes())))
                    .await
                    .is_err()
                {
                    return StopReason::Stream(StreamError::Write(
                        "shell command channel closed".into(),
                    ));
                }
            }
            SessionEvent::Resize(geometry) => {
                if geometry == last_geometry {
                    trace!("coalescing duplicate resize");
                    continue;
                }
                last_geometry = geometry;
                if cmd_tx.send(ShellCommand::Resize(geometry)).await.is_err() {
                    return StopReason::Stream(StreamError::Write(
                        "shell command channel closed".into(),
                    ));
                }
            }
            SessionEvent::AuthResponse(_) => {
                debug!("dropping auth response, shell already open");
            }
        }
    }
    StopReason::Shutdown(ShutdownKind::Disconnected)
}

/// Shell events out to the client. Stdout and stderr stay in arrival order
/// and cross as lossy UTF-8 text.
async fn run_outbound(mut event_rx: mpsc::Receiver<ShellEvent>, sink: ClientSink) -> StopReason {
    while let Some(event) = event_rx.recv().await {
        match event {
            ShellEvent::Stdout(data) => {
                sink.emit(ServerEvent::ShellOutput(
                    String::from_utf8_lossy(&data).into_owned(),
                ))
                .await;
            }
            ShellEvent::Stderr(data) => {
                sink.emit(ServerEvent::ShellErrorOutput(
                    String::from_utf8_lossy(&data).into_owned(),
                ))
                .await;
            }
            ShellEvent::Closed => return StopReason::ProviderClosed,
            ShellEvent::Fault(reason) => {
                return StopReason::Stream(StreamError::Provider(reason))
            }
        }
    }
    StopReason::ProviderClosed
}
