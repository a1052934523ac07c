//! Provider seam: the transport engine behind a session.
//!
//! The session state machine owns lifecycle and policy; everything that
//! actually speaks SSH lives behind [`SessionProvider`]. Tests substitute a
//! scripted implementation, production uses [`russh::RusshProvider`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::{ConnectionConfig, Credential};
use crate::error::{AuthError, ConnectError, ShellError};
use crate::protocol::{ChallengePrompt, Geometry};

pub mod russh;

#[cfg(test)]
pub mod fake;

/// Capacity of the command and event channels between a session and its
/// shell stream. Writers block when full, which is how provider
/// backpressure reaches the client connection.
pub const SHELL_CHANNEL_CAPACITY: usize = 1024;

/// Opens authenticated transport handles. One provider serves the whole
/// gateway; each connect call yields an exclusive handle.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Establishes transport to the target host. Authentication happens
    /// afterwards, on the returned handle.
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn ProviderSession>, ConnectError>;
}

/// An exclusive handle to one remote host, from transport establishment
/// through teardown.
#[async_trait]
pub trait ProviderSession: Send {
    /// Offers a single credential. `Err` means the transport itself failed;
    /// an unconvinced server comes back as [`AuthVerdict::Denied`].
    async fn try_credential(&mut self, credential: &Credential) -> Result<AuthVerdict, AuthError>;

    /// Starts interactive (keyboard-style) authentication.
    async fn begin_interactive(&mut self) -> Result<AuthVerdict, AuthError>;

    /// Sends the client's answers for the current challenge round.
    async fn answer_interactive(&mut self, responses: Vec<String>)
        -> Result<AuthVerdict, AuthError>;

    /// Banner text the host pushed since the last call, if any.
    fn take_banner(&mut self) -> Option<String>;

    /// Opens the interactive shell with an initial terminal geometry.
    async fn open_shell(&mut self, geometry: Geometry) -> Result<ShellChannel, ShellError>;

    /// Releases the transport. Best effort; callers bound it with a timeout
    /// and drop the handle regardless.
    async fn close(&mut self);
}

/// Outcome of one authentication step.
#[derive(Debug, Clone)]
pub enum AuthVerdict {
    /// The server accepted; the session may open its shell.
    Ready,

    /// The server refused this step.
    Denied {
        reason: String,
        /// Whether the server still offers interactive authentication.
        interactive: bool,
    },

    /// The server wants answers to interactive prompts.
    Challenge(ProviderChallenge),
}

/// An interactive challenge round as the provider reports it, before the
/// gateway attaches a correlation token.
#[derive(Debug, Clone)]
pub struct ProviderChallenge {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<ChallengePrompt>,
}

/// Duplex handle to an open shell stream.
pub struct ShellChannel {
    pub cmd_tx: mpsc::Sender<ShellCommand>,
    pub event_rx: mpsc::Receiver<ShellEvent>,
}

/// Traffic flowing into the shell.
#[derive(Debug)]
pub enum ShellCommand {
    /// Raw input bytes, forwarded verbatim.
    Data(Bytes),

    /// Resize the remote PTY.
    Resize(Geometry),

    /// Ask the remote side to wind the stream down.
    Close,
}

/// Traffic flowing out of the shell.
#[derive(Debug)]
pub enum ShellEvent {
    Stdout(Bytes),

    Stderr(Bytes),

    /// The remote stream ended (EOF or channel close).
    Closed,

    /// The stream failed mid-flight.
    Fault(String),
}
