//! Gateway error types

use thiserror::Error;

/// Transport-level failure before authentication begins.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Connection config rejected by validation.
    #[error("invalid connection config: {0}")]
    InvalidConfig(String),

    /// Hostname did not resolve to any address.
    #[error("address resolution failed: {0}")]
    Resolve(String),

    /// TCP-level failure reaching the host.
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    /// Transport handshake with the remote host failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// Authentication failure, including interactive challenge rounds.
#[derive(Error, Debug)]
pub enum AuthError {
    /// Every offered credential and challenge round was refused.
    #[error("authentication rejected: {0}")]
    Rejected(String),

    /// The overall connect deadline or a challenge response deadline elapsed.
    #[error("authentication timeout")]
    Timeout,

    /// The transport dropped mid-negotiation.
    #[error("transport failed during authentication: {0}")]
    Transport(String),
}

/// Failure while establishing the interactive shell channel.
#[derive(Error, Debug)]
pub enum ShellError {
    /// The provider refused to open a shell channel.
    #[error("failed to open shell channel: {0}")]
    Open(String),

    /// PTY or shell request rejected on an open channel.
    #[error("shell channel rejected request: {0}")]
    Request(String),
}

/// Mid-session failure on an established shell stream.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Writing client input into the shell stream failed.
    #[error("shell stream write failed: {0}")]
    Write(String),

    /// The provider reported a stream fault.
    #[error("shell stream failed: {0}")]
    Provider(String),
}

/// Malformed client traffic. Offending frames are dropped, never fatal.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Frame text did not parse as a known client event.
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Binary frames are not part of the protocol.
    #[error("unexpected binary frame")]
    BinaryFrame,
}

/// Anything that can take a session to the `Failed` state.
///
/// The `Display` form becomes the human-readable reason carried by the
/// session error event.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Shell(#[from] ShellError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Top-level gateway failure.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}
