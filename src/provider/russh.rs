//! SSH session provider built on russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{ChannelMsg, Disconnect, MethodKind};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{ConnectionConfig, Credential};
use crate::error::{AuthError, ConnectError, ShellError};
use crate::protocol::{ChallengePrompt, Geometry};

use super::{
    AuthVerdict, ProviderChallenge, ProviderSession, SessionProvider, ShellChannel, ShellCommand,
    ShellEvent, SHELL_CHANNEL_CAPACITY,
};

/// Keepalive probe interval on established transports.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Missed keepalives tolerated before the transport is considered dead.
const KEEPALIVE_MAX: usize = 3;

/// Banner text captured by the transport handler, drained by the session.
type BannerSlot = Arc<Mutex<Option<String>>>;

/// Opens SSH transports with russh. The per-connect deadline is enforced by
/// the caller, so every step here runs to completion or error.
#[derive(Debug, Default)]
pub struct RusshProvider;

impl RusshProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionProvider for RusshProvider {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Box<dyn ProviderSession>, ConnectError> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket_addr = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| ConnectError::Resolve(format!("{addr}: {e}")))?
            .next()
            .ok_or_else(|| ConnectError::Resolve(format!("{addr}: no addresses")))?;

        debug!("opening transport to {socket_addr}");
        let stream = TcpStream::connect(socket_addr).await?;

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let banner: BannerSlot = Arc::new(Mutex::new(None));
        let handler = TransportHandler {
            host: config.host.clone(),
            port: config.port,
            banner: banner.clone(),
        };

        let handle = client::connect_stream(ssh_config, stream, handler)
            .await
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        Ok(Box::new(RusshSession {
            username: config.username.clone(),
            handle,
            banner,
        }))
    }
}

/// Transport event handler. Host keys are accepted and logged; verification
/// policy lives with the deployment, not the gateway.
struct TransportHandler {
    host: String,
    port: u16,
    banner: BannerSlot,
}

impl client::Handler for TransportHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "accepting host key for {}:{} ({})",
            self.host,
            self.port,
            server_public_key.algorithm()
        );
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let mut slot = self.banner.lock();
        match slot.as_mut() {
            Some(existing) => existing.push_str(banner),
            None => *slot = Some(banner.to_string()),
        }
        Ok(())
    }
}

/// One authenticated-or-authenticating SSH transport.
struct RusshSession {
    username: String,
    handle: client::Handle<TransportHandler>,
    banner: BannerSlot,
}

impl RusshSession {
    fn credential_verdict(result: client::AuthResult) -> AuthVerdict {
        match result {
            client::AuthResult::Success => AuthVerdict::Ready,
            client::AuthResult::Failure {
                remaining_methods,
                partial_success,
            } => AuthVerdict::Denied {
                reason: if partial_success {
                    "server requires further authentication".to_string()
                } else {
                    "credential rejected by server".to_string()
                },
                interactive: remaining_methods.contains(&MethodKind::KeyboardInteractive),
            },
        }
    }

    fn interactive_verdict(response: KeyboardInteractiveAuthResponse) -> AuthVerdict {
        match response {
            KeyboardInteractiveAuthResponse::Success => AuthVerdict::Ready,
            KeyboardInteractiveAuthResponse::Failure { .. } => AuthVerdict::Denied {
                reason: "authentication rejected by server".to_string(),
                interactive: false,
            },
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => AuthVerdict::Challenge(ProviderChallenge {
                name,
                instructions,
                prompts: prompts
                    .into_iter()
                    .map(|p| ChallengePrompt {
                        prompt: p.prompt,
                        echo: p.echo,
                    })
                    .collect(),
            }),
        }
    }
}

#[async_trait]
impl ProviderSession for RusshSession {
    async fn try_credential(&mut self, credential: &Credential) -> Result<AuthVerdict, AuthError> {
        match credential {
            Credential::Password(password) => {
                let result = self
                    .handle
                    .authenticate_password(&self.username, password)
                    .await
                    .map_err(|e| AuthError::Transport(e.to_string()))?;
                Ok(Self::credential_verdict(result))
            }
            Credential::Key {
                material,
                passphrase,
            } => {
                let key = match russh::keys::decode_secret_key(material, passphrase.as_deref()) {
                    Ok(key) => key,
                    Err(e) => {
                        debug!("private key unusable, skipping: {e}");
                        return Ok(AuthVerdict::Denied {
                            reason: format!("unusable private key: {e}"),
                            interactive: false,
                        });
                    }
                };
                let result = self
                    .handle
                    .authenticate_publickey(
                        &self.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), None),
                    )
                    .await
                    .map_err(|e| AuthError::Transport(e.to_string()))?;
                Ok(Self::credential_verdict(result))
            }
        }
    }

    async fn begin_interactive(&mut self) -> Result<AuthVerdict, AuthError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_start(&self.username, None::<String>)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(Self::interactive_verdict(response))
    }

    async fn answer_interactive(
        &mut self,
        responses: Vec<String>,
    ) -> Result<AuthVerdict, AuthError> {
        let response = self
            .handle
            .authenticate_keyboard_interactive_respond(responses)
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;
        Ok(Self::interactive_verdict(response))
    }

    fn take_banner(&mut self) -> Option<String> {
        self.banner.lock().take()
    }

    async fn open_shell(&mut self, geometry: Geometry) -> Result<ShellChannel, ShellError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ShellError::Open(e.to_string()))?;

        channel
            .request_pty(
                false,
                "xterm-256color",
                geometry.cols,
                geometry.rows,
                geometry.width_px,
                geometry.height_px,
                &[],
            )
            .await
            .map_err(|e| ShellError::Request(format!("PTY request failed: {e}")))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| ShellError::Request(format!("shell request failed: {e}")))?;

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(SHELL_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(SHELL_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                warn!("shell write failed: {e}");
                                let _ = event_tx
                                    .send(ShellEvent::Fault(format!("write failed: {e}")))
                                    .await;
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(g)) => {
                            // Don't break on resize error, continue
                            if let Err(e) = channel
                                .window_change(g.cols, g.rows, g.width_px, g.height_px)
                                .await
                            {
                                warn!("window change failed: {e}");
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            let _ = channel.eof().await;
                            break;
                        }
                    },
                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            if event_tx
                                .send(ShellEvent::Stdout(Bytes::copy_from_slice(&data)))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            // ext 1 is the SSH stderr stream
                            if ext == 1
                                && event_tx
                                    .send(ShellEvent::Stderr(Bytes::copy_from_slice(&data)))
                                    .await
                                    .is_err()
                            {
                                break;
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            debug!("remote shell exited with status {exit_status}");
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            debug!("remote shell terminated by signal {signal_name:?}");
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                            let _ = event_tx.send(ShellEvent::Closed).await;
                            break;
                        }
                        Some(_) => {}
                    },
                }
            }
            debug!("shell channel task ended");
        });

        Ok(ShellChannel { cmd_tx, event_rx })
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "Session closed", "en")
            .await
        {
            debug!("disconnect notification failed: {e}");
        }
    }
}
