//! Scripted in-memory provider for exercising session flows.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::{ConnectionConfig, Credential};
use crate::error::{AuthError, ConnectError, ShellError};
use crate::protocol::Geometry;

use super::{
    AuthVerdict, ProviderSession, SessionProvider, ShellChannel, ShellCommand, ShellEvent,
    SHELL_CHANNEL_CAPACITY,
};

/// Everything a fake session was asked to do, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeCall {
    Connect,
    Credential(String),
    BeginInteractive,
    Answer(Vec<String>),
    OpenShell(Geometry),
    Data(Vec<u8>),
    Resize(Geometry),
    Close,
}

/// Provider whose auth verdicts come from a script. When the script runs
/// dry, every step answers `Ready`.
pub struct FakeProvider {
    inner: Arc<FakeInner>,
}

struct FakeInner {
    verdicts: Mutex<VecDeque<AuthVerdict>>,
    banner: Mutex<Option<String>>,
    connect_error: Mutex<Option<String>>,
    hang_connect: bool,
    calls: Mutex<Vec<FakeCall>>,
    feed: Mutex<Option<mpsc::Sender<ShellEvent>>>,
}

impl FakeProvider {
    /// Accepts the first credential and opens shells on demand.
    pub fn ready() -> Self {
        Self::with_verdicts(Vec::new())
    }

    /// Serves the given verdicts in order across all auth steps.
    pub fn with_verdicts(verdicts: Vec<AuthVerdict>) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                verdicts: Mutex::new(verdicts.into()),
                banner: Mutex::new(None),
                connect_error: Mutex::new(None),
                hang_connect: false,
                calls: Mutex::new(Vec::new()),
                feed: Mutex::new(None),
            }),
        }
    }

    /// Fails every connect attempt with the given reason.
    pub fn refusing_connect(reason: &str) -> Self {
        let provider = Self::ready();
        *provider.inner.connect_error.lock() = Some(reason.to_string());
        provider
    }

    /// Never completes a connect attempt.
    pub fn hanging() -> Self {
        Self {
            inner: Arc::new(FakeInner {
                verdicts: Mutex::new(VecDeque::new()),
                banner: Mutex::new(None),
                connect_error: Mutex::new(None),
                hang_connect: true,
                calls: Mutex::new(Vec::new()),
                feed: Mutex::new(None),
            }),
        }
    }

    pub fn set_banner(&self, text: &str) {
        *self.inner.banner.lock() = Some(text.to_string());
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.inner.calls.lock().clone()
    }

    /// Waits until the recorded calls satisfy the predicate, up to two
    /// seconds.
    pub async fn wait_for_calls<F>(&self, predicate: F) -> bool
    where
        F: Fn(&[FakeCall]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if predicate(&self.calls()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Sender for injecting shell output. Waits for `open_shell` to happen.
    pub async fn shell_feed(&self) -> mpsc::Sender<ShellEvent> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(feed) = self.inner.feed.lock().clone() {
                return feed;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no shell was opened within two seconds"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
    ) -> Result<Box<dyn ProviderSession>, ConnectError> {
        self.inner.calls.lock().push(FakeCall::Connect);
        if self.inner.hang_connect {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = self.inner.connect_error.lock().clone() {
            return Err(ConnectError::Handshake(reason));
        }
        Ok(Box::new(FakeSession {
            inner: self.inner.clone(),
        }))
    }
}

struct FakeSession {
    inner: Arc<FakeInner>,
}

impl FakeSession {
    fn next_verdict(&self) -> AuthVerdict {
        self.inner
            .verdicts
            .lock()
            .pop_front()
            .unwrap_or(AuthVerdict::Ready)
    }
}

#[async_trait]
impl ProviderSession for FakeSession {
    async fn try_credential(&mut self, credential: &Credential) -> Result<AuthVerdict, AuthError> {
        self.inner
            .calls
            .lock()
            .push(FakeCall::Credential(credential.kind().to_string()));
        Ok(self.next_verdict())
    }

    async fn begin_interactive(&mut self) -> Result<AuthVerdict, AuthError> {
        self.inner.calls.lock().push(FakeCall::BeginInteractive);
        Ok(self.next_verdict())
    }

    async fn answer_interactive(
        &mut self,
        responses: Vec<String>,
    ) -> Result<AuthVerdict, AuthError> {
        self.inner.calls.lock().push(FakeCall::Answer(responses));
        Ok(self.next_verdict())
    }

    fn take_banner(&mut self) -> Option<String> {
        self.inner.banner.lock().take()
    }

    async fn open_shell(&mut self, geometry: Geometry) -> Result<ShellChannel, ShellError> {
        self.inner.calls.lock().push(FakeCall::OpenShell(geometry));

        let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(SHELL_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(SHELL_CHANNEL_CAPACITY);
        *self.inner.feed.lock() = Some(event_tx);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                match cmd {
                    ShellCommand::Data(data) => {
                        inner.calls.lock().push(FakeCall::Data(data.to_vec()));
                    }
                    ShellCommand::Resize(g) => {
                        inner.calls.lock().push(FakeCall::Resize(g));
                    }
                    ShellCommand::Close => break,
                }
            }
        });

        Ok(ShellChannel { cmd_tx, event_rx })
    }

    async fn close(&mut self) {
        self.inner.calls.lock().push(FakeCall::Close);
    }
}
