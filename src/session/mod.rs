//! Per-connection session engine
//!
//! A [`Session`] owns everything about one connection once the transport has
//! handed it a channel: the lifecycle state, the line reader and the loop
//! that feeds completed lines to the extractor and the pseudo-command table.
//! Nothing in here is shared with other sessions except the read-only
//! [`SessionServices`].

pub mod auth;
pub mod commands;
pub mod extract;
pub mod terminal;

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::config::Config;
use crate::db::DownloadQueue;
use commands::CommandTable;
use extract::Extractor;
use terminal::LineReader;

/// Byte-level access to an interactive channel.
#[async_trait]
pub trait ChannelIo: Send {
    /// Next chunk of client input; `None` once the channel is closed or at EOF.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    async fn send(&mut self, data: &[u8]) -> Result<(), SessionError>;

    /// Best-effort close; errors are swallowed since the peer may be gone.
    async fn close(&mut self);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session channel was opened")]
    NoChannel,
    #[error("client never asked for a shell")]
    ShellTimeout,
    #[error("no input for {0:?}, peer presumed dead")]
    ReadTimeout(Duration),
    #[error("channel closed by peer")]
    ChannelClosed,
    #[error("write to channel failed: {0}")]
    Write(String),
    #[error("undecodable input bytes: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Negotiating,
    AwaitingShell,
    Interactive,
    Closed,
    Errored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Exit,
    Eof,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exit => write!(f, "exit command"),
            CloseReason::Eof => write!(f, "channel closed by client"),
        }
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub state: SessionState,
    pub result: Result<CloseReason, SessionError>,
    pub commands: usize,
    pub banner_sent: bool,
}

/// Read-only collaborators shared by every session.
#[derive(Clone)]
pub struct SessionServices {
    pub config: Arc<Config>,
    pub commands: Arc<CommandTable>,
    pub extractor: Arc<Extractor>,
}

impl SessionServices {
    pub fn new(config: Arc<Config>, queue: Arc<dyn DownloadQueue>) -> Result<Self, regex::Error> {
        let commands = Arc::new(CommandTable::from_config(&config));
        let extractor = Arc::new(Extractor::new(queue)?);
        Ok(Self {
            config,
            commands,
            extractor,
        })
    }
}

/// State of one accepted connection.
pub struct Session {
    id: String,
    peer: SocketAddr,
    state: SessionState,
    services: SessionServices,
    span: Span,
    commands: usize,
    banner_sent: bool,
}

impl Session {
    pub fn new(peer: SocketAddr, services: SessionServices) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        let span = info_span!("session", id = %id, peer = %peer.ip());
        Self {
            id,
            peer,
            state: SessionState::Connected,
            services,
            span,
            commands: 0,
            banner_sent: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn span(&self) -> Span {
        self.span.clone()
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    /// The socket has been handed to the SSH transport.
    pub fn negotiating(&mut self) {
        self.transition(SessionState::Negotiating);
    }

    /// The transport rejected the handshake before any channel existed.
    pub fn negotiation_failed(mut self, error: &dyn fmt::Display) -> SessionOutcome {
        let _enter = self.span.enter();
        warn!(error = %error, "SSH negotiation failed");
        self.state = SessionState::Errored;
        SessionOutcome {
            state: self.state,
            result: Err(SessionError::NoChannel),
            commands: 0,
            banner_sent: false,
        }
    }

    /// Drive the session to completion.
    ///
    /// `channel` resolves once the transport has authenticated the client and
    /// opened a session channel; `shell` once the client asks for a shell.
    /// Dropping either sender (transport gone) ends the wait early. The
    /// channel, once received, is closed on every path out of here.
    pub async fn run<C>(
        mut self,
        channel: oneshot::Receiver<C>,
        shell: oneshot::Receiver<()>,
    ) -> SessionOutcome
    where
        C: ChannelIo,
    {
        let span = self.span.clone();
        async move {
            if self.state == SessionState::Connected {
                self.transition(SessionState::Negotiating);
            }

            let channel_timeout = self.services.config.session.channel_timeout();
            let mut channel = match tokio::time::timeout(channel_timeout, channel).await {
                Ok(Ok(channel)) => channel,
                Ok(Err(_)) => {
                    info!("Transport ended before a session channel was opened");
                    return self.finish(Err(SessionError::NoChannel));
                }
                Err(_) => {
                    info!("No session channel within {:?}", channel_timeout);
                    return self.finish(Err(SessionError::NoChannel));
                }
            };

            let result = self.drive(&mut channel, shell).await;
            channel.close().await;
            self.finish(result)
        }
        .instrument(span)
        .await
    }

    async fn drive<C>(
        &mut self,
        channel: &mut C,
        shell: oneshot::Receiver<()>,
    ) -> Result<CloseReason, SessionError>
    where
        C: ChannelIo,
    {
        self.transition(SessionState::AwaitingShell);

        let shell_timeout = self.services.config.session.shell_timeout();
        match tokio::time::timeout(shell_timeout, shell).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => return Err(SessionError::ShellTimeout),
        }

        self.transition(SessionState::Interactive);
        let emulation = &self.services.config.emulation;
        channel.send(emulation.welcome_banner.as_bytes()).await?;
        self.banner_sent = true;

        let mut reader = LineReader::new(self.services.config.session.read_timeout());
        loop {
            channel.send(emulation.prompt.as_bytes()).await?;

            let command = match reader.read_line(channel).await {
                Ok(line) => line,
                Err(SessionError::ChannelClosed) => return Ok(CloseReason::Eof),
                Err(e) => return Err(e),
            };
            self.commands += 1;
            info!(command = %command, "Command received");

            self.services.extractor.scan(&command, self.peer.ip(), &self.id);

            if command == "exit" {
                info!("Connection closed via exit command");
                return Ok(CloseReason::Exit);
            }

            let response = self.services.commands.respond(&command);
            info!(command = %command, response = %response, "Response from honeypot");
            if !response.is_empty() {
                channel.send(format!("{}\r\n", response).as_bytes()).await?;
            }
        }
    }

    fn finish(mut self, result: Result<CloseReason, SessionError>) -> SessionOutcome {
        match &result {
            Ok(reason) => {
                self.transition(SessionState::Closed);
                info!(reason = %reason, commands = self.commands, "Session closed");
            }
            Err(SessionError::ShellTimeout) => {
                self.transition(SessionState::Errored);
                info!("Client never asked for a shell");
            }
            Err(SessionError::NoChannel) => {
                self.transition(SessionState::Errored);
                info!("Connection closed without a session channel");
            }
            Err(e) => {
                self.transition(SessionState::Errored);
                warn!(error = %e, commands = self.commands, "Session aborted");
            }
        }

        SessionOutcome {
            state: self.state,
            result,
            commands: self.commands,
            banner_sent: self.banner_sent,
        }
    }
}
