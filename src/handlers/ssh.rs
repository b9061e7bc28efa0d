//! SSH honeypot handler
//!
//! The accept loop hands each socket to russh together with a fresh
//! [`HoneypotHandler`]. The handler answers the protocol callbacks and passes
//! the session channel and the shell request to the connection's
//! [`Session`] through one-shot channels; everything after that happens in
//! the session controller.

use anyhow::{Context, Result};
use async_trait::async_trait;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{Auth, Msg, Session as SshSession};
use russh::{Channel, ChannelId, ChannelMsg, Disconnect, SshId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument, Span};

use crate::config::Config;
use crate::session::auth::{allowed_methods, AuthPolicy};
use crate::session::{ChannelIo, Session, SessionError, SessionOutcome, SessionServices};

/// How long the transport gets to wind down after we disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// A russh session channel seen through [`ChannelIo`].
pub struct SshChannel {
    inner: Channel<Msg>,
}

#[async_trait]
impl ChannelIo for SshChannel {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.inner.wait().await? {
                ChannelMsg::Data { data } => return Some(data.to_vec()),
                ChannelMsg::Eof | ChannelMsg::Close => return None,
                // Requests are answered by the handler; extended data is ignored
                _ => {}
            }
        }
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.inner
            .data(data)
            .await
            .map_err(|e| SessionError::Write(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.inner.eof().await;
        let _ = self.inner.close().await;
    }
}

/// Per-connection server policy
pub struct HoneypotHandler {
    peer: SocketAddr,
    session_id: String,
    policy: AuthPolicy,
    services: SessionServices,
    channel_tx: Option<oneshot::Sender<SshChannel>>,
    shell_tx: Option<oneshot::Sender<()>>,
    session_channel: Option<ChannelId>,
    // russh drives the callbacks from its own task
    span: Span,
}

impl HoneypotHandler {
    pub fn new(
        peer: SocketAddr,
        session_id: String,
        span: Span,
        services: SessionServices,
        channel_tx: oneshot::Sender<SshChannel>,
        shell_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            peer,
            session_id,
            policy: AuthPolicy::new(peer.ip()),
            services,
            channel_tx: Some(channel_tx),
            shell_tx: Some(shell_tx),
            session_channel: None,
            span,
        }
    }
}

impl russh::server::Handler for HoneypotHandler {
    type Error = anyhow::Error;

    async fn authentication_banner(&mut self) -> Result<Option<String>, Self::Error> {
        let _span = self.span.enter();
        let banner = &self.services.config.emulation.auth_banner;
        if banner.is_empty() {
            Ok(None)
        } else {
            Ok(Some(banner.clone()))
        }
    }

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        let _span = self.span.enter();
        Ok(self.policy.check_none(user).into_auth())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let _span = self.span.enter();
        Ok(self.policy.check_password(user, password).into_auth())
    }

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let _span = self.span.enter();
        Ok(self.policy.check_public_key(user, public_key).into_auth())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let _span = self.span.enter();
        Ok(self.policy.check_public_key(user, public_key).into_auth())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let _span = self.span.enter();
        let id = channel.id();
        let Some(tx) = self.channel_tx.take() else {
            debug!(channel = %id, "Refusing additional session channel");
            return Ok(false);
        };

        let client_version = String::from_utf8_lossy(session.remote_sshid()).into_owned();
        info!(channel = %id, client_version = %client_version, "Session channel opened");

        if tx.send(SshChannel { inner: channel }).is_err() {
            // Controller stopped waiting
            return Ok(false);
        }
        self.session_channel = Some(id);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _span = self.span.enter();
        info!(term = %term, cols = col_width, rows = row_height, "PTY requested");
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _span = self.span.enter();
        if self.session_channel == Some(channel) {
            if let Some(tx) = self.shell_tx.take() {
                info!("Shell requested");
                let _ = session.channel_success(channel);
                let _ = tx.send(());
                return Ok(());
            }
        }
        let _ = session.channel_failure(channel);
        Ok(())
    }

    /// Log and scan `ssh host "command"` payloads; nothing is ever run.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _span = self.span.enter();
        let command = String::from_utf8_lossy(data);
        info!(command = %command, "Exec request (not executed)");
        self.services
            .extractor
            .scan(&command, self.peer.ip(), &self.session_id);

        let _ = session.channel_success(channel);
        let _ = session.exit_status_request(channel, 0);
        let _ = session.close(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut SshSession,
    ) -> Result<(), Self::Error> {
        let _span = self.span.enter();
        info!(subsystem = %name, "Subsystem request refused");
        let _ = session.channel_failure(channel);
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let _span = self.span.enter();
        warn!(
            target_host = %host_to_connect,
            target_port = port_to_connect,
            originator = %format!("{}:{}", originator_address, originator_port),
            "Port forwarding attempt refused"
        );
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut SshSession,
    ) -> Result<bool, Self::Error> {
        let _span = self.span.enter();
        warn!(address = %address, port = *port, "Reverse forwarding attempt refused");
        Ok(false)
    }
}

/// russh settings shared by every connection.
pub fn server_config(config: &Config, host_key: PrivateKey) -> russh::server::Config {
    let mut ssh_config = russh::server::Config::default();
    ssh_config.keys.push(host_key);
    ssh_config.server_id = SshId::Standard(config.emulation.ssh_banner.clone());
    ssh_config.methods = allowed_methods();
    ssh_config.auth_rejection_time = Duration::from_secs(1);
    ssh_config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    ssh_config
}

/// Bind the listening socket with `SO_REUSEADDR` and the configured backlog.
pub fn bind(config: &Config) -> Result<TcpListener> {
    let addr = config.listen_addr()?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("creating listening socket")?;
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("binding SSH listener to {}", addr))?;
    let listener = socket
        .listen(config.server.backlog)
        .with_context(|| format!("listening on {}", addr))?;
    Ok(listener)
}

/// Run the SSH honeypot until the process stops.
pub async fn serve(config: Arc<Config>, services: SessionServices, host_key: PrivateKey) -> Result<()> {
    let listener = bind(&config)?;
    info!("SSH honeypot listening on {}", listener.local_addr()?);
    let ssh_config = Arc::new(server_config(&config, host_key));
    accept_loop(listener, ssh_config, services).await
}

async fn accept_loop(
    listener: TcpListener,
    ssh_config: Arc<russh::server::Config>,
    services: SessionServices,
) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(
                    stream,
                    peer,
                    ssh_config.clone(),
                    services.clone(),
                ));
            }
            Err(e) => {
                warn!("SSH accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ssh_config: Arc<russh::server::Config>,
    services: SessionServices,
) {
    let mut session = Session::new(peer, services.clone());
    let span = session.span();

    async move {
        info!("Connection opened");
        let (channel_tx, channel_rx) = oneshot::channel();
        let (shell_tx, shell_rx) = oneshot::channel();
        let handler = HoneypotHandler::new(
            peer,
            session.id().to_string(),
            session.span(),
            services.clone(),
            channel_tx,
            shell_tx,
        );

        session.negotiating();
        // A peer that never sends its identification string must not pin the task
        let handshake = tokio::time::timeout(
            services.config.session.channel_timeout(),
            russh::server::run_stream(ssh_config, stream, handler),
        )
        .await;
        let running = match handshake {
            Ok(Ok(running)) => running,
            Ok(Err(e)) => {
                session.negotiation_failed(&e);
                return;
            }
            Err(_) => {
                session.negotiation_failed(&"identification exchange timed out");
                return;
            }
        };

        let guard = TransportGuard {
            handle: running.handle(),
            task: Some(tokio::spawn(running)),
        };

        let outcome = session.run(channel_rx, shell_rx).await;
        let transport_error = guard.shutdown().await;
        report_connection(&outcome, transport_error.as_ref());
    }
    .instrument(span)
    .await
}

/// Owns the running transport; aborts it if the connection task unwinds.
struct TransportGuard {
    handle: russh::server::Handle,
    task: Option<JoinHandle<Result<(), anyhow::Error>>>,
}

impl TransportGuard {
    /// Disconnect and wait for the transport task. Returns the error the
    /// transport ended with, if any.
    async fn shutdown(mut self) -> Option<anyhow::Error> {
        if self
            .handle
            .disconnect(Disconnect::ByApplication, "".into(), "en".into())
            .await
            .is_err()
        {
            debug!("Transport already gone");
        }

        let mut task = self.task.take()?;
        match tokio::time::timeout(DISCONNECT_GRACE, &mut task).await {
            Ok(Ok(Ok(()))) => {
                debug!("Transport closed");
                None
            }
            Ok(Ok(Err(e))) => Some(e),
            Ok(Err(e)) => {
                warn!(error = %e, "Transport task failed");
                None
            }
            Err(_) => {
                debug!("Transport did not close in time");
                task.abort();
                None
            }
        }
    }
}

/// Log how the connection ended.
///
/// A transport error with no session channel means negotiation (key
/// exchange or authentication) never completed, which is worth a warning.
fn report_connection(outcome: &SessionOutcome, transport_error: Option<&anyhow::Error>) {
    match (&outcome.result, transport_error) {
        (Err(SessionError::NoChannel), Some(e)) => {
            warn!(error = %e, "SSH negotiation failed");
        }
        (_, Some(e)) => debug!(error = %e, "Transport ended with error"),
        (_, None) => {}
    }
    debug!(
        state = ?outcome.state,
        result = ?outcome.result,
        commands = outcome.commands,
        banner_sent = outcome.banner_sent,
        "Connection finished"
    );
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
