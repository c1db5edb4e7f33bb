//! Per-connection SSH handler
//!
//! Authenticates the single allowed identity and dispatches each session
//! channel to the exec or SFTP bridge based on its first request.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::PublicKey;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sp_core::ChannelProtocolError;

use crate::auth::AuthMethod;
use crate::bridge::{ExecBridge, SftpBridge};
use crate::server::ServerContext;

/// What a classified channel is serving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPurpose {
    Exec,
    Sftp,
}

impl ChannelPurpose {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::Sftp => "sftp",
        }
    }
}

/// Dispatch state of one session channel.
///
/// `AwaitingPurpose` holds the channel until an exec or sftp request
/// claims it; the entry is dropped once the client closes the channel.
pub enum ChannelState {
    AwaitingPurpose(Channel<Msg>),
    Serving(ChannelPurpose),
}

/// Handler for a single client connection
pub struct ConnectionHandler {
    context: Arc<ServerContext>,
    peer_addr: SocketAddr,
    /// Cancelled when the connection is torn down
    cancel: CancellationToken,
    /// Tracks channel tasks so shutdown can wait for them
    tracker: TaskTracker,
    /// Authenticated user
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ConnectionHandler {
    pub fn new(
        context: Arc<ServerContext>,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            context,
            peer_addr,
            cancel,
            tracker,
            user: None,
            channels: HashMap::new(),
        }
    }

    /// Move a channel out of `AwaitingPurpose`, fixing its purpose
    fn claim(
        &mut self,
        id: ChannelId,
        purpose: ChannelPurpose,
    ) -> Result<Channel<Msg>, ChannelProtocolError> {
        match self.channels.remove(&id) {
            Some(ChannelState::AwaitingPurpose(channel)) => {
                self.channels.insert(id, ChannelState::Serving(purpose));
                Ok(channel)
            }
            Some(ChannelState::Serving(existing)) => {
                self.channels.insert(id, ChannelState::Serving(existing));
                Err(ChannelProtocolError::AlreadyClassified(existing.as_str()))
            }
            None => Err(ChannelProtocolError::UnknownChannel),
        }
    }

    fn refuse(&self, id: ChannelId, error: ChannelProtocolError, session: &mut Session) {
        tracing::warn!("Refusing request on channel {:?} from {}: {}", id, self.peer_addr, error);
        session.channel_failure(id);
    }

    fn spawn_exec(&self, channel: Channel<Msg>, handle: Handle, command: String) {
        let bridge = ExecBridge::new(
            Arc::clone(&self.context.communicator),
            self.context.ui.clone(),
        );
        let cancel = self.cancel.child_token();
        self.tracker
            .spawn(async move { bridge.run(channel, handle, command, cancel).await });
    }

    fn spawn_sftp(&self, channel: Channel<Msg>, handle: Handle) {
        let bridge = SftpBridge::new(
            Arc::clone(&self.context.communicator),
            self.context.ui.clone(),
        );
        let cancel = self.cancel.child_token();
        let peer_addr = self.peer_addr;

        self.tracker.spawn(async move {
            let id = channel.id();
            if let Err(e) = bridge.serve(channel.into_stream(), cancel).await {
                tracing::warn!("SFTP channel {:?} from {} failed: {}", id, peer_addr, e);
            }
            let _ = handle.close(id).await;
        });
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Answer a key probe; only mismatches count as attempts
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let outcome = self.context.gate.evaluate(user, public_key);
        if outcome.is_ok() {
            return Ok(Auth::Accept);
        }
        self.context
            .gate
            .record(self.peer_addr, user, AuthMethod::PublicKeyOffered, &outcome);
        Ok(Auth::Reject {
            proceed_with_methods: None,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        tracing::debug!(
            "Auth attempt from {} ({}), key fingerprint: {}",
            self.peer_addr,
            user,
            public_key.fingerprint()
        );

        match self
            .context
            .gate
            .check(self.peer_addr, user, public_key, AuthMethod::PublicKey)
        {
            Ok(()) => {
                self.user = Some(user.to_string());
                Ok(Auth::Accept)
            }
            Err(_) => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        tracing::debug!("Session channel {:?} opened by {}", id, self.peer_addr);
        self.channels.insert(id, ChannelState::AwaitingPurpose(channel));
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let error = ChannelProtocolError::UnsupportedChannelType("direct-tcpip".to_string());
        tracing::warn!(
            "Refusing channel to {}:{} from {}: {}",
            host_to_connect,
            port_to_connect,
            self.peer_addr,
            error
        );
        Ok(false)
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let error = ChannelProtocolError::UnsupportedChannelType("x11".to_string());
        tracing::warn!("Refusing channel from {}: {}", self.peer_addr, error);
        Ok(false)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();

        match self.claim(channel, ChannelPurpose::Exec) {
            Ok(claimed) => {
                tracing::info!(
                    "{} executing on channel {:?}: {}",
                    self.user.as_deref().unwrap_or("?"),
                    channel,
                    command
                );
                session.channel_success(channel);
                self.spawn_exec(claimed, session.handle(), command);
            }
            Err(error) => self.refuse(channel, error, session),
        }
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" {
            let error = ChannelProtocolError::UnsupportedSubsystem(name.to_string());
            self.refuse(channel, error, session);
            return Ok(());
        }

        match self.claim(channel, ChannelPurpose::Sftp) {
            Ok(claimed) => {
                session.channel_success(channel);
                match self.context.sftp_command.clone() {
                    Some(command) => {
                        tracing::info!(
                            "SFTP on channel {:?} piped to remote command: {}",
                            channel,
                            command
                        );
                        self.spawn_exec(claimed, session.handle(), command);
                    }
                    None => {
                        tracing::info!("SFTP session started on channel {:?}", channel);
                        self.spawn_sftp(claimed, session.handle());
                    }
                }
            }
            Err(error) => self.refuse(channel, error, session),
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, ChannelProtocolError::UnsupportedRequest("shell"), session);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, ChannelProtocolError::UnsupportedRequest("pty-req"), session);
        Ok(())
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.refuse(channel, ChannelProtocolError::UnsupportedRequest("x11-req"), session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.remove(&channel) {
            let purpose = match state {
                ChannelState::AwaitingPurpose(_) => "unclassified",
                ChannelState::Serving(purpose) => purpose.as_str(),
            };
            tracing::debug!("Channel {:?} ({}) closed by {}", channel, purpose, self.peer_addr);
        }
        Ok(())
    }
}
