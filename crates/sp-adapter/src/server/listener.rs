//! Loopback listener
//!
//! Binds 127.0.0.1 and spawns one tracked task per accepted connection.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use russh::server::Config;
use russh::{Disconnect, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sp_core::ListenError;

use crate::keys::HostSigner;
use crate::server::handler::ConnectionHandler;
use crate::server::ServerContext;

/// First candidate of automatic port selection (start of the ephemeral range)
pub const DEFAULT_PORT_SEARCH_BASE: u16 = 49152;

/// Candidate ports tried before giving up
pub const DEFAULT_PORT_SEARCH_ATTEMPTS: u16 = 10;

/// How long a cancelled connection may take to finish its disconnect
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after `consecutive` failed accepts in a row (EMFILE and friends)
fn accept_backoff(consecutive: u32) -> Duration {
    let factor = 1u32.checked_shl(consecutive.saturating_sub(1)).unwrap_or(u32::MAX);
    ACCEPT_BACKOFF_INITIAL
        .saturating_mul(factor)
        .min(ACCEPT_BACKOFF_MAX)
}

/// How the listening port is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSelection {
    /// Bind exactly this port, once. Port 0 lets the OS choose.
    Fixed(u16),
    /// Try `base`, `base + 1`, ... for at most `attempts` ports
    Auto { base: u16, attempts: u16 },
}

impl Default for PortSelection {
    fn default() -> Self {
        Self::Auto {
            base: DEFAULT_PORT_SEARCH_BASE,
            attempts: DEFAULT_PORT_SEARCH_ATTEMPTS,
        }
    }
}

impl PortSelection {
    /// Ports tried, in order
    pub fn candidates(&self) -> Vec<u16> {
        match *self {
            Self::Fixed(port) => vec![port],
            Self::Auto { base, attempts } => (0..attempts)
                .map_while(|offset| base.checked_add(offset))
                .collect(),
        }
    }
}

/// Bind a loopback listener according to `selection`
pub async fn bind_loopback(selection: PortSelection) -> Result<TcpListener, ListenError> {
    match selection {
        PortSelection::Fixed(port) => TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .map_err(|source| ListenError::Bind { port, source }),
        PortSelection::Auto { base, attempts } => {
            for port in selection.candidates() {
                match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
                    Ok(listener) => return Ok(listener),
                    Err(e) => tracing::debug!("Port {} unavailable: {}", port, e),
                }
            }
            Err(ListenError::Exhausted {
                first: base,
                last: base.saturating_add(attempts.saturating_sub(1)),
                attempts,
            })
        }
    }
}

/// russh configuration: one host key, public key authentication only
pub fn server_config(host: &dyn HostSigner) -> Arc<Config> {
    let mut config = Config::default();
    config.keys.push(host.signing_key());
    config.methods = MethodSet::PUBLICKEY;
    config.auth_rejection_time = Duration::from_secs(1);
    config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    Arc::new(config)
}

/// Accept loop over a bound listener
pub struct Acceptor {
    listener: TcpListener,
    config: Arc<Config>,
    context: Arc<ServerContext>,
}

impl Acceptor {
    pub fn new(listener: TcpListener, config: Arc<Config>, context: Arc<ServerContext>) -> Self {
        Self {
            listener,
            config,
            context,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until `cancel` fires; the listener is closed on return
    pub async fn run(self, cancel: CancellationToken, tracker: TaskTracker) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!("SSH proxy listening on {}", addr);
        }

        let mut accept_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("SSH proxy no longer accepting connections");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            accept_errors = 0;
                            self.spawn_connection(socket, peer_addr, &cancel, &tracker);
                        }
                        Err(e) => {
                            accept_errors = accept_errors.saturating_add(1);
                            let pause = accept_backoff(accept_errors);
                            tracing::error!(
                                "Failed to accept connection: {} (retrying in {:?})",
                                e,
                                pause
                            );
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = tokio::time::sleep(pause) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    fn spawn_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        cancel: &CancellationToken,
        tracker: &TaskTracker,
    ) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config);
        let context = Arc::clone(&self.context);
        let conn_cancel = cancel.child_token();
        let channel_tracker = tracker.clone();

        tracker.spawn(async move {
            let id = context.registry.register(peer_addr, conn_cancel.clone());
            let handler = ConnectionHandler::new(
                Arc::clone(&context),
                peer_addr,
                conn_cancel.clone(),
                channel_tracker,
            );

            serve_connection(config, socket, handler, peer_addr, conn_cancel.clone()).await;

            // Channels outliving their connection are stopped too
            conn_cancel.cancel();
            if let Some(entry) = context.registry.remove(id) {
                tracing::debug!(
                    "Connection {} from {} released after {:?}, {} live",
                    id,
                    peer_addr,
                    entry.age(),
                    context.registry.len()
                );
            }
        });
    }
}

async fn serve_connection(
    config: Arc<Config>,
    socket: TcpStream,
    handler: ConnectionHandler,
    peer_addr: SocketAddr,
    cancel: CancellationToken,
) {
    // The handshake itself may stall; it must not outlive shutdown
    let session = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Handshake with {} cancelled", peer_addr);
            return;
        }
        result = russh::server::run_stream(config, socket, handler) => match result {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                return;
            }
        },
    };

    let handle = session.handle();
    tokio::pin!(session);

    let result = tokio::select! {
        result = &mut session => result,
        _ = cancel.cancelled() => {
            tracing::debug!("Disconnecting {}", peer_addr);
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "proxy shutting down".to_string(),
                    "en".to_string(),
                )
                .await;
            match tokio::time::timeout(DISCONNECT_TIMEOUT, &mut session).await {
                Ok(result) => result,
                Err(_) => Ok(()),
            }
        }
    };

    match result {
        Ok(()) => tracing::info!("Connection from {} closed normally", peer_addr),
        Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
    }
}
