//! Lifecycle controller
//!
//! [`ProxyAdapter`] ties key material, the Communicator and the UI to one
//! loopback listener. `start` binds and spawns the accept loop; `shutdown`
//! raises the shutdown signal, waits a bounded time for connections and
//! channels to finish, and removes the generated client key.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use sp_core::{Communicator, ListenError, ProxyError, SerializedUi};

use crate::auth::{AuthGate, AuthStats};
use crate::keys::{ClientCredential, HostIdentity};
use crate::server::{bind_loopback, server_config, Acceptor, PortSelection, ServerContext};

/// Default bound on how long shutdown waits for in-flight work
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Adapter settings independent of key material
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// The only user name accepted
    pub user: String,
    pub port: PortSelection,
    pub shutdown_grace: Duration,
    /// Pipe `sftp` subsystems to this remote command instead of bridging
    pub sftp_command: Option<String>,
}

impl AdapterOptions {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            port: PortSelection::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            sftp_command: None,
        }
    }
}

/// Diagnostics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterStats {
    pub auth: AuthStats,
    pub live_connections: usize,
}

/// A loopback SSH server bridging exec and sftp onto a Communicator
pub struct ProxyAdapter {
    options: AdapterOptions,
    host: HostIdentity,
    client: ClientCredential,
    context: Arc<ServerContext>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    port: OnceLock<u16>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl ProxyAdapter {
    pub fn new(
        options: AdapterOptions,
        host: HostIdentity,
        client: ClientCredential,
        communicator: Arc<dyn Communicator>,
        ui: SerializedUi,
    ) -> Self {
        let context = Arc::new(ServerContext {
            gate: AuthGate::new(options.user.clone(), &client),
            communicator,
            ui,
            registry: Default::default(),
            sftp_command: options.sftp_command.clone(),
        });

        Self {
            options,
            host,
            client,
            context,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            port: OnceLock::new(),
            accept_task: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Bind the listener and start accepting. Returns the bound port.
    ///
    /// Calling `start` again after a successful start returns the same port.
    pub async fn start(&self) -> Result<u16, ProxyError> {
        if self.cancel.is_cancelled() {
            return Err(ListenError::ShutDown.into());
        }
        if let Some(port) = self.port.get() {
            return Ok(*port);
        }

        let listener = bind_loopback(self.options.port).await?;
        let port = listener.local_addr()?.port();

        let mut accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = self.port.get() {
            // Lost a race with a concurrent start; drop our listener
            return Ok(*existing);
        }
        if self.cancel.is_cancelled() {
            return Err(ListenError::ShutDown.into());
        }

        let config = server_config(&self.host);
        let acceptor = Acceptor::new(listener, config, Arc::clone(&self.context));
        let task = tokio::spawn(acceptor.run(self.cancel.clone(), self.tracker.clone()));
        *accept_task = Some(task);
        let _ = self.port.set(port);

        tracing::info!(
            "SSH proxy started on 127.0.0.1:{} for user {}",
            port,
            self.options.user
        );
        Ok(port)
    }

    /// Port bound by [`ProxyAdapter::start`]
    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    pub fn user(&self) -> &str {
        &self.options.user
    }

    /// Generated private key for the external ssh client, if any
    pub fn private_key_file(&self) -> Option<&Path> {
        self.client.private_key_file()
    }

    pub fn host_identity(&self) -> &HostIdentity {
        &self.host
    }

    pub fn client_credential(&self) -> &ClientCredential {
        &self.client
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            auth: self.context.gate.stats(),
            live_connections: self.context.registry.len(),
        }
    }

    /// Token raised by [`ProxyAdapter::shutdown`]
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting, close connections and clean up. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Shutting down SSH proxy");

        self.cancel.cancel();
        self.context.registry.close_all();
        self.tracker.close();

        let accept_task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                tracing::warn!("Accept loop ended abnormally: {}", e);
            }
        }

        if tokio::time::timeout(self.options.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "{} task(s) still running after {:?} grace period",
                self.tracker.len(),
                self.options.shutdown_grace
            );
        }

        if let Err(e) = self.client.cleanup() {
            tracing::warn!("Failed to remove generated client key: {}", e);
        }
        tracing::info!("SSH proxy stopped");
    }
}

impl Drop for ProxyAdapter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
