//! Loopback SSH server: acceptor, per-connection handler and registry

mod handler;
mod listener;
mod registry;

use std::sync::Arc;

use sp_core::{Communicator, SerializedUi};

use crate::auth::AuthGate;

pub use handler::{ChannelPurpose, ChannelState, ConnectionHandler};
pub use listener::{
    bind_loopback, server_config, Acceptor, PortSelection, DEFAULT_PORT_SEARCH_ATTEMPTS,
    DEFAULT_PORT_SEARCH_BASE,
};
pub use registry::{ConnectionEntry, ConnectionId, ConnectionRegistry};

/// State shared by every connection of one adapter
pub struct ServerContext {
    pub gate: AuthGate,
    pub communicator: Arc<dyn Communicator>,
    pub ui: SerializedUi,
    pub registry: ConnectionRegistry,
    /// Remote sftp-server to pipe `sftp` subsystems to instead of bridging
    pub sftp_command: Option<String>,
}
