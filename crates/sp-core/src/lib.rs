//! sp-core: Core abstractions and configuration for sshproxy
//!
//! This crate provides the error taxonomy, provisioner settings, and the
//! `Communicator` and `Ui` capabilities consumed by the adapter and CLI.

pub mod config;
pub mod error;
pub mod local;
pub mod time;
pub mod traits;

pub use config::{KeyType, PreparedSettings, Preset, Settings};
pub use error::{
    AuthenticationError, ChannelProtocolError, CommunicatorError, ConfigError, KeyLoadError,
    ListenError, ProxyError, SftpStatusError,
};
pub use local::LocalCommunicator;
pub use traits::{
    Capabilities, Communicator, DirEntry, FileKind, FileMetadata, RemoteCommand, SerializedUi, Ui,
};
