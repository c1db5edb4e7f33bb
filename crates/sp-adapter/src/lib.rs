//! sp-adapter: loopback SSH server fronting a Communicator
//!
//! External tools that only speak SSH connect to 127.0.0.1, authenticate
//! with the one configured key, and have their `exec` requests and `sftp`
//! sessions translated into Communicator calls. Nothing is forwarded to a
//! real sshd.

pub mod adapter;
pub mod auth;
pub mod bridge;
pub mod keys;
pub mod server;

pub use adapter::{AdapterOptions, AdapterStats, ProxyAdapter, DEFAULT_SHUTDOWN_GRACE};
pub use auth::{AuthGate, AuthMethod, AuthStats};
pub use keys::{
    obtain_client_credential, obtain_client_credential_as, obtain_host_identity,
    obtain_host_identity_as, ClientCredential, HostIdentity, HostSigner, PublicKeySource,
    RSA_KEY_BITS,
};
pub use server::{
    PortSelection, DEFAULT_PORT_SEARCH_ATTEMPTS, DEFAULT_PORT_SEARCH_BASE,
};
