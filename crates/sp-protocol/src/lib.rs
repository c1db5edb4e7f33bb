//! sp-protocol: SFTP wire protocol for the sshproxy adapter
//!
//! This crate defines the version 3 SFTP packets exchanged over an SSH
//! `sftp` subsystem channel: the length-prefixed framing codec, typed
//! requests and responses, and the attribute block.

pub mod attrs;
pub mod codec;
pub mod error;
pub mod message;
pub mod types;
mod wire;

pub use attrs::{long_name, FileAttributes, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
pub use codec::{PacketCodec, RawPacket, MAX_PACKET_SIZE};
pub use error::ProtocolError;
pub use message::{request_id, NameEntry, Request, Response};
pub use types::{OpenFlags, PacketType, StatusCode, SFTP_VERSION};
