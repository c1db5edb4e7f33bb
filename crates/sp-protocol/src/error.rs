//! Protocol error types

use thiserror::Error;

/// Errors that can occur while framing or parsing SFTP packets
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet declared a length of zero (no room for the type byte)
    #[error("Empty packet")]
    EmptyPacket,

    /// Packet exceeds maximum size
    #[error("Packet too large: {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },

    /// Packet body ended before a field could be read
    #[error("Truncated packet: missing {0}")]
    Truncated(&'static str),

    /// Packet type is not one this side of the protocol understands
    #[error("Unexpected packet type: {0}")]
    UnexpectedType(u8),

    /// A string field was not valid UTF-8
    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
