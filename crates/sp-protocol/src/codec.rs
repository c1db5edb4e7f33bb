//! Tokio codec for length-prefixed SFTP packets
//!
//! Every SFTP packet is framed as:
//! - length: 4 bytes (u32, big-endian, counts the type byte and body)
//! - type: 1 byte
//! - body: `length - 1` bytes

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the length prefix in bytes
pub const LENGTH_SIZE: usize = 4;

/// Largest packet accepted in either direction (type byte + body)
pub const MAX_PACKET_SIZE: usize = 256 * 1024 + 1024;

/// One framed packet: its type byte and the undecoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    /// Raw packet type byte
    pub kind: u8,
    /// Packet body following the type byte
    pub body: Bytes,
}

impl RawPacket {
    /// Create a new packet
    pub fn new(kind: u8, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }
}

/// Codec for encoding/decoding SFTP packet frames
#[derive(Debug, Default)]
pub struct PacketCodec {
    /// Length of the frame currently being received (if the prefix has been read)
    pending_length: Option<usize>,
}

impl PacketCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            pending_length: None,
        }
    }
}

impl Decoder for PacketCodec {
    type Item = RawPacket;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let length = match self.pending_length.take() {
            Some(length) => length,
            None => {
                if src.len() < LENGTH_SIZE {
                    return Ok(None);
                }
                let length = src.get_u32() as usize;
                if length == 0 {
                    return Err(ProtocolError::EmptyPacket);
                }
                if length > MAX_PACKET_SIZE {
                    return Err(ProtocolError::PacketTooLarge {
                        size: length,
                        max: MAX_PACKET_SIZE,
                    });
                }
                length
            }
        };

        if src.len() < length {
            // Save the length and wait for the rest of the frame
            src.reserve(length - src.len());
            self.pending_length = Some(length);
            return Ok(None);
        }

        let mut frame = src.split_to(length).freeze();
        let kind = frame.get_u8();

        Ok(Some(RawPacket { kind, body: frame }))
    }
}

impl Encoder<RawPacket> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: RawPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = packet.body.len() + 1;
        if length > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: length,
                max: MAX_PACKET_SIZE,
            });
        }

        dst.reserve(LENGTH_SIZE + length);
        dst.put_u32(length as u32);
        dst.put_u8(packet.kind);
        dst.extend_from_slice(&packet.body);

        Ok(())
    }
}
