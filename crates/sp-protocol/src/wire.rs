//! Primitive SSH wire encodings used inside SFTP packets
//!
//! SFTP reuses the SSH data types: big-endian `uint32`/`uint64` and
//! length-prefixed `string`s.

use bytes::{Buf, BufMut, Bytes};

use crate::error::ProtocolError;

pub(crate) fn get_u8(src: &mut Bytes, field: &'static str) -> Result<u8, ProtocolError> {
    if src.remaining() < 1 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(src.get_u8())
}

pub(crate) fn get_u32(src: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    if src.remaining() < 4 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(src.get_u32())
}

pub(crate) fn get_u64(src: &mut Bytes, field: &'static str) -> Result<u64, ProtocolError> {
    if src.remaining() < 8 {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(src.get_u64())
}

/// Read a length-prefixed byte string without copying
pub(crate) fn get_bytes(src: &mut Bytes, field: &'static str) -> Result<Bytes, ProtocolError> {
    let len = get_u32(src, field)? as usize;
    if src.remaining() < len {
        return Err(ProtocolError::Truncated(field));
    }
    Ok(src.split_to(len))
}

/// Read a length-prefixed UTF-8 string
pub(crate) fn get_string(src: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    let raw = get_bytes(src, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
}

pub(crate) fn put_bytes(dst: &mut impl BufMut, value: &[u8]) {
    dst.put_u32(value.len() as u32);
    dst.put_slice(value);
}

pub(crate) fn put_string(dst: &mut impl BufMut, value: &str) {
    put_bytes(dst, value.as_bytes());
}
