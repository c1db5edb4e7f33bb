//! Typed SFTP requests and responses
//!
//! Both directions are encodable and decodable so the same types serve the
//! server bridge and client-side tooling.

use bytes::{BufMut, Bytes, BytesMut};

use crate::attrs::FileAttributes;
use crate::codec::RawPacket;
use crate::error::ProtocolError;
use crate::types::{OpenFlags, PacketType, StatusCode};
use crate::wire;

/// Requests sent by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init {
        version: u32,
    },
    Open {
        id: u32,
        path: String,
        flags: OpenFlags,
        attrs: FileAttributes,
    },
    Close {
        id: u32,
        handle: String,
    },
    Read {
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    },
    Write {
        id: u32,
        handle: String,
        offset: u64,
        data: Bytes,
    },
    Lstat {
        id: u32,
        path: String,
    },
    Fstat {
        id: u32,
        handle: String,
    },
    Setstat {
        id: u32,
        path: String,
        attrs: FileAttributes,
    },
    Fsetstat {
        id: u32,
        handle: String,
        attrs: FileAttributes,
    },
    Opendir {
        id: u32,
        path: String,
    },
    Readdir {
        id: u32,
        handle: String,
    },
    Remove {
        id: u32,
        path: String,
    },
    Mkdir {
        id: u32,
        path: String,
        attrs: FileAttributes,
    },
    Rmdir {
        id: u32,
        path: String,
    },
    Realpath {
        id: u32,
        path: String,
    },
    Stat {
        id: u32,
        path: String,
    },
    Rename {
        id: u32,
        from: String,
        to: String,
    },
    Readlink {
        id: u32,
        path: String,
    },
    Symlink {
        id: u32,
        link: String,
        target: String,
    },
    Extended {
        id: u32,
        name: String,
        data: Bytes,
    },
    /// A well-framed request whose type the bridge does not know
    Unknown {
        id: u32,
        kind: u8,
    },
}

/// One entry of an SSH_FXP_NAME response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttributes,
}

/// Responses sent by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version {
        version: u32,
        extensions: Vec<(String, String)>,
    },
    Status {
        id: u32,
        code: StatusCode,
        message: String,
    },
    Handle {
        id: u32,
        handle: String,
    },
    Data {
        id: u32,
        data: Bytes,
    },
    Name {
        id: u32,
        entries: Vec<NameEntry>,
    },
    Attrs {
        id: u32,
        attrs: FileAttributes,
    },
}

/// Best-effort extraction of the request id, used to answer malformed requests
pub fn request_id(packet: &RawPacket) -> Option<u32> {
    if packet.kind == PacketType::Init.as_u8() || packet.body.len() < 4 {
        return None;
    }
    let raw = &packet.body[..4];
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

impl Request {
    /// Request id (INIT carries none)
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Init { .. } => None,
            Self::Open { id, .. }
            | Self::Close { id, .. }
            | Self::Read { id, .. }
            | Self::Write { id, .. }
            | Self::Lstat { id, .. }
            | Self::Fstat { id, .. }
            | Self::Setstat { id, .. }
            | Self::Fsetstat { id, .. }
            | Self::Opendir { id, .. }
            | Self::Readdir { id, .. }
            | Self::Remove { id, .. }
            | Self::Mkdir { id, .. }
            | Self::Rmdir { id, .. }
            | Self::Realpath { id, .. }
            | Self::Stat { id, .. }
            | Self::Rename { id, .. }
            | Self::Readlink { id, .. }
            | Self::Symlink { id, .. }
            | Self::Extended { id, .. }
            | Self::Unknown { id, .. } => Some(*id),
        }
    }

    /// Parse a framed packet into a request
    pub fn parse(packet: RawPacket) -> Result<Self, ProtocolError> {
        let mut body = packet.body;
        let Some(kind) = PacketType::from_u8(packet.kind) else {
            let id = wire::get_u32(&mut body, "request id")?;
            return Ok(Self::Unknown {
                id,
                kind: packet.kind,
            });
        };

        if kind == PacketType::Init {
            let version = wire::get_u32(&mut body, "version")?;
            return Ok(Self::Init { version });
        }

        let id = wire::get_u32(&mut body, "request id")?;
        let body = &mut body;
        let request = match kind {
            PacketType::Open => Self::Open {
                id,
                path: wire::get_string(body, "path")?,
                flags: OpenFlags(wire::get_u32(body, "pflags")?),
                attrs: FileAttributes::decode(body)?,
            },
            PacketType::Close => Self::Close {
                id,
                handle: wire::get_string(body, "handle")?,
            },
            PacketType::Read => Self::Read {
                id,
                handle: wire::get_string(body, "handle")?,
                offset: wire::get_u64(body, "offset")?,
                len: wire::get_u32(body, "len")?,
            },
            PacketType::Write => Self::Write {
                id,
                handle: wire::get_string(body, "handle")?,
                offset: wire::get_u64(body, "offset")?,
                data: wire::get_bytes(body, "data")?,
            },
            PacketType::Lstat => Self::Lstat {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Fstat => Self::Fstat {
                id,
                handle: wire::get_string(body, "handle")?,
            },
            PacketType::Setstat => Self::Setstat {
                id,
                path: wire::get_string(body, "path")?,
                attrs: FileAttributes::decode(body)?,
            },
            PacketType::Fsetstat => Self::Fsetstat {
                id,
                handle: wire::get_string(body, "handle")?,
                attrs: FileAttributes::decode(body)?,
            },
            PacketType::Opendir => Self::Opendir {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Readdir => Self::Readdir {
                id,
                handle: wire::get_string(body, "handle")?,
            },
            PacketType::Remove => Self::Remove {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Mkdir => Self::Mkdir {
                id,
                path: wire::get_string(body, "path")?,
                attrs: FileAttributes::decode(body)?,
            },
            PacketType::Rmdir => Self::Rmdir {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Realpath => Self::Realpath {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Stat => Self::Stat {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Rename => Self::Rename {
                id,
                from: wire::get_string(body, "old path")?,
                to: wire::get_string(body, "new path")?,
            },
            PacketType::Readlink => Self::Readlink {
                id,
                path: wire::get_string(body, "path")?,
            },
            PacketType::Symlink => Self::Symlink {
                id,
                link: wire::get_string(body, "link path")?,
                target: wire::get_string(body, "target path")?,
            },
            PacketType::Extended => Self::Extended {
                id,
                name: wire::get_string(body, "extended request")?,
                data: std::mem::take(body),
            },
            other => return Err(ProtocolError::UnexpectedType(other.as_u8())),
        };

        Ok(request)
    }

    /// Encode into a framed packet
    pub fn to_packet(&self) -> RawPacket {
        let mut body = BytesMut::new();
        let kind = match self {
            Self::Init { version } => {
                body.put_u32(*version);
                PacketType::Init.as_u8()
            }
            Self::Open {
                id,
                path,
                flags,
                attrs,
            } => {
                body.put_u32(*id);
                wire::put_string(&mut body, path);
                body.put_u32(flags.0);
                attrs.encode(&mut body);
                PacketType::Open.as_u8()
            }
            Self::Close { id, handle } => {
                body.put_u32(*id);
                wire::put_string(&mut body, handle);
                PacketType::Close.as_u8()
            }
            Self::Read {
                id,
                handle,
                offset,
                len,
            } => {
                body.put_u32(*id);
                wire::put_string(&mut body, handle);
                body.put_u64(*offset);
                body.put_u32(*len);
                PacketType::Read.as_u8()
            }
            Self::Write {
                id,
                handle,
                offset,
                data,
            } => {
                body.put_u32(*id);
                wire::put_string(&mut body, handle);
                body.put_u64(*offset);
                wire::put_bytes(&mut body, data);
                PacketType::Write.as_u8()
            }
            Self::Lstat { id, path } => path_request(&mut body, *id, path, PacketType::Lstat),
            Self::Fstat { id, handle } => path_request(&mut body, *id, handle, PacketType::Fstat),
            Self::Setstat { id, path, attrs } => {
                path_request(&mut body, *id, path, PacketType::Setstat);
                attrs.encode(&mut body);
                PacketType::Setstat.as_u8()
            }
            Self::Fsetstat { id, handle, attrs } => {
                path_request(&mut body, *id, handle, PacketType::Fsetstat);
                attrs.encode(&mut body);
                PacketType::Fsetstat.as_u8()
            }
            Self::Opendir { id, path } => path_request(&mut body, *id, path, PacketType::Opendir),
            Self::Readdir { id, handle } => {
                path_request(&mut body, *id, handle, PacketType::Readdir)
            }
            Self::Remove { id, path } => path_request(&mut body, *id, path, PacketType::Remove),
            Self::Mkdir { id, path, attrs } => {
                path_request(&mut body, *id, path, PacketType::Mkdir);
                attrs.encode(&mut body);
                PacketType::Mkdir.as_u8()
            }
            Self::Rmdir { id, path } => path_request(&mut body, *id, path, PacketType::Rmdir),
            Self::Realpath { id, path } => {
                path_request(&mut body, *id, path, PacketType::Realpath)
            }
            Self::Stat { id, path } => path_request(&mut body, *id, path, PacketType::Stat),
            Self::Rename { id, from, to } => {
                path_request(&mut body, *id, from, PacketType::Rename);
                wire::put_string(&mut body, to);
                PacketType::Rename.as_u8()
            }
            Self::Readlink { id, path } => {
                path_request(&mut body, *id, path, PacketType::Readlink)
            }
            Self::Symlink { id, link, target } => {
                path_request(&mut body, *id, link, PacketType::Symlink);
                wire::put_string(&mut body, target);
                PacketType::Symlink.as_u8()
            }
            Self::Extended { id, name, data } => {
                path_request(&mut body, *id, name, PacketType::Extended);
                body.extend_from_slice(data);
                PacketType::Extended.as_u8()
            }
            Self::Unknown { id, kind } => {
                body.put_u32(*id);
                *kind
            }
        };

        RawPacket::new(kind, body.freeze())
    }
}

/// Shared layout of requests that start with `id` followed by one string
fn path_request(body: &mut BytesMut, id: u32, value: &str, kind: PacketType) -> u8 {
    body.put_u32(id);
    wire::put_string(body, value);
    kind.as_u8()
}

impl Response {
    /// Build a status response with the code's default message
    pub fn status(id: u32, code: StatusCode) -> Self {
        Self::Status {
            id,
            code,
            message: code.message().to_string(),
        }
    }

    /// Parse a framed packet into a response
    pub fn parse(packet: RawPacket) -> Result<Self, ProtocolError> {
        let mut body = packet.body;
        let body = &mut body;
        let kind = PacketType::from_u8(packet.kind)
            .ok_or(ProtocolError::UnexpectedType(packet.kind))?;

        let response = match kind {
            PacketType::Version => {
                let version = wire::get_u32(body, "version")?;
                let mut extensions = Vec::new();
                while !body.is_empty() {
                    let name = wire::get_string(body, "extension name")?;
                    let data = wire::get_string(body, "extension data")?;
                    extensions.push((name, data));
                }
                Self::Version {
                    version,
                    extensions,
                }
            }
            PacketType::Status => {
                let id = wire::get_u32(body, "request id")?;
                let raw = wire::get_u32(body, "status code")?;
                let code = StatusCode::from_u32(raw).unwrap_or(StatusCode::Failure);
                // Message and language tag are optional for very old servers
                let message = if body.is_empty() {
                    String::new()
                } else {
                    wire::get_string(body, "status message")?
                };
                Self::Status { id, code, message }
            }
            PacketType::Handle => Self::Handle {
                id: wire::get_u32(body, "request id")?,
                handle: wire::get_string(body, "handle")?,
            },
            PacketType::Data => Self::Data {
                id: wire::get_u32(body, "request id")?,
                data: wire::get_bytes(body, "data")?,
            },
            PacketType::Name => {
                let id = wire::get_u32(body, "request id")?;
                let count = wire::get_u32(body, "name count")?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    entries.push(NameEntry {
                        filename: wire::get_string(body, "filename")?,
                        longname: wire::get_string(body, "longname")?,
                        attrs: FileAttributes::decode(body)?,
                    });
                }
                Self::Name { id, entries }
            }
            PacketType::Attrs => Self::Attrs {
                id: wire::get_u32(body, "request id")?,
                attrs: FileAttributes::decode(body)?,
            },
            other => return Err(ProtocolError::UnexpectedType(other.as_u8())),
        };

        Ok(response)
    }

    /// Encode into a framed packet
    pub fn to_packet(&self) -> RawPacket {
        let mut body = BytesMut::new();
        let kind = match self {
            Self::Version {
                version,
                extensions,
            } => {
                body.put_u32(*version);
                for (name, data) in extensions {
                    wire::put_string(&mut body, name);
                    wire::put_string(&mut body, data);
                }
                PacketType::Version
            }
            Self::Status { id, code, message } => {
                body.put_u32(*id);
                body.put_u32(code.as_u32());
                wire::put_string(&mut body, message);
                wire::put_string(&mut body, "en");
                PacketType::Status
            }
            Self::Handle { id, handle } => {
                body.put_u32(*id);
                wire::put_string(&mut body, handle);
                PacketType::Handle
            }
            Self::Data { id, data } => {
                body.put_u32(*id);
                wire::put_bytes(&mut body, data);
                PacketType::Data
            }
            Self::Name { id, entries } => {
                body.put_u32(*id);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    wire::put_string(&mut body, &entry.filename);
                    wire::put_string(&mut body, &entry.longname);
                    entry.attrs.encode(&mut body);
                }
                PacketType::Name
            }
            Self::Attrs { id, attrs } => {
                body.put_u32(*id);
                attrs.encode(&mut body);
                PacketType::Attrs
            }
        };

        RawPacket::new(kind.as_u8(), body.freeze())
    }
}
