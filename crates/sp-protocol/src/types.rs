//! SFTP constants: packet types, status codes and open flags

use std::fmt;

/// Protocol version spoken by the bridge
pub const SFTP_VERSION: u32 = 3;

/// SFTP packet type (SSH_FXP_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl PacketType {
    /// Convert from the raw type byte
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            19 => Self::Readlink,
            20 => Self::Symlink,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Status code carried by SSH_FXP_STATUS (SSH_FX_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
    /// SSH_FX_INVALID_HANDLE, borrowed from later protocol drafts so that
    /// stale handles are distinguishable from generic failures
    InvalidHandle = 9,
}

impl StatusCode {
    /// Convert from the raw wire value
    pub fn from_u32(value: u32) -> Option<Self> {
        let code = match value {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            9 => Self::InvalidHandle,
            _ => return None,
        };
        Some(code)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Default human-readable message sent alongside the code
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation unsupported",
            Self::InvalidHandle => "Invalid handle",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Flags of SSH_FXP_OPEN (SSH_FXF_*)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    pub const READ: u32 = 0x0000_0001;
    pub const WRITE: u32 = 0x0000_0002;
    pub const APPEND: u32 = 0x0000_0004;
    pub const CREAT: u32 = 0x0000_0008;
    pub const TRUNC: u32 = 0x0000_0010;
    pub const EXCL: u32 = 0x0000_0020;

    fn has(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn read(self) -> bool {
        self.has(Self::READ)
    }

    pub fn write(self) -> bool {
        self.has(Self::WRITE)
    }

    pub fn append(self) -> bool {
        self.has(Self::APPEND)
    }

    pub fn create(self) -> bool {
        self.has(Self::CREAT)
    }

    pub fn truncate(self) -> bool {
        self.has(Self::TRUNC)
    }

    pub fn exclusive(self) -> bool {
        self.has(Self::EXCL)
    }
}
