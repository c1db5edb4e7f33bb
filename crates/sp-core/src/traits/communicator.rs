//! Communicator traits
//!
//! A Communicator is the opaque channel to the target machine: it can run
//! a command with streamed stdio and move whole files back and forth. The
//! adapter translates every SSH operation into calls on this trait.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use sp_protocol::{FileAttributes, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

use crate::error::CommunicatorError;
use crate::time::wire_secs;

/// A command started on the target
pub struct RemoteCommand {
    /// Remote standard input; dropping or shutting it down signals EOF
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    /// Resolves to the remote exit code once the command terminates
    pub exit: BoxFuture<'static, Result<u32, CommunicatorError>>,
    /// Cancelling this token asks the target to stop the command.
    /// `None` when the communicator cannot interrupt.
    pub interrupt: Option<CancellationToken>,
}

impl std::fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("interruptible", &self.interrupt.is_some())
            .finish_non_exhaustive()
    }
}

/// Optional features a communicator may offer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `read_at` / `write_at` work at arbitrary offsets
    pub random_access: bool,
    /// Started commands can be interrupted
    pub interrupt: bool,
}

/// Kind of filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

/// Metadata reported for a remote path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub size: u64,
    /// POSIX mode including the file type bits
    pub mode: u32,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Seconds since the Unix epoch
    pub atime: Option<u64>,
    pub mtime: Option<u64>,
}

impl FileMetadata {
    pub fn kind(&self) -> FileKind {
        match self.mode & S_IFMT {
            S_IFREG => FileKind::File,
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::Other,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    /// Attribute block reported to SFTP clients
    pub fn to_attributes(&self) -> FileAttributes {
        let mtime = self.mtime.map(wire_secs);
        FileAttributes {
            size: Some(self.size),
            uid: self.uid.filter(|_| self.gid.is_some()),
            gid: self.gid.filter(|_| self.uid.is_some()),
            permissions: Some(self.mode),
            // SFTP v3 only carries both times together
            atime: mtime.map(|m| self.atime.map(wire_secs).unwrap_or(m)),
            mtime,
            extended: Vec::new(),
        }
    }
}

/// One directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub metadata: FileMetadata,
}

/// Remote execution and file transfer capability
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Start `command` on the target with piped stdio
    async fn start(&self, command: &str) -> Result<RemoteCommand, CommunicatorError>;

    /// Replace the whole content of `path`
    async fn upload(
        &self,
        path: &str,
        content: Bytes,
        mode: Option<u32>,
    ) -> Result<(), CommunicatorError>;

    /// Fetch the whole content of `path`
    async fn download(&self, path: &str) -> Result<Bytes, CommunicatorError>;

    async fn stat(&self, path: &str) -> Result<FileMetadata, CommunicatorError>;

    /// Like `stat` but without following a final symlink
    async fn lstat(&self, path: &str) -> Result<FileMetadata, CommunicatorError> {
        self.stat(path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, CommunicatorError>;

    async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<(), CommunicatorError>;

    async fn rmdir(&self, path: &str) -> Result<(), CommunicatorError>;

    async fn remove(&self, path: &str) -> Result<(), CommunicatorError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), CommunicatorError>;

    async fn set_permissions(&self, _path: &str, _mode: u32) -> Result<(), CommunicatorError> {
        Err(CommunicatorError::Unsupported("set_permissions"))
    }

    /// Directory relative paths resolve against
    async fn working_directory(&self) -> Result<String, CommunicatorError> {
        Ok("/".to_string())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Read up to `len` bytes at `offset`; an empty result means end of file
    async fn read_at(
        &self,
        _path: &str,
        _offset: u64,
        _len: u32,
    ) -> Result<Bytes, CommunicatorError> {
        Err(CommunicatorError::Unsupported("read_at"))
    }

    /// Write `data` at `offset`, extending the file as needed
    async fn write_at(
        &self,
        _path: &str,
        _offset: u64,
        _data: Bytes,
    ) -> Result<(), CommunicatorError> {
        Err(CommunicatorError::Unsupported("write_at"))
    }
}
