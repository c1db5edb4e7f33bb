//! Communicator for the machine sshproxy itself runs on
//!
//! Commands go through `sh -c` and file operations hit the local
//! filesystem directly, with full random access.

use std::io::SeekFrom;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::CommunicatorError;
#[cfg(not(unix))]
use crate::time::unix_secs;
use crate::traits::{Capabilities, Communicator, DirEntry, FileMetadata, RemoteCommand};

/// Runs commands and file operations on the local host
#[derive(Debug, Clone, Default)]
pub struct LocalCommunicator {
    shell: Option<String>,
}

impl LocalCommunicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a shell other than `sh` to run commands
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: Some(shell.into()),
        }
    }

    fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or("sh")
    }
}

fn exit_code(status: ExitStatus) -> u32 {
    if let Some(code) = status.code() {
        return code as u32;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as u32;
        }
    }
    255
}

fn metadata_from(meta: &std::fs::Metadata) -> FileMetadata {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        FileMetadata {
            size: meta.len(),
            mode: meta.mode(),
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            atime: u64::try_from(meta.atime()).ok(),
            mtime: u64::try_from(meta.mtime()).ok(),
        }
    }
    #[cfg(not(unix))]
    {
        use sp_protocol::{S_IFDIR, S_IFREG};
        let mode = if meta.is_dir() { S_IFDIR | 0o755 } else { S_IFREG | 0o644 };
        FileMetadata {
            size: meta.len(),
            mode,
            uid: None,
            gid: None,
            atime: meta.accessed().ok().map(unix_secs),
            mtime: meta.modified().ok().map(unix_secs),
        }
    }
}

async fn apply_mode(path: &str, mode: u32) -> Result<(), CommunicatorError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Err(CommunicatorError::Unsupported("set_permissions"))
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    async fn start(&self, command: &str) -> Result<RemoteCommand, CommunicatorError> {
        debug!("Starting local command: {}", command);

        let mut child = Command::new(self.shell())
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommunicatorError::Start(format!("{}: {}", command, e)))?;

        let missing = || CommunicatorError::Start("stdio was not piped".to_string());
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let stderr = child.stderr.take().ok_or_else(missing)?;

        let interrupt = CancellationToken::new();
        let token = interrupt.clone();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    debug!("Interrupting local command");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let _ = tx.send(status);
        });

        let exit = async move {
            let status = rx
                .await
                .map_err(|_| CommunicatorError::Failed("command supervisor vanished".into()))??;
            Ok::<_, CommunicatorError>(exit_code(status))
        }
        .boxed();

        Ok(RemoteCommand {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            exit,
            interrupt: Some(interrupt),
        })
    }

    async fn upload(
        &self,
        path: &str,
        content: Bytes,
        mode: Option<u32>,
    ) -> Result<(), CommunicatorError> {
        trace!("upload {} ({} bytes)", path, content.len());
        tokio::fs::write(path, &content)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;
        if let Some(mode) = mode {
            apply_mode(path, mode).await?;
        }
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<Bytes, CommunicatorError> {
        trace!("download {}", path);
        tokio::fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(|e| CommunicatorError::from_io(e, path))
    }

    async fn stat(&self, path: &str) -> Result<FileMetadata, CommunicatorError> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;
        Ok(metadata_from(&meta))
    }

    async fn lstat(&self, path: &str) -> Result<FileMetadata, CommunicatorError> {
        let meta = tokio::fs::symlink_metadata(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;
        Ok(metadata_from(&meta))
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, CommunicatorError> {
        let mut reader = tokio::fs::read_dir(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?
        {
            // Entries can vanish between readdir and stat
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                metadata: metadata_from(&meta),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<(), CommunicatorError> {
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;
        if let Some(mode) = mode {
            apply_mode(path, mode).await?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), CommunicatorError> {
        tokio::fs::remove_dir(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))
    }

    async fn remove(&self, path: &str) -> Result<(), CommunicatorError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), CommunicatorError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| CommunicatorError::from_io(e, from))
    }

    async fn set_permissions(&self, path: &str, mode: u32) -> Result<(), CommunicatorError> {
        apply_mode(path, mode).await
    }

    async fn working_directory(&self) -> Result<String, CommunicatorError> {
        let dir = std::env::current_dir()?;
        Ok(dir.to_string_lossy().into_owned())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            random_access: true,
            interrupt: true,
        }
    }

    async fn read_at(&self, path: &str, offset: u64, len: u32) -> Result<Bytes, CommunicatorError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = Vec::with_capacity(len as usize);
        file.take(u64::from(len)).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn write_at(&self, path: &str, offset: u64, data: Bytes) -> Result<(), CommunicatorError> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| CommunicatorError::from_io(e, path))?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}
