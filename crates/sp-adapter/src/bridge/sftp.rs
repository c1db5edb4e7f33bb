//! SFTP bridge
//!
//! Serves SFTP version 3 over one channel's byte stream, translating each
//! request into Communicator calls. Requests are handled strictly one at a
//! time. Handles live in a per-channel table and are never reused.
//!
//! When the Communicator offers random access, file handles read and write
//! at arbitrary offsets directly. Otherwise a file is downloaded whole on
//! OPEN, served from memory, and uploaded on CLOSE if it was written; in
//! that mode a write that would leave a hole is rejected as unsupported.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use sp_core::{Communicator, FileMetadata, SerializedUi, SftpStatusError, Ui};
use sp_protocol::{
    long_name, request_id, FileAttributes, NameEntry, OpenFlags, PacketCodec, ProtocolError,
    RawPacket, Request, Response, StatusCode, SFTP_VERSION,
};

use super::path::normalize;

/// Entries returned per READDIR
pub const READDIR_PAGE_SIZE: usize = 100;

/// Largest READ served in one DATA packet
const MAX_READ_LEN: u32 = 256 * 1024;

enum FileContent {
    /// Reads and writes go straight to the Communicator
    Direct,
    /// Whole file held in memory, uploaded on CLOSE when dirty
    Buffered { data: Vec<u8>, dirty: bool },
}

struct OpenFile {
    path: String,
    flags: OpenFlags,
    content: FileContent,
}

struct OpenDir {
    path: String,
    /// Entries not yet returned by READDIR
    pending: VecDeque<NameEntry>,
}

enum HandleState {
    File(OpenFile),
    Dir(OpenDir),
}

impl HandleState {
    fn path(&self) -> &str {
        match self {
            Self::File(file) => &file.path,
            Self::Dir(dir) => &dir.path,
        }
    }
}

#[derive(Default)]
struct HandleTable {
    last_id: u64,
    entries: HashMap<String, HandleState>,
}

impl HandleTable {
    fn insert(&mut self, state: HandleState) -> String {
        self.last_id += 1;
        let handle = self.last_id.to_string();
        self.entries.insert(handle.clone(), state);
        handle
    }

    fn get(&self, handle: &str) -> Result<&HandleState, SftpStatusError> {
        self.entries
            .get(handle)
            .ok_or_else(|| SftpStatusError::bad_handle(handle))
    }

    fn file_mut(&mut self, handle: &str) -> Result<&mut OpenFile, SftpStatusError> {
        match self.entries.get_mut(handle) {
            Some(HandleState::File(file)) => Ok(file),
            _ => Err(SftpStatusError::bad_handle(handle)),
        }
    }

    fn dir_mut(&mut self, handle: &str) -> Result<&mut OpenDir, SftpStatusError> {
        match self.entries.get_mut(handle) {
            Some(HandleState::Dir(dir)) => Ok(dir),
            _ => Err(SftpStatusError::bad_handle(handle)),
        }
    }

    fn remove(&mut self, handle: &str) -> Option<HandleState> {
        self.entries.remove(handle)
    }
}

/// SFTP server for one channel
pub struct SftpBridge {
    communicator: Arc<dyn Communicator>,
    ui: SerializedUi,
    random_access: bool,
    handles: HandleTable,
    /// Directory relative paths resolve against, fetched on first use
    cwd: Option<String>,
}

impl SftpBridge {
    pub fn new(communicator: Arc<dyn Communicator>, ui: SerializedUi) -> Self {
        let random_access = communicator.capabilities().random_access;
        Self {
            communicator,
            ui,
            random_access,
            handles: HandleTable::default(),
            cwd: None,
        }
    }

    /// Serve requests from `stream` until the client closes it or `cancel` fires.
    ///
    /// Open handles are released on return; unflushed buffered writes are
    /// discarded.
    pub async fn serve<S>(mut self, stream: S, cancel: CancellationToken) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, PacketCodec::new());
        let result = self.serve_framed(&mut framed, &cancel).await;
        self.teardown();
        result
    }

    async fn serve_framed<S>(
        &mut self,
        framed: &mut Framed<S, PacketCodec>,
        cancel: &CancellationToken,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let packet = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("SFTP session cancelled");
                    return Ok(());
                }
                next = framed.next() => match next {
                    Some(packet) => packet?,
                    None => return Ok(()),
                },
            };

            if let Some(response) = self.handle_packet(packet).await {
                framed.send(response.to_packet()).await?;
            }
        }
    }

    fn teardown(&mut self) {
        let unflushed = self
            .handles
            .entries
            .values()
            .filter(|state| {
                matches!(
                    state,
                    HandleState::File(OpenFile {
                        content: FileContent::Buffered { dirty: true, .. },
                        ..
                    })
                )
            })
            .count();
        if unflushed > 0 {
            tracing::warn!("Discarding {} unflushed file(s) left open", unflushed);
        }
        self.handles.entries.clear();
    }

    async fn handle_packet(&mut self, packet: RawPacket) -> Option<Response> {
        let recovered_id = request_id(&packet);
        let request = match Request::parse(packet) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed SFTP request: {}", e);
                return recovered_id.map(|id| Response::Status {
                    id,
                    code: StatusCode::BadMessage,
                    message: e.to_string(),
                });
            }
        };

        tracing::trace!("SFTP request: {:?}", request);
        let id = request.id().unwrap_or_default();
        match self.dispatch(request).await {
            Ok(response) => Some(response),
            Err(error) => {
                if error.code == StatusCode::Failure {
                    self.ui.error(&format!("SFTP operation failed: {}", error.message));
                }
                Some(Response::Status {
                    id,
                    code: error.code,
                    message: error.message,
                })
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response, SftpStatusError> {
        match request {
            Request::Init { version } => {
                tracing::debug!("SFTP client version {}", version);
                Ok(Response::Version {
                    version: SFTP_VERSION,
                    extensions: Vec::new(),
                })
            }
            Request::Open {
                id,
                path,
                flags,
                attrs,
            } => self.open(id, &path, flags, attrs).await,
            Request::Close { id, handle } => self.close(id, &handle).await,
            Request::Read {
                id,
                handle,
                offset,
                len,
            } => self.read(id, &handle, offset, len).await,
            Request::Write {
                id,
                handle,
                offset,
                data,
            } => self.write(id, &handle, offset, data).await,
            Request::Stat { id, path } => {
                let path = self.resolve(&path).await;
                let meta = self.communicator.stat(&path).await?;
                Ok(attrs_response(id, &meta))
            }
            Request::Lstat { id, path } => {
                let path = self.resolve(&path).await;
                let meta = self.communicator.lstat(&path).await?;
                Ok(attrs_response(id, &meta))
            }
            Request::Fstat { id, handle } => self.fstat(id, &handle).await,
            Request::Setstat { id, path, attrs } => {
                let path = self.resolve(&path).await;
                self.set_attributes(id, &path, &attrs).await
            }
            Request::Fsetstat { id, handle, attrs } => {
                let path = self.handles.get(&handle)?.path().to_string();
                self.set_attributes(id, &path, &attrs).await
            }
            Request::Opendir { id, path } => self.opendir(id, &path).await,
            Request::Readdir { id, handle } => self.readdir(id, &handle),
            Request::Remove { id, path } => {
                let path = self.resolve(&path).await;
                self.communicator.remove(&path).await?;
                Ok(Response::status(id, StatusCode::Ok))
            }
            Request::Mkdir { id, path, attrs } => {
                let path = self.resolve(&path).await;
                self.communicator.mkdir(&path, attrs.permissions).await?;
                Ok(Response::status(id, StatusCode::Ok))
            }
            Request::Rmdir { id, path } => {
                let path = self.resolve(&path).await;
                self.communicator.rmdir(&path).await?;
                Ok(Response::status(id, StatusCode::Ok))
            }
            Request::Rename { id, from, to } => {
                let from = self.resolve(&from).await;
                let to = self.resolve(&to).await;
                self.communicator.rename(&from, &to).await?;
                Ok(Response::status(id, StatusCode::Ok))
            }
            Request::Realpath { id, path } => {
                let resolved = self.resolve(&path).await;
                Ok(Response::Name {
                    id,
                    entries: vec![NameEntry {
                        filename: resolved.clone(),
                        longname: resolved,
                        attrs: FileAttributes::new(),
                    }],
                })
            }
            Request::Readlink { .. }
            | Request::Symlink { .. }
            | Request::Extended { .. }
            | Request::Unknown { .. } => Err(SftpStatusError::code(StatusCode::OpUnsupported)),
        }
    }

    /// Absolute, normalized form of a client path
    async fn resolve(&mut self, path: &str) -> String {
        if self.cwd.is_none() {
            let cwd = match self.communicator.working_directory().await {
                Ok(dir) => dir,
                Err(e) => {
                    tracing::debug!("No working directory from communicator: {}", e);
                    "/".to_string()
                }
            };
            self.cwd = Some(normalize("/", &cwd));
        }
        normalize(self.cwd.as_deref().unwrap_or("/"), path)
    }

    async fn open(
        &mut self,
        id: u32,
        path: &str,
        flags: OpenFlags,
        attrs: FileAttributes,
    ) -> Result<Response, SftpStatusError> {
        let path = self.resolve(path).await;

        let existing = match self.communicator.stat(&path).await {
            Ok(meta) => Some(meta),
            Err(e) if e.status_code() == StatusCode::NoSuchFile => None,
            Err(e) => return Err(e.into()),
        };

        if existing.as_ref().is_some_and(FileMetadata::is_dir) {
            return Err(SftpStatusError::new(
                StatusCode::Failure,
                format!("{} is a directory", path),
            ));
        }
        if existing.is_some() && flags.create() && flags.exclusive() {
            return Err(SftpStatusError::new(
                StatusCode::Failure,
                format!("{} already exists", path),
            ));
        }
        if existing.is_none() && !flags.create() {
            return Err(SftpStatusError::new(StatusCode::NoSuchFile, path));
        }

        let reset = existing.is_none() || (flags.write() && flags.truncate());
        if reset {
            self.communicator
                .upload(&path, Bytes::new(), attrs.permissions)
                .await?;
        }

        let content = if self.random_access {
            FileContent::Direct
        } else {
            let data = if reset {
                Vec::new()
            } else {
                self.communicator.download(&path).await?.to_vec()
            };
            FileContent::Buffered { data, dirty: false }
        };

        let handle = self.handles.insert(HandleState::File(OpenFile {
            path,
            flags,
            content,
        }));
        Ok(Response::Handle { id, handle })
    }

    async fn close(&mut self, id: u32, handle: &str) -> Result<Response, SftpStatusError> {
        match self.handles.remove(handle) {
            None => return Err(SftpStatusError::bad_handle(handle)),
            Some(HandleState::File(OpenFile {
                path,
                content: FileContent::Buffered { data, dirty: true },
                ..
            })) => {
                self.communicator
                    .upload(&path, Bytes::from(data), None)
                    .await?;
            }
            Some(_) => {}
        }
        Ok(Response::status(id, StatusCode::Ok))
    }

    async fn read(
        &mut self,
        id: u32,
        handle: &str,
        offset: u64,
        len: u32,
    ) -> Result<Response, SftpStatusError> {
        let len = len.min(MAX_READ_LEN);
        let file = self.handles.file_mut(handle)?;
        if !file.flags.read() {
            return Err(SftpStatusError::new(
                StatusCode::PermissionDenied,
                "handle not opened for reading",
            ));
        }

        let data = match &file.content {
            FileContent::Direct => self.communicator.read_at(&file.path, offset, len).await?,
            FileContent::Buffered { data, .. } => {
                let start = usize::try_from(offset).unwrap_or(usize::MAX);
                if start >= data.len() {
                    Bytes::new()
                } else {
                    let end = start.saturating_add(len as usize).min(data.len());
                    Bytes::copy_from_slice(&data[start..end])
                }
            }
        };

        if data.is_empty() {
            return Err(SftpStatusError::code(StatusCode::Eof));
        }
        Ok(Response::Data { id, data })
    }

    async fn write(
        &mut self,
        id: u32,
        handle: &str,
        offset: u64,
        data: Bytes,
    ) -> Result<Response, SftpStatusError> {
        let file = self.handles.file_mut(handle)?;
        if !file.flags.write() {
            return Err(SftpStatusError::new(
                StatusCode::PermissionDenied,
                "handle not opened for writing",
            ));
        }

        match &mut file.content {
            FileContent::Direct => {
                let offset = if file.flags.append() {
                    self.communicator.stat(&file.path).await?.size
                } else {
                    offset
                };
                self.communicator.write_at(&file.path, offset, data).await?;
            }
            FileContent::Buffered { data: buffer, dirty } => {
                let start = if file.flags.append() {
                    buffer.len()
                } else {
                    usize::try_from(offset).unwrap_or(usize::MAX)
                };
                if start > buffer.len() {
                    return Err(SftpStatusError::new(
                        StatusCode::OpUnsupported,
                        format!(
                            "write at offset {} past end of file ({} bytes) needs random access",
                            offset,
                            buffer.len()
                        ),
                    ));
                }
                let end = start + data.len();
                if end > buffer.len() {
                    buffer.resize(end, 0);
                }
                buffer[start..end].copy_from_slice(&data);
                *dirty = true;
            }
        }
        Ok(Response::status(id, StatusCode::Ok))
    }

    async fn fstat(&mut self, id: u32, handle: &str) -> Result<Response, SftpStatusError> {
        let state = self.handles.get(handle)?;
        let mut meta = self.communicator.stat(state.path()).await?;
        if let HandleState::File(OpenFile {
            content: FileContent::Buffered { data, .. },
            ..
        }) = state
        {
            meta.size = data.len() as u64;
        }
        Ok(attrs_response(id, &meta))
    }

    async fn set_attributes(
        &mut self,
        id: u32,
        path: &str,
        attrs: &FileAttributes,
    ) -> Result<Response, SftpStatusError> {
        // Only permissions are applied; other fields are accepted and ignored
        if let Some(mode) = attrs.permissions {
            self.communicator.set_permissions(path, mode & 0o7777).await?;
        }
        Ok(Response::status(id, StatusCode::Ok))
    }

    async fn opendir(&mut self, id: u32, path: &str) -> Result<Response, SftpStatusError> {
        let path = self.resolve(path).await;
        let listing = self.communicator.list_dir(&path).await?;

        let pending = listing
            .into_iter()
            .map(|entry| {
                let attrs = entry.metadata.to_attributes();
                NameEntry {
                    longname: long_name(&entry.name, &attrs),
                    filename: entry.name,
                    attrs,
                }
            })
            .collect();

        let handle = self
            .handles
            .insert(HandleState::Dir(OpenDir { path, pending }));
        Ok(Response::Handle { id, handle })
    }

    fn readdir(&mut self, id: u32, handle: &str) -> Result<Response, SftpStatusError> {
        let dir = self.handles.dir_mut(handle)?;
        if dir.pending.is_empty() {
            return Err(SftpStatusError::code(StatusCode::Eof));
        }
        let count = dir.pending.len().min(READDIR_PAGE_SIZE);
        let entries = dir.pending.drain(..count).collect();
        Ok(Response::Name { id, entries })
    }
}

fn attrs_response(id: u32, meta: &FileMetadata) -> Response {
    Response::Attrs {
        id,
        attrs: meta.to_attributes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use sp_core::{
        Capabilities, CommunicatorError, DirEntry, LocalCommunicator, RemoteCommand,
    };
    use sp_protocol::{S_IFDIR, S_IFREG};
    use tokio::io::DuplexStream;

    /// Flat in-memory filesystem without random access
    #[derive(Default)]
    struct MemoryCommunicator {
        files: Mutex<BTreeMap<String, Vec<u8>>>,
        dirs: Mutex<Vec<String>>,
        uploads: Mutex<usize>,
    }

    impl MemoryCommunicator {
        fn with_file(path: &str, content: &[u8]) -> Self {
            let comm = Self::default();
            comm.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_vec());
            comm
        }

        fn content(&self, path: &str) -> Option<Vec<u8>> {
            self.files.lock().unwrap().get(path).cloned()
        }
    }

    #[async_trait]
    impl Communicator for MemoryCommunicator {
        async fn start(&self, _command: &str) -> Result<RemoteCommand, CommunicatorError> {
            Err(CommunicatorError::Unsupported("start"))
        }

        async fn upload(
            &self,
            path: &str,
            content: Bytes,
            _mode: Option<u32>,
        ) -> Result<(), CommunicatorError> {
            *self.uploads.lock().unwrap() += 1;
            self.files
                .lock()
                .unwrap()
                .insert(path.to_string(), content.to_vec());
            Ok(())
        }

        async fn download(&self, path: &str) -> Result<Bytes, CommunicatorError> {
            self.content(path)
                .map(Bytes::from)
                .ok_or_else(|| CommunicatorError::NotFound(path.to_string()))
        }

        async fn stat(&self, path: &str) -> Result<FileMetadata, CommunicatorError> {
            if let Some(content) = self.content(path) {
                return Ok(FileMetadata {
                    size: content.len() as u64,
                    mode: S_IFREG | 0o644,
                    ..Default::default()
                });
            }
            if path == "/" || self.dirs.lock().unwrap().iter().any(|d| d == path) {
                return Ok(FileMetadata {
                    mode: S_IFDIR | 0o755,
                    ..Default::default()
                });
            }
            Err(CommunicatorError::NotFound(path.to_string()))
        }

        async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, CommunicatorError> {
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{}/", path)
            };
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(name, content)| {
                    let rest = name.strip_prefix(&prefix)?;
                    (!rest.contains('/')).then(|| DirEntry {
                        name: rest.to_string(),
                        metadata: FileMetadata {
                            size: content.len() as u64,
                            mode: S_IFREG | 0o644,
                            ..Default::default()
                        },
                    })
                })
                .collect())
        }

        async fn mkdir(&self, path: &str, _mode: Option<u32>) -> Result<(), CommunicatorError> {
            self.dirs.lock().unwrap().push(path.to_string());
            Ok(())
        }

        async fn rmdir(&self, path: &str) -> Result<(), CommunicatorError> {
            self.dirs.lock().unwrap().retain(|d| d != path);
            Ok(())
        }

        async fn remove(&self, path: &str) -> Result<(), CommunicatorError> {
            self.files
                .lock()
                .unwrap()
                .remove(path)
                .map(|_| ())
                .ok_or_else(|| CommunicatorError::NotFound(path.to_string()))
        }

        async fn rename(&self, from: &str, to: &str) -> Result<(), CommunicatorError> {
            let mut files = self.files.lock().unwrap();
            let content = files
                .remove(from)
                .ok_or_else(|| CommunicatorError::NotFound(from.to_string()))?;
            files.insert(to.to_string(), content);
            Ok(())
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    struct NullUi;

    impl Ui for NullUi {
        fn say(&self, _message: &str) {}
        fn message(&self, _message: &str) {}
        fn error(&self, _message: &str) {}
        fn ask(&self, _query: &str) -> io::Result<String> {
            Ok(String::new())
        }
        fn machine(&self, _kind: &str, _args: &[&str]) {}
    }

    /// Client end of an in-process SFTP session
    struct TestClient {
        framed: Framed<DuplexStream, PacketCodec>,
        next_id: u32,
    }

    impl TestClient {
        fn start(communicator: Arc<dyn Communicator>) -> Self {
            let (client, server) = tokio::io::duplex(1024 * 1024);
            let bridge = SftpBridge::new(communicator, SerializedUi::new(Arc::new(NullUi)));
            tokio::spawn(bridge.serve(server, CancellationToken::new()));
            Self {
                framed: Framed::new(client, PacketCodec::new()),
                next_id: 0,
            }
        }

        fn id(&mut self) -> u32 {
            self.next_id += 1;
            self.next_id
        }

        async fn call(&mut self, request: Request) -> Response {
            self.framed.send(request.to_packet()).await.unwrap();
            self.recv().await
        }

        async fn recv(&mut self) -> Response {
            let packet = self.framed.next().await.unwrap().unwrap();
            Response::parse(packet).unwrap()
        }

        async fn open(&mut self, path: &str, flags: u32) -> Response {
            let id = self.id();
            self.call(Request::Open {
                id,
                path: path.to_string(),
                flags: OpenFlags(flags),
                attrs: FileAttributes::new(),
            })
            .await
        }

        async fn open_handle(&mut self, path: &str, flags: u32) -> String {
            match self.open(path, flags).await {
                Response::Handle { handle, .. } => handle,
                other => panic!("expected handle, got {:?}", other),
            }
        }

        async fn write(&mut self, handle: &str, offset: u64, data: &'static [u8]) -> Response {
            let id = self.id();
            self.call(Request::Write {
                id,
                handle: handle.to_string(),
                offset,
                data: Bytes::from_static(data),
            })
            .await
        }

        async fn read(&mut self, handle: &str, offset: u64, len: u32) -> Response {
            let id = self.id();
            self.call(Request::Read {
                id,
                handle: handle.to_string(),
                offset,
                len,
            })
            .await
        }

        async fn close(&mut self, handle: &str) -> Response {
            let id = self.id();
            self.call(Request::Close {
                id,
                handle: handle.to_string(),
            })
            .await
        }
    }

    fn status_of(response: &Response) -> StatusCode {
        match response {
            Response::Status { code, .. } => *code,
            other => panic!("expected status, got {:?}", other),
        }
    }

    const RW_CREATE: u32 = OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT;

    #[tokio::test]
    async fn test_init_negotiates_version_3() {
        let mut client = TestClient::start(Arc::new(MemoryCommunicator::default()));
        let response = client.call(Request::Init { version: 6 }).await;
        assert_eq!(
            response,
            Response::Version {
                version: 3,
                extensions: vec![]
            }
        );
    }

    #[tokio::test]
    async fn test_buffered_write_is_uploaded_on_close() {
        let comm = Arc::new(MemoryCommunicator::default());
        let mut client = TestClient::start(comm.clone());

        let handle = client.open_handle("/data.txt", RW_CREATE).await;
        assert_eq!(status_of(&client.write(&handle, 0, b"hello ").await), StatusCode::Ok);
        assert_eq!(status_of(&client.write(&handle, 6, b"world").await), StatusCode::Ok);

        // Not visible on the target until CLOSE
        assert_eq!(comm.content("/data.txt").unwrap(), b"");

        match client.read(&handle, 0, 64).await {
            Response::Data { data, .. } => assert_eq!(&data[..], b"hello world"),
            other => panic!("expected data, got {:?}", other),
        }
        assert_eq!(status_of(&client.read(&handle, 11, 64).await), StatusCode::Eof);

        assert_eq!(status_of(&client.close(&handle).await), StatusCode::Ok);
        assert_eq!(comm.content("/data.txt").unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_buffered_write_past_end_is_unsupported() {
        let comm = Arc::new(MemoryCommunicator::with_file("/f", b"abc"));
        let mut client = TestClient::start(comm.clone());

        let handle = client
            .open_handle("/f", OpenFlags::READ | OpenFlags::WRITE)
            .await;
        // Overwriting inside the file and appending at its end both work
        assert_eq!(status_of(&client.write(&handle, 1, b"X").await), StatusCode::Ok);
        assert_eq!(status_of(&client.write(&handle, 3, b"d").await), StatusCode::Ok);
        assert_eq!(
            status_of(&client.write(&handle, 100, b"hole").await),
            StatusCode::OpUnsupported
        );

        client.close(&handle).await;
        assert_eq!(comm.content("/f").unwrap(), b"aXcd");
    }

    #[tokio::test]
    async fn test_buffered_reads_at_any_offset() {
        let comm = Arc::new(MemoryCommunicator::with_file("/r", b"0123456789"));
        let mut client = TestClient::start(comm);

        let handle = client.open_handle("/r", OpenFlags::READ).await;
        match client.read(&handle, 7, 2).await {
            Response::Data { data, .. } => assert_eq!(&data[..], b"78"),
            other => panic!("expected data, got {:?}", other),
        }
        match client.read(&handle, 0, 3).await {
            Response::Data { data, .. } => assert_eq!(&data[..], b"012"),
            other => panic!("expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unclosed_buffered_write_is_discarded() {
        let comm = Arc::new(MemoryCommunicator::with_file("/keep", b"original"));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let bridge = SftpBridge::new(comm.clone(), SerializedUi::new(Arc::new(NullUi)));
        let task = tokio::spawn(bridge.serve(server, CancellationToken::new()));

        let mut framed = Framed::new(client, PacketCodec::new());
        framed
            .send(
                Request::Open {
                    id: 1,
                    path: "/keep".to_string(),
                    flags: OpenFlags(OpenFlags::WRITE),
                    attrs: FileAttributes::new(),
                }
                .to_packet(),
            )
            .await
            .unwrap();
        let handle = match Response::parse(framed.next().await.unwrap().unwrap()).unwrap() {
            Response::Handle { handle, .. } => handle,
            other => panic!("expected handle, got {:?}", other),
        };
        framed
            .send(
                Request::Write {
                    id: 2,
                    handle,
                    offset: 0,
                    data: Bytes::from_static(b"changed!"),
                }
                .to_packet(),
            )
            .await
            .unwrap();
        framed.next().await.unwrap().unwrap();

        drop(framed);
        task.await.unwrap().unwrap();
        assert_eq!(comm.content("/keep").unwrap(), b"original");
    }

    #[tokio::test]
    async fn test_bad_handles() {
        let comm = Arc::new(MemoryCommunicator::with_file("/x", b"x"));
        let mut client = TestClient::start(comm);

        // Never issued
        assert_eq!(
            status_of(&client.read("42", 0, 1).await),
            StatusCode::InvalidHandle
        );

        // Already closed
        let handle = client.open_handle("/x", OpenFlags::READ).await;
        assert_eq!(status_of(&client.close(&handle).await), StatusCode::Ok);
        assert_eq!(
            status_of(&client.close(&handle).await),
            StatusCode::InvalidHandle
        );
        assert_eq!(
            status_of(&client.write(&handle, 0, b"y").await),
            StatusCode::InvalidHandle
        );

        // Handles are never reused
        let again = client.open_handle("/x", OpenFlags::READ).await;
        assert_ne!(again, handle);
    }

    #[tokio::test]
    async fn test_open_missing_without_create() {
        let mut client = TestClient::start(Arc::new(MemoryCommunicator::default()));
        assert_eq!(
            status_of(&client.open("/missing", OpenFlags::READ).await),
            StatusCode::NoSuchFile
        );
    }

    #[tokio::test]
    async fn test_exclusive_create_on_existing_fails() {
        let comm = Arc::new(MemoryCommunicator::with_file("/e", b"1"));
        let mut client = TestClient::start(comm);
        let flags = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::EXCL;
        assert_eq!(status_of(&client.open("/e", flags).await), StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_truncate_discards_old_content() {
        let comm = Arc::new(MemoryCommunicator::with_file("/t", b"old content"));
        let mut client = TestClient::start(comm.clone());

        let handle = client
            .open_handle("/t", OpenFlags::WRITE | OpenFlags::TRUNC)
            .await;
        client.write(&handle, 0, b"new").await;
        client.close(&handle).await;
        assert_eq!(comm.content("/t").unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_readdir_pages_then_eof() {
        let comm = MemoryCommunicator::default();
        for i in 0..150 {
            comm.files
                .lock()
                .unwrap()
                .insert(format!("/dir/f{:03}", i), vec![0; i]);
        }
        comm.dirs.lock().unwrap().push("/dir".to_string());
        let mut client = TestClient::start(Arc::new(comm));

        let handle = match client
            .call(Request::Opendir {
                id: 1,
                path: "/dir".to_string(),
            })
            .await
        {
            Response::Handle { handle, .. } => handle,
            other => panic!("expected handle, got {:?}", other),
        };

        let mut seen = Vec::new();
        loop {
            let response = client
                .call(Request::Readdir {
                    id: 2,
                    handle: handle.clone(),
                })
                .await;
            match response {
                Response::Name { entries, .. } => {
                    assert!(entries.len() <= READDIR_PAGE_SIZE);
                    assert!(entries[0].longname.starts_with("-rw-r--r--"));
                    seen.extend(entries.into_iter().map(|e| e.filename));
                }
                other => {
                    assert_eq!(status_of(&other), StatusCode::Eof);
                    break;
                }
            }
        }
        assert_eq!(seen.len(), 150);
        assert_eq!(seen[0], "f000");
    }

    #[tokio::test]
    async fn test_realpath_normalizes_without_existence() {
        let mut client = TestClient::start(Arc::new(MemoryCommunicator::default()));
        let response = client
            .call(Request::Realpath {
                id: 5,
                path: "a/./b/../c".to_string(),
            })
            .await;
        match response {
            Response::Name { id, entries } => {
                assert_eq!(id, 5);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, "/a/c");
            }
            other => panic!("expected name, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unsupported_operations() {
        let mut client = TestClient::start(Arc::new(MemoryCommunicator::default()));

        let symlink = client
            .call(Request::Symlink {
                id: 1,
                link: "/a".to_string(),
                target: "/b".to_string(),
            })
            .await;
        assert_eq!(status_of(&symlink), StatusCode::OpUnsupported);

        let unknown = client.call(Request::Unknown { id: 2, kind: 99 }).await;
        assert_eq!(status_of(&unknown), StatusCode::OpUnsupported);

        // No set_permissions on this communicator
        let setstat = client
            .call(Request::Setstat {
                id: 3,
                path: "/".to_string(),
                attrs: FileAttributes {
                    permissions: Some(0o700),
                    ..Default::default()
                },
            })
            .await;
        assert_eq!(status_of(&setstat), StatusCode::OpUnsupported);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_bad_message() {
        let mut client = TestClient::start(Arc::new(MemoryCommunicator::default()));
        // READ carrying only its request id
        client
            .framed
            .send(RawPacket::new(5, Bytes::from_static(&[0, 0, 0, 77])))
            .await
            .unwrap();
        match client.recv().await {
            Response::Status { id, code, .. } => {
                assert_eq!(id, 77);
                assert_eq!(code, StatusCode::BadMessage);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_random_access_round_trip_on_local_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ra.bin").to_string_lossy().into_owned();
        let mut client = TestClient::start(Arc::new(LocalCommunicator::new()));

        let handle = client.open_handle(&path, RW_CREATE).await;
        // Out-of-order writes are fine with random access
        assert_eq!(status_of(&client.write(&handle, 5, b"world").await), StatusCode::Ok);
        assert_eq!(status_of(&client.write(&handle, 0, b"hello").await), StatusCode::Ok);
        match client.read(&handle, 0, 100).await {
            Response::Data { data, .. } => assert_eq!(&data[..], b"helloworld"),
            other => panic!("expected data, got {:?}", other),
        }
        client.close(&handle).await;

        let remove = client
            .call(Request::Remove {
                id: 90,
                path: path.clone(),
            })
            .await;
        assert_eq!(status_of(&remove), StatusCode::Ok);
        let stat = client.call(Request::Stat { id: 91, path }).await;
        assert_eq!(status_of(&stat), StatusCode::NoSuchFile);
    }

    #[tokio::test]
    async fn test_cancel_ends_session() {
        let (_client, server) = tokio::io::duplex(1024);
        let bridge = SftpBridge::new(
            Arc::new(MemoryCommunicator::default()),
            SerializedUi::new(Arc::new(NullUi)),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.serve(server, cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
