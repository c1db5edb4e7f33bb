//! SFTP over a real SSH channel, bridged onto the local filesystem

mod common;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use russh::client::Msg;
use russh::ChannelStream;
use tokio_util::codec::Framed;

use sp_protocol::{FileAttributes, OpenFlags, PacketCodec, Request, Response, StatusCode};

use common::{login, start_adapter, TestClient};

struct Sftp {
    framed: Framed<ChannelStream<Msg>, PacketCodec>,
    next_id: u32,
    // Keeps the connection alive
    _session: russh::client::Handle<TestClient>,
}

impl Sftp {
    async fn open(fixture: &common::Fixture) -> Self {
        let session = login(fixture).await;
        let channel = session.channel_open_session().await.unwrap();
        channel.request_subsystem(true, "sftp").await.unwrap();

        let mut sftp = Self {
            framed: Framed::new(channel.into_stream(), PacketCodec::new()),
            next_id: 0,
            _session: session,
        };
        let version = sftp.call(Request::Init { version: 3 }).await;
        assert!(matches!(version, Response::Version { version: 3, .. }));
        sftp
    }

    fn id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    async fn call(&mut self, request: Request) -> Response {
        self.framed.send(request.to_packet()).await.unwrap();
        let packet = self.framed.next().await.unwrap().unwrap();
        Response::parse(packet).unwrap()
    }

    async fn status(&mut self, request: Request) -> StatusCode {
        match self.call(request).await {
            Response::Status { code, .. } => code,
            other => panic!("expected status, got {:?}", other),
        }
    }

    async fn handle(&mut self, request: Request) -> String {
        match self.call(request).await {
            Response::Handle { handle, .. } => handle,
            other => panic!("expected handle, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_write_read_remove_stat() {
    let fixture = start_adapter().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin").to_string_lossy().into_owned();
    let payload = Bytes::from((0..=255u8).cycle().take(100_000).collect::<Vec<u8>>());

    let mut sftp = Sftp::open(&fixture).await;
    let id = sftp.id();
    let handle = sftp
        .handle(Request::Open {
            id,
            path: path.clone(),
            flags: OpenFlags(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT),
            attrs: FileAttributes::new(),
        })
        .await;

    // Written in chunks the way clients do
    for (i, chunk) in payload.chunks(32 * 1024).enumerate() {
        let id = sftp.id();
        let status = sftp
            .status(Request::Write {
                id,
                handle: handle.clone(),
                offset: (i * 32 * 1024) as u64,
                data: Bytes::copy_from_slice(chunk),
            })
            .await;
        assert_eq!(status, StatusCode::Ok);
    }

    let mut read_back = Vec::new();
    loop {
        let id = sftp.id();
        match sftp
            .call(Request::Read {
                id,
                handle: handle.clone(),
                offset: read_back.len() as u64,
                len: 32 * 1024,
            })
            .await
        {
            Response::Data { data, .. } => read_back.extend_from_slice(&data),
            Response::Status { code, .. } => {
                assert_eq!(code, StatusCode::Eof);
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(read_back, payload);

    let id = sftp.id();
    assert_eq!(sftp.status(Request::Close { id, handle }).await, StatusCode::Ok);

    let id = sftp.id();
    match sftp.call(Request::Stat { id, path: path.clone() }).await {
        Response::Attrs { attrs, .. } => assert_eq!(attrs.size, Some(payload.len() as u64)),
        other => panic!("expected attrs, got {:?}", other),
    }

    let id = sftp.id();
    assert_eq!(
        sftp.status(Request::Remove { id, path: path.clone() }).await,
        StatusCode::Ok
    );
    let id = sftp.id();
    assert_eq!(
        sftp.status(Request::Stat { id, path }).await,
        StatusCode::NoSuchFile
    );
    fixture.adapter.shutdown().await;
}

#[tokio::test]
async fn test_stale_handles() {
    let fixture = start_adapter().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f").to_string_lossy().into_owned();
    std::fs::write(&path, b"content").unwrap();

    let mut sftp = Sftp::open(&fixture).await;

    let status = sftp
        .status(Request::Read {
            id: 1,
            handle: "12345".to_string(),
            offset: 0,
            len: 10,
        })
        .await;
    assert_eq!(status, StatusCode::InvalidHandle);

    let handle = sftp
        .handle(Request::Open {
            id: 2,
            path,
            flags: OpenFlags(OpenFlags::READ),
            attrs: FileAttributes::new(),
        })
        .await;
    assert_eq!(
        sftp.status(Request::Close {
            id: 3,
            handle: handle.clone()
        })
        .await,
        StatusCode::Ok
    );
    assert_eq!(
        sftp.status(Request::Fstat { id: 4, handle }).await,
        StatusCode::InvalidHandle
    );
    fixture.adapter.shutdown().await;
}

#[tokio::test]
async fn test_directory_operations() {
    let fixture = start_adapter().await;
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_string_lossy().into_owned();
    std::fs::write(dir.path().join("a.txt"), b"a").unwrap();

    let mut sftp = Sftp::open(&fixture).await;

    let sub = format!("{}/sub", root);
    assert_eq!(
        sftp.status(Request::Mkdir {
            id: 1,
            path: sub.clone(),
            attrs: FileAttributes::new()
        })
        .await,
        StatusCode::Ok
    );
    assert_eq!(
        sftp.status(Request::Rename {
            id: 2,
            from: format!("{}/a.txt", root),
            to: format!("{}/b.txt", root),
        })
        .await,
        StatusCode::Ok
    );

    let handle = sftp
        .handle(Request::Opendir {
            id: 3,
            path: root.clone(),
        })
        .await;
    let mut names = Vec::new();
    loop {
        match sftp
            .call(Request::Readdir {
                id: 4,
                handle: handle.clone(),
            })
            .await
        {
            Response::Name { entries, .. } => {
                names.extend(entries.into_iter().map(|e| e.filename))
            }
            Response::Status { code, .. } => {
                assert_eq!(code, StatusCode::Eof);
                break;
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    names.sort();
    assert_eq!(names, vec!["b.txt", "sub"]);

    assert_eq!(
        sftp.status(Request::Rmdir { id: 5, path: sub }).await,
        StatusCode::Ok
    );
    assert_eq!(
        sftp.status(Request::Readlink {
            id: 6,
            path: root
        })
        .await,
        StatusCode::OpUnsupported
    );
    fixture.adapter.shutdown().await;
}
