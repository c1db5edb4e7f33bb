//! Start, port selection and shutdown behaviour with live connections

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use sp_adapter::{
    obtain_client_credential, obtain_host_identity, AdapterOptions, PortSelection, ProxyAdapter,
};
use sp_core::{ListenError, LocalCommunicator, ProxyError, SerializedUi};

use common::{exec, login, start_adapter, RecordingUi};

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let fixture = start_adapter().await;

    let mut channels = Vec::new();
    let mut sessions = Vec::new();
    for _ in 0..3 {
        let session = login(&fixture).await;
        channels.push(session.channel_open_session().await.unwrap());
        sessions.push(session);
    }
    // One channel busy in a long-running command
    let mut busy = sessions[0].channel_open_session().await.unwrap();
    busy.exec(true, "sleep 30").await.unwrap();
    channels.push(busy);

    tokio::time::timeout(Duration::from_secs(6), fixture.adapter.shutdown())
        .await
        .expect("shutdown exceeded its grace period");

    for mut channel in channels {
        let closed = tokio::time::timeout(Duration::from_secs(3), async {
            while channel.wait().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "channel still open after shutdown");
    }

    assert!(tokio::net::TcpStream::connect(("127.0.0.1", fixture.port))
        .await
        .is_err());
    assert_eq!(fixture.adapter.stats().live_connections, 0);

    // Second call is a no-op
    tokio::time::timeout(Duration::from_secs(1), fixture.adapter.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_generated_key_removed_on_shutdown() {
    let fixture = start_adapter().await;
    let key_file = fixture.adapter.private_key_file().unwrap().to_path_buf();
    assert!(key_file.exists());

    let session = login(&fixture).await;
    assert_eq!(exec(&session, "true").await.exit_status, Some(0));

    fixture.adapter.shutdown().await;
    assert!(!key_file.exists());
}

fn adapter_on(port: PortSelection) -> ProxyAdapter {
    let mut options = AdapterOptions::new("someone");
    options.port = port;
    ProxyAdapter::new(
        options,
        obtain_host_identity(None).unwrap(),
        obtain_client_credential(None).unwrap(),
        Arc::new(LocalCommunicator::new()),
        SerializedUi::new(Arc::new(RecordingUi::default())),
    )
}

#[tokio::test]
async fn test_auto_port_skips_bound_candidates() {
    let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = busy.local_addr().unwrap().port();
    if base > u16::MAX - 32 {
        return;
    }

    let adapter = adapter_on(PortSelection::Auto { base, attempts: 16 });
    let port = adapter.start().await.unwrap();
    assert!(port > base && port < base + 16);
    adapter.shutdown().await;
}

#[tokio::test]
async fn test_auto_port_exhausted() {
    let busy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = busy.local_addr().unwrap().port();

    let adapter = adapter_on(PortSelection::Auto { base, attempts: 1 });
    let err = adapter.start().await.unwrap_err();
    assert!(matches!(
        err,
        ProxyError::Listen(ListenError::Exhausted { attempts: 1, .. })
    ));
    assert!(adapter.port().is_none());

    // Cleanup still works after a failed start
    adapter.shutdown().await;
}
