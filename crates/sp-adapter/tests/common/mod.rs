//! Shared fixtures: an adapter on an OS-chosen port and a russh client

#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg};
use russh_keys::key::{KeyPair, PublicKey};

use sp_adapter::{
    obtain_client_credential_as, obtain_host_identity_as, AdapterOptions, PortSelection,
    ProxyAdapter,
};
use sp_core::{Communicator, KeyType, LocalCommunicator, SerializedUi, Ui};

pub const USER: &str = "provisioner";

/// Ui that keeps every error for inspection
#[derive(Default)]
pub struct RecordingUi {
    pub errors: Mutex<Vec<String>>,
}

impl Ui for RecordingUi {
    fn say(&self, _message: &str) {}
    fn message(&self, _message: &str) {}
    fn error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }
    fn ask(&self, _query: &str) -> io::Result<String> {
        Ok(String::new())
    }
    fn machine(&self, _kind: &str, _args: &[&str]) {}
}

pub struct Fixture {
    pub adapter: ProxyAdapter,
    pub port: u16,
    /// Private half of the authorized key
    pub key: Arc<KeyPair>,
    pub ui: Arc<RecordingUi>,
}

pub async fn start_adapter() -> Fixture {
    start_adapter_with(Arc::new(LocalCommunicator::new()), |_| {}).await
}

pub async fn start_adapter_with(
    communicator: Arc<dyn Communicator>,
    configure: impl FnOnce(&mut AdapterOptions),
) -> Fixture {
    start_adapter_keyed(communicator, KeyType::default(), configure).await
}

/// Like [`start_adapter_with`], generating `key_type` host and client keys
pub async fn start_adapter_keyed(
    communicator: Arc<dyn Communicator>,
    key_type: KeyType,
    configure: impl FnOnce(&mut AdapterOptions),
) -> Fixture {
    let mut options = AdapterOptions::new(USER);
    options.port = PortSelection::Fixed(0);
    options.shutdown_grace = Duration::from_secs(3);
    configure(&mut options);

    let client = obtain_client_credential_as(None, key_type).unwrap();
    let key = russh_keys::load_secret_key(client.private_key_file().unwrap(), None).unwrap();
    let ui = Arc::new(RecordingUi::default());

    let adapter = ProxyAdapter::new(
        options,
        obtain_host_identity_as(None, key_type).unwrap(),
        client,
        communicator,
        SerializedUi::new(ui.clone()),
    );
    let port = adapter.start().await.unwrap();

    Fixture {
        adapter,
        port,
        key: Arc::new(key),
        ui,
    }
}

pub struct TestClient;

#[async_trait]
impl client::Handler for TestClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub async fn connect(port: u16) -> Handle<TestClient> {
    let config = Arc::new(client::Config::default());
    client::connect(config, ("127.0.0.1", port), TestClient)
        .await
        .unwrap()
}

/// Connect and authenticate as the configured user
pub async fn login(fixture: &Fixture) -> Handle<TestClient> {
    let mut session = connect(fixture.port).await;
    let ok = session
        .authenticate_publickey(USER, Arc::clone(&fixture.key))
        .await
        .unwrap();
    assert!(ok, "authentication with the configured key must succeed");
    session
}

/// Everything an exec channel delivered before closing
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

pub async fn collect(channel: &mut Channel<Msg>) -> ExecOutput {
    let mut output = ExecOutput::default();
    let drain = async {
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    output.stderr.extend_from_slice(&data)
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_status = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .expect("exec channel did not close");
    output
}

pub async fn exec(session: &Handle<TestClient>, command: &str) -> ExecOutput {
    let mut channel = session.channel_open_session().await.unwrap();
    channel.exec(true, command).await.unwrap();
    collect(&mut channel).await
}
