//! Exec bridge
//!
//! Runs one command through the Communicator and relays its stdio over
//! the SSH channel: channel data feeds remote stdin, remote stdout and
//! stderr come back as channel data and extended data, and the exit code
//! is reported with an `exit-status` request before the channel closes.

use std::sync::Arc;

use futures::FutureExt;
use russh::server::{Handle, Msg};
use russh::{Channel, ChannelId, ChannelMsg};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use sp_core::{Communicator, RemoteCommand, SerializedUi, Ui};

/// Exit status reported when the command could not be run at all
pub const START_FAILURE_STATUS: u32 = 255;

/// SSH_EXTENDED_DATA_STDERR
const EXTENDED_DATA_STDERR: u32 = 1;

const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

pub struct ExecBridge {
    communicator: Arc<dyn Communicator>,
    ui: SerializedUi,
}

impl ExecBridge {
    pub fn new(communicator: Arc<dyn Communicator>, ui: SerializedUi) -> Self {
        Self { communicator, ui }
    }

    /// Run `command` and relay it over `channel` until it exits or `cancel` fires
    pub async fn run(
        self,
        channel: Channel<Msg>,
        handle: Handle,
        command: String,
        cancel: CancellationToken,
    ) {
        let id = channel.id();

        let started = tokio::select! {
            _ = cancel.cancelled() => {
                finish(&handle, id, None).await;
                return;
            }
            started = self.communicator.start(&command) => started,
        };

        let remote = match started {
            Ok(remote) => remote,
            Err(e) => {
                tracing::error!("Failed to start {:?} on channel {:?}: {}", command, id, e);
                self.ui
                    .error(&format!("Failed to run command {:?}: {}", command, e));
                finish(&handle, id, Some(START_FAILURE_STATUS)).await;
                return;
            }
        };

        let RemoteCommand {
            stdin,
            stdout,
            stderr,
            exit,
            interrupt,
        } = remote;

        // Window-aware writers, so output never outruns the client
        let stdout_tx = Box::pin(channel.make_writer());
        let stderr_tx = Box::pin(channel.make_writer_ext(Some(EXTENDED_DATA_STDERR)));

        let closed = cancel.child_token();
        let input = relay_input(channel, stdin, closed.clone());
        tokio::pin!(input);

        let mut completion = async move {
            tokio::join!(
                relay_output(id, stdout, stdout_tx, closed.clone()),
                relay_output(id, stderr, stderr_tx, closed),
            );
            exit.await
        }
        .boxed();

        let mut input_done = false;

        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break None,
                _ = &mut input, if !input_done => input_done = true,
                exit = &mut completion => break Some(exit),
            }
        };

        match outcome {
            Some(Ok(code)) => {
                tracing::debug!("Command on channel {:?} exited with {}", id, code);
                finish(&handle, id, Some(code)).await;
            }
            Some(Err(e)) => {
                tracing::error!("Command on channel {:?} failed: {}", id, e);
                self.ui
                    .error(&format!("Command {:?} failed: {}", command, e));
                finish(&handle, id, Some(START_FAILURE_STATUS)).await;
            }
            None => {
                match interrupt {
                    Some(token) => {
                        tracing::debug!("Interrupting command on channel {:?}", id);
                        token.cancel();
                    }
                    None => {
                        tracing::debug!("Detaching uninterruptible command on channel {:?}", id);
                        tokio::spawn(async move {
                            let _ = completion.await;
                        });
                    }
                }
                finish(&handle, id, None).await;
            }
        }
    }
}

/// Forward channel data to remote stdin until the client sends EOF,
/// then hold the channel until the client closes it
async fn relay_input(
    mut channel: Channel<Msg>,
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    closed: CancellationToken,
) {
    let mut stdin = Some(stdin);

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => {
                // A command that stopped reading must not stall the channel
                if let Some(writer) = stdin.as_mut() {
                    if writer.write_all(&data).await.is_err() {
                        stdin = None;
                    }
                }
            }
            ChannelMsg::Eof => {
                if let Some(mut writer) = stdin.take() {
                    let _ = writer.shutdown().await;
                }
            }
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    if let Some(mut writer) = stdin.take() {
        let _ = writer.shutdown().await;
    }
    closed.cancel();
}

/// Copy a remote output stream to the channel, waiting for window space
/// on every write
async fn relay_output<W>(
    id: ChannelId,
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut writer: W,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    let mut deliver = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("Output stream for channel {:?} failed: {}", id, e);
                break;
            }
        };

        // Keep draining after the channel is gone so the command never blocks
        if !deliver {
            continue;
        }

        let sent = tokio::select! {
            _ = closed.cancelled() => Ok(false),
            sent = writer.write_all(&buf[..n]) => sent.map(|_| true),
        };
        match sent {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Channel {:?} closed, discarding further output", id);
                deliver = false;
            }
            Err(e) => {
                tracing::debug!("Channel {:?} write failed: {}, discarding further output", id, e);
                deliver = false;
            }
        }
    }
}

/// Report the exit status (if any), then EOF and close
async fn finish(handle: &Handle, id: ChannelId, status: Option<u32>) {
    if let Some(code) = status {
        let _ = handle.exit_status_request(id, code).await;
    }
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}
