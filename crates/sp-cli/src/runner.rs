//! Drives the external command
//!
//! The command line runs under `sh -e -c` with the inherited environment
//! plus the proxy variables. Each output line is relayed to the Ui with
//! trailing whitespace trimmed.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use sp_core::Ui;

/// Run `command_line` to completion, relaying its output to `ui`.
///
/// Fails with `Non-zero exit status` when the command does not exit 0, and
/// kills it if `cancel` fires first.
pub async fn run_command(
    command_line: &str,
    env: &[(String, String)],
    ui: &dyn Ui,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut child = Command::new("sh")
        .arg("-e")
        .arg("-c")
        .arg(command_line)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to start {:?}", command_line))?;

    let stdout = child.stdout.take().context("stdout not captured")?;
    let stderr = child.stderr.take().context("stderr not captured")?;

    let relay = async {
        tokio::join!(relay_lines(stdout, ui), relay_lines(stderr, ui));
        child.wait().await
    };

    let status = tokio::select! {
        status = relay => status.context("Failed to wait for command")?,
        _ = cancel.cancelled() => {
            tracing::info!("Cancelled, stopping {:?}", command_line);
            bail!("Provisioning cancelled");
        }
    };

    if !status.success() {
        tracing::warn!("{:?} exited with {}", command_line, status);
        bail!("Non-zero exit status: {}", status);
    }
    Ok(())
}

async fn relay_lines<R: AsyncRead + Unpin>(reader: R, ui: &dyn Ui) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => ui.message(line.trim_end()),
            Ok(None) => break,
            Err(e) => {
                ui.error(&e.to_string());
                break;
            }
        }
    }
}
