//! The provisioning run
//!
//! Starts the proxy in front of a Communicator, hands the external command
//! an ssh_config for it, runs the command and tears everything down again
//! whatever the outcome.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use sp_adapter::{
    obtain_client_credential_as, obtain_host_identity_as, AdapterOptions, PortSelection,
    ProxyAdapter,
};
use sp_core::{Communicator, PreparedSettings, SerializedUi, Ui};

use crate::runner;
use crate::ssh_config::{exported_path, HostAliasConfig};

/// Run `settings.command` against `communicator` through the proxy
pub async fn run_command(
    settings: &PreparedSettings,
    communicator: Arc<dyn Communicator>,
    ui: SerializedUi,
    cancel: CancellationToken,
) -> Result<()> {
    ui.say("Provisioning with SshProxy...");

    let client =
        obtain_client_credential_as(settings.ssh_authorized_key_file.as_deref(), settings.key_type)
            .context("Failed to obtain client key")?;
    let host = obtain_host_identity_as(settings.ssh_host_key_file.as_deref(), settings.key_type)
        .context("Failed to obtain host key")?;

    let adapter = ProxyAdapter::new(
        adapter_options(settings),
        host,
        client,
        communicator,
        ui.clone(),
    );

    let result = match adapter.start().await {
        Ok(port) => drive(settings, &adapter, port, &ui, &cancel).await,
        Err(e) => Err(anyhow::Error::new(e).context("Failed to start SSH proxy")),
    };

    adapter.shutdown().await;
    result.with_context(|| format!("Error executing {}", settings.command))
}

fn adapter_options(settings: &PreparedSettings) -> AdapterOptions {
    let mut options = AdapterOptions::new(settings.user.clone());
    options.port = match settings.local_port {
        Some(port) => PortSelection::Fixed(port),
        None => PortSelection::Auto {
            base: settings.port_search_base,
            attempts: settings.port_search_attempts,
        },
    };
    options.shutdown_grace = settings.shutdown_grace();
    options.sftp_command = settings.sftp_command.clone();
    options
}

async fn drive(
    settings: &PreparedSettings,
    adapter: &ProxyAdapter,
    port: u16,
    ui: &SerializedUi,
    cancel: &CancellationToken,
) -> Result<()> {
    // Held until the command finishes; dropping it deletes the file
    let generated = match &settings.ssh_config_file {
        Some(_) => None,
        None => {
            let config = HostAliasConfig {
                alias: settings.host_alias.clone(),
                port,
                user: settings.user.clone(),
                identity_file: adapter.private_key_file().map(|p| p.to_path_buf()),
            };
            Some(
                config
                    .write_temp()
                    .context("Error preparing ssh_config file")?,
            )
        }
    };

    let config_path = exported_path(settings.ssh_config_file.as_deref(), generated.as_ref())
        .context("no ssh_config available")?;

    let mut env = vec![
        (
            settings.ssh_config_env_name.clone(),
            config_path.display().to_string(),
        ),
        (settings.host_alias_env_name.clone(), settings.host_alias.clone()),
    ];
    env.extend(settings.environment_variables.iter().cloned());

    let command_line = settings.command_line();
    ui.say(&format!("Executing: {}", command_line));
    tracing::info!(
        "Running {:?} against 127.0.0.1:{} as {}",
        command_line,
        port,
        settings.user
    );

    runner::run_command(&command_line, &env, ui, cancel).await
}
