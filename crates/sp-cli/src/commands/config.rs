//! Config command implementations

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::output::{print_error, print_info, print_success, print_warning};
use sp_core::config;
use sp_core::{ConfigError, Settings};

/// Written by `config init`
const DEFAULT_CONFIG: &str = r#"# sshproxy configuration
#
# Every key is optional; commented values show the defaults.

# Command run against the proxy, and its arguments.
# command = "ansible-playbook"
# arguments = ["-i", "${TARGET_HOSTS},", "site.yml"]

# Extra KEY=VALUE environment for the command.
# environment_variables = []

# User the command must log in as (defaults to the current user).
# user = "deploy"

# Fixed loopback port; absent or 0 searches from port_search_base.
# local_port = 0
# port_search_base = 49152
# port_search_attempts = 10

# Key material; generated when absent.
# ssh_host_key_file = "/path/to/host_key"
# ssh_authorized_key_file = "/path/to/id_ed25519.pub"
# Algorithm of generated keys: "ed25519" or "rsa" (2048-bit, for
# clients such as paramiko older than 2.2).
# key_type = "ed25519"

# Supply your own ssh_config instead of the generated one.
# ssh_config_file = "/path/to/ssh_config"
# ssh_config_env_name = "SSH_CONFIG_FILE"
# host_alias = "default"
# host_alias_env_name = "TARGET_HOSTS"

# Pipe sftp sessions to this command on the target instead of the
# built-in SFTP server.
# sftp_command = "/usr/lib/openssh/sftp-server -e"

# Seconds shutdown waits for open connections.
# shutdown_grace_secs = 5

# "generic" or "testinfra".
# preset = "generic"
"#;

fn resolve_path(config_path: Option<&PathBuf>) -> PathBuf {
    config_path
        .cloned()
        .unwrap_or_else(config::default_config_path)
}

/// Load settings from `config_path`, or the default file if it exists.
///
/// An explicitly named file must exist; a missing default file yields
/// empty settings.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<Settings> {
    let path = resolve_path(config_path);
    match config::load_config::<Settings>(&path) {
        Ok(settings) => {
            tracing::debug!("Loaded settings from {:?}", path);
            Ok(settings)
        }
        Err(ConfigError::NotFound(_)) if config_path.is_none() => {
            tracing::debug!("No config at {:?}, using defaults", path);
            Ok(Settings::default())
        }
        Err(e) => Err(e).with_context(|| format!("Failed to load config from {:?}", path)),
    }
}

/// Initialize a new configuration file
pub fn config_init(config_path: Option<&PathBuf>, force: bool) -> Result<()> {
    let path = resolve_path(config_path);

    if path.exists() && !force {
        print_warning(&format!("Config file already exists: {:?}", path));
        print_info("Use --force to overwrite");
        return Ok(());
    }

    write_default(&path)?;
    print_success(&format!("Created config file: {:?}", path));
    Ok(())
}

fn write_default(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("Failed to write config file: {:?}", path))
}

/// Print the prepared settings
pub fn config_show(config_path: Option<&PathBuf>, json: bool) -> Result<()> {
    let prepared = load_settings(config_path)?.prepare()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&prepared)?);
    } else {
        println!("{}", toml::to_string_pretty(&prepared)?);
    }
    Ok(())
}

/// Check the settings and report every problem.
///
/// Returns whether the settings are valid.
pub fn config_validate(config_path: Option<&PathBuf>) -> Result<bool> {
    let settings = load_settings(config_path)?;
    match settings.prepare() {
        Ok(_) => {
            print_success("Configuration is valid");
            Ok(true)
        }
        Err(ConfigError::Invalid(problems)) => {
            for problem in &problems {
                print_error(problem);
            }
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
