//! Provisioner settings

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_HOST_ALIAS: &str = "default";
const DEFAULT_HOST_ALIAS_ENV: &str = "TARGET_HOSTS";
const DEFAULT_SSH_CONFIG_ENV: &str = "SSH_CONFIG_FILE";
const DEFAULT_PORT_SEARCH_BASE: u16 = 49152;
const DEFAULT_PORT_SEARCH_ATTEMPTS: u16 = 10;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

const TESTINFRA_COMMAND: &str = "pytest";
const TESTINFRA_ARGUMENTS: [&str; 2] = ["--ssh-config=${SSH_CONFIG_FILE}", "--hosts=${TARGET_HOSTS}"];

/// Settings presets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    /// Run the configured command as-is
    #[default]
    Generic,
    /// Drive pytest-testinfra against the proxied host
    Testinfra,
}

/// Algorithm of generated host and client keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    #[default]
    Ed25519,
    /// RSA-2048, for clients without Ed25519 support
    Rsa,
}

/// Raw provisioner settings as written in the config file.
///
/// Every field is optional; [`Settings::prepare`] applies defaults and
/// validates the result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// External command driving the session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    /// Extra arguments appended to the command
    pub arguments: Vec<String>,

    /// `KEY=VALUE` assignments added to the command's environment
    pub environment_variables: Vec<String>,

    /// User the client must authenticate as
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Loopback port to listen on (absent or 0 selects automatically)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,

    /// First candidate port for automatic selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_search_base: Option<u16>,

    /// Number of candidate ports tried during automatic selection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_search_attempts: Option<u16>,

    /// Private host key (generated in memory when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_host_key_file: Option<PathBuf>,

    /// Authorized client public key (generated when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_authorized_key_file: Option<PathBuf>,

    /// Client ssh_config handed to the command (generated when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_config_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_config_env_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_alias: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_alias_env_name: Option<String>,

    /// Remote sftp-server command used instead of the built-in SFTP bridge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sftp_command: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,

    /// Algorithm used when a key has to be generated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyType>,

    pub preset: Preset,
}

/// Settings with defaults applied and every field validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedSettings {
    pub command: String,
    pub arguments: Vec<String>,
    pub environment_variables: Vec<(String, String)>,
    pub user: String,
    /// `None` selects a port automatically
    pub local_port: Option<u16>,
    pub port_search_base: u16,
    pub port_search_attempts: u16,
    pub ssh_host_key_file: Option<PathBuf>,
    pub ssh_authorized_key_file: Option<PathBuf>,
    pub ssh_config_file: Option<PathBuf>,
    pub ssh_config_env_name: String,
    pub host_alias: String,
    pub host_alias_env_name: String,
    pub sftp_command: Option<String>,
    pub shutdown_grace_secs: u64,
    pub key_type: KeyType,
    pub preset: Preset,
}

impl Settings {
    /// Apply the preset and defaults, validating every field.
    ///
    /// All problems are collected into a single [`ConfigError::Invalid`].
    pub fn prepare(mut self) -> Result<PreparedSettings, ConfigError> {
        let mut errors = Vec::new();

        if self.preset == Preset::Testinfra {
            self.apply_testinfra(&mut errors);
        }

        let command = match self.command.take().filter(|c| !c.trim().is_empty()) {
            Some(command) => command,
            None => {
                errors.push("command must be specified".to_string());
                String::new()
            }
        };

        let user = self
            .user
            .take()
            .unwrap_or_else(whoami::username);
        if user.is_empty() {
            errors.push("user could not be determined; set `user`".to_string());
        }

        let mut environment_variables = Vec::new();
        for entry in &self.environment_variables {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    environment_variables.push((key.to_string(), value.to_string()));
                }
                _ => errors.push(format!(
                    "environment variable not in KEY=VALUE format: {:?}",
                    entry
                )),
            }
        }

        let port_search_attempts = self
            .port_search_attempts
            .unwrap_or(DEFAULT_PORT_SEARCH_ATTEMPTS);
        if port_search_attempts == 0 {
            errors.push("port_search_attempts must be at least 1".to_string());
        }

        for (name, path) in [
            ("ssh_host_key_file", &self.ssh_host_key_file),
            ("ssh_authorized_key_file", &self.ssh_authorized_key_file),
        ] {
            if let Some(path) = path {
                if let Err(problem) = validate_key_file(path) {
                    errors.push(format!("{}: {}", name, problem));
                }
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        Ok(PreparedSettings {
            command,
            arguments: self.arguments,
            environment_variables,
            user,
            local_port: self.local_port.filter(|port| *port != 0),
            port_search_base: self.port_search_base.unwrap_or(DEFAULT_PORT_SEARCH_BASE),
            port_search_attempts,
            ssh_host_key_file: self.ssh_host_key_file,
            ssh_authorized_key_file: self.ssh_authorized_key_file,
            ssh_config_file: self.ssh_config_file,
            ssh_config_env_name: self
                .ssh_config_env_name
                .unwrap_or_else(|| DEFAULT_SSH_CONFIG_ENV.to_string()),
            host_alias: self
                .host_alias
                .unwrap_or_else(|| DEFAULT_HOST_ALIAS.to_string()),
            host_alias_env_name: self
                .host_alias_env_name
                .unwrap_or_else(|| DEFAULT_HOST_ALIAS_ENV.to_string()),
            sftp_command: self.sftp_command,
            shutdown_grace_secs: self
                .shutdown_grace_secs
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            key_type: self.key_type.unwrap_or_default(),
            preset: self.preset,
        })
    }

    /// testinfra reads the ssh config and host list from fixed variables
    fn apply_testinfra(&mut self, errors: &mut Vec<String>) {
        for (name, set) in [
            ("ssh_config_env_name", self.ssh_config_env_name.is_some()),
            ("host_alias", self.host_alias.is_some()),
            ("host_alias_env_name", self.host_alias_env_name.is_some()),
        ] {
            if set {
                errors.push(format!("{} cannot be set with the testinfra preset", name));
            }
        }

        if self.command.is_none() {
            self.command = Some(TESTINFRA_COMMAND.to_string());
        }
        self.arguments
            .extend(TESTINFRA_ARGUMENTS.iter().map(|arg| arg.to_string()));
    }
}

fn validate_key_file(path: &Path) -> Result<(), String> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Err(format!("{} is a directory", path.display())),
        Ok(_) => Ok(()),
        Err(e) => Err(format!("{}: {}", path.display(), e)),
    }
}

impl PreparedSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Full shell command line: the command followed by its arguments
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
