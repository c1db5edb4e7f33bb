//! Client ssh_config generation
//!
//! When no ssh_config is supplied, the command gets a one-host file
//! pointing its alias at the loopback proxy.

use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::TempPath;

/// `Host` block routing an alias to the proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAliasConfig {
    pub alias: String,
    pub port: u16,
    pub user: String,
    /// Private key to authenticate with; omitted when the operator
    /// supplied the authorized key and holds the private half themselves
    pub identity_file: Option<PathBuf>,
}

impl HostAliasConfig {
    pub fn render(&self) -> String {
        let mut out = format!(
            "Host {}\n  Hostname 127.0.0.1\n  Port {}\n  StrictHostKeyChecking no\n  UserKnownHostsFile /dev/null\n  User {}\n",
            self.alias, self.port, self.user
        );
        if let Some(identity) = &self.identity_file {
            out.push_str(&format!("  IdentityFile {}\n", identity.display()));
            out.push_str("  IdentitiesOnly yes\n");
        }
        out
    }

    /// Write the block to a temporary file, deleted when the guard drops
    pub fn write_temp(&self) -> std::io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix("sshproxy-ssh_config-")
            .tempfile()?;
        file.write_all(self.render().as_bytes())?;
        file.flush()?;
        let path = file.into_temp_path();
        tracing::debug!("Wrote ssh_config for {} to {:?}", self.alias, &*path);
        Ok(path)
    }
}

/// Path exported to the command: the supplied file or the generated one
pub fn exported_path<'a>(
    supplied: Option<&'a Path>,
    generated: Option<&'a TempPath>,
) -> Option<&'a Path> {
    supplied.or(generated.map(|path| &**path))
}
