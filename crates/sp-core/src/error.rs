//! Core error types for sshproxy

use std::path::PathBuf;

use sp_protocol::StatusCode;
use thiserror::Error;

/// Top-level error type for the adapter
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Host or client key material could not be obtained (fatal to startup)
    #[error("Key error: {0}")]
    KeyLoad(#[from] KeyLoadError),

    /// No usable loopback port (fatal to startup)
    #[error("Listen error: {0}")]
    Listen(#[from] ListenError),

    /// A single authentication attempt was refused
    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    /// A channel asked for something the adapter does not serve
    #[error("Channel error: {0}")]
    ChannelProtocol(#[from] ChannelProtocolError),

    /// An SFTP operation failed with a protocol status
    #[error("SFTP error: {0}")]
    SftpStatus(#[from] SftpStatusError),

    /// The communicator failed to carry out an operation
    #[error("Communicator error: {0}")]
    Communicator(#[from] CommunicatorError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key material errors
#[derive(Error, Debug)]
pub enum KeyLoadError {
    /// Key file could not be read
    #[error("Failed to read key file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Key file contents are not a usable key
    #[error("Failed to parse key file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Fresh key generation failed
    #[error("Failed to generate key pair: {0}")]
    Generate(String),

    /// Generated private key could not be persisted for the client
    #[error("Failed to write private key: {0}")]
    Persist(#[source] std::io::Error),
}

/// Listener errors
#[derive(Error, Debug)]
pub enum ListenError {
    /// A specifically requested port could not be bound
    #[error("Failed to bind 127.0.0.1:{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Every automatic candidate port failed
    #[error("No usable loopback port in {first}..={last} after {attempts} attempts")]
    Exhausted { first: u16, last: u16, attempts: u16 },

    /// The adapter was shut down before it could start
    #[error("Adapter is shut down")]
    ShutDown,
}

/// Authentication errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    /// The presented user is not the configured one
    #[error("authentication failed: {0} is not a valid user")]
    InvalidUser(String),

    /// The presented key is not the authorized client key
    #[error("authentication failed: unauthorized key")]
    UnauthorizedKey,
}

/// Channel-level protocol errors; the channel is refused, the connection lives on
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelProtocolError {
    /// Channel type other than `session`
    #[error("unsupported channel type: {0}")]
    UnsupportedChannelType(String),

    /// Subsystem other than `sftp`
    #[error("unsupported subsystem: {0}")]
    UnsupportedSubsystem(String),

    /// A request arrived on a channel whose purpose is already fixed
    #[error("channel already serving {0}")]
    AlreadyClassified(&'static str),

    /// A request the adapter never serves (shell, pty, x11, ...)
    #[error("unsupported channel request: {0}")]
    UnsupportedRequest(&'static str),

    /// Request for a channel id the connection does not know
    #[error("unknown channel")]
    UnknownChannel,
}

/// An SFTP failure carrying the status code to report
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct SftpStatusError {
    pub code: StatusCode,
    pub message: String,
}

impl SftpStatusError {
    /// Create a new status error
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Status error with the code's default message
    pub fn code(code: StatusCode) -> Self {
        Self::new(code, code.message())
    }

    pub fn bad_handle(handle: &str) -> Self {
        Self::new(StatusCode::InvalidHandle, format!("Invalid handle: {}", handle))
    }
}

impl From<CommunicatorError> for SftpStatusError {
    fn from(err: CommunicatorError) -> Self {
        Self::new(err.status_code(), err.to_string())
    }
}

/// Communicator errors
#[derive(Error, Debug)]
pub enum CommunicatorError {
    /// Command could not be started at all (not a non-zero exit)
    #[error("Failed to start command: {0}")]
    Start(String),

    /// Path does not exist
    #[error("No such file: {0}")]
    NotFound(String),

    /// Access denied by the target
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Target already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The communicator cannot perform this operation
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// Operation failed on the target
    #[error("{0}")]
    Failed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommunicatorError {
    /// Classify an I/O error against a path
    pub fn from_io(err: std::io::Error, path: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_string()),
            _ => Self::Io(err),
        }
    }

    /// SFTP status code that best describes this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NoSuchFile,
            Self::PermissionDenied(_) => StatusCode::PermissionDenied,
            Self::Unsupported(_) => StatusCode::OpUnsupported,
            Self::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NoSuchFile,
                std::io::ErrorKind::PermissionDenied => StatusCode::PermissionDenied,
                _ => StatusCode::Failure,
            },
            Self::Start(_) | Self::AlreadyExists(_) | Self::Failed(_) => StatusCode::Failure,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// One or more settings failed validation
    #[error("Invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// Config file could not be read or written
    #[error("Config file I/O: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_communicator_error_status_mapping() {
        assert_eq!(
            CommunicatorError::NotFound("/x".into()).status_code(),
            StatusCode::NoSuchFile
        );
        assert_eq!(
            CommunicatorError::PermissionDenied("/x".into()).status_code(),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            CommunicatorError::Unsupported("read_at").status_code(),
            StatusCode::OpUnsupported
        );
        assert_eq!(
            CommunicatorError::Failed("boom".into()).status_code(),
            StatusCode::Failure
        );
    }

    #[test]
    fn test_from_io_classifies_kind() {
        let err = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(matches!(
            CommunicatorError::from_io(err, "/missing"),
            CommunicatorError::NotFound(path) if path == "/missing"
        ));

        let err = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        assert_eq!(
            CommunicatorError::from_io(err, "/x").status_code(),
            StatusCode::Failure
        );
    }

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = ConfigError::Invalid(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Invalid config: a; b");
    }
}
