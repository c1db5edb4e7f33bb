//! Bridges from SSH channels onto the Communicator

mod exec;
mod path;
mod sftp;

pub use exec::{ExecBridge, START_FAILURE_STATUS};
pub use path::normalize;
pub use sftp::{SftpBridge, READDIR_PAGE_SIZE};
