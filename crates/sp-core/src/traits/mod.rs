//! Core trait definitions

mod communicator;
mod ui;

pub use communicator::{
    Capabilities, Communicator, DirEntry, FileKind, FileMetadata, RemoteCommand,
};
pub use ui::{SerializedUi, Ui};
