//! CLI command implementations

mod config;
mod run;

pub use config::{config_init, config_show, config_validate, load_settings};
pub use run::run_command;
