//! sshproxy: run SSH-only tooling against a Communicator
//!
//! Provides the `sshproxy` CLI. A provisioning run starts the loopback
//! proxy, generates an ssh_config for it, and drives the configured
//! command to completion.

pub mod commands;
pub mod output;
pub mod runner;
pub mod ssh_config;
