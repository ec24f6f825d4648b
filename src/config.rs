//! The resolved configuration shape the core consumes (spec §6.1). Loading
//! this from a TOML file on disk, template-interpolating path variables, and
//! the interactive menu that builds `manual_transfer`/scope selections are
//! external collaborators (spec §1) and live in the CLI binary, not here.

use std::path::PathBuf;

use crate::ssh::SshTarget;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub local_root: PathBuf,
    pub remote_root: String,
    pub os_target: String,
    pub ignores: Vec<String>,
    pub manual_transfer: Vec<String>,
    pub ssh: SshTarget,
}

impl SyncConfig {
    pub fn is_windows_target(&self) -> bool {
        self.os_target.to_ascii_lowercase().contains("win")
    }
}
