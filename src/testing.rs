//! In-process test doubles for [`crate::ssh::SshSession`].
//!
//! Not behind `#[cfg(test)]` because `tests/engine_scenarios.rs` is a
//! separate compilation unit and needs these from the compiled library, the
//! same way a production codebase keeps a small `testing` module public for
//! its integration-test crate to reuse.

use std::path::{Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::ssh::SshSession;

/// A fake remote host that is really just another directory on the same
/// filesystem. `upload`/`download` are plain file copies; `run` executes the
/// literal command string through `sh -c`, so the real POSIX `RemoteShell`
/// commands (`rm -f`, `mkdir -p`, `sha256sum`, `pkill -f`) exercise real
/// system binaries against that directory.
pub struct FakeSshSession;

impl FakeSshSession {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FakeSshSession {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SshSession for FakeSshSession {
    async fn upload(&self, local: &Path, remote_path: &str, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let dest = PathBuf::from(remote_path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| Error::PerFileIo {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::copy(local, &dest)
            .await
            .map_err(|source| Error::PerFileTransfer {
                rel: remote_path.to_string(),
                reason: source.to_string(),
            })?;
        Ok(())
    }

    async fn download(&self, remote_path: &str, local: &Path, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let src = PathBuf::from(remote_path);
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| Error::PerFileIo {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        tokio::fs::copy(&src, local)
            .await
            .map_err(|source| Error::PerFileTransfer {
                rel: remote_path.to_string(),
                reason: source.to_string(),
            })?;
        Ok(())
    }

    async fn run(&self, command: &str) -> Result<String> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| Error::SshIo {
                op: "run".to_string(),
                source,
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
