//! `RemoteShell` capability (spec §9 design note: "Windows/POSIX duality").
//!
//! Every place the engine or the Agent Lifecycle previously branched on
//! `os_target.contains("win")` is factored into this trait so the engine
//! itself stays OS-agnostic; only the two small implementations here know
//! about `rm` vs `del`, `pkill` vs `taskkill`, and so on.

use crate::ssh::SshSession;

/// Commands the engine needs to run on the remote host, abstracted over
/// POSIX and Windows shells.
#[async_trait::async_trait]
pub trait RemoteShell: Send + Sync {
    /// Short name for logging ("posix" / "windows"); also handy in tests.
    fn name(&self) -> &'static str;
    async fn mkdir_p(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()>;
    async fn rm_f(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()>;
    async fn sha256_of(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<String>;
    async fn kill_by_name(&self, ssh: &dyn SshSession, process_name: &str) -> crate::error::Result<()>;
    async fn chmod_x(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()>;
    /// Returns `path`'s contents, or an empty string if it does not exist.
    /// Used only by the lockfile guard (SPEC_FULL.md §C).
    async fn cat_or_empty(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<String>;
}

pub fn for_target(os_target: &str) -> Box<dyn RemoteShell> {
    if os_target.to_ascii_lowercase().contains("win") {
        Box::new(WindowsShell)
    } else {
        Box::new(PosixShell)
    }
}

pub struct PosixShell;

#[async_trait::async_trait]
impl RemoteShell for PosixShell {
    fn name(&self) -> &'static str {
        "posix"
    }

    async fn mkdir_p(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()> {
        ssh.run(&format!("mkdir -p '{path}'")).await.map(|_| ())
    }

    async fn rm_f(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()> {
        ssh.run(&format!("rm -f '{path}'")).await.map(|_| ())
    }

    async fn sha256_of(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<String> {
        let out = ssh.run(&format!("sha256sum '{path}' 2>/dev/null")).await?;
        Ok(out.split_whitespace().next().unwrap_or_default().to_string())
    }

    async fn kill_by_name(&self, ssh: &dyn SshSession, process_name: &str) -> crate::error::Result<()> {
        // Non-fatal: absence of a matching process is not an error.
        let _ = ssh.run(&format!("pkill -f '{process_name}' || true")).await;
        Ok(())
    }

    async fn chmod_x(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()> {
        ssh.run(&format!("chmod +x '{path}'")).await.map(|_| ())
    }

    async fn cat_or_empty(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<String> {
        ssh.run(&format!("cat '{path}' 2>/dev/null || true")).await
    }
}

pub struct WindowsShell;

#[async_trait::async_trait]
impl RemoteShell for WindowsShell {
    fn name(&self) -> &'static str {
        "windows"
    }

    async fn mkdir_p(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()> {
        ssh.run(&format!(
            "cmd.exe /C if not exist \"{path}\" mkdir \"{path}\""
        ))
        .await
        .map(|_| ())
    }

    async fn rm_f(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<()> {
        ssh.run(&format!("cmd.exe /C del /f /q \"{path}\""))
            .await
            .map(|_| ())
    }

    async fn sha256_of(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<String> {
        let out = ssh
            .run(&format!(
                "powershell.exe -NoProfile -Command \"(Get-FileHash -Algorithm SHA256 '{path}').Hash\""
            ))
            .await?;
        Ok(out.trim().to_ascii_lowercase())
    }

    async fn kill_by_name(&self, ssh: &dyn SshSession, process_name: &str) -> crate::error::Result<()> {
        let _ = ssh
            .run(&format!("cmd.exe /C taskkill /F /IM \"{process_name}\""))
            .await;
        Ok(())
    }

    async fn chmod_x(&self, _ssh: &dyn SshSession, _path: &str) -> crate::error::Result<()> {
        // Executable permission is not a meaningful concept on Windows.
        Ok(())
    }

    async fn cat_or_empty(&self, ssh: &dyn SshSession, path: &str) -> crate::error::Result<String> {
        ssh.run(&format!(
            "powershell.exe -NoProfile -Command \"if (Test-Path '{path}') {{ Get-Content '{path}' -Raw }} else {{ '' }}\""
        ))
        .await
    }
}
