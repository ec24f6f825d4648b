//! Agent Lifecycle (spec §4.6): build-for-target, deploy, execute, collect.
//!
//! Mirrors the teacher's own process-spawning idiom (`which` to locate a
//! toolchain binary, `tokio::process::Command` to run it, a streamed-output
//! log) but applied to cross-compiling and driving the remote indexing agent
//! instead of `rsync`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::agent_proto::{AgentWireConfig, DevsyncSection};
use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::remote_shell::RemoteShell;
use crate::ssh::SshSession;

pub const SYNC_TEMP_DIRNAME: &str = ".sync_temp";
pub const LOCK_FILENAME: &str = ".lock";
const AGENT_EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const DEPLOY_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const WORKSTATION_ID_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const WORKSTATION_ID_LEN: usize = 8;

/// A short, random, filesystem-safe id unique to this workstation (spec
/// §4.6). Persisted in `.sync_temp/config.json` so repeat invocations reuse
/// the same agent binary name instead of colliding with another
/// workstation's deployment on the same remote host.
pub fn generate_workstation_id() -> String {
    let mut rng = rand::rng();
    (0..WORKSTATION_ID_LEN)
        .map(|_| {
            let idx = rng.random_range(0..WORKSTATION_ID_CHARS.len());
            WORKSTATION_ID_CHARS[idx] as char
        })
        .collect()
}

pub fn agent_binary_name(workstation_id: &str, windows: bool) -> String {
    if windows {
        format!("sync-agent-{workstation_id}.exe")
    } else {
        format!("sync-agent-{workstation_id}")
    }
}

/// The Go-toolchain-style arch token mapping named in §4.6, expressed as a
/// Rust target triple fragment plus (for 32-bit ARM) the variant needed to
/// pick the right calling convention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArch {
    pub arch: String,
    pub variant: Option<String>,
}

impl TargetArch {
    pub fn from_uname_m(uname_output: &str) -> Option<TargetArch> {
        match uname_output.trim() {
            "x86_64" => Some(TargetArch {
                arch: "amd64".to_string(),
                variant: None,
            }),
            "aarch64" => Some(TargetArch {
                arch: "arm64".to_string(),
                variant: None,
            }),
            "armv7l" => Some(TargetArch {
                arch: "arm".to_string(),
                variant: Some("armv7".to_string()),
            }),
            "armv6l" => Some(TargetArch {
                arch: "arm".to_string(),
                variant: Some("armv6".to_string()),
            }),
            _ => None,
        }
    }
}

/// Detects the remote architecture with a single remote command. Skipped
/// entirely for Windows targets (spec §4.6: "skipped for Windows targets").
pub async fn detect_remote_arch(
    ssh: &dyn SshSession,
    windows_target: bool,
) -> Result<Option<TargetArch>> {
    if windows_target {
        return Ok(None);
    }
    let output = ssh.run("uname -m").await?;
    Ok(TargetArch::from_uname_m(&output))
}

/// Maps a detected architecture (or the Windows default, x86_64) to the Rust
/// target triple `cargo build --target` expects. The remote host's arch
/// token (amd64/arm64/arm+armv7/arm+armv6, per §4.6) is translated into the
/// `gnu`/`musl`/`gnueabihf` triple family this toolchain already targets for
/// POSIX builds; Windows cross-compiles via the `gnu` ABI.
pub fn rust_target_triple(windows_target: bool, arch: Option<&TargetArch>) -> String {
    if windows_target {
        return "x86_64-pc-windows-gnu".to_string();
    }
    match arch {
        Some(TargetArch { arch, variant: None }) if arch == "amd64" => {
            "x86_64-unknown-linux-gnu".to_string()
        }
        Some(TargetArch { arch, variant: None }) if arch == "arm64" => {
            "aarch64-unknown-linux-gnu".to_string()
        }
        Some(TargetArch { variant: Some(v), .. }) if v == "armv7" => {
            "armv7-unknown-linux-gnueabihf".to_string()
        }
        Some(TargetArch { variant: Some(v), .. }) if v == "armv6" => {
            "arm-unknown-linux-gnueabihf".to_string()
        }
        _ => "x86_64-unknown-linux-gnu".to_string(),
    }
}

async fn run_local_streamed(mut cmd: Command, op: &str) -> Result<()> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|source| Error::AgentBuild {
        target: op.to_string(),
        source,
    })?;
    let stdout = child.stdout.take().expect("stdout was piped");
    let mut reader = BufReader::new(stdout).lines();

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = child.wait().await;
        let _ = tx.send(status);
    });

    while let Some(line) = reader
        .next_line()
        .await
        .map_err(|source| Error::AgentBuild {
            target: op.to_string(),
            source,
        })?
    {
        debug!(%op, "{}", line);
    }

    let status = rx
        .await
        .map_err(|_| Error::AgentBuild {
            target: op.to_string(),
            source: std::io::Error::other("build process disappeared"),
        })?
        .map_err(|source| Error::AgentBuild {
            target: op.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(Error::AgentBuild {
            target: op.to_string(),
            source: std::io::Error::other(format!("{op} exited with status {status}")),
        });
    }
    Ok(())
}

/// Cross-compiles `sync-agent` for `rust_target_triple` into `out_dir`.
pub async fn build_agent(rust_target_triple: &str, project_root: &Path) -> Result<PathBuf> {
    let cargo = which::which("cargo").map_err(|e| Error::AgentBuild {
        target: rust_target_triple.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
    })?;

    let mut cmd = Command::new(cargo);
    cmd.current_dir(project_root);
    cmd.args([
        "build",
        "--release",
        "--bin",
        "sync-agent",
        "--target",
        rust_target_triple,
    ]);
    run_local_streamed(cmd, rust_target_triple).await?;

    Ok(project_root
        .join("target")
        .join(rust_target_triple)
        .join("release")
        .join("sync-agent"))
}

/// Falls back to a pre-compiled binary checked into the project root when a
/// fresh cross-compile fails (spec §4.6 "Fallback").
pub fn find_fallback_binary(project_root: &Path, os_target: &str) -> Option<PathBuf> {
    let windows = os_target.to_ascii_lowercase().contains("win");
    let ext = if windows { ".exe" } else { "" };
    let candidates = [
        format!("sync-agent-{os_target}{ext}"),
        format!("sync-agent{ext}"),
    ];
    candidates
        .into_iter()
        .map(|name| project_root.join(name))
        .find(|path| path.is_file())
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|source| Error::PerFileIo {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|source| Error::PerFileIo {
            path: path.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Ensures the agent binary and its config are present and current on the
/// remote host (spec §4.6 "Deploy"). Returns the remote path to the agent.
pub async fn deploy(
    ssh: &dyn SshSession,
    shell: &dyn RemoteShell,
    local_agent_binary: &Path,
    remote_root: &str,
    agent_file_name: &str,
    devsync: &DevsyncSection,
    overwrite: bool,
) -> Result<String> {
    let remote_temp = format!("{remote_root}/{SYNC_TEMP_DIRNAME}");
    let remote_agent_path = format!("{remote_temp}/{agent_file_name}");

    tokio::time::timeout(DEPLOY_STEP_TIMEOUT, shell.mkdir_p(ssh, &remote_temp))
        .await
        .map_err(|_| Error::SshIo {
            op: "mkdir .sync_temp".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "deploy step timed out"),
        })??;

    // Best-effort: an old instance of this exact binary may still be
    // running. Failure here is never fatal (spec §4.6 step 2).
    let _ = shell.kill_by_name(ssh, agent_file_name).await;

    let local_sha = sha256_file(local_agent_binary)?;
    let remote_sha = shell.sha256_of(ssh, &remote_agent_path).await.unwrap_or_default();

    let needs_upload = remote_sha.is_empty() || remote_sha != local_sha || overwrite;
    if needs_upload {
        info!(path = %remote_agent_path, "uploading agent binary");
        // Deploy runs before the engine's cancellable transfer phase begins,
        // so it isn't wired to the caller's token.
        ssh.upload(local_agent_binary, &remote_agent_path, &CancellationToken::new())
            .await?;
    } else {
        debug!(path = %remote_agent_path, "agent binary already current, skipping upload");
    }
    shell.chmod_x(ssh, &remote_agent_path).await?;

    let wire_config = AgentWireConfig {
        devsync: devsync.clone(),
    };
    let json = serde_json::to_vec_pretty(&wire_config).expect("AgentWireConfig always serializes");
    let local_tmp = std::env::temp_dir().join(format!("make-sync-config-{agent_file_name}.json"));
    std::fs::write(&local_tmp, &json).map_err(|source| Error::PerFileIo {
        path: local_tmp.clone(),
        source,
    })?;
    ssh.upload(
        &local_tmp,
        &format!("{remote_temp}/config.json"),
        &CancellationToken::new(),
    )
    .await?;
    let _ = std::fs::remove_file(&local_tmp);

    Ok(remote_agent_path)
}

/// Runs the agent's `indexing` or `prune` subcommand on the remote host and
/// returns its stdout (spec §4.6 "Execute").
pub async fn execute(
    ssh: &dyn SshSession,
    windows: bool,
    working_dir: &str,
    remote_agent_path: &str,
    args: &[&str],
) -> Result<String> {
    let joined_args = args.join(" ");
    let command = if windows {
        format!(
            "cmd.exe /C cd /d \"{working_dir}\" && \"{remote_agent_path}\" {joined_args}"
        )
    } else {
        format!(
            "bash -lc 'cd {working_dir} && {remote_agent_path} {joined_args}'"
        )
    };

    match tokio::time::timeout(AGENT_EXEC_TIMEOUT, ssh.run(&command)).await {
        Ok(result) => result.map_err(|e| Error::AgentExec(e.to_string())),
        Err(_) => Err(Error::AgentExec(format!(
            "agent command timed out after {}s: {command}",
            AGENT_EXEC_TIMEOUT.as_secs()
        ))),
    }
}

/// Advisory lockfile guard (SPEC_FULL.md §C, grounded on `bunnysync`'s
/// destination lockfile): writes this workstation's id to
/// `.sync_temp/.lock` before the agent runs, warning if another id is
/// already there. Never refuses to proceed on its own — a stale lock from a
/// crashed or disconnected run is only ever cleared by the caller passing
/// `force_unlock`.
pub async fn acquire_lock(
    ssh: &dyn SshSession,
    shell: &dyn RemoteShell,
    remote_root: &str,
    workstation_id: &str,
    force_unlock: bool,
) -> Result<()> {
    let lock_path = format!("{remote_root}/{SYNC_TEMP_DIRNAME}/{LOCK_FILENAME}");

    if force_unlock {
        let _ = shell.rm_f(ssh, &lock_path).await;
    } else {
        let holder = shell.cat_or_empty(ssh, &lock_path).await.unwrap_or_default();
        let holder = holder.trim();
        if !holder.is_empty() && holder != workstation_id {
            warn!(
                %holder,
                "remote lock already held by another workstation; pass --force-unlock if that run is gone"
            );
        }
    }

    let local_tmp = std::env::temp_dir().join(format!("make-sync-lock-{workstation_id}"));
    std::fs::write(&local_tmp, workstation_id).map_err(|source| Error::PerFileIo {
        path: local_tmp.clone(),
        source,
    })?;
    ssh.upload(&local_tmp, &lock_path, &CancellationToken::new()).await?;
    let _ = std::fs::remove_file(&local_tmp);
    Ok(())
}

/// Removes the advisory lock on normal engine exit, regardless of whether
/// this run acquired it cleanly.
pub async fn release_lock(
    ssh: &dyn SshSession,
    shell: &dyn RemoteShell,
    remote_root: &str,
) -> Result<()> {
    let lock_path = format!("{remote_root}/{SYNC_TEMP_DIRNAME}/{LOCK_FILENAME}");
    shell.rm_f(ssh, &lock_path).await
}

/// Downloads `.sync_temp/indexing_files.db` to the local project's
/// `.sync_temp/` (spec §4.6 "Collect").
pub async fn collect(
    ssh: &dyn SshSession,
    remote_root: &str,
    local_root: &Path,
) -> Result<PathBuf> {
    let remote_db = format!("{remote_root}/{SYNC_TEMP_DIRNAME}/{}", crate::index::INDEX_DB_FILENAME);
    let local_temp = local_root.join(SYNC_TEMP_DIRNAME);
    std::fs::create_dir_all(&local_temp).map_err(|source| Error::PerFileIo {
        path: local_temp.clone(),
        source,
    })?;
    let local_db = local_temp.join(crate::index::INDEX_DB_FILENAME);
    ssh.download(&remote_db, &local_db, &CancellationToken::new())
        .await
        .map_err(|_| Error::IndexDownload(remote_db.clone()))?;
    Ok(local_db)
}
