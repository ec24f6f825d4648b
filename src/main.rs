//! `make-sync` CLI binary (SPEC_FULL.md §A/§B.3): resolves configuration,
//! drives the Agent Lifecycle (build, deploy, execute, collect), and hands
//! the result to the Differential Sync Engine for one `push` or `pull`
//! reconciliation. Loading config, the menu/TUI, saved-collection
//! backup/restore, template interpolation, and the recent-workspace history
//! store are out of scope (spec §1) and are not implemented here beyond the
//! thin TOML config this binary itself needs.

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, WrapErr};
use color_eyre::Result;
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::{debug, info};
use tracing_subscriber::FmtSubscriber;

use make_sync::agent_proto::{DevsyncSection, WorkstationConfig};
use make_sync::config::SyncConfig;
use make_sync::engine::{CancellationToken, Engine};
use make_sync::ignore_matcher::{expand_bare_pattern, IgnoreMatcher};
use make_sync::index::IndexStore;
use make_sync::lifecycle;
use make_sync::mode::{Deletion, Direction, IgnorePolicy, OperationMode};
use make_sync::remote_shell;
use make_sync::scope::{Scope, ScopeSelector};
use make_sync::ssh::{ProcessSshSession, SshTarget};

const THIS_CRATE_NAME: &str = env!("CARGO_PKG_NAME");
const DEFAULT_LOG_LEVEL: &str = "INFO";
const DEFAULT_SIZE_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Verb,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR).
    #[clap(long, short)]
    log_level: Option<tracing::Level>,

    /// Compute the full reconciliation plan without transferring or
    /// deleting anything.
    #[clap(long)]
    dry_run: bool,

    /// Clear a stale advisory lock left by a crashed or disconnected run
    /// before proceeding.
    #[clap(long)]
    force_unlock: bool,
}

#[derive(Debug, Subcommand)]
enum Verb {
    /// Send local files to the remote host.
    Push(OperationArgs),
    /// Receive remote files into the local tree.
    Pull(OperationArgs),
}

#[derive(Debug, Args)]
struct OperationArgs {
    /// Delete files on the receiving side that are absent on the sending
    /// side, scoped to the selected prefixes.
    #[arg(long)]
    force: bool,

    /// Skip the Ignore Matcher for in-scope paths (`.sync_temp` is always
    /// excluded regardless).
    #[arg(long)]
    bypass_ignore: bool,

    /// Restrict the operation to these relative prefixes (comma-separated
    /// or repeated). Mutually exclusive with `--include`.
    #[arg(long, value_delimiter = ',')]
    scope: Vec<String>,

    /// Restrict the operation to paths matching these `!`-style include
    /// patterns. Mutually exclusive with `--scope`.
    #[arg(long, value_delimiter = ',', conflicts_with = "scope")]
    include: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct GeneralSettings {
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct RemoteSettings {
    host: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    user: String,
    key_path: Option<PathBuf>,
    /// Absolute path to the project root on the remote host.
    root: String,
    /// "windows" iff it contains "win" (case-insensitive), else POSIX (spec §6.1).
    os_target: String,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Deserialize, Clone, Default)]
struct SyncSettings {
    /// Local project root; defaults to the current directory.
    local_root: Option<PathBuf>,
    #[serde(default)]
    ignores: Vec<String>,
    #[serde(default)]
    manual_transfer: Vec<String>,
    #[serde(default = "default_size_limit")]
    size_limit: u64,
}

fn default_size_limit() -> u64 {
    DEFAULT_SIZE_LIMIT
}

#[derive(Debug, Deserialize)]
struct Config {
    general: Option<GeneralSettings>,
    remote: RemoteSettings,
    #[serde(default)]
    sync: SyncSettings,
}

fn load_workstation_config(local_root: &std::path::Path) -> Result<WorkstationConfig> {
    let path = local_root.join(".sync_temp").join("config.json");
    if let Ok(contents) = std::fs::read_to_string(&path) {
        if let Ok(parsed) = serde_json::from_str(&contents) {
            return Ok(parsed);
        }
    }
    let config = WorkstationConfig {
        agent_name: lifecycle::generate_workstation_id(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(&path, serde_json::to_vec_pretty(&config)?)
        .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let Some(proj_dirs) = ProjectDirs::from("", "", THIS_CRATE_NAME) else {
        bail!("unable to resolve XDG config directory");
    };
    let config_file = proj_dirs.config_dir().join("config.toml");
    let contents = std::fs::read_to_string(&config_file)
        .wrap_err_with(|| format!("failed to read config at {}", config_file.display()))?;
    let config: Config = toml::from_str(&contents).wrap_err("malformed config.toml")?;

    let cli = Cli::parse();
    let log_level = cli.log_level.unwrap_or_else(|| {
        let raw = config
            .general
            .as_ref()
            .and_then(|g| g.log_level.clone())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
        tracing::Level::from_str(&raw).unwrap_or(tracing::Level::INFO)
    });
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default tracing subscriber failed");

    debug!("config: {:?}", &config);

    let local_root = match &config.sync.local_root {
        Some(path) => path.clone(),
        None => std::env::current_dir().wrap_err("failed to resolve current directory")?,
    };
    let local_root = local_root
        .canonicalize()
        .wrap_err_with(|| format!("failed to canonicalize {}", local_root.display()))?;

    // Narrow the superset TOML config down to the shape the library
    // actually consumes.
    let sync_config = SyncConfig {
        local_root: local_root.clone(),
        remote_root: config.remote.root.clone(),
        os_target: config.remote.os_target.clone(),
        ignores: config.sync.ignores.clone(),
        manual_transfer: config.sync.manual_transfer.clone(),
        ssh: SshTarget {
            host: config.remote.host.clone(),
            port: config.remote.port,
            username: config.remote.user.clone(),
            key_path: config.remote.key_path.clone(),
        },
    };

    let (operation_args, direction) = match &cli.command {
        Verb::Push(args) => (args, Direction::Push),
        Verb::Pull(args) => (args, Direction::Pull),
    };
    let deletion = if operation_args.force { Deletion::Force } else { Deletion::Soft };
    let ignore_policy = if operation_args.bypass_ignore {
        IgnorePolicy::Bypass
    } else {
        IgnorePolicy::Respect
    };
    let mode = OperationMode::new(direction, deletion, ignore_policy);
    info!(
        "resolved operation mode: {:?}/{:?}/{:?} -> {:?}",
        mode.direction,
        mode.deletion,
        mode.ignore_policy,
        mode.strategy()
    );

    let scope = if !operation_args.include.is_empty() {
        use make_sync::ignore_matcher::IncludeMatcher;
        Scope::Include(IncludeMatcher::from_patterns(
            &local_root,
            &operation_args.include,
        ))
    } else if !operation_args.scope.is_empty() {
        Scope::Selector(ScopeSelector::prefixes(operation_args.scope.clone()))
    } else {
        Scope::Selector(ScopeSelector::Full)
    };

    let windows = sync_config.is_windows_target();
    let workstation = load_workstation_config(&local_root)?;
    let agent_file_name = lifecycle::agent_binary_name(&workstation.agent_name, windows);

    let ssh = ProcessSshSession::connect(sync_config.ssh.clone())?;
    let shell = remote_shell::for_target(&sync_config.os_target);

    let arch = lifecycle::detect_remote_arch(&ssh, windows).await?;
    let rust_target = lifecycle::rust_target_triple(windows, arch.as_ref());
    let project_root = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));

    let local_agent_binary = match lifecycle::build_agent(&rust_target, &project_root).await {
        Ok(path) => path,
        Err(err) => {
            info!(%err, "cross-compile failed, looking for a fallback binary");
            lifecycle::find_fallback_binary(&project_root, &sync_config.os_target)
                .ok_or(err)
                .wrap_err("no pre-compiled fallback agent binary found")?
        }
    };

    let expanded_ignores: Vec<String> = sync_config
        .ignores
        .iter()
        .flat_map(|p| expand_bare_pattern(p))
        .collect();

    let devsync = DevsyncSection {
        size_limit: config.sync.size_limit,
        ignores: expanded_ignores,
        agent_watchs: Vec::new(),
        manual_transfer: sync_config.manual_transfer.clone(),
        working_dir: sync_config.remote_root.clone(),
    };

    let remote_agent_path = lifecycle::deploy(
        &ssh,
        shell.as_ref(),
        &local_agent_binary,
        &sync_config.remote_root,
        &agent_file_name,
        &devsync,
        false,
    )
    .await?;

    lifecycle::acquire_lock(
        &ssh,
        shell.as_ref(),
        &sync_config.remote_root,
        &workstation.agent_name,
        cli.force_unlock,
    )
    .await?;

    let mut index_args = vec!["indexing".to_string()];
    if ignore_policy == IgnorePolicy::Bypass {
        index_args.push("--bypass-ignore".to_string());
    }
    if let Scope::Selector(ScopeSelector::Prefixes(prefixes)) = &scope {
        index_args.push("--manual-transfer".to_string());
        index_args.push(prefixes.join(","));
    }
    let index_args_ref: Vec<&str> = index_args.iter().map(String::as_str).collect();
    lifecycle::execute(
        &ssh,
        windows,
        &sync_config.remote_root,
        &remote_agent_path,
        &index_args_ref,
    )
    .await?;

    let local_db = lifecycle::collect(&ssh, &sync_config.remote_root, &local_root).await?;
    let remote_index = IndexStore::open(&local_db, false)?;

    let engine = Engine {
        local_root: local_root.clone(),
        remote_root: sync_config.remote_root.clone(),
        manual_transfer: sync_config.manual_transfer.clone(),
        scope,
        mode,
        ssh: std::sync::Arc::new(ssh),
        shell: shell.into(),
        remote_index,
        local_index_store_path: Some(local_db),
        ignore_matcher: IgnoreMatcher::new(local_root.clone()),
        dry_run: cli.dry_run,
    };

    let cancel = CancellationToken::new();
    let (summary, cancelled) = match engine.reconcile(&cancel).await {
        Ok(summary) => (summary, false),
        Err(make_sync::Error::RunCancelled { summary }) => {
            tracing::warn!("sync run cancelled; reporting partial results");
            (*summary, true)
        }
        Err(err) => return Err(err.into()),
    };

    if !cancelled && direction == Direction::Push && deletion == Deletion::Force && !cli.dry_run {
        let mut prune_args = vec!["prune".to_string()];
        if ignore_policy == IgnorePolicy::Bypass {
            prune_args.push("--bypass-ignore".to_string());
        }
        let prune_args_ref: Vec<&str> = prune_args.iter().map(String::as_str).collect();
        match lifecycle::execute(
            engine.ssh.as_ref(),
            windows,
            &sync_config.remote_root,
            &remote_agent_path,
            &prune_args_ref,
        )
        .await
        {
            Ok(stdout) => {
                let report = make_sync::agent_proto::PruneReport::parse_first_line(&stdout);
                info!(
                    removed = report.removed.len(),
                    failed = report.failed.len(),
                    "remote prune complete"
                );
            }
            Err(err) => {
                tracing::warn!(%err, "remote prune step failed; empty directories may remain");
            }
        }
    }

    if let Err(err) = lifecycle::release_lock(engine.ssh.as_ref(), engine.shell.as_ref(), &sync_config.remote_root).await {
        tracing::warn!(%err, "failed to release remote lock");
    }

    println!("{summary}");
    for message in &summary.error_messages {
        tracing::warn!("{message}");
    }
    if cancelled || summary.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
