//! The standalone remote indexing agent (spec §4.3): walks a project tree,
//! applies the Ignore Matcher, computes content hashes, and writes the
//! Index Store. Cross-compiled for the remote OS/architecture and deployed
//! by [`make_sync::lifecycle::deploy`].

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::Serialize;
use tracing::{debug, warn};
use tracing_subscriber::FmtSubscriber;

use make_sync::agent_proto::{AgentWireConfig, PruneReport};
use make_sync::ignore_matcher::{IgnoreMatcher, RemoteIgnoreMatcher};
use make_sync::index::{IndexEntry, IndexStore, INDEX_DB_FILENAME};

const CONFIG_PATH: &str = ".sync_temp/config.json";

#[derive(Debug, Parser)]
#[command(version, about = "Remote indexing agent for make-sync", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: AgentCommand,
}

#[derive(Debug, Subcommand)]
enum AgentCommand {
    /// Walk the tree, apply ignores, write indexing_files.db.
    Indexing {
        /// Skip ignore-matcher checks for in-scope paths.
        #[arg(long)]
        bypass_ignore: bool,
        /// Comma-separated list of relative prefixes to restrict the walk to.
        #[arg(long, value_delimiter = ',')]
        manual_transfer: Vec<String>,
    },
    /// Remove empty directories matching scope.
    Prune {
        #[arg(long)]
        bypass_ignore: bool,
        #[arg(long, value_delimiter = ',')]
        manual_transfer: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
}

fn load_config() -> Result<AgentWireConfig> {
    let contents = std::fs::read_to_string(CONFIG_PATH)
        .wrap_err_with(|| format!("missing agent config at {CONFIG_PATH}"))?;
    serde_json::from_str(&contents).wrap_err("malformed agent config.json")
}

fn working_dir(config: &AgentWireConfig) -> PathBuf {
    if config.devsync.working_dir.trim().is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(&config.devsync.working_dir)
    }
}

fn in_scope_prefixes(rel: &str, prefixes: &[String]) -> bool {
    if prefixes.is_empty() {
        return true;
    }
    prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        prefix.is_empty() || rel == prefix || rel.starts_with(&format!("{prefix}/"))
    })
}

fn is_explicit_endpoint(rel: &str, manual_transfer: &[String]) -> bool {
    manual_transfer.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/');
        !prefix.is_empty() && (rel == prefix || rel.starts_with(&format!("{prefix}/")))
    })
}

/// Whether `path` should be treated as ignored, mirroring the engine's own
/// `Engine::is_ignored` ordering: `.sync_temp` is excluded unconditionally
/// (even under `--bypass-ignore`), then bypass, then the explicit-endpoint
/// exception, then the ignore matcher itself.
fn path_is_ignored(
    rel: &str,
    path: &Path,
    is_dir: bool,
    bypass_ignore: bool,
    manual_transfer: &[String],
    matcher: &RemoteIgnoreMatcher,
) -> bool {
    if IgnoreMatcher::is_sync_temp(path) {
        return true;
    }
    if bypass_ignore {
        return false;
    }
    if is_explicit_endpoint(rel, manual_transfer) {
        return false;
    }
    matcher.is_ignored(path, is_dir)
}

/// DFS walk in deterministic (sorted) order, mirroring the engine's own
/// `walk_local` (spec §4.3 "Walk. Depth-first, deterministic ordering.").
fn walk_sorted(root: &Path) -> Vec<walkdir::DirEntry> {
    let mut entries: Vec<_> = walkdir::WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.path() != root)
        .collect();
    entries.sort_by(|a, b| a.path().cmp(b.path()));
    entries
}

fn run_indexing(bypass_ignore: bool, cli_manual_transfer: Vec<String>) -> Result<()> {
    let config = load_config()?;
    let root = working_dir(&config);
    std::env::set_current_dir(&root)
        .wrap_err_with(|| format!("failed to cd into working_dir {}", root.display()))?;
    let root = std::env::current_dir().wrap_err("failed to resolve working_dir")?;

    let ignore_matcher = RemoteIgnoreMatcher::from_patterns(&root, &config.devsync.ignores);
    let manual_transfer = &config.devsync.manual_transfer;
    // A manual-transfer prefix passed on the command line narrows this
    // particular walk; the config's own manual_transfer list still governs
    // the explicit-endpoint ignore exception (spec §3.6) regardless.
    let walk_prefixes: Vec<String> = if cli_manual_transfer.is_empty() {
        Vec::new()
    } else {
        cli_manual_transfer
    };

    let db_path = PathBuf::from(".sync_temp").join(INDEX_DB_FILENAME);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let store = IndexStore::create(&db_path).wrap_err("failed to open indexing_files.db")?;

    let mut examined = 0u64;
    let mut skipped = 0u64;
    for entry in walk_sorted(&root) {
        let path = entry.path();
        let is_dir = entry.file_type().is_dir();
        if !is_dir && !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel_path) = path.strip_prefix(&root) else {
            continue;
        };
        let rel = rel_path.to_string_lossy().replace('\\', "/");
        if rel.is_empty() {
            continue;
        }

        if !in_scope_prefixes(&rel, &walk_prefixes) {
            continue;
        }

        let ignored = path_is_ignored(&rel, path, is_dir, bypass_ignore, manual_transfer, &ignore_matcher);
        if ignored {
            skipped += 1;
            continue;
        }

        let metadata = match path.metadata() {
            Ok(m) => m,
            Err(source) => {
                warn!(rel = %rel, %source, "failed to stat entry, skipping");
                continue;
            }
        };
        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        let (size, hash) = if is_dir {
            (0i64, String::new())
        } else {
            let size = metadata.len() as i64;
            // Open question resolution (spec §9 / SPEC_FULL.md §D): files
            // above size_limit are indexed with an empty hash rather than
            // omitted.
            let hash = if (size as u64) <= config.devsync.size_limit {
                make_sync::hash::hash_file(path)
            } else {
                String::new()
            };
            (size, hash)
        };

        if let Err(source) = store.insert(&IndexEntry {
            path: path.to_path_buf(),
            rel: rel.clone(),
            size,
            mod_time,
            hash,
            is_dir,
            checked: false,
        }) {
            warn!(rel = %rel, %source, "failed to insert index entry, skipping");
            continue;
        }
        examined += 1;
    }

    println!("indexed {examined} entries, skipped {skipped} ignored");
    Ok(())
}

fn run_prune(bypass_ignore: bool, cli_manual_transfer: Vec<String>, dry_run: bool) -> Result<()> {
    let config = load_config()?;
    let root = working_dir(&config);
    std::env::set_current_dir(&root)
        .wrap_err_with(|| format!("failed to cd into working_dir {}", root.display()))?;
    let root = std::env::current_dir().wrap_err("failed to resolve working_dir")?;

    let ignore_matcher = RemoteIgnoreMatcher::from_patterns(&root, &config.devsync.ignores);
    let manual_transfer = &config.devsync.manual_transfer;
    let walk_prefixes = cli_manual_transfer;

    let mut removed = Vec::new();
    let mut failed = Vec::new();

    // Deepest-first so a directory that becomes empty after its child was
    // removed is itself considered on the same pass.
    let mut dirs: Vec<PathBuf> = walk_sorted(&root)
        .into_iter()
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    for dir in dirs {
        let Ok(rel_path) = dir.strip_prefix(&root) else {
            continue;
        };
        let rel = rel_path.to_string_lossy().replace('\\', "/");
        if rel.is_empty() {
            continue;
        }
        if !in_scope_prefixes(&rel, &walk_prefixes) {
            continue;
        }
        let ignored = path_is_ignored(&rel, &dir, true, bypass_ignore, manual_transfer, &ignore_matcher);
        if ignored {
            continue;
        }

        let is_empty = match std::fs::read_dir(&dir) {
            Ok(mut it) => it.next().is_none(),
            Err(_) => false,
        };
        if !is_empty {
            continue;
        }

        if dry_run {
            removed.push(rel);
            continue;
        }
        match std::fs::remove_dir(&dir) {
            Ok(()) => removed.push(rel),
            Err(source) => {
                debug!(rel = %rel, %source, "failed to remove empty directory");
                failed.push(rel);
            }
        }
    }

    let report = PruneReport {
        removed: removed.clone(),
        failed: failed.clone(),
        dry_run,
    };
    print_json_line(&report)?;
    println!(
        "prune: removed {} director{}, {} failure{}",
        removed.len(),
        if removed.len() == 1 { "y" } else { "ies" },
        failed.len(),
        if failed.len() == 1 { "" } else { "s" },
    );
    Ok(())
}

fn print_json_line<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).wrap_err("failed to serialize prune report")?;
    println!("{line}");
    Ok(())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| eyre!("failed to install tracing subscriber: {e}"))?;

    let cli = Cli::parse();
    match cli.command {
        AgentCommand::Indexing {
            bypass_ignore,
            manual_transfer,
        } => run_indexing(bypass_ignore, manual_transfer),
        AgentCommand::Prune {
            bypass_ignore,
            manual_transfer,
            dry_run,
        } => run_prune(bypass_ignore, manual_transfer, dry_run),
    }
}
