//! Differential Sync Engine (spec §4.5): the operational heart of
//! `make-sync`. Given a local root, a [`ScopeSelector`]/[`IncludeMatcher`], an
//! [`OperationMode`], an SSH capability, and a freshly downloaded remote
//! [`IndexStore`], decides for every in-scope path whether to transfer, skip,
//! or delete, and executes those decisions with bounded concurrency.

pub mod summary;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub use crate::cancel::CancellationToken;
use crate::error::{Error, Result};
use crate::hash::hash_file;
use crate::ignore_matcher::IgnoreMatcher;
use crate::index::{IndexEntry, IndexStore};
use crate::mode::{Deletion, Direction, IgnorePolicy, OperationMode, Strategy};
use crate::remote_shell::RemoteShell;
use crate::scope::Scope;
use crate::ssh::SshSession;

use summary::{OperationSummary, SummaryCounters};

/// A deliberate ceiling on concurrent file transfers per operation (spec
/// §5). Sourced from a single named location, as the spec requires.
pub const MAX_CONCURRENT_TRANSFERS: usize = 5;

/// Holds the 1..=5 slot ids used purely for log interleaving (spec §4.5.6);
/// dropping the guard returns the slot to the pool.
struct SlotPool {
    free: Mutex<Vec<u8>>,
}

impl SlotPool {
    fn new(n: u8) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((1..=n).rev().collect()),
        })
    }

    fn acquire(self: &Arc<Self>) -> SlotGuard {
        let slot = self.free.lock().pop().unwrap_or(0);
        SlotGuard {
            pool: self.clone(),
            slot,
        }
    }
}

struct SlotGuard {
    pool: Arc<SlotPool>,
    slot: u8,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.slot);
    }
}

enum TransferDirection {
    Upload,
    Download,
}

struct TransferTask {
    rel: String,
    local_path: PathBuf,
    remote_path: String,
    direction: TransferDirection,
}

/// Everything the engine needs for one `Reconcile` call (spec §6.6).
pub struct Engine {
    pub local_root: PathBuf,
    pub remote_root: String,
    pub manual_transfer: Vec<String>,
    pub scope: Scope,
    pub mode: OperationMode,
    pub ssh: Arc<dyn SshSession>,
    pub shell: Arc<dyn RemoteShell>,
    pub remote_index: IndexStore,
    pub local_index_store_path: Option<PathBuf>,
    pub ignore_matcher: IgnoreMatcher,
    /// When true, compute the full reconciliation plan (transfers,
    /// deletions) without touching the network or local disk (SPEC_FULL.md
    /// §C, generalizing the teacher's own `--dry-run` flag to the engine).
    pub dry_run: bool,
}

impl Engine {
    fn local_path_for(&self, rel: &str) -> PathBuf {
        self.local_root.join(rel)
    }

    fn remote_path_for(&self, rel: &str) -> String {
        format!("{}/{}", self.remote_root.trim_end_matches('/'), rel)
    }

    fn is_explicit_endpoint(&self, rel: &str) -> bool {
        self.manual_transfer.iter().any(|prefix| {
            let prefix = prefix.trim_end_matches('/');
            !prefix.is_empty() && (rel == prefix || rel.starts_with(&format!("{prefix}/")))
        })
    }

    /// Whether `rel`/`path` should be treated as ignored under the current
    /// mode (spec §3.6 explicit-endpoint exception, §4.5.1 Bypass skipping
    /// ignore checks entirely). `.sync_temp` is excluded unconditionally,
    /// even under Bypass (spec §3.4) — it holds the engine's own in-flight
    /// state and must never be treated as a regular in-scope path.
    fn is_ignored(&self, rel: &str, path: &Path, is_dir: bool) -> bool {
        if IgnoreMatcher::is_sync_temp(path) {
            return true;
        }
        if self.mode.ignore_policy == IgnorePolicy::Bypass {
            return false;
        }
        if !self.scope.is_include() && self.is_explicit_endpoint(rel) {
            return false;
        }
        self.ignore_matcher.is_ignored(path, is_dir)
    }

    fn in_scope(&self, rel: &str, path: &Path, is_dir: bool) -> bool {
        self.scope.contains_rel(rel, path, is_dir)
    }

    /// Dispatches to the strategy named by `self.mode.strategy()` (spec
    /// §4.5.1) and returns the operation's summary. For push-force, the
    /// caller is responsible for following up with the agent's `prune`
    /// subcommand (spec §4.5.5) via [`crate::lifecycle::execute`] — the
    /// Engine only performs the remote file deletions, since invoking the
    /// deployed agent needs context (working dir, remote agent path) the
    /// Engine does not own.
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<OperationSummary> {
        match self.mode.direction {
            Direction::Pull => self.run_pull(cancel).await,
            Direction::Push => self.run_push(cancel).await,
        }
    }

    // ---- Pull: §4.5.2 RemoteDrivenHashCompare / PrefixScopedDownload,
    // plus §4.5.4 LocalPruneNotInRemote when Deletion::Force.
    async fn run_pull(&self, cancel: &CancellationToken) -> Result<OperationSummary> {
        let counters = Arc::new(SummaryCounters::new());
        let mut tasks = Vec::new();
        let mut remote_rels: HashSet<String> = HashSet::new();

        for entry in self.remote_index.all_entries()? {
            if entry.is_dir {
                continue;
            }
            if IgnoreMatcher::is_sync_temp(Path::new(&entry.rel)) {
                continue;
            }
            remote_rels.insert(entry.rel.clone());

            let local_path = self.local_path_for(&entry.rel);
            if self.is_ignored(&entry.rel, &local_path, false) {
                counters.skip_ignored();
                continue;
            }
            if !self.in_scope(&entry.rel, &local_path, false) {
                continue;
            }

            if self.needs_download(&entry, &local_path) {
                tasks.push(TransferTask {
                    rel: entry.rel.clone(),
                    local_path,
                    remote_path: self.remote_path_for(&entry.rel),
                    direction: TransferDirection::Download,
                });
            } else {
                counters.skip_up_to_date();
            }
        }

        self.execute_transfers(tasks, counters.clone(), cancel).await?;

        if self.mode.deletion == Deletion::Force && !cancel.is_cancelled() {
            self.local_prune_not_in_remote(&remote_rels, &counters)?;
        }

        if cancel.is_cancelled() {
            return Err(Error::RunCancelled {
                summary: Box::new(counters.snapshot()),
            });
        }
        Ok(counters.snapshot())
    }

    fn needs_download(&self, remote_entry: &IndexEntry, local_path: &Path) -> bool {
        if !local_path.exists() {
            return true;
        }
        if remote_entry.hash.is_empty() {
            return true;
        }
        let local_hash = hash_file(local_path);
        local_hash.is_empty() || local_hash != remote_entry.hash
    }

    /// §4.5.4: after the download phase, delete local files not present
    /// remotely, within scope and (under Respect) not ignored.
    fn local_prune_not_in_remote(
        &self,
        remote_rels: &HashSet<String>,
        counters: &SummaryCounters,
    ) -> Result<()> {
        for entry in self.walk_local() {
            if entry.is_dir || remote_rels.contains(&entry.rel) {
                continue;
            }
            if self.is_ignored(&entry.rel, &entry.path, false) {
                continue;
            }
            if !self.in_scope(&entry.rel, &entry.path, false) {
                continue;
            }
            if self.dry_run {
                info!(rel = %entry.rel, "[dry-run] would prune local file absent from remote");
                counters.delete();
                continue;
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    info!(rel = %entry.rel, "pruned local file absent from remote");
                    counters.delete();
                }
                Err(source) => {
                    warn!(rel = %entry.rel, %source, "failed to prune local file");
                    counters.error(format!("prune {}: {source}", entry.rel));
                }
            }
        }
        Ok(())
    }

    // ---- Push: §4.5.3 LocalDrivenHashCompare / PrefixScopedUpload, plus
    // §4.5.5 RemotePruneNotChecked when Deletion::Force.
    async fn run_push(&self, cancel: &CancellationToken) -> Result<OperationSummary> {
        let counters = Arc::new(SummaryCounters::new());
        let mut tasks = Vec::new();
        let force = self.mode.deletion == Deletion::Force;

        let checked_store = if force {
            match &self.local_index_store_path {
                Some(path) => Some(IndexStore::open(path, true)?),
                None => None,
            }
        } else {
            None
        };

        for entry in self.walk_local() {
            if entry.is_dir {
                continue;
            }
            if !self.in_scope(&entry.rel, &entry.path, false) {
                continue;
            }

            let ignored = self.is_ignored(&entry.rel, &entry.path, false);
            if ignored {
                counters.skip_ignored();
                // Open question resolution (§9 / SPEC_FULL.md §D): an
                // ignored file is still marked checked during push-force so
                // it is never deleted by RemotePruneNotChecked.
                if let Some(store) = &checked_store {
                    store.set_checked(&entry.rel)?;
                }
                continue;
            }

            let local_hash = hash_file(&entry.path);
            let remote_entry = self.remote_index.get_by_rel(&entry.rel)?;
            let needs_upload = match &remote_entry {
                None => true,
                Some(r) => r.hash.is_empty() || r.hash != local_hash,
            };

            if needs_upload {
                tasks.push(TransferTask {
                    rel: entry.rel.clone(),
                    local_path: entry.path.clone(),
                    remote_path: self.remote_path_for(&entry.rel),
                    direction: TransferDirection::Upload,
                });
            } else {
                counters.skip_up_to_date();
            }

            if let Some(store) = &checked_store {
                store.set_checked(&entry.rel)?;
            }
        }

        self.execute_transfers(tasks, counters.clone(), cancel).await?;

        if force && !cancel.is_cancelled() {
            self.remote_prune_not_checked(&counters).await?;
        }

        if cancel.is_cancelled() {
            return Err(Error::RunCancelled {
                summary: Box::new(counters.snapshot()),
            });
        }
        Ok(counters.snapshot())
    }

    /// §4.5.5: iterate the remote index; delete anything in scope, not
    /// ignored, whose `checked` bit is false. The agent's `prune` subcommand
    /// (cleaning up now-empty directories) is invoked by the caller after
    /// this returns, not here — see [`Engine::reconcile`]'s doc comment.
    /// Serialized, not parallelized (spec §4.5.6).
    async fn remote_prune_not_checked(&self, counters: &SummaryCounters) -> Result<()> {
        for entry in self.remote_index.all_entries()? {
            if entry.is_dir {
                continue;
            }
            if IgnoreMatcher::is_sync_temp(Path::new(&entry.rel)) {
                continue;
            }
            let local_path = self.local_path_for(&entry.rel);
            if self.is_ignored(&entry.rel, &local_path, false) {
                continue;
            }
            if !self.in_scope(&entry.rel, &local_path, false) {
                continue;
            }
            if entry.checked {
                continue;
            }

            let remote_path = self.remote_path_for(&entry.rel);
            if self.dry_run {
                info!(rel = %entry.rel, "[dry-run] would delete remote file not checked during push-force");
                counters.delete();
                continue;
            }
            match self.shell.rm_f(self.ssh.as_ref(), &remote_path).await {
                Ok(()) => {
                    info!(rel = %entry.rel, "deleted remote file not checked during push-force");
                    counters.delete();
                }
                Err(source) => {
                    warn!(rel = %entry.rel, %source, "failed to delete remote file");
                    counters.error(format!("remote delete {}: {source}", entry.rel));
                }
            }
        }
        Ok(())
    }

    /// DFS walk of the local tree, yielding entries in deterministic order.
    fn walk_local(&self) -> Vec<LocalEntry> {
        let mut entries = Vec::new();
        for dir_entry in WalkDir::new(&self.local_root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = dir_entry.path();
            if path == self.local_root {
                continue;
            }
            let is_dir = dir_entry.file_type().is_dir();
            if !is_dir && !dir_entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&self.local_root) else {
                continue;
            };
            let rel = rel.to_string_lossy().replace('\\', "/");
            entries.push(LocalEntry {
                path: path.to_path_buf(),
                rel,
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.rel.cmp(&b.rel));
        entries
    }

    /// Runs every queued transfer with bounded concurrency (spec §4.5.6).
    async fn execute_transfers(
        &self,
        mut tasks: Vec<TransferTask>,
        counters: Arc<SummaryCounters>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tasks.sort_by(|a, b| a.rel.cmp(&b.rel));

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_TRANSFERS));
        let slots = SlotPool::new(MAX_CONCURRENT_TRANSFERS as u8);
        let mut joins = JoinSet::new();

        for task in tasks {
            if cancel.is_cancelled() {
                break;
            }
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
            let slots = slots.clone();
            let ssh = self.ssh.clone();
            let counters = counters.clone();
            let dry_run = self.dry_run;
            let cancel = cancel.clone();

            joins.spawn(async move {
                let _permit = permit;
                let guard = slots.acquire();
                debug!(slot = guard.slot, rel = %task.rel, "starting transfer");

                if dry_run {
                    info!(slot = guard.slot, rel = %task.rel, "[dry-run] would transfer");
                    counters.transfer();
                    return;
                }

                let result = match task.direction {
                    TransferDirection::Upload => {
                        ssh.upload(&task.local_path, &task.remote_path, &cancel).await
                    }
                    TransferDirection::Download => {
                        if let Some(parent) = task.local_path.parent() {
                            let _ = tokio::fs::create_dir_all(parent).await;
                        }
                        ssh.download(&task.remote_path, &task.local_path, &cancel).await
                    }
                };

                match result {
                    Ok(()) => counters.transfer(),
                    Err(err) => counters.error(format!("{}: {err}", task.rel)),
                }
            });
        }

        while let Some(joined) = joins.join_next().await {
            if let Err(join_err) = joined {
                counters.error(format!("transfer task panicked: {join_err}"));
            }
        }

        Ok(())
    }
}

struct LocalEntry {
    path: PathBuf,
    rel: String,
    is_dir: bool,
}

/// Matches a dispatched [`Strategy`] back to the two coarse control-flow
/// paths implemented above, for tests and logging.
pub fn strategy_direction(strategy: Strategy) -> Direction {
    match strategy {
        Strategy::RemoteDrivenHashCompare
        | Strategy::PrefixScopedDownload
        | Strategy::RemoteDrivenHashCompareWithPrune
        | Strategy::PrefixScopedDownloadWithPrune => Direction::Pull,
        Strategy::LocalDrivenHashCompare
        | Strategy::PrefixScopedUpload
        | Strategy::LocalDrivenHashCompareWithRemotePrune => Direction::Push,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore_matcher::IgnoreMatcher;
    use crate::index::IndexStore;
    use crate::mode::{Deletion, IgnorePolicy};
    use crate::scope::ScopeSelector;
    use crate::testing::FakeSshSession;
    use std::fs;

    fn make_engine(
        local_root: PathBuf,
        remote_root: PathBuf,
        remote_index: IndexStore,
        mode: OperationMode,
        scope: Scope,
    ) -> Engine {
        Engine {
            ignore_matcher: IgnoreMatcher::new(local_root.clone()),
            local_root,
            remote_root: remote_root.to_string_lossy().to_string(),
            manual_transfer: vec![],
            scope,
            mode,
            ssh: Arc::new(FakeSshSession::new()),
            shell: Arc::new(crate::remote_shell::PosixShell),
            remote_index,
            local_index_store_path: None,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn push_soft_uploads_a_new_file() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        fs::write(local.path().join("a.txt"), "x").unwrap();

        let remote_index = IndexStore::create(&remote.path().join("indexing_files.db")).unwrap();
        let mode = OperationMode::new(Direction::Push, Deletion::Soft, IgnorePolicy::Respect);
        let engine = make_engine(
            local.path().to_path_buf(),
            remote.path().to_path_buf(),
            remote_index,
            mode,
            Scope::Selector(ScopeSelector::Full),
        );

        let cancel = CancellationToken::new();
        let summary = engine.reconcile(&cancel).await.unwrap();
        assert_eq!(summary.transferred, 1);
        assert!(remote.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn pull_soft_skips_up_to_date_file() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        fs::write(local.path().join("a.txt"), "x").unwrap();
        fs::write(remote.path().join("a.txt"), "x").unwrap();

        let remote_index = IndexStore::create(&remote.path().join("indexing_files.db")).unwrap();
        remote_index
            .insert(&IndexEntry {
                path: remote.path().join("a.txt"),
                rel: "a.txt".to_string(),
                size: 1,
                mod_time: 0,
                hash: crate::hash::hash_file(&remote.path().join("a.txt")),
                is_dir: false,
                checked: false,
            })
            .unwrap();

        let mode = OperationMode::new(Direction::Pull, Deletion::Soft, IgnorePolicy::Respect);
        let engine = make_engine(
            local.path().to_path_buf(),
            remote.path().to_path_buf(),
            remote_index,
            mode,
            Scope::Selector(ScopeSelector::Full),
        );

        let cancel = CancellationToken::new();
        let summary = engine.reconcile(&cancel).await.unwrap();
        assert_eq!(summary.transferred, 0);
        assert_eq!(summary.skipped_up_to_date, 1);
    }

    #[test]
    fn slot_pool_recycles_slots() {
        let pool = SlotPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.slot, b.slot);
        drop(a);
        let c = pool.acquire();
        assert!(c.slot == 1 || c.slot == 2);
    }

    #[test]
    fn bypass_ignore_still_excludes_sync_temp() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        let remote_index = IndexStore::create(&remote.path().join("indexing_files.db")).unwrap();
        let mode = OperationMode::new(Direction::Push, Deletion::Soft, IgnorePolicy::Bypass);
        let engine = make_engine(
            local.path().to_path_buf(),
            remote.path().to_path_buf(),
            remote_index,
            mode,
            Scope::Selector(ScopeSelector::Full),
        );

        let sync_temp_file = local.path().join(".sync_temp").join("indexing_files.db");
        assert!(engine.is_ignored(".sync_temp/indexing_files.db", &sync_temp_file, false));

        let regular_file = local.path().join("debug.log");
        assert!(!engine.is_ignored("debug.log", &regular_file, false));
    }

    #[tokio::test]
    async fn push_bypass_still_skips_sync_temp_end_to_end() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        fs::create_dir_all(local.path().join(".sync_temp")).unwrap();
        fs::write(local.path().join(".sync_temp").join("indexing_files.db"), "local state").unwrap();
        fs::write(local.path().join("keep.txt"), "x").unwrap();

        let remote_index = IndexStore::create(&remote.path().join("indexing_files.db")).unwrap();
        let mode = OperationMode::new(Direction::Push, Deletion::Soft, IgnorePolicy::Bypass);
        let engine = make_engine(
            local.path().to_path_buf(),
            remote.path().to_path_buf(),
            remote_index,
            mode,
            Scope::Selector(ScopeSelector::Full),
        );

        let cancel = CancellationToken::new();
        let summary = engine.reconcile(&cancel).await.unwrap();
        assert_eq!(summary.transferred, 1);
        assert!(remote.path().join("keep.txt").exists());
        assert!(!remote.path().join(".sync_temp").exists());
    }

    #[tokio::test]
    async fn cancellation_returns_partial_results_instead_of_discarding_them() {
        let local = tempfile::tempdir().unwrap();
        let remote = tempfile::tempdir().unwrap();
        fs::write(local.path().join("a.txt"), "x").unwrap();

        let remote_index = IndexStore::create(&remote.path().join("indexing_files.db")).unwrap();
        let mode = OperationMode::new(Direction::Push, Deletion::Soft, IgnorePolicy::Respect);
        let engine = make_engine(
            local.path().to_path_buf(),
            remote.path().to_path_buf(),
            remote_index,
            mode,
            Scope::Selector(ScopeSelector::Full),
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        match engine.reconcile(&cancel).await {
            Err(Error::RunCancelled { summary }) => {
                assert_eq!(summary.transferred, 0);
            }
            other => panic!("expected Err(Error::RunCancelled {{ .. }}), got {other:?}"),
        }
    }
}
