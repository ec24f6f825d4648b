//! Wire types shared between the local side and the remote indexing agent
//! (spec §4.3 config contract, §6.5 stdout protocol).

use serde::{Deserialize, Serialize};

/// `<remoteRoot>/.sync_temp/config.json`, read by the agent at start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentWireConfig {
    pub devsync: DevsyncSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevsyncSection {
    /// Max file size to hash; larger files are indexed with an empty hash
    /// (open question in §9, resolved in favour of "indexed with empty
    /// hash" rather than omitted).
    pub size_limit: u64,
    /// Precomputed ignore list from the local side, already bare-pattern
    /// expanded (see [`crate::ignore_matcher::expand_bare_pattern`]).
    pub ignores: Vec<String>,
    #[serde(default)]
    pub agent_watchs: Vec<String>,
    #[serde(default)]
    pub manual_transfer: Vec<String>,
    pub working_dir: String,
}

/// `<localRoot>/.sync_temp/config.json`, the workstation-local config that
/// names the deployed agent binary (spec §3.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkstationConfig {
    pub agent_name: String,
}

/// The single JSON line the `prune` subcommand writes as its first line of
/// stdout (spec §6.5). If that line fails to parse, the engine falls back to
/// `removed=0, failed=0` (§9 open question).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub dry_run: bool,
}

impl PruneReport {
    /// Parses the first line of the agent's `prune` stdout, falling back to
    /// an empty report on any malformed or missing first line rather than
    /// treating it as an engine-level failure.
    pub fn parse_first_line(stdout: &str) -> PruneReport {
        match stdout.lines().next() {
            Some(line) => serde_json::from_str(line).unwrap_or_default(),
            None => PruneReport::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_first_line() {
        let stdout = "{\"removed\":[\"a/b\"],\"failed\":[],\"dry_run\":false}\nsome human line\n";
        let report = PruneReport::parse_first_line(stdout);
        assert_eq!(report.removed, vec!["a/b".to_string()]);
        assert!(!report.dry_run);
    }

    #[test]
    fn falls_back_to_empty_report_on_malformed_first_line() {
        let stdout = "pruned 3 dirs\n{\"removed\":[]}\n";
        let report = PruneReport::parse_first_line(stdout);
        assert!(report.removed.is_empty());
        assert!(report.failed.is_empty());
    }

    #[test]
    fn falls_back_to_empty_report_on_empty_stdout() {
        let report = PruneReport::parse_first_line("");
        assert!(report.removed.is_empty());
    }
}
