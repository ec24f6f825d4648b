use std::path::PathBuf;

use thiserror::Error;

/// Error kinds the core distinguishes (spec §7).
///
/// `is_fatal` decides whether an error aborts the whole operation or is
/// accumulated into the [`crate::engine::summary::OperationSummary`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("required config field missing: {0}")]
    ConfigMissing(String),

    #[error("failed to open SSH connection to {host}: {source}")]
    SshConnect {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH transport failure during {op}: {source}")]
    SshIo {
        op: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to cross-compile agent for target {target}: {source}")]
    AgentBuild {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("remote agent execution failed: {0}")]
    AgentExec(String),

    #[error("failed to download remote index: {0}")]
    IndexDownload(String),

    #[error("index database at {path} could not be opened or is missing the `files` table: {source}")]
    IndexSchema {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O failure on {path}: {source}")]
    PerFileIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer failure for {rel}: {reason}")]
    PerFileTransfer { rel: String, reason: String },

    #[error("failed to prune directory {path}: {reason}")]
    PruneFailure { path: PathBuf, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("sync run cancelled after partial progress: {summary}")]
    RunCancelled {
        summary: Box<crate::engine::summary::OperationSummary>,
    },
}

impl Error {
    /// Fatal kinds bubble up unchanged and abort the operation; non-fatal
    /// kinds are accumulated into the running summary (spec §7).
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::PerFileIo { .. } | Error::PerFileTransfer { .. } | Error::PruneFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
