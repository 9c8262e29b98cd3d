use std::fmt;
use std::path::PathBuf;

use crate::store_path::StorePath;

/// Which half of an archive an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// The binary store object itself.
    Data,
    /// The `.narinfo` metadata record describing it.
    Info,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryKind::Data => write!(f, "data"),
            EntryKind::Info => write!(f, "info"),
        }
    }
}

/// Errors surfaced by the build and execute pipelines.
///
/// The first failure aborts the current run and is returned verbatim; nothing
/// retries or swallows errors mid-pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op}: exited with status {status}: {stderr}")]
    ExternalToolFailure {
        op: &'static str,
        status: i32,
        stderr: String,
    },

    #[error("{op}: unexpected output: {raw}")]
    ExternalOutputMalformed { op: &'static str, raw: String },

    #[error(
        "flake does not configure a host named {requested:?}, available: {}",
        available.join(", ")
    )]
    UnknownHostname {
        requested: String,
        available: Vec<String>,
    },

    #[error("reference cycle in closure, involving {0}")]
    ClosureCycle(StorePath),

    #[error("archive is missing the {kind} entry for {path}")]
    ArchiveIncomplete { kind: EntryKind, path: StorePath },

    #[error("invalid instruction: {reason}")]
    InvalidInstruction { reason: String },

    #[error("instruction contains a command of unknown kind {0:?}")]
    UnknownCommandKind(String),

    #[error("no info file available for dependency path {0}")]
    MissingDependencyMetadata(StorePath),

    #[error("import of {path} into the target store failed")]
    ImportFailed {
        path: StorePath,
        #[source]
        cause: Box<Error>,
    },

    #[error("activation of {path} failed")]
    ActivationFailed {
        path: StorePath,
        #[source]
        cause: Box<Error>,
    },

    #[error("client state cache at {} is locked by another run", .0.display())]
    CacheLocked(PathBuf),

    #[error("malformed info file at {}", path.display())]
    InvalidNarInfo {
        path: PathBuf,
        #[source]
        cause: crate::narinfo::Error,
    },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for the CLI: 2 for anything the user handed us that
    /// does not hold up, 3 for external tool trouble, 4 for target store
    /// state, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnknownHostname { .. }
            | Error::InvalidInstruction { .. }
            | Error::UnknownCommandKind(_)
            | Error::InvalidNarInfo { .. } => 2,
            Error::ExternalToolFailure { .. } | Error::ExternalOutputMalformed { .. } => 3,
            Error::MissingDependencyMetadata(_)
            | Error::ImportFailed { .. }
            | Error::ActivationFailed { .. }
            | Error::ArchiveIncomplete { .. }
            | Error::CacheLocked(_) => 4,
            Error::ClosureCycle(_) | Error::Io { .. } => 1,
        }
    }
}
