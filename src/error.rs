//! Error types for the migration agent

use std::path::PathBuf;

use thiserror::Error;

use crate::migrate::MigrationStep;

/// Boxed underlying cause, kept intact so callers can walk the source chain
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for migration operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Snapshot archive is missing or is not a valid zip container
    #[error("failed to open snapshot archive {}: {message}", .path.display())]
    ArchiveOpen {
        /// Archive path
        path: PathBuf,
        /// Underlying failure
        message: String,
    },

    /// An archive entry would be written outside the extraction root
    #[error("illegal archive entry {entry:?}: resolves outside {}", .dest.display())]
    PathTraversal {
        /// Entry name as stored in the archive
        entry: String,
        /// Extraction root
        dest: PathBuf,
    },

    /// Reading an entry or writing it to disk failed mid-extraction
    #[error("failed to extract {}: {source}", .path.display())]
    ExtractionIo {
        /// Path being read or written
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// No `.rkestate` file in the extracted snapshot
    #[error("no state file found under {}", .dir.display())]
    StateFileNotFound {
        /// Directory that was searched
        dir: PathBuf,
    },

    /// No etcd backup file in the extracted snapshot
    #[error("no snapshot backup file found under {}", .dir.display())]
    BackupFileNotFound {
        /// Directory that was searched
        dir: PathBuf,
    },

    /// The state document could not be read or parsed
    #[error("failed to decode state file {}: {source}", .path.display())]
    StateDecode {
        /// State document path
        path: PathBuf,
        /// Underlying read or parse error
        #[source]
        source: BoxedCause,
    },

    /// None of the node matching strategies found this host in the state
    #[error("cannot find node in current state (hostname {hostname}, ip {ip}{})",
        .override_name.as_deref().map(|n| format!(", node name {n}")).unwrap_or_default())]
    NodeNotFound {
        /// Local hostname used for matching
        hostname: String,
        /// Local IP used for matching
        ip: String,
        /// Operator supplied node name, if any
        override_name: Option<String>,
    },

    /// A role-gated migration step failed
    #[error("migration step {step} failed: {source}")]
    Step {
        /// Step that failed
        step: MigrationStep,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Local hostname or primary IP could not be determined
    #[error("failed to determine host identity: {0}")]
    HostIdentity(String),

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error outside of archive extraction
    #[error("{context}: {source}")]
    Io {
        /// What was being done
        context: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Snapshot download from object storage failed
    #[error("snapshot download failed: {0}")]
    Download(String),

    /// External command failed
    #[error("command failed: {0}")]
    Command(String),

    /// Invalid operator configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded wait ran out
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Configured limit
        after: std::time::Duration,
    },

    /// The run was cancelled before the operation completed
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Create an archive open error
    pub fn archive_open(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Self::ArchiveOpen {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Create an extraction IO error
    pub fn extraction_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ExtractionIo {
            path: path.into(),
            source,
        }
    }

    /// Create a state decode error, keeping the underlying cause
    pub fn state_decode(path: impl Into<PathBuf>, source: impl Into<BoxedCause>) -> Self {
        Self::StateDecode {
            path: path.into(),
            source: source.into(),
        }
    }

    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a host identity error
    pub fn host_identity(msg: impl Into<String>) -> Self {
        Self::HostIdentity(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a download error
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Create a command error
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Wrap a collaborator failure with the step it happened in
    pub fn step(step: MigrationStep, source: Error) -> Self {
        Self::Step {
            step,
            source: Box::new(source),
        }
    }

    /// True for errors caused by archive content trying to escape the
    /// extraction root. These are never suppressed or retried.
    pub fn is_security_violation(&self) -> bool {
        match self {
            Self::PathTraversal { .. } => true,
            Self::Step { source, .. } => source.is_security_violation(),
            _ => false,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
