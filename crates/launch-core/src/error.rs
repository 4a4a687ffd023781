//! Error types for the distributed training launcher

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using the launcher Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the distributed training launcher
#[derive(Error, Debug)]
pub enum Error {
    // Command-line errors
    #[error("Usage error: {message}")]
    Usage { message: String },

    // Configuration errors
    #[error("Failed to load configuration from {path}: {message}")]
    ConfigSource { path: PathBuf, message: String },

    #[error("Invalid configuration: {}", format_violations(.violations))]
    Config { violations: Vec<ConfigViolation> },

    // Dataset preparation errors
    #[error("Dataset preparation failed: {0}")]
    DataPrep(#[from] DataPrepError),

    // Worker errors
    #[error("{} of {total} worker(s) failed (local ranks {failed_ranks:?})", .failed_ranks.len())]
    WorkerFailure {
        failed_ranks: Vec<usize>,
        total: usize,
    },

    #[error("Failed to spawn worker {local_rank}: {message}")]
    SpawnFailed { local_rank: usize, message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for a configuration error with a single violation
    pub fn config(fields: &[&str], message: impl Into<String>) -> Self {
        Error::Config {
            violations: vec![ConfigViolation::new(fields, message)],
        }
    }

    /// Process exit code the launcher reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Usage { .. } => 1,
            Error::ConfigSource { .. } | Error::Config { .. } => 2,
            Error::DataPrep(_) => 3,
            Error::WorkerFailure { .. } | Error::SpawnFailed { .. } => 4,
            Error::Io(_) | Error::Serialization(_) | Error::Internal { .. } => 5,
        }
    }

    /// Returns true if this error is raised before any worker is spawned
    pub fn is_pre_spawn(&self) -> bool {
        matches!(
            self,
            Error::Usage { .. }
                | Error::ConfigSource { .. }
                | Error::Config { .. }
                | Error::DataPrep(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// A violated cross-field rule, naming the offending fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    /// Fully qualified field names, e.g. `RUN.synchronized_bn`
    pub fields: Vec<String>,

    /// Human readable description of the rule
    pub message: String,
}

impl ConfigViolation {
    pub fn new(fields: &[&str], message: impl Into<String>) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            message: message.into(),
        }
    }

    /// Returns true if the violation names the given field
    pub fn names(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }
}

impl fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.fields.join(", "), self.message)
    }
}

fn format_violations(violations: &[ConfigViolation]) -> String {
    violations
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures of the one-time dataset cache build
#[derive(Error, Debug)]
pub enum DataPrepError {
    #[error("source data for {name} not found at {path}")]
    SourceMissing { name: String, path: PathBuf },

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid dataset bundle at {path}: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },

    #[error("{message}")]
    Build { message: String },
}

impl DataPrepError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataPrepError::Io {
            path: path.into(),
            source,
        }
    }
}
