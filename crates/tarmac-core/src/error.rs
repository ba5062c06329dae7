//! Error types for tarmac.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Workflow errors
    #[error("Workflow load failed: {0}")]
    WorkflowLoad(String),

    #[error("Duplicate job name: {0}")]
    DuplicateJob(String),

    #[error("Job '{job}': {message}")]
    InvalidJob { job: String, message: String },

    #[error("Job '{job}': cache dir '{dir}' escapes the workspace")]
    UnconfinedCacheDir { job: String, dir: String },

    // DAG errors
    #[error("Job '{job}' needs unknown job '{missing}'")]
    UnknownNeed { job: String, missing: String },

    #[error("Dependency cycle: {0}")]
    Cycle(String),

    // Repo facts errors
    #[error("Not a git repository (or any parent up to filesystem root)")]
    NotARepository,

    #[error("Unknown git ref: {0}")]
    UnknownRef(String),

    #[error("git command failed: {0}")]
    Git(String),

    // Cache errors
    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    // Step errors
    #[error("Step '{step}' failed with exit code {exit_code}")]
    StepFailed { step: String, exit_code: i32 },

    #[error("Unknown step kind: {0}")]
    UnknownStepKind(String),

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
