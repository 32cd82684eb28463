//! Job error types.

use std::fmt;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job definitions sharing one resolved name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// The contested job name.
    pub name: String,

    /// Every file declaring it, relative to the application root.
    pub files: Vec<String>,
}

impl fmt::Display for DuplicateGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' declared in [{}]", self.name, self.files.join(", "))
    }
}

fn format_duplicates(groups: &[DuplicateGroup]) -> String {
    groups
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Unresolvable queue, invalid options, bad config provider.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Two or more job definitions resolve to the same name.
    #[error("Duplicate job definitions: {}", format_duplicates(.0))]
    DuplicateJobDefinition(Vec<DuplicateGroup>),

    /// A worker received a record with no registered definition.
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    /// Payload decryption or closure signature verification failed.
    #[error("Payload crypto error: {0}")]
    PayloadCrypto(String),

    /// The job's process implementation failed.
    #[error("Job execution failed: {0}")]
    Process(String),

    /// The job asked not to be retried.
    #[error("Unrecoverable job error: {0}")]
    Unrecoverable(String),

    /// A dispatched job ended in the failed state.
    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Queue engine rejected or could not serve a request.
    #[error("Queue engine error: {0}")]
    Engine(String),

    /// Job or entry not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Redis error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Redis pool error.
    #[error("Redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Worker lifecycle error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Creates a retryable process error.
    pub fn process(message: impl Into<String>) -> Self {
        JobError::Process(message.into())
    }

    /// Creates an error that stops retries regardless of remaining attempts.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        JobError::Unrecoverable(message.into())
    }

    /// Returns true if no further attempt may be made after this error.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobError::Configuration(_)
                | JobError::DuplicateJobDefinition(_)
                | JobError::UnknownJobType(_)
                | JobError::PayloadCrypto(_)
                | JobError::Unrecoverable(_)
                | JobError::JobFailed { .. }
        )
    }

    /// Returns true if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true for errors that must abort startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            JobError::Configuration(_) | JobError::DuplicateJobDefinition(_)
        )
    }

    /// Returns a machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Configuration(_) => "ConfigurationError",
            JobError::DuplicateJobDefinition(_) => "DuplicateJobDefinition",
            JobError::UnknownJobType(_) => "UnknownJobType",
            JobError::PayloadCrypto(_) => "PayloadCryptoError",
            JobError::Process(_) => "UserProcessError",
            JobError::Unrecoverable(_) => "UnrecoverableUserError",
            JobError::JobFailed { .. } => "JobFailed",
            JobError::Serialization(_) => "SerializationError",
            JobError::Engine(_) | JobError::Redis(_) | JobError::Pool(_) => "EngineError",
            JobError::NotFound(_) => "NotFound",
            JobError::Worker(_) => "WorkerError",
            JobError::Internal(_) => "InternalError",
        }
    }
}

impl From<hopper_core::HopperError> for JobError {
    fn from(err: hopper_core::HopperError) -> Self {
        match err {
            hopper_core::HopperError::Configuration(msg) => JobError::Configuration(msg),
            other => JobError::Internal(other.to_string()),
        }
    }
}
