//! Job trait and execution context.

use crate::engine::JobRecord;
use crate::error::JobError;
use crate::options::JobOptions;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use tracing::Span;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Creates a job ID from a string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job execution context handed to [`Job::process`].
#[derive(Debug, Clone)]
pub struct JobContext<D> {
    /// Decoded (and decrypted) payload.
    pub data: D,

    /// The raw record as the queue engine stores it.
    pub job: JobRecord,

    /// Lock token owned by the worker for this attempt.
    pub token: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Span wrapping this attempt.
    pub span: Span,
}

impl<D> JobContext<D> {
    /// Returns the job ID.
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// Returns the queue the job runs on.
    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// Maximum attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        self.job.max_attempts()
    }

    /// Returns true if this is the last attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts()
    }

    /// Returns remaining attempts.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts().saturating_sub(self.attempt)
    }

    /// Replaces the payload, keeping everything else.
    pub fn map<U>(self, data: U) -> JobContext<U> {
        JobContext {
            data,
            job: self.job,
            token: self.token,
            attempt: self.attempt,
            span: self.span,
        }
    }
}

/// Trait for defining jobs.
///
/// A job type carries the dependencies it needs to run; the payload travels
/// separately as [`Job::Data`].
///
/// # Example
///
/// ```rust,ignore
/// use hopper_jobs::{Job, JobContext, JobError};
///
/// struct SendEmail {
///     mailer: Arc<Mailer>,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendEmail {
///     type Data = Email;
///     type Output = ();
///     const QUEUE: Option<&'static str> = Some("emails");
///
///     async fn process(&self, ctx: &JobContext<Email>) -> Result<(), JobError> {
///         self.mailer.send(&ctx.data).await.map_err(|e| JobError::process(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Payload type.
    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Value returned on success and stored by the engine.
    type Output: Serialize + Send + 'static;

    /// Queue used when the dispatcher does not name one.
    const QUEUE: Option<&'static str> = None;

    /// Encrypt the payload at rest in the queue engine.
    const ENCRYPTED: bool = false;

    /// File defining the job, reported when two jobs share a name.
    /// Set it with [`job_file!`](crate::job_file); unset jobs report the
    /// file that registered them.
    const SOURCE: Option<&'static str> = None;

    /// Registered name. Defaults to the type's own identifier.
    fn name() -> String
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }

    /// Default engine options for this job.
    fn options() -> JobOptions
    where
        Self: Sized,
    {
        JobOptions::default()
    }

    /// Execute the job.
    async fn process(&self, ctx: &JobContext<Self::Data>) -> Result<Self::Output, JobError>;

    /// Called on a fresh instance after any failed attempt.
    async fn on_failed(&self, _ctx: &JobContext<Self::Data>, _error: &JobError) {}
}

/// Records the invoking file as [`Job::SOURCE`]. Use inside `impl Job`.
///
/// ```rust,ignore
/// #[async_trait::async_trait]
/// impl Job for SendEmail {
///     type Data = Email;
///     type Output = ();
///     hopper_jobs::job_file!();
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! job_file {
    () => {
        const SOURCE: ::std::option::Option<&'static str> = ::std::option::Option::Some(file!());
    };
}

/// Last path segment of a type name, without generic arguments.
pub(crate) fn short_type_name<T: ?Sized>() -> String {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}
