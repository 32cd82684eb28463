//! Registered job definitions and their type-erased handlers.

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext};
use crate::options::JobOptions;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Job handler with its payload type erased to JSON.
#[async_trait]
pub trait ErasedJob: Send + Sync {
    /// Decodes the payload, runs the job and encodes its output.
    async fn process(&self, ctx: JobContext<Value>) -> JobResult<Value>;

    /// Runs the failure hook. Payloads that no longer decode are skipped.
    async fn on_failed(&self, ctx: JobContext<Value>, error: &JobError);
}

struct TypedJob<J>(J);

#[async_trait]
impl<J: Job> ErasedJob for TypedJob<J> {
    async fn process(&self, ctx: JobContext<Value>) -> JobResult<Value> {
        let data: J::Data = serde_json::from_value(ctx.data.clone()).map_err(|e| {
            JobError::unrecoverable(format!("payload does not match job data: {}", e))
        })?;
        let ctx = ctx.map(data);

        let output = self.0.process(&ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| JobError::unrecoverable(format!("job output is not serializable: {}", e)))
    }

    async fn on_failed(&self, ctx: JobContext<Value>, error: &JobError) {
        match serde_json::from_value::<J::Data>(ctx.data.clone()) {
            Ok(data) => self.0.on_failed(&ctx.map(data), error).await,
            Err(e) => tracing::debug!(error = %e, "Skipping failure hook, payload does not decode"),
        }
    }
}

/// Produces a fresh handler for every attempt.
pub type HandlerFactory = Arc<dyn Fn() -> JobResult<Box<dyn ErasedJob>> + Send + Sync>;

/// Everything the runtime knows about a job type.
#[derive(Clone)]
pub struct JobDefinition {
    name: String,
    default_queue: Option<String>,
    default_options: JobOptions,
    encrypted: bool,
    source: PathBuf,
    factory: HandlerFactory,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("default_queue", &self.default_queue)
            .field("default_options", &self.default_options)
            .field("encrypted", &self.encrypted)
            .field("source", &self.source)
            .finish()
    }
}

impl JobDefinition {
    /// Defines job `J`.
    ///
    /// The source is `J::SOURCE`, or the calling file when the job does not
    /// declare one.
    #[track_caller]
    pub fn of<J: Job>(factory: impl Fn() -> J + Send + Sync + 'static) -> Self {
        Self::with_factory::<J>(
            Location::caller().file(),
            Arc::new(move || -> JobResult<Box<dyn ErasedJob>> {
                Ok(Box::new(TypedJob(factory())))
            }),
        )
    }

    /// Like [`JobDefinition::of`] for handlers whose construction can fail.
    #[track_caller]
    pub fn try_of<J: Job>(factory: impl Fn() -> JobResult<J> + Send + Sync + 'static) -> Self {
        Self::with_factory::<J>(
            Location::caller().file(),
            Arc::new(move || -> JobResult<Box<dyn ErasedJob>> {
                Ok(Box::new(TypedJob(factory()?)))
            }),
        )
    }

    fn with_factory<J: Job>(registered_at: &str, factory: HandlerFactory) -> Self {
        Self {
            name: J::name(),
            default_queue: J::QUEUE.map(str::to_string),
            default_options: J::options(),
            encrypted: J::ENCRYPTED,
            source: PathBuf::from(J::SOURCE.unwrap_or(registered_at)),
            factory,
        }
    }

    /// Overrides the registered name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Overrides the recorded source file.
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = source.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_queue(&self) -> Option<&str> {
        self.default_queue.as_deref()
    }

    pub fn default_options(&self) -> &JobOptions {
        &self.default_options
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Builds a fresh handler instance.
    pub fn instantiate(&self) -> JobResult<Box<dyn ErasedJob>> {
        (self.factory)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{JobRecord, JobState};
    use crate::job::JobId;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Resize {
        width: u32,
    }

    struct ResizeImage;

    #[async_trait]
    impl Job for ResizeImage {
        type Data = Resize;
        type Output = u32;
        const QUEUE: Option<&'static str> = Some("images");
        const ENCRYPTED: bool = true;

        fn options() -> JobOptions {
            JobOptions::default().with_attempts(3)
        }

        async fn process(&self, ctx: &JobContext<Resize>) -> Result<u32, JobError> {
            Ok(ctx.data.width * 2)
        }
    }

    fn context(data: Value) -> JobContext<Value> {
        JobContext {
            data: data.clone(),
            job: JobRecord {
                id: JobId::from("1"),
                name: "ResizeImage".into(),
                queue: "images".into(),
                data,
                options: JobOptions::default(),
                state: JobState::Active,
                attempts_made: 0,
                return_value: None,
                failed_reason: None,
                parent: None,
                created_at: Utc::now(),
                processed_on: None,
                finished_on: None,
            },
            token: "t".into(),
            attempt: 1,
            span: tracing::Span::none(),
        }
    }

    #[test]
    fn test_definition_metadata() {
        let def = JobDefinition::of(|| ResizeImage);
        assert_eq!(def.name(), "ResizeImage");
        assert_eq!(def.default_queue(), Some("images"));
        assert_eq!(def.default_options().attempts, Some(3));
        assert!(def.is_encrypted());
        assert!(def.source().ends_with("definition.rs"));
    }

    struct Thumbnail;

    #[async_trait]
    impl Job for Thumbnail {
        type Data = ();
        type Output = ();
        const SOURCE: Option<&'static str> = Some("src/jobs/thumbnail.rs");

        async fn process(&self, _ctx: &JobContext<()>) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[test]
    fn test_declared_source_wins_over_registration_site() {
        let def = JobDefinition::of(|| Thumbnail);
        assert_eq!(def.source(), Path::new("src/jobs/thumbnail.rs"));
    }

    #[test]
    fn test_named_override() {
        let def = JobDefinition::of(|| ResizeImage).named("images:resize");
        assert_eq!(def.name(), "images:resize");
    }

    #[tokio::test]
    async fn test_erased_process_round_trips_json() {
        let def = JobDefinition::of(|| ResizeImage);
        let handler = def.instantiate().unwrap();
        let out = handler.process(context(json!({ "width": 21 }))).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn test_mismatched_payload_is_unrecoverable() {
        let def = JobDefinition::of(|| ResizeImage);
        let handler = def.instantiate().unwrap();
        let err = handler
            .process(context(json!({ "height": 1 })))
            .await
            .unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_fallible_factory() {
        let def = JobDefinition::try_of::<ResizeImage>(|| {
            Err(JobError::Configuration("missing dependency".into()))
        });
        assert!(def.instantiate().is_err());
    }
}
