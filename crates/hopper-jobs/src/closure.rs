//! Closure jobs: named operations dispatched with signed arguments.
//!
//! A closure is registered under a name on every process that runs workers.
//! Dispatching one stores `{operation, args}` plus an HS256 signature over
//! both, so a worker never runs an operation or arguments it did not sign.

use crate::definition::JobDefinition;
use crate::engine::JobRecord;
use crate::error::{JobError, JobResult};
use crate::job::{Job, JobContext};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{warn, Span};

/// Registered name of the built-in closure job.
pub const CLOSURE_JOB_NAME: &str = "hopper:closure";

/// Shared application state handed to closures.
pub type AppHandle = Arc<dyn Any + Send + Sync>;

/// Closure payload as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedClosure {
    pub operation: String,
    pub args: Vec<Value>,
    pub signature: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ClosureClaims {
    op: String,
    args: Vec<Value>,
    iat: i64,
}

/// Signs and verifies closure payloads with the application key.
#[derive(Clone)]
pub struct ClosureCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for ClosureCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureCodec").finish_non_exhaustive()
    }
}

impl ClosureCodec {
    /// Creates a codec keyed by `app_key`.
    pub fn new(app_key: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        Self {
            encoding_key: EncodingKey::from_secret(app_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(app_key.as_bytes()),
            validation,
        }
    }

    /// Signs `operation` with its arguments.
    pub fn serialize(&self, operation: &str, args: Vec<Value>) -> JobResult<SerializedClosure> {
        if operation.trim().is_empty() {
            return Err(JobError::Configuration(
                "closure operation name must not be empty".to_string(),
            ));
        }

        let claims = ClosureClaims {
            op: operation.to_string(),
            args: args.clone(),
            iat: Utc::now().timestamp(),
        };
        let signature = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JobError::PayloadCrypto(format!("closure signing failed: {}", e)))?;

        Ok(SerializedClosure {
            operation: operation.to_string(),
            args,
            signature,
        })
    }

    /// Verifies the signature and returns the operation name and arguments.
    pub fn deserialize(&self, payload: &SerializedClosure) -> JobResult<(String, Vec<Value>)> {
        let claims = decode::<ClosureClaims>(&payload.signature, &self.decoding_key, &self.validation)
            .map_err(|e| {
                warn!("Closure signature verification failed: {}", e);
                JobError::PayloadCrypto(format!("closure signature invalid: {}", e))
            })?
            .claims;

        if claims.op != payload.operation || claims.args != payload.args {
            return Err(JobError::PayloadCrypto(
                "closure payload does not match its signature".to_string(),
            ));
        }

        Ok((claims.op, claims.args))
    }
}

/// Context passed to every closure hook.
#[derive(Clone)]
pub struct ClosureContext {
    pub job: JobRecord,
    pub attempt: u32,
    pub span: Span,
    app: Option<AppHandle>,
}

impl std::fmt::Debug for ClosureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureContext")
            .field("job", &self.job.id)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

impl ClosureContext {
    /// Application state of type `T`, if one was registered.
    pub fn app<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.app.as_ref().and_then(|app| app.downcast_ref::<T>())
    }
}

/// An operation runnable as a closure job.
#[async_trait]
pub trait Closure: Send + Sync + 'static {
    /// Runs before the body.
    async fn prepare(&self, _ctx: &ClosureContext) -> JobResult<()> {
        Ok(())
    }

    /// The closure body.
    async fn run(&self, ctx: &ClosureContext, args: Vec<Value>) -> JobResult<Value>;

    /// Receives any error from `prepare` or `run`. Rethrows by default.
    async fn catch(&self, _ctx: &ClosureContext, error: JobError) -> JobResult<Value> {
        Err(error)
    }
}

struct FnClosure<F>(F);

#[async_trait]
impl<F, Fut> Closure for FnClosure<F>
where
    F: Fn(ClosureContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult<Value>> + Send + 'static,
{
    async fn run(&self, ctx: &ClosureContext, args: Vec<Value>) -> JobResult<Value> {
        (self.0)(ctx.clone(), args).await
    }
}

/// Named closures available to workers.
#[derive(Default, Clone)]
pub struct ClosureRegistry {
    closures: HashMap<String, Arc<dyn Closure>>,
    app: Option<AppHandle>,
}

impl std::fmt::Debug for ClosureRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClosureRegistry")
            .field("closures", &self.names())
            .finish_non_exhaustive()
    }
}

impl ClosureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares `app` with every closure through [`ClosureContext::app`].
    pub fn with_app(mut self, app: AppHandle) -> Self {
        self.app = Some(app);
        self
    }

    /// Registers a closure implementation.
    pub fn register(mut self, name: impl Into<String>, closure: impl Closure) -> Self {
        self.closures.insert(name.into(), Arc::new(closure));
        self
    }

    /// Registers an async function as a closure.
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ClosureContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<Value>> + Send + 'static,
    {
        self.register(name, FnClosure(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Closure>> {
        self.closures.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.closures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// The built-in job that runs closures.
pub struct ClosureJob {
    codec: Arc<ClosureCodec>,
    closures: Arc<ClosureRegistry>,
}

impl ClosureJob {
    /// Definition registered under [`CLOSURE_JOB_NAME`].
    pub fn definition(codec: Arc<ClosureCodec>, closures: Arc<ClosureRegistry>) -> JobDefinition {
        JobDefinition::of(move || ClosureJob {
            codec: codec.clone(),
            closures: closures.clone(),
        })
    }
}

#[async_trait]
impl Job for ClosureJob {
    type Data = SerializedClosure;
    type Output = Value;

    fn name() -> String {
        CLOSURE_JOB_NAME.to_string()
    }

    async fn process(&self, ctx: &JobContext<SerializedClosure>) -> JobResult<Value> {
        let (operation, args) = self.codec.deserialize(&ctx.data)?;
        let closure = self.closures.get(&operation).ok_or_else(|| {
            JobError::unrecoverable(format!("closure '{}' is not registered", operation))
        })?;

        let closure_ctx = ClosureContext {
            job: ctx.job.clone(),
            attempt: ctx.attempt,
            span: ctx.span.clone(),
            app: self.closures.app.clone(),
        };

        let result = match closure.prepare(&closure_ctx).await {
            Ok(()) => closure.run(&closure_ctx, args).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => Ok(value),
            Err(e) => closure.catch(&closure_ctx, e).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "closure-signing-key-for-tests";

    #[test]
    fn test_serialize_then_verify() {
        let codec = ClosureCodec::new(KEY);
        let payload = codec.serialize("send_report", vec![json!(42), json!("weekly")]).unwrap();

        let (op, args) = codec.deserialize(&payload).unwrap();
        assert_eq!(op, "send_report");
        assert_eq!(args, vec![json!(42), json!("weekly")]);
    }

    #[test]
    fn test_tampered_args_rejected() {
        let codec = ClosureCodec::new(KEY);
        let mut payload = codec.serialize("refund", vec![json!(10)]).unwrap();
        payload.args = vec![json!(10_000)];

        let err = codec.deserialize(&payload).unwrap_err();
        assert!(matches!(err, JobError::PayloadCrypto(_)));
    }

    #[test]
    fn test_foreign_key_rejected() {
        let payload = ClosureCodec::new("another-key-entirely-here")
            .serialize("refund", vec![])
            .unwrap();
        let err = ClosureCodec::new(KEY).deserialize(&payload).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn test_empty_operation_rejected() {
        let err = ClosureCodec::new(KEY).serialize(" ", vec![]).unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[test]
    fn test_registry_names() {
        let registry = ClosureRegistry::new()
            .register_fn("b", |_ctx, _args| async { Ok::<_, JobError>(Value::Null) })
            .register_fn("a", |_ctx, _args| async { Ok::<_, JobError>(Value::Null) });
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.get("a").is_some());
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_closure_definition_name() {
        let def = ClosureJob::definition(
            Arc::new(ClosureCodec::new(KEY)),
            Arc::new(ClosureRegistry::new()),
        );
        assert_eq!(def.name(), CLOSURE_JOB_NAME);
    }

    #[test]
    fn test_context_app_downcast() {
        struct Mailer(&'static str);
        let ctx = ClosureContext {
            job: JobRecord {
                id: "1".into(),
                name: CLOSURE_JOB_NAME.into(),
                queue: "default".into(),
                data: Value::Null,
                options: Default::default(),
                state: crate::engine::JobState::Active,
                attempts_made: 0,
                return_value: None,
                failed_reason: None,
                parent: None,
                created_at: Utc::now(),
                processed_on: None,
                finished_on: None,
            },
            attempt: 1,
            span: Span::none(),
            app: Some(Arc::new(Mailer("smtp"))),
        };
        assert_eq!(ctx.app::<Mailer>().map(|m| m.0), Some("smtp"));
        assert!(ctx.app::<String>().is_none());
    }
}
