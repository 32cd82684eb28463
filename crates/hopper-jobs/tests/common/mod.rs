//! Common test infrastructure for orchestration tests.
//!
//! Everything runs against the in-memory queue engine.

#![allow(dead_code)]

pub mod legacy;

use async_trait::async_trait;
use hopper_config::{HopperConfig, QueueOptions};
use hopper_jobs::{
    ClosureRegistry, Job, JobContext, JobDefinition, JobError, JobEvent, JobOptions, JobResult,
    JobSource, MemoryQueueEngine, QueueManager,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const APP_KEY: &str = "0123456789abcdef0123456789abcdef";

/// Names of jobs in the order their `process` ran.
pub type ExecutionLog = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub input: String,
}

impl Input {
    pub fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }
}

macro_rules! logging_job {
    ($name:ident) => {
        pub struct $name {
            pub log: ExecutionLog,
        }

        #[async_trait]
        impl Job for $name {
            type Data = Input;
            type Output = String;
            hopper_jobs::job_file!();

            async fn process(&self, ctx: &JobContext<Input>) -> JobResult<String> {
                self.log
                    .lock()
                    .push(format!("{}:{}", stringify!($name), ctx.data.input));
                Ok(ctx.data.input.to_uppercase())
            }
        }
    };
}

logging_job!(JobA);
logging_job!(JobB);
logging_job!(JobC);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub api_token: String,
}

/// Payload is encrypted at rest.
#[derive(Default)]
pub struct RotateToken;

#[async_trait]
impl Job for RotateToken {
    type Data = Credentials;
    type Output = String;
    const ENCRYPTED: bool = true;

    async fn process(&self, ctx: &JobContext<Credentials>) -> JobResult<String> {
        Ok(ctx.data.api_token.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flaky {
    pub fail_times: u32,
}

/// Fails its first `fail_times` attempts.
pub struct FlakyJob {
    pub failures: ExecutionLog,
}

#[async_trait]
impl Job for FlakyJob {
    type Data = Flaky;
    type Output = u32;

    fn options() -> JobOptions {
        JobOptions::default().with_attempts(3)
    }

    async fn process(&self, ctx: &JobContext<Flaky>) -> JobResult<u32> {
        if ctx.attempt <= ctx.data.fail_times {
            return Err(JobError::process(format!("attempt {} failed", ctx.attempt)));
        }
        Ok(ctx.attempt)
    }

    async fn on_failed(&self, ctx: &JobContext<Flaky>, error: &JobError) {
        self.failures
            .lock()
            .push(format!("{}:{}", ctx.attempt, error.kind()));
    }
}

/// Gives up without retrying.
#[derive(Default)]
pub struct DoomedJob;

#[async_trait]
impl Job for DoomedJob {
    type Data = ();
    type Output = ();

    fn options() -> JobOptions {
        JobOptions::default().with_attempts(5)
    }

    async fn process(&self, _ctx: &JobContext<()>) -> JobResult<()> {
        Err(JobError::unrecoverable("account closed"))
    }
}

/// Panics inside `process`.
#[derive(Default)]
pub struct PanicJob;

#[async_trait]
impl Job for PanicJob {
    type Data = ();
    type Output = ();

    async fn process(&self, _ctx: &JobContext<()>) -> JobResult<()> {
        panic!("boom");
    }
}

/// Sleeps for the given number of milliseconds.
#[derive(Default)]
pub struct SlowJob;

#[async_trait]
impl Job for SlowJob {
    type Data = u64;
    type Output = u64;
    const QUEUE: Option<&'static str> = Some("reports");

    async fn process(&self, ctx: &JobContext<u64>) -> JobResult<u64> {
        tokio::time::sleep(Duration::from_millis(ctx.data)).await;
        Ok(ctx.data)
    }
}

pub fn test_config() -> HopperConfig {
    let mut config = HopperConfig::default();
    config.app.root = "/srv/app".into();
    config.app.key = APP_KEY.to_string();
    config.worker.block_timeout_ms = 20;
    config.worker.shutdown_timeout_secs = 5;
    config.queue.queues.insert(
        "emails".to_string(),
        QueueOptions {
            concurrency: Some(2),
            ..Default::default()
        },
    );
    config.queue.queues.insert(
        "reports".to_string(),
        QueueOptions {
            global_concurrency: Some(1),
            ..Default::default()
        },
    );
    config
}

/// Manager, engine and shared logs wired together.
pub struct TestApp {
    pub manager: QueueManager,
    pub engine: Arc<MemoryQueueEngine>,
    pub log: ExecutionLog,
    pub failures: ExecutionLog,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_closures(ClosureRegistry::new())
    }

    pub fn with_closures(closures: ClosureRegistry) -> Self {
        let log = ExecutionLog::default();
        let failures = ExecutionLog::default();
        let engine = Arc::new(MemoryQueueEngine::new());

        let manager = QueueManager::bootstrap(
            test_config(),
            engine.clone(),
            vec![job_source(&log, &failures)],
            closures,
        )
        .expect("bootstrap failed");

        Self {
            manager,
            engine,
            log,
            failures,
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub fn job_source(log: &ExecutionLog, failures: &ExecutionLog) -> JobSource {
    let (a, b, c) = (log.clone(), log.clone(), log.clone());
    let failures = failures.clone();

    JobSource::new("/srv/app/jobs")
        .register(JobDefinition::of(move || JobA { log: a.clone() }))
        .register(JobDefinition::of(move || JobB { log: b.clone() }))
        .register(JobDefinition::of(move || JobC { log: c.clone() }))
        .register(JobDefinition::of(move || FlakyJob {
            failures: failures.clone(),
        }))
        .job::<RotateToken>()
        .job::<DoomedJob>()
        .job::<PanicJob>()
        .job::<SlowJob>()
}

/// Collects events until `done` returns true or the timeout passes.
pub async fn collect_events(
    events: &mut broadcast::Receiver<JobEvent>,
    timeout: Duration,
    mut done: impl FnMut(&JobEvent) -> bool,
) -> Vec<JobEvent> {
    let mut seen = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await;
    seen
}

/// Event names, in order.
pub fn names(events: &[JobEvent]) -> Vec<&'static str> {
    events.iter().map(JobEvent::name).collect()
}
