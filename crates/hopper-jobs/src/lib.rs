//! Hopper Jobs - Job Orchestration over a Queue Engine
//!
//! Describes, composes, dispatches and executes jobs on top of an external
//! queue engine:
//! - Typed job definitions registered at startup, unique by name
//! - Lazy dispatch builders with per-call option overrides
//! - Chains, flows and bulk batches
//! - Per-queue workers with bounded local and global concurrency
//! - Recurring schedules (cron or fixed interval)
//! - Signed closure jobs and encrypted payloads
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                   Hopper Jobs Architecture                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  JobSource ... JobSource ──► JobDiscoverer ──► JobRegistry     │
//! │                                                     │          │
//! │                                                     ▼          │
//! │  ┌──────────────────────── QueueManager ─────────────────────┐ │
//! │  │  config · registry · cipher · closure codec · event bus   │ │
//! │  └──────┬──────────────────────┬─────────────────────┬───────┘ │
//! │         │                      │                     │         │
//! │         ▼                      ▼                     ▼         │
//! │  JobDispatcher          WorkerManager          JobScheduler    │
//! │  Chain / Flow / Bulk    (one worker/queue)     (repeatables)   │
//! │         │                      ▲                     │         │
//! │         ▼                      │                     ▼         │
//! │  ┌──────────────────────── QueueEngine ──────────────────────┐ │
//! │  │  enqueue · flows · bulk · repeatables · events · fetch    │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use hopper_jobs::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Welcome {
//!     to: String,
//! }
//!
//! #[derive(Default)]
//! struct SendWelcomeEmail;
//!
//! #[async_trait::async_trait]
//! impl Job for SendWelcomeEmail {
//!     type Data = Welcome;
//!     type Output = ();
//!     const QUEUE: Option<&'static str> = Some("emails");
//!
//!     async fn process(&self, ctx: &JobContext<Welcome>) -> JobResult<()> {
//!         tracing::info!(to = %ctx.data.to, "sending");
//!         Ok(())
//!     }
//! }
//!
//! let manager = QueueManager::bootstrap(
//!     config,
//!     Arc::new(MemoryQueueEngine::new()),
//!     vec![JobSource::new("src/jobs").job::<SendWelcomeEmail>()],
//!     ClosureRegistry::new(),
//! )?;
//!
//! manager
//!     .dispatch::<SendWelcomeEmail>(Welcome { to: "user@example.com".into() })?
//!     .priority(Priority::High)
//!     .dispatch()
//!     .await?;
//!
//! let workers = WorkerManager::new(manager.clone());
//! workers.start(&[]).await?;
//! workers.wait_for_shutdown_signal().await?;
//! ```

pub mod backoff;
pub mod closure;
pub mod composition;
pub mod connection;
pub mod crypto;
pub mod definition;
pub mod di;
pub mod discovery;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod scheduler;
pub mod worker;

pub use backoff::{Backoff, BackoffKind};
pub use closure::{
    Closure, ClosureCodec, ClosureContext, ClosureJob, ClosureRegistry, SerializedClosure,
    CLOSURE_JOB_NAME,
};
pub use composition::{BulkBatch, Chain, DispatchedFlow, FlowBuilder, FlowChildren};
pub use connection::{ConnectionManager, ConnectionRole};
pub use crypto::PayloadCipher;
pub use definition::{ErasedJob, JobDefinition};
pub use di::{JobsInterface, JobsService, QueueOverview};
pub use discovery::{JobDiscoverer, JobRegistry, JobSource};
pub use dispatcher::{DispatchedJob, JobDispatcher};
pub use engine::{
    cron_expressions, EngineEvent, JobCounts, JobHandle, JobRecord, JobState, MemoryQueueEngine,
    QueueEngine, RepeatSpec,
};
pub use error::{DuplicateGroup, JobError, JobResult};
pub use events::{JobEvent, NotificationBus};
pub use job::{Job, JobContext, JobId};
pub use manager::QueueManager;
pub use metrics::{register_metrics, JobMetrics, SchedulerMetrics, WorkerMetrics};
pub use options::{JobOptions, Priority, RemovalPolicy};
pub use scheduler::{JobScheduler, ScheduleEntry};
pub use worker::{shutdown_signal, WorkerManager, WorkerState, WorkerStats};

/// Re-export commonly used traits
pub mod prelude {
    pub use crate::engine::{MemoryQueueEngine, QueueEngine, RepeatSpec};
    pub use crate::job::Job;
    pub use crate::options::{JobOptions, Priority};
    pub use crate::{
        ClosureRegistry, JobContext, JobError, JobId, JobResult, JobScheduler, JobSource,
        QueueManager, WorkerManager,
    };
}
