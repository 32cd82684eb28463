//! Queue manager: the entry point for dispatching and composing jobs.

use crate::closure::{ClosureCodec, ClosureRegistry, CLOSURE_JOB_NAME};
use crate::composition::{BulkBatch, Chain, FlowBuilder};
use crate::crypto::PayloadCipher;
use crate::definition::JobDefinition;
use crate::discovery::{JobDiscoverer, JobRegistry, JobSource};
use crate::dispatcher::JobDispatcher;
use crate::engine::QueueEngine;
use crate::error::{JobError, JobResult};
use crate::events::{JobEvent, NotificationBus};
use crate::job::Job;
use crate::options::JobOptions;
use hopper_config::{HopperConfig, QueueSettings};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

struct ManagerInner {
    config: HopperConfig,
    engine: Arc<dyn QueueEngine>,
    registry: Arc<JobRegistry>,
    cipher: PayloadCipher,
    codec: Arc<ClosureCodec>,
    bus: NotificationBus,
    queue_defaults: HashMap<String, JobOptions>,
}

/// Shared handle over configuration, engine and job registry.
///
/// Cheap to clone; every clone sees the same notification bus.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.inner.config.queue.names())
            .field("jobs", &self.inner.registry.names())
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    /// Creates a manager over an already built registry.
    ///
    /// The configuration is validated here; any problem aborts startup.
    pub fn new(
        config: HopperConfig,
        engine: Arc<dyn QueueEngine>,
        registry: JobRegistry,
    ) -> JobResult<Self> {
        hopper_config::validate(&config)?;

        let queue_defaults = config
            .queue
            .queues
            .iter()
            .map(|(name, options)| {
                JobOptions::from_map(&options.default_job_options)
                    .map(|defaults| (name.clone(), defaults))
                    .map_err(|e| {
                        JobError::Configuration(format!("queue '{}': {}", name, e))
                    })
            })
            .collect::<JobResult<HashMap<_, _>>>()?;

        info!(
            queues = ?config.queue.names(),
            jobs = registry.len(),
            "Queue manager ready"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                cipher: PayloadCipher::new(&config.app.key),
                codec: Arc::new(ClosureCodec::new(&config.app.key)),
                config,
                engine,
                registry: Arc::new(registry),
                bus: NotificationBus::default(),
                queue_defaults,
            }),
        })
    }

    /// Discovers jobs from `sources` plus the built-in closure job, then
    /// creates the manager.
    pub fn bootstrap(
        config: HopperConfig,
        engine: Arc<dyn QueueEngine>,
        sources: Vec<JobSource>,
        closures: ClosureRegistry,
    ) -> JobResult<Self> {
        let codec = Arc::new(ClosureCodec::new(&config.app.key));
        let discoverer = sources
            .into_iter()
            .fold(JobDiscoverer::new(config.app.root.clone()), JobDiscoverer::add_source)
            .with_closures(codec, Arc::new(closures));

        let registry = discoverer.discover()?;
        Self::new(config, engine, registry)
    }

    pub fn config(&self) -> &HopperConfig {
        &self.inner.config
    }

    pub fn queue_settings(&self) -> &QueueSettings {
        &self.inner.config.queue
    }

    pub fn engine(&self) -> &Arc<dyn QueueEngine> {
        &self.inner.engine
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn cipher(&self) -> &PayloadCipher {
        &self.inner.cipher
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.inner.bus
    }

    /// Subscribes to job notifications.
    pub fn events(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.bus.subscribe()
    }

    /// Declared queue names, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        self.inner.config.queue.names()
    }

    /// Picks the queue for a job: explicit name, then the job's own default,
    /// then the configured default. The result must be declared.
    pub fn resolve_queue(
        &self,
        explicit: Option<&str>,
        definition: &JobDefinition,
    ) -> JobResult<String> {
        let queues = &self.inner.config.queue;
        let queue = explicit
            .or(definition.default_queue())
            .unwrap_or(queues.default_queue.as_str());

        if !queues.contains(queue) {
            return Err(JobError::Configuration(format!(
                "queue '{}' for job '{}' is not declared in the queue catalogue",
                queue,
                definition.name()
            )));
        }
        Ok(queue.to_string())
    }

    /// Default job options configured for `queue`.
    pub fn queue_defaults(&self, queue: &str) -> JobOptions {
        self.inner
            .queue_defaults
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Local concurrency for `queue`.
    pub fn queue_concurrency(&self, queue: &str) -> usize {
        self.inner
            .config
            .queue
            .options(queue)
            .and_then(|options| options.concurrency)
            .unwrap_or(self.inner.config.worker.concurrency)
            .max(1)
    }

    /// Cross-worker concurrency cap for `queue`, if configured.
    pub fn queue_global_concurrency(&self, queue: &str) -> Option<usize> {
        self.inner
            .config
            .queue
            .options(queue)
            .and_then(|options| options.global_concurrency)
    }

    /// Starts building a dispatch of `J` with `data`.
    pub fn dispatch<J: Job>(&self, data: J::Data) -> JobResult<JobDispatcher> {
        let definition = self.inner.registry.resolve_job::<J>()?;
        let data = serde_json::to_value(data)?;
        Ok(JobDispatcher::new(self.clone(), definition, data))
    }

    /// Starts building a dispatch of the job registered as `name`.
    pub fn dispatch_named(&self, name: &str, data: Value) -> JobResult<JobDispatcher> {
        let definition = self.inner.registry.resolve(name)?;
        Ok(JobDispatcher::new(self.clone(), definition, data))
    }

    /// Starts building a dispatch of the closure registered as `operation`.
    pub fn closure(&self, operation: &str, args: Vec<Value>) -> JobResult<JobDispatcher> {
        let payload = self.inner.codec.serialize(operation, args)?;
        self.dispatch_named(CLOSURE_JOB_NAME, serde_json::to_value(payload)?)
    }

    /// Starts an empty chain.
    pub fn chain(&self) -> Chain {
        Chain::new(self.clone())
    }

    /// Starts a flow rooted at `root`.
    pub fn flow(&self, root: JobDispatcher) -> FlowBuilder {
        FlowBuilder::new(root)
    }

    /// Starts an empty bulk batch.
    pub fn bulk(&self) -> BulkBatch {
        BulkBatch::new(self.clone())
    }
}
