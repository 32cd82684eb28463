//! Single-job dispatch builder and completion waiting.

use crate::composition::FlowBuilder;
use crate::definition::JobDefinition;
use crate::engine::{EngineEvent, EngineEventStream, EnqueueRequest, FlowNode, JobHandle, JobRecord, JobState, QueueEngine};
use crate::error::{JobError, JobResult};
use crate::events::JobEvent;
use crate::job::JobId;
use crate::manager::QueueManager;
use crate::metrics::JobMetrics;
use crate::options::{JobOptions, Priority};
use futures::StreamExt;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Builder for one job submission.
///
/// `dispatch` consumes the builder, so a job is submitted at most once.
#[derive(Debug)]
pub struct JobDispatcher {
    manager: QueueManager,
    definition: Arc<JobDefinition>,
    data: Value,
    queue: Option<String>,
    overrides: Map<String, Value>,
    /// Set when `with_options` could not be applied; reported at dispatch.
    rejected: Option<String>,
    children: Vec<JobDispatcher>,
}

impl JobDispatcher {
    pub(crate) fn new(manager: QueueManager, definition: Arc<JobDefinition>, data: Value) -> Self {
        Self {
            manager,
            definition,
            data,
            queue: None,
            overrides: Map::new(),
            rejected: None,
            children: Vec::new(),
        }
    }

    /// Sends the job to `queue` instead of its default.
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Overrides one engine option. Unknown keys fail at dispatch.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.overrides.insert(key.into(), value.into());
        self
    }

    /// Overrides every option set in `options`. Failures surface at dispatch.
    pub fn with_options(mut self, options: &JobOptions) -> Self {
        match serde_json::to_value(options) {
            Ok(Value::Object(map)) => self.overrides.extend(map),
            Ok(other) => {
                self.rejected = Some(format!("job options must serialize to an object, got {}", other));
            }
            Err(e) => {
                self.rejected = Some(format!("job options are not serializable: {}", e));
            }
        }
        self
    }

    /// Sets the attempt count.
    pub fn attempts(self, attempts: u32) -> Self {
        self.with_option("attempts", attempts)
    }

    /// Delays the first run.
    pub fn delay(self, delay: Duration) -> Self {
        self.with_option("delay_ms", delay.as_millis() as u64)
    }

    /// Sets the priority.
    pub fn priority(self, priority: Priority) -> Self {
        self.with_option("priority", i8::from(priority))
    }

    /// Sets a caller-chosen job id.
    pub fn job_id(self, id: impl Into<String>) -> Self {
        self.with_option("job_id", id.into())
    }

    /// Adds children that must complete before this job runs.
    pub fn add_children(mut self, children: Vec<JobDispatcher>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    pub fn children(&self) -> &[JobDispatcher] {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// This job plus all of its descendants.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(JobDispatcher::node_count)
            .sum::<usize>()
    }

    pub(crate) fn manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Queue this job will be sent to.
    pub fn resolve_queue(&self) -> JobResult<String> {
        self.manager
            .resolve_queue(self.queue.as_deref(), &self.definition)
    }

    /// Queue defaults, then job defaults, then overrides.
    pub fn resolve_options(&self, queue: &str) -> JobResult<JobOptions> {
        if let Some(reason) = &self.rejected {
            return Err(JobError::Configuration(reason.clone()));
        }

        let mut options = self
            .manager
            .queue_defaults(queue)
            .merge(self.definition.default_options());

        for (key, value) in &self.overrides {
            options.set(key, value.clone())?;
        }
        Ok(options)
    }

    fn payload(&self) -> JobResult<Value> {
        if self.definition.is_encrypted() {
            self.manager.cipher().encrypt(&self.data)
        } else {
            Ok(self.data.clone())
        }
    }

    /// Engine request for this job alone, ignoring children.
    pub fn to_request(&self) -> JobResult<EnqueueRequest> {
        let queue = self.resolve_queue()?;
        let options = self.resolve_options(&queue)?;
        Ok(EnqueueRequest {
            name: self.definition.name().to_string(),
            data: self.payload()?,
            queue,
            options,
        })
    }

    /// Engine flow node for this job and its children.
    pub fn to_flow_node(&self) -> JobResult<FlowNode> {
        let EnqueueRequest {
            name,
            queue,
            data,
            options,
        } = self.to_request()?;

        Ok(FlowNode {
            name,
            queue,
            data,
            options,
            children: self
                .children
                .iter()
                .map(JobDispatcher::to_flow_node)
                .collect::<JobResult<_>>()?,
        })
    }

    /// Submits the job. With children, the whole tree goes in as a flow.
    pub async fn dispatch(self) -> JobResult<DispatchedJob> {
        if self.has_children() {
            let flow = FlowBuilder::new(self).dispatch().await?;
            return Ok(flow.into_root());
        }

        let request = self.to_request()?;
        let engine = self.manager.engine().clone();
        let handle = engine.enqueue(request).await?;

        JobMetrics::job_dispatched(&handle.queue, 1);
        debug!(job.name = %handle.name, job.id = %handle.id, queue = %handle.queue, "Job dispatched");
        self.manager.bus().emit(JobEvent::Dispatched(handle.clone()));

        Ok(DispatchedJob::new(handle, engine))
    }

    /// Submits the job and waits for its return value.
    ///
    /// The event subscription is opened before submission so a fast worker
    /// cannot finish the job unseen.
    pub async fn wait_result(self) -> JobResult<Value> {
        let queue = self.resolve_queue()?;
        let engine = self.manager.engine().clone();
        let events = engine.subscribe_events(&queue).await?;

        let dispatched = self.dispatch().await?;
        wait_for_finish(engine.as_ref(), dispatched.handle(), events).await
    }
}

/// A job accepted by the engine.
#[derive(Clone)]
pub struct DispatchedJob {
    handle: JobHandle,
    engine: Arc<dyn QueueEngine>,
}

impl std::fmt::Debug for DispatchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchedJob")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DispatchedJob {
    pub(crate) fn new(handle: JobHandle, engine: Arc<dyn QueueEngine>) -> Self {
        Self { handle, engine }
    }

    pub fn id(&self) -> &JobId {
        &self.handle.id
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn queue(&self) -> &str {
        &self.handle.queue
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Current engine record.
    pub async fn record(&self) -> JobResult<Option<JobRecord>> {
        self.engine.get_job(&self.handle.queue, &self.handle.id).await
    }

    /// Waits until the job completes or fails for good.
    pub async fn wait_until_finished(&self) -> JobResult<Value> {
        let events = self.engine.subscribe_events(&self.handle.queue).await?;
        wait_for_finish(self.engine.as_ref(), &self.handle, events).await
    }

    /// Like [`DispatchedJob::wait_until_finished`], bounded by `timeout`.
    pub async fn wait_until_finished_timeout(&self, timeout: Duration) -> JobResult<Value> {
        tokio::time::timeout(timeout, self.wait_until_finished())
            .await
            .map_err(|_| {
                JobError::Engine(format!(
                    "job {} did not finish within {:?}",
                    self.handle.id, timeout
                ))
            })?
    }
}

fn finished_result(record: &JobRecord) -> Option<JobResult<Value>> {
    match record.state {
        JobState::Completed => Some(Ok(record.return_value.clone().unwrap_or(Value::Null))),
        JobState::Failed => Some(Err(JobError::JobFailed {
            job_id: record.id.to_string(),
            reason: record.failed_reason.clone().unwrap_or_default(),
        })),
        _ => None,
    }
}

/// Resolves once `handle` completes or fails terminally.
///
/// `events` must be subscribed before the current state is read.
pub(crate) async fn wait_for_finish(
    engine: &dyn QueueEngine,
    handle: &JobHandle,
    mut events: EngineEventStream,
) -> JobResult<Value> {
    if let Some(record) = engine.get_job(&handle.queue, &handle.id).await? {
        if let Some(result) = finished_result(&record) {
            return result;
        }
    }

    while let Some(event) = events.next().await {
        match event {
            EngineEvent::Completed {
                job_id,
                return_value,
            } if job_id == handle.id => return Ok(return_value),
            EngineEvent::Failed {
                job_id,
                reason,
                terminal: true,
            } if job_id == handle.id => {
                return Err(JobError::JobFailed {
                    job_id: job_id.to_string(),
                    reason,
                })
            }
            _ => {}
        }
    }

    Err(JobError::Engine(format!(
        "event stream for queue '{}' closed before job {} finished",
        handle.queue, handle.id
    )))
}
