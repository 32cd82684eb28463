//! Queue engine abstraction.
//!
//! The engine owns persistence, locking, retries and parent/child
//! bookkeeping. This crate only talks to it through [`QueueEngine`].

mod memory;
mod repeat;

pub use memory::MemoryQueueEngine;
pub use repeat::{cron_expressions, normalize_cron, RepeatSpec, MAX_INTERVAL};

use crate::error::JobResult;
use crate::job::JobId;
use crate::options::JobOptions;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A single job submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub name: String,
    pub queue: String,
    pub data: Value,
    pub options: JobOptions,
}

/// Node of a job tree. Children complete before their parent runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub name: String,
    pub queue: String,
    pub data: Value,
    pub options: JobOptions,
    #[serde(default)]
    pub children: Vec<FlowNode>,
}

impl FlowNode {
    /// Number of nodes in this tree.
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(FlowNode::node_count).sum::<usize>()
    }

    /// Number of parent/child edges in this tree.
    pub fn edge_count(&self) -> usize {
        self.node_count() - 1
    }

    /// Length of the longest root-to-leaf path, counting nodes.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(FlowNode::depth).max().unwrap_or(0)
    }

    /// Job names in depth-first pre-order.
    pub fn names(&self) -> Vec<&str> {
        let mut names = vec![self.name.as_str()];
        for child in &self.children {
            names.extend(child.names());
        }
        names
    }
}

/// Identity of a job accepted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub name: String,
    pub queue: String,
}

/// Handles for every node of an added flow, mirroring its shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowHandle {
    pub job: JobHandle,
    pub children: Vec<FlowHandle>,
}

impl FlowHandle {
    /// Number of jobs in this flow.
    pub fn len(&self) -> usize {
        1 + self.children.iter().map(FlowHandle::len).sum::<usize>()
    }

    /// Flows always hold at least their root.
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Lifecycle state of a job inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    WaitingChildren,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// Returns true for completed or failed jobs.
    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Reference from a flow child to its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: JobId,
    pub queue: String,
}

/// A job as stored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub name: String,
    pub queue: String,
    pub data: Value,
    pub options: JobOptions,
    pub state: JobState,

    /// Failed attempts recorded so far.
    pub attempts_made: u32,

    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub parent: Option<ParentRef>,
    pub created_at: DateTime<Utc>,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Maximum attempts configured for this job.
    pub fn max_attempts(&self) -> u32 {
        self.options.max_attempts()
    }

    /// Returns true if the job is completed or failed.
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Identity of this job.
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id.clone(),
            name: self.name.clone(),
            queue: self.queue.clone(),
        }
    }
}

/// A stored flow with current job states.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowTree {
    pub job: JobRecord,
    pub children: Vec<FlowTree>,
}

/// Events the engine publishes per queue.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Waiting { job_id: JobId },
    Active { job_id: JobId },
    Completed { job_id: JobId, return_value: Value },
    /// `terminal` is false when the job will be retried.
    Failed { job_id: JobId, reason: String, terminal: bool },
    Paused,
    Resumed,
}

impl EngineEvent {
    /// Job the event refers to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            EngineEvent::Waiting { job_id }
            | EngineEvent::Active { job_id }
            | EngineEvent::Completed { job_id, .. }
            | EngineEvent::Failed { job_id, .. } => Some(job_id),
            EngineEvent::Paused | EngineEvent::Resumed => None,
        }
    }
}

/// Stream of engine events for one queue.
pub type EngineEventStream = BoxStream<'static, EngineEvent>;

/// Job enqueued each time a repeatable entry fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatTemplate {
    pub name: String,
    pub data: Value,
    pub options: JobOptions,
}

/// A repeatable entry as stored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepeatableEntry {
    pub key: String,
    pub queue: String,
    pub repeat: RepeatSpec,
    pub template: RepeatTemplate,
    pub next_run: Option<DateTime<Utc>>,
}

/// Job counts per state for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub waiting_children: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Jobs not yet finished.
    pub fn pending(&self) -> u64 {
        self.waiting + self.waiting_children + self.delayed + self.active
    }
}

/// What the engine did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Job goes back to the queue after `delay`.
    Retrying { delay: Duration },
    /// Job is terminally failed.
    Failed,
}

/// Queue engine contract.
///
/// Implementations must be safe to share between dispatchers, workers and
/// schedulers.
#[async_trait]
pub trait QueueEngine: Send + Sync + 'static {
    /// Adds a single job.
    async fn enqueue(&self, request: EnqueueRequest) -> JobResult<JobHandle>;

    /// Adds a job tree atomically.
    async fn add_flow(&self, root: FlowNode) -> JobResult<FlowHandle>;

    /// Adds independent jobs in one call.
    async fn add_bulk(&self, requests: Vec<EnqueueRequest>) -> JobResult<Vec<JobHandle>>;

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>>;

    async fn get_flow(&self, queue: &str, id: &JobId) -> JobResult<Option<FlowTree>>;

    /// Subscribes to events of one queue.
    async fn subscribe_events(&self, queue: &str) -> JobResult<EngineEventStream>;

    async fn get_repeatable_jobs(&self, queue: &str) -> JobResult<Vec<RepeatableEntry>>;

    /// Creates or replaces the repeatable entry stored under `key`.
    async fn upsert_repeatable(
        &self,
        queue: &str,
        key: &str,
        repeat: RepeatSpec,
        template: RepeatTemplate,
    ) -> JobResult<RepeatableEntry>;

    /// Returns true if an entry was removed.
    async fn remove_repeatable(&self, queue: &str, key: &str) -> JobResult<bool>;

    async fn job_counts(&self, queue: &str) -> JobResult<JobCounts>;

    /// Removes up to `limit` jobs in `state` older than `grace`. Zero means no limit.
    async fn clean(&self, queue: &str, grace: Duration, limit: usize, state: JobState)
        -> JobResult<u64>;

    async fn pause(&self, queue: &str) -> JobResult<()>;

    async fn resume(&self, queue: &str) -> JobResult<()>;

    /// Sets the cross-worker concurrency cap, or clears it with `None`.
    async fn set_global_concurrency(&self, queue: &str, limit: Option<usize>) -> JobResult<()>;

    /// Locks the next available job with `token`, waiting up to `block`.
    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        block: Duration,
    ) -> JobResult<Option<JobRecord>>;

    /// Marks a locked job completed.
    async fn complete(&self, job: &JobRecord, token: &str, return_value: Value) -> JobResult<()>;

    /// Records a failed attempt; `retry` false forces a terminal failure.
    async fn fail(
        &self,
        job: &JobRecord,
        token: &str,
        reason: &str,
        retry: bool,
    ) -> JobResult<FailOutcome>;
}
