//! Independent jobs submitted in one engine call.

use crate::dispatcher::{DispatchedJob, JobDispatcher};
use crate::engine::EnqueueRequest;
use crate::error::{JobError, JobResult};
use crate::events::JobEvent;
use crate::manager::QueueManager;
use crate::metrics::JobMetrics;
use tracing::debug;

/// A batch of unrelated jobs.
#[derive(Debug)]
pub struct BulkBatch {
    manager: QueueManager,
    jobs: Vec<JobDispatcher>,
}

impl BulkBatch {
    pub(crate) fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            jobs: Vec::new(),
        }
    }

    /// Adds a job.
    pub fn add(mut self, job: JobDispatcher) -> Self {
        self.jobs.push(job);
        self
    }

    /// Adds several jobs.
    pub fn extend(mut self, jobs: impl IntoIterator<Item = JobDispatcher>) -> Self {
        self.jobs.extend(jobs);
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Engine requests for every member. Members with children are rejected.
    pub fn to_requests(&self) -> JobResult<Vec<EnqueueRequest>> {
        self.jobs
            .iter()
            .map(|job| {
                if job.has_children() {
                    return Err(JobError::Configuration(format!(
                        "bulk member '{}' cannot carry children; dispatch it as a flow",
                        job.name()
                    )));
                }
                job.to_request()
            })
            .collect()
    }

    /// Submits every job. An empty batch submits nothing and emits nothing.
    pub async fn dispatch(self) -> JobResult<Vec<DispatchedJob>> {
        if self.jobs.is_empty() {
            return Ok(Vec::new());
        }

        let requests = self.to_requests()?;
        let engine = self.manager.engine().clone();
        let handles = engine.add_bulk(requests).await?;

        for handle in &handles {
            JobMetrics::job_dispatched(&handle.queue, 1);
        }
        debug!(count = handles.len(), "Bulk batch dispatched");
        self.manager
            .bus()
            .emit(JobEvent::DispatchedMany(handles.clone()));

        Ok(handles
            .into_iter()
            .map(|handle| DispatchedJob::new(handle, engine.clone()))
            .collect())
    }
}
