//! Sequential job chains.

use super::DispatchedFlow;
use crate::dispatcher::{DispatchedJob, JobDispatcher};
use crate::engine::FlowNode;
use crate::error::{JobError, JobResult};
use crate::events::JobEvent;
use crate::manager::QueueManager;
use crate::metrics::JobMetrics;
use tracing::debug;

/// Jobs that run one after another, in insertion order.
///
/// Submitted as a flow in which every job is the only child of the job
/// added after it, so the first job added is the first to run. This nests
/// job *i* under job *i+1*, the reverse of nesting *i+1* under *i*, since
/// the engine runs children before their parent.
#[derive(Debug)]
pub struct Chain {
    manager: QueueManager,
    jobs: Vec<JobDispatcher>,
}

impl Chain {
    pub(crate) fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            jobs: Vec::new(),
        }
    }

    /// Appends a job.
    pub fn add(mut self, job: JobDispatcher) -> Self {
        self.jobs.push(job);
        self
    }

    /// Appends several jobs.
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

    /// Folds the chain into a flow tree. `None` when empty.
    pub fn to_flow_node(&self) -> JobResult<Option<FlowNode>> {
        let mut tree: Option<FlowNode> = None;

        for job in &self.jobs {
            if job.has_children() {
                return Err(JobError::Configuration(format!(
                    "chained job '{}' cannot carry its own children",
                    job.name()
                )));
            }

            let mut node = job.to_flow_node()?;
            node.children.extend(tree.take());
            tree = Some(node);
        }

        Ok(tree)
    }

    /// Submits the chain. An empty chain submits nothing and returns `None`.
    pub async fn dispatch(self) -> JobResult<Option<DispatchedFlow>> {
        let Some(root) = self.to_flow_node()? else {
            return Ok(None);
        };

        let engine = self.manager.engine().clone();
        let tree = engine.add_flow(root).await?;

        JobMetrics::job_dispatched(&tree.job.queue, tree.len());
        debug!(root = %tree.job.id, jobs = tree.len(), "Chain dispatched");
        self.manager
            .bus()
            .emit(JobEvent::DispatchedChain(tree.clone()));

        let root = DispatchedJob::new(tree.job.clone(), engine);
        Ok(Some(DispatchedFlow::new(root, tree)))
    }
}
