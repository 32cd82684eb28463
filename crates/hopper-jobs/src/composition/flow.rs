//! Parent/child job trees.

use super::DispatchedFlow;
use crate::dispatcher::{DispatchedJob, JobDispatcher};
use crate::engine::FlowNode;
use crate::error::JobResult;
use crate::events::JobEvent;
use crate::manager::QueueManager;
use crate::metrics::JobMetrics;
use tracing::debug;

#[derive(Debug)]
struct FlowEntry {
    job: JobDispatcher,
    children: Vec<FlowEntry>,
}

impl FlowEntry {
    fn leaf(job: JobDispatcher) -> Self {
        Self {
            job,
            children: Vec::new(),
        }
    }

    fn node_count(&self) -> usize {
        self.job.node_count() + self.children.iter().map(FlowEntry::node_count).sum::<usize>()
    }

    fn to_flow_node(&self) -> JobResult<FlowNode> {
        let mut node = self.job.to_flow_node()?;
        for child in &self.children {
            node.children.push(child.to_flow_node()?);
        }
        Ok(node)
    }
}

/// Children of one flow node, filled inside `add_child_job` callbacks.
#[derive(Debug, Default)]
pub struct FlowChildren {
    entries: Vec<FlowEntry>,
}

impl FlowChildren {
    /// Adds a child with no children of its own.
    pub fn add_child(&mut self, job: JobDispatcher) -> &mut Self {
        self.entries.push(FlowEntry::leaf(job));
        self
    }

    /// Adds a child and lets `configure` add its children.
    pub fn add_child_job(
        &mut self,
        job: JobDispatcher,
        configure: impl FnOnce(&mut FlowChildren),
    ) -> &mut Self {
        let mut nested = FlowChildren::default();
        configure(&mut nested);
        self.entries.push(FlowEntry {
            job,
            children: nested.entries,
        });
        self
    }
}

/// Builds a job tree where every parent runs after all of its children.
#[derive(Debug)]
pub struct FlowBuilder {
    root: FlowEntry,
}

impl FlowBuilder {
    /// Starts a flow rooted at `root`. Children already attached to `root`
    /// with `add_children` are kept.
    pub fn new(root: JobDispatcher) -> Self {
        Self {
            root: FlowEntry::leaf(root),
        }
    }

    /// Adds a direct child of the root.
    pub fn add_child(mut self, job: JobDispatcher) -> Self {
        self.root.children.push(FlowEntry::leaf(job));
        self
    }

    /// Adds a direct child of the root and lets `configure` add its children.
    pub fn add_child_job(
        mut self,
        job: JobDispatcher,
        configure: impl FnOnce(&mut FlowChildren),
    ) -> Self {
        let mut nested = FlowChildren::default();
        configure(&mut nested);
        self.root.children.push(FlowEntry {
            job,
            children: nested.entries,
        });
        self
    }

    /// Number of jobs in the tree.
    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// Projects the tree onto engine flow nodes.
    pub fn to_flow_node(&self) -> JobResult<FlowNode> {
        self.root.to_flow_node()
    }

    fn manager(&self) -> &QueueManager {
        self.root.job.manager()
    }

    /// Submits the whole tree in one engine call.
    pub async fn dispatch(self) -> JobResult<DispatchedFlow> {
        let node = self.to_flow_node()?;
        let manager = self.manager().clone();
        let engine = manager.engine().clone();
        let tree = engine.add_flow(node).await?;

        JobMetrics::job_dispatched(&tree.job.queue, tree.len());
        debug!(root = %tree.job.id, jobs = tree.len(), "Flow dispatched");
        manager.bus().emit(JobEvent::DispatchedFlow(tree.clone()));

        let root = DispatchedJob::new(tree.job.clone(), engine);
        Ok(DispatchedFlow::new(root, tree))
    }
}
