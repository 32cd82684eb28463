//! Multi-job compositions: chains, flows and bulk batches.

mod bulk;
mod chain;
mod flow;

pub use bulk::BulkBatch;
pub use chain::Chain;
pub use flow::{FlowBuilder, FlowChildren};

use crate::dispatcher::DispatchedJob;
use crate::engine::FlowHandle;
use crate::error::JobResult;
use serde_json::Value;

/// A chain or flow accepted by the engine.
#[derive(Debug, Clone)]
pub struct DispatchedFlow {
    root: DispatchedJob,
    tree: FlowHandle,
}

impl DispatchedFlow {
    pub(crate) fn new(root: DispatchedJob, tree: FlowHandle) -> Self {
        Self { root, tree }
    }

    /// The root job, which runs last.
    pub fn root(&self) -> &DispatchedJob {
        &self.root
    }

    pub fn into_root(self) -> DispatchedJob {
        self.root
    }

    /// Handles for every job, shaped like the submitted tree.
    pub fn tree(&self) -> &FlowHandle {
        &self.tree
    }

    /// Number of jobs submitted.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Waits for the root job, and so for the whole flow.
    pub async fn wait_until_finished(&self) -> JobResult<Value> {
        self.root.wait_until_finished().await
    }
}
