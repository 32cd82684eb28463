//! Application-level job notifications.

use crate::engine::{FlowHandle, JobHandle};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Notification published by dispatchers and workers.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// A single job was enqueued.
    Dispatched(JobHandle),
    /// A bulk batch was enqueued.
    DispatchedMany(Vec<JobHandle>),
    /// A chain was enqueued.
    DispatchedChain(FlowHandle),
    /// A flow was enqueued.
    DispatchedFlow(FlowHandle),
    /// A worker is about to run the job.
    Started(JobHandle),
    /// The job finished successfully.
    Success { job: JobHandle, result: Value },
    /// An attempt failed. Emitted on every failed attempt.
    Error {
        job: JobHandle,
        error: String,
        attempt: u32,
    },
    /// The job failed for good.
    Failed {
        job: JobHandle,
        error: String,
        attempts: u32,
    },
}

impl JobEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Dispatched(_) => "job:dispatched",
            JobEvent::DispatchedMany(_) => "job:dispatched:many",
            JobEvent::DispatchedChain(_) => "job:dispatched:chain",
            JobEvent::DispatchedFlow(_) => "job:dispatched:flow",
            JobEvent::Started(_) => "job:started",
            JobEvent::Success { .. } => "job:success",
            JobEvent::Error { .. } => "job:error",
            JobEvent::Failed { .. } => "job:failed",
        }
    }

    /// Job the event is about, for single-job events.
    pub fn job(&self) -> Option<&JobHandle> {
        match self {
            JobEvent::Dispatched(job)
            | JobEvent::Started(job)
            | JobEvent::Success { job, .. }
            | JobEvent::Error { job, .. }
            | JobEvent::Failed { job, .. } => Some(job),
            JobEvent::DispatchedChain(flow) | JobEvent::DispatchedFlow(flow) => Some(&flow.job),
            JobEvent::DispatchedMany(_) => None,
        }
    }
}

/// Fan-out bus for [`JobEvent`]s. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<JobEvent>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationBus {
    /// Creates a bus buffering up to `capacity` events per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn emit(&self, event: JobEvent) {
        trace!(event = event.name(), "Publishing job event");
        let _ = self.sender.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    fn handle() -> JobHandle {
        JobHandle {
            id: JobId::from("1"),
            name: "SendEmail".to_string(),
            queue: "emails".to_string(),
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(JobEvent::Dispatched(handle()).name(), "job:dispatched");
        assert_eq!(JobEvent::DispatchedMany(vec![]).name(), "job:dispatched:many");
        assert_eq!(
            JobEvent::Failed {
                job: handle(),
                error: "x".into(),
                attempts: 3
            }
            .name(),
            "job:failed"
        );
    }

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let bus = NotificationBus::default();
        let mut rx = bus.subscribe();
        bus.emit(JobEvent::Started(handle()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, JobEvent::Started(handle()));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = NotificationBus::new(4);
        bus.emit(JobEvent::Started(handle()));
    }
}
