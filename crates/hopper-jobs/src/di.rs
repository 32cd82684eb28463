//! Dependency injection interfaces for the jobs module.
//!
//! Groups the operations a host application exposes (CLI, dashboard,
//! RPC) behind one Shaku-compatible component.

use crate::connection::{ConnectionManager, ConnectionRole};
use crate::definition::JobDefinition;
use crate::engine::{JobCounts, JobHandle, JobRecord, JobState, RepeatSpec};
use crate::error::{JobError, JobResult};
use crate::job::JobId;
use crate::manager::QueueManager;
use crate::scheduler::{JobScheduler, ScheduleEntry};
use crate::worker::{WorkerManager, WorkerState, WorkerStats};
use async_trait::async_trait;
use hopper_core::Interface;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of one queue for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOverview {
    pub name: String,
    pub counts: JobCounts,
    pub concurrency: usize,
    pub global_concurrency: Option<usize>,
    pub worker: WorkerState,
    pub stats: Option<WorkerStats>,
}

/// Interface for job orchestration.
#[async_trait]
pub trait JobsInterface: Interface + Send + Sync {
    fn manager(&self) -> &QueueManager;

    fn scheduler(&self) -> &JobScheduler;

    fn workers(&self) -> &WorkerManager;

    /// Looks up a registered job type.
    fn resolve(&self, name: &str) -> JobResult<Arc<JobDefinition>>;

    /// Dispatches the job registered as `name`.
    async fn dispatch(&self, name: &str, data: Value, queue: Option<&str>) -> JobResult<JobHandle>;

    async fn schedule(
        &self,
        key: &str,
        name: &str,
        data: Value,
        repeat: RepeatSpec,
        queue: Option<&str>,
    ) -> JobResult<ScheduleEntry>;

    async fn list_schedules(&self, queues: Option<&[String]>) -> JobResult<Vec<ScheduleEntry>>;

    async fn remove_schedule(&self, key: &str) -> JobResult<bool>;

    /// Starts workers; every declared queue when `queues` is empty.
    async fn start_workers(&self, queues: &[String]) -> JobResult<()>;

    async fn stop_workers(&self, force: bool) -> JobResult<()>;

    fn list_queues(&self) -> Vec<String>;

    /// Counts and worker state for every declared queue.
    async fn queue_overview(&self) -> JobResult<Vec<QueueOverview>>;

    async fn pause(&self, queue: &str) -> JobResult<()>;

    async fn resume(&self, queue: &str) -> JobResult<()>;

    /// Removes finished jobs older than `grace`. Returns how many went.
    async fn clean(&self, queue: &str, grace: Duration, limit: usize, state: JobState)
        -> JobResult<u64>;

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>>;

    /// Pings the engine connection when one is configured.
    async fn health_check(&self) -> JobResult<()>;
}

/// Job orchestration service implementation.
pub struct JobsService {
    manager: QueueManager,
    workers: Arc<WorkerManager>,
    scheduler: JobScheduler,
    connections: Option<ConnectionManager>,
}

impl JobsService {
    pub fn new(manager: QueueManager) -> Self {
        Self {
            workers: Arc::new(WorkerManager::new(manager.clone())),
            scheduler: JobScheduler::new(manager.clone()),
            manager,
            connections: None,
        }
    }

    /// Attaches the connection pools used for health checks.
    pub fn with_connections(mut self, connections: ConnectionManager) -> Self {
        self.connections = Some(connections);
        self
    }

    fn declared(&self, queue: &str) -> JobResult<()> {
        if self.manager.queue_settings().contains(queue) {
            Ok(())
        } else {
            Err(JobError::Configuration(format!(
                "queue '{}' is not declared in the queue catalogue",
                queue
            )))
        }
    }
}

#[async_trait]
impl JobsInterface for JobsService {
    fn manager(&self) -> &QueueManager {
        &self.manager
    }

    fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    fn workers(&self) -> &WorkerManager {
        &self.workers
    }

    fn resolve(&self, name: &str) -> JobResult<Arc<JobDefinition>> {
        self.manager.registry().resolve(name)
    }

    async fn dispatch(&self, name: &str, data: Value, queue: Option<&str>) -> JobResult<JobHandle> {
        let mut dispatcher = self.manager.dispatch_named(name, data)?;
        if let Some(queue) = queue {
            dispatcher = dispatcher.on_queue(queue);
        }
        Ok(dispatcher.dispatch().await?.handle().clone())
    }

    async fn schedule(
        &self,
        key: &str,
        name: &str,
        data: Value,
        repeat: RepeatSpec,
        queue: Option<&str>,
    ) -> JobResult<ScheduleEntry> {
        self.scheduler
            .schedule_named(key, name, data, repeat, queue)
            .await
    }

    async fn list_schedules(&self, queues: Option<&[String]>) -> JobResult<Vec<ScheduleEntry>> {
        self.scheduler.list(queues).await
    }

    async fn remove_schedule(&self, key: &str) -> JobResult<bool> {
        self.scheduler.remove(key).await
    }

    async fn start_workers(&self, queues: &[String]) -> JobResult<()> {
        self.workers.start(queues).await
    }

    async fn stop_workers(&self, force: bool) -> JobResult<()> {
        self.workers.stop(force).await
    }

    fn list_queues(&self) -> Vec<String> {
        self.workers.list_queues()
    }

    async fn queue_overview(&self) -> JobResult<Vec<QueueOverview>> {
        let mut overview = Vec::new();
        for name in self.manager.queue_names() {
            let counts = self.manager.engine().job_counts(&name).await?;
            overview.push(QueueOverview {
                counts,
                concurrency: self.manager.queue_concurrency(&name),
                global_concurrency: self.manager.queue_global_concurrency(&name),
                worker: self.workers.state(&name),
                stats: self.workers.stats(&name),
                name,
            });
        }
        Ok(overview)
    }

    async fn pause(&self, queue: &str) -> JobResult<()> {
        self.declared(queue)?;
        self.manager.engine().pause(queue).await
    }

    async fn resume(&self, queue: &str) -> JobResult<()> {
        self.declared(queue)?;
        self.manager.engine().resume(queue).await
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        state: JobState,
    ) -> JobResult<u64> {
        self.declared(queue)?;
        self.manager.engine().clean(queue, grace, limit, state).await
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.declared(queue)?;
        self.manager.engine().get_job(queue, id).await
    }

    async fn health_check(&self) -> JobResult<()> {
        let Some(connections) = &self.connections else {
            return Ok(());
        };
        connections.health_check(ConnectionRole::Queue).await?;
        if !connections.is_shared() {
            connections.health_check(ConnectionRole::Worker).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::JobRegistry;
    use crate::engine::MemoryQueueEngine;
    use hopper_config::HopperConfig;

    fn service() -> JobsService {
        let mut config = HopperConfig::default();
        config.app.key = "0123456789abcdef0123456789abcdef".to_string();
        let manager =
            QueueManager::new(config, Arc::new(MemoryQueueEngine::new()), JobRegistry::default())
                .unwrap();
        JobsService::new(manager)
    }

    #[tokio::test]
    async fn test_queue_overview() {
        let service = service();
        let overview = service.queue_overview().await.unwrap();
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].name, "default");
        assert_eq!(overview[0].worker, WorkerState::Idle);
        assert_eq!(overview[0].counts, JobCounts::default());
    }

    #[tokio::test]
    async fn test_undeclared_queue_rejected() {
        let service = service();
        assert!(matches!(
            service.pause("ghost").await,
            Err(JobError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_unknown() {
        let service = service();
        assert!(matches!(
            service.resolve("Missing"),
            Err(JobError::UnknownJobType(_))
        ));
    }

    #[tokio::test]
    async fn test_health_check_without_connections() {
        service().health_check().await.unwrap();
    }
}
