//! Recurring job templates stored in the engine's repeatable-job store.

use crate::definition::JobDefinition;
use crate::dispatcher::JobDispatcher;
use crate::engine::{RepeatSpec, RepeatTemplate, RepeatableEntry};
use crate::error::{JobError, JobResult};
use crate::job::Job;
use crate::manager::QueueManager;
use crate::metrics::SchedulerMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A schedule as reported by [`JobScheduler::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub key: String,
    /// Job type fired on every run.
    pub name: String,
    pub queue: String,
    pub repeat: RepeatSpec,
    /// Template data, decrypted when the job type is encrypted.
    pub data: Value,
    pub next_run: Option<DateTime<Utc>>,
}

/// Stateless facade over the engine's repeatable-job store.
///
/// A key names at most one schedule across all queues. Engines store keys
/// per queue, so upserts prune other queues and removal probes all of them.
#[derive(Debug, Clone)]
pub struct JobScheduler {
    manager: QueueManager,
}

impl JobScheduler {
    pub fn new(manager: QueueManager) -> Self {
        Self { manager }
    }

    /// Creates or replaces the schedule stored under `key`.
    ///
    /// The queue resolves the same way a dispatch does. Encrypted job
    /// types store their template data encrypted. Copies of `key` left in
    /// other queues are removed once the new entry is stored.
    pub async fn schedule(
        &self,
        key: &str,
        definition: Arc<JobDefinition>,
        data: Value,
        repeat: RepeatSpec,
        queue: Option<&str>,
    ) -> JobResult<ScheduleEntry> {
        if key.trim().is_empty() {
            return Err(JobError::Configuration(
                "schedule key must not be empty".to_string(),
            ));
        }
        repeat.validate()?;

        let mut dispatcher = JobDispatcher::new(self.manager.clone(), definition, data.clone());
        if let Some(queue) = queue {
            dispatcher = dispatcher.on_queue(queue);
        }
        let request = dispatcher.to_request()?;

        let stored = self
            .manager
            .engine()
            .upsert_repeatable(
                &request.queue,
                key,
                repeat,
                RepeatTemplate {
                    name: request.name,
                    data: request.data,
                    options: request.options,
                },
            )
            .await?;
        self.prune_other_queues(key, &stored.queue).await;

        SchedulerMetrics::schedule_upserted(&stored.queue, &stored.template.name);
        info!(
            key = %stored.key,
            job = %stored.template.name,
            queue = %stored.queue,
            next_run = ?stored.next_run,
            "Schedule upserted"
        );

        Ok(build_entry(stored, data))
    }

    /// Schedules job type `J`.
    pub async fn schedule_job<J: Job>(
        &self,
        key: &str,
        data: J::Data,
        repeat: RepeatSpec,
    ) -> JobResult<ScheduleEntry> {
        let definition = self.manager.registry().resolve_job::<J>()?;
        let data = serde_json::to_value(data)?;
        self.schedule(key, definition, data, repeat, None).await
    }

    /// Schedules the job type registered as `name`.
    pub async fn schedule_named(
        &self,
        key: &str,
        name: &str,
        data: Value,
        repeat: RepeatSpec,
        queue: Option<&str>,
    ) -> JobResult<ScheduleEntry> {
        let definition = self.manager.registry().resolve(name)?;
        self.schedule(key, definition, data, repeat, queue).await
    }

    /// Schedules across `queues`, or every declared queue.
    pub async fn list(&self, queues: Option<&[String]>) -> JobResult<Vec<ScheduleEntry>> {
        let mut entries = Vec::new();
        for queue in self.select_queues(queues)? {
            let stored = self.manager.engine().get_repeatable_jobs(&queue).await?;
            for entry in stored {
                entries.push(self.to_entry(entry)?);
            }
        }
        Ok(entries)
    }

    pub async fn find(&self, key: &str) -> JobResult<Option<ScheduleEntry>> {
        Ok(self
            .list(None)
            .await?
            .into_iter()
            .find(|entry| entry.key == key))
    }

    pub async fn exists(&self, key: &str) -> JobResult<bool> {
        Ok(self.find(key).await?.is_some())
    }

    /// Removes the schedule stored under `key` from every queue holding it.
    ///
    /// A queue that errors is logged and skipped.
    pub async fn remove(&self, key: &str) -> JobResult<bool> {
        let mut removed = 0;
        for queue in self.manager.queue_names() {
            match self.manager.engine().remove_repeatable(&queue, key).await {
                Ok(true) => {
                    removed += 1;
                    info!(key = %key, queue = %queue, "Schedule removed");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, queue = %queue, error = %e, "Failed to remove schedule, trying next queue");
                }
            }
        }

        if removed == 0 {
            debug!(key = %key, "No schedule to remove");
            return Ok(false);
        }
        SchedulerMetrics::schedules_removed(removed);
        Ok(true)
    }

    /// Removes every schedule in `queues`, or in every declared queue.
    ///
    /// Returns how many were removed.
    pub async fn clear(&self, queues: Option<&[String]>) -> JobResult<usize> {
        let engine = self.manager.engine();
        let mut removed = 0;

        for queue in self.select_queues(queues)? {
            let stored = match engine.get_repeatable_jobs(&queue).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to list schedules, skipping queue");
                    continue;
                }
            };

            for entry in stored {
                match engine.remove_repeatable(&queue, &entry.key).await {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %entry.key, queue = %queue, error = %e, "Failed to remove schedule");
                    }
                }
            }
        }

        SchedulerMetrics::schedules_removed(removed);
        info!(removed, "Schedules cleared");
        Ok(removed)
    }

    async fn prune_other_queues(&self, key: &str, keep: &str) {
        for queue in self.manager.queue_names() {
            if queue == keep {
                continue;
            }
            match self.manager.engine().remove_repeatable(&queue, key).await {
                Ok(true) => {
                    debug!(key = %key, from = %queue, to = %keep, "Schedule moved between queues");
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %key, queue = %queue, error = %e, "Failed to prune schedule from queue");
                }
            }
        }
    }

    fn select_queues(&self, queues: Option<&[String]>) -> JobResult<Vec<String>> {
        let Some(queues) = queues else {
            return Ok(self.manager.queue_names());
        };

        let settings = self.manager.queue_settings();
        if let Some(unknown) = queues.iter().find(|q| !settings.contains(q)) {
            return Err(JobError::Configuration(format!(
                "queue '{}' is not declared in the queue catalogue",
                unknown
            )));
        }
        Ok(queues.to_vec())
    }

    /// Maps a stored entry, decrypting template data for encrypted job types.
    ///
    /// Data that no longer decrypts is an error rather than ciphertext.
    fn to_entry(&self, stored: RepeatableEntry) -> JobResult<ScheduleEntry> {
        let encrypted = self
            .manager
            .registry()
            .resolve(&stored.template.name)
            .map(|definition| definition.is_encrypted())
            .unwrap_or(false);

        let data = if encrypted {
            self.manager
                .cipher()
                .decrypt(&stored.template.data)
                .map_err(|e| {
                    warn!(key = %stored.key, queue = %stored.queue, error = %e, "Cannot decrypt schedule data");
                    JobError::PayloadCrypto(format!(
                        "schedule '{}' in queue '{}' holds undecryptable data: {}",
                        stored.key, stored.queue, e
                    ))
                })?
        } else {
            stored.template.data.clone()
        };

        Ok(build_entry(stored, data))
    }
}

fn build_entry(stored: RepeatableEntry, data: Value) -> ScheduleEntry {
    let next_run = stored
        .next_run
        .or_else(|| stored.repeat.next_after(Utc::now()).ok().flatten());

    ScheduleEntry {
        key: stored.key,
        name: stored.template.name,
        queue: stored.queue,
        repeat: stored.repeat,
        data,
        next_run,
    }
}
