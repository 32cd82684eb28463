//! In-memory queue engine for tests and local development.
//!
//! - Single process, no persistence
//! - Honors flows, retries with backoff, delays, priorities and repeatables
//! - Repeatables fire only when [`MemoryQueueEngine::run_due_repeatables`] is called

use super::{
    EngineEvent, EngineEventStream, EnqueueRequest, FailOutcome, FlowHandle, FlowNode, FlowTree,
    JobCounts, JobHandle, JobRecord, JobState, ParentRef, QueueEngine, RepeatSpec,
    RepeatTemplate, RepeatableEntry,
};
use crate::error::{JobError, JobResult};
use crate::job::JobId;
use crate::options::RemovalPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, trace};

const EVENT_CAPACITY: usize = 1024;

struct StoredJob {
    record: JobRecord,
    seq: u64,
    available_at: DateTime<Utc>,
    pending_children: usize,
    children: Vec<JobId>,
    lock_token: Option<String>,
}

struct QueueState {
    paused: bool,
    global_concurrency: Option<usize>,
    active: usize,
    repeatables: BTreeMap<String, RepeatableEntry>,
    events: broadcast::Sender<EngineEvent>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            paused: false,
            global_concurrency: None,
            active: 0,
            repeatables: BTreeMap::new(),
            events,
            notify: Arc::new(Notify::new()),
        }
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, StoredJob>,
    queues: HashMap<String, QueueState>,
    seq: u64,
}

impl State {
    fn queue_mut(&mut self, name: &str) -> &mut QueueState {
        self.queues
            .entry(name.to_string())
            .or_insert_with(QueueState::new)
    }

    fn emit(&mut self, queue: &str, event: EngineEvent) {
        trace!(queue, ?event, "Engine event");
        let _ = self.queue_mut(queue).events.send(event);
    }

    fn wake(&mut self, queue: &str) {
        self.queue_mut(queue).notify.notify_waiters();
    }

    fn insert(
        &mut self,
        request: EnqueueRequest,
        parent: Option<ParentRef>,
        pending_children: usize,
        now: DateTime<Utc>,
    ) -> JobHandle {
        let EnqueueRequest {
            name,
            queue,
            data,
            options,
        } = request;

        let id = options
            .job_id
            .clone()
            .map(JobId::from)
            .unwrap_or_else(JobId::new);

        if let Some(existing) = self.jobs.get(&id) {
            debug!(job_id = %id, "Job id already present, ignoring duplicate");
            return existing.record.handle();
        }

        let delay = options.delay().unwrap_or(Duration::ZERO);
        let state = if pending_children > 0 {
            JobState::WaitingChildren
        } else if delay > Duration::ZERO {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        self.seq += 1;
        let record = JobRecord {
            id: id.clone(),
            name,
            queue: queue.clone(),
            data,
            options,
            state,
            attempts_made: 0,
            return_value: None,
            failed_reason: None,
            parent,
            created_at: now,
            processed_on: None,
            finished_on: None,
        };
        let handle = record.handle();

        self.jobs.insert(
            id.clone(),
            StoredJob {
                record,
                seq: self.seq,
                available_at: shift_forward(now, delay),
                pending_children,
                children: Vec::new(),
                lock_token: None,
            },
        );

        if state == JobState::Waiting {
            self.emit(&queue, EngineEvent::Waiting { job_id: id });
        }
        self.wake(&queue);
        handle
    }

    fn insert_flow(
        &mut self,
        node: FlowNode,
        parent: Option<ParentRef>,
        now: DateTime<Utc>,
    ) -> FlowHandle {
        let FlowNode {
            name,
            queue,
            data,
            options,
            children,
        } = node;

        let job = self.insert(
            EnqueueRequest {
                name,
                queue,
                data,
                options,
            },
            parent,
            children.len(),
            now,
        );

        let parent_ref = ParentRef {
            id: job.id.clone(),
            queue: job.queue.clone(),
        };
        let children: Vec<FlowHandle> = children
            .into_iter()
            .map(|child| self.insert_flow(child, Some(parent_ref.clone()), now))
            .collect();

        if let Some(stored) = self.jobs.get_mut(&job.id) {
            stored.children = children.iter().map(|c| c.job.id.clone()).collect();
        }

        FlowHandle { job, children }
    }

    fn flow_tree(&self, id: &JobId) -> Option<FlowTree> {
        let stored = self.jobs.get(id)?;
        Some(FlowTree {
            job: stored.record.clone(),
            children: stored
                .children
                .iter()
                .filter_map(|child| self.flow_tree(child))
                .collect(),
        })
    }

    fn take_next(&mut self, queue: &str, token: &str, now: DateTime<Utc>) -> Option<JobRecord> {
        let q = self.queue_mut(queue);
        if q.paused || q.global_concurrency.is_some_and(|limit| q.active >= limit) {
            return None;
        }

        let id = self
            .jobs
            .values()
            .filter(|job| job.record.queue == queue)
            .filter(|job| match job.record.state {
                JobState::Waiting => true,
                JobState::Delayed => job.available_at <= now,
                _ => false,
            })
            .min_by_key(|job| {
                let order = if job.record.options.lifo.unwrap_or(false) {
                    -(job.seq as i64)
                } else {
                    job.seq as i64
                };
                (Reverse(job.record.options.priority.unwrap_or(0)), order)
            })
            .map(|job| job.record.id.clone())?;

        let stored = self.jobs.get_mut(&id)?;
        stored.record.state = JobState::Active;
        stored.record.processed_on = Some(now);
        stored.lock_token = Some(token.to_string());
        let record = stored.record.clone();

        self.queue_mut(queue).active += 1;
        self.emit(queue, EngineEvent::Active { job_id: id });
        Some(record)
    }

    fn next_wakeup(&self, queue: &str) -> Option<DateTime<Utc>> {
        self.jobs
            .values()
            .filter(|job| job.record.queue == queue && job.record.state == JobState::Delayed)
            .map(|job| job.available_at)
            .min()
    }

    fn release_lock(&mut self, job: &JobRecord, token: &str) -> JobResult<()> {
        let stored = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| JobError::NotFound(format!("job {}", job.id)))?;

        if stored.record.state != JobState::Active || stored.lock_token.as_deref() != Some(token) {
            return Err(JobError::Engine(format!(
                "job {} is not locked by this worker",
                job.id
            )));
        }
        stored.lock_token = None;

        let q = self.queue_mut(&job.queue);
        q.active = q.active.saturating_sub(1);
        Ok(())
    }

    fn child_completed(&mut self, parent: &ParentRef, now: DateTime<Utc>) {
        let Some(stored) = self.jobs.get_mut(&parent.id) else {
            return;
        };
        stored.pending_children = stored.pending_children.saturating_sub(1);
        if stored.pending_children > 0 || stored.record.state != JobState::WaitingChildren {
            return;
        }

        stored.record.state = JobState::Waiting;
        stored.available_at = now;
        self.emit(
            &parent.queue,
            EngineEvent::Waiting {
                job_id: parent.id.clone(),
            },
        );
        self.wake(&parent.queue);
    }

    fn fail_parent(&mut self, parent: &ParentRef, reason: &str, now: DateTime<Utc>) {
        let Some(stored) = self.jobs.get_mut(&parent.id) else {
            return;
        };
        if stored.record.is_finished() {
            return;
        }

        let reason = format!("child failed: {}", reason);
        stored.record.state = JobState::Failed;
        stored.record.failed_reason = Some(reason.clone());
        stored.record.finished_on = Some(now);
        let grandparent = stored
            .record
            .options
            .fail_parent_on_failure
            .unwrap_or(false)
            .then(|| stored.record.parent.clone())
            .flatten();

        self.emit(
            &parent.queue,
            EngineEvent::Failed {
                job_id: parent.id.clone(),
                reason: reason.clone(),
                terminal: true,
            },
        );

        if let Some(grandparent) = grandparent {
            self.fail_parent(&grandparent, &reason, now);
        }
    }

    fn apply_removal(&mut self, job: &JobRecord, policy: Option<RemovalPolicy>) {
        match policy {
            None | Some(RemovalPolicy::Keep) => {}
            Some(RemovalPolicy::Remove) => {
                self.jobs.remove(&job.id);
            }
            Some(RemovalPolicy::KeepLast(keep)) => {
                let mut finished: Vec<(DateTime<Utc>, u64, JobId)> = self
                    .jobs
                    .values()
                    .filter(|j| j.record.queue == job.queue && j.record.state == job.state)
                    .map(|j| {
                        (
                            j.record.finished_on.unwrap_or(j.record.created_at),
                            j.seq,
                            j.record.id.clone(),
                        )
                    })
                    .collect();
                finished.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
                for (_, _, id) in finished.into_iter().skip(keep) {
                    self.jobs.remove(&id);
                }
            }
        }
    }
}

/// `now + duration`, saturating at the end of the calendar.
fn shift_forward(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// `now - duration`, saturating at the start of the calendar.
fn shift_back(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Queue engine that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryQueueEngine {
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryQueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryQueueEngine")
            .field("jobs", &state.jobs.len())
            .field("queues", &state.queues.len())
            .finish()
    }
}

impl MemoryQueueEngine {
    /// Creates an empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues every repeatable entry due at `now` and advances its next run.
    pub fn run_due_repeatables(&self, now: DateTime<Utc>) -> JobResult<Vec<JobHandle>> {
        let mut state = self.state.lock();

        let due: Vec<(String, String)> = state
            .queues
            .iter()
            .flat_map(|(queue, q)| {
                q.repeatables
                    .values()
                    .filter(|entry| entry.next_run.is_some_and(|at| at <= now))
                    .map(|entry| (queue.clone(), entry.key.clone()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut handles = Vec::with_capacity(due.len());
        for (queue, key) in due {
            let Some(entry) = state.queue_mut(&queue).repeatables.get(&key).cloned() else {
                continue;
            };
            let next_run = entry.repeat.next_after(now)?;

            let handle = state.insert(
                EnqueueRequest {
                    name: entry.template.name.clone(),
                    queue: queue.clone(),
                    data: entry.template.data.clone(),
                    options: entry.template.options.clone(),
                },
                None,
                0,
                now,
            );
            if let Some(stored) = state.queue_mut(&queue).repeatables.get_mut(&key) {
                stored.next_run = next_run;
            }
            handles.push(handle);
        }

        Ok(handles)
    }

    /// Current cross-worker concurrency cap of `queue`.
    pub fn global_concurrency(&self, queue: &str) -> Option<usize> {
        self.state
            .lock()
            .queues
            .get(queue)
            .and_then(|q| q.global_concurrency)
    }

    /// Returns true if `queue` is paused.
    pub fn is_paused(&self, queue: &str) -> bool {
        self.state
            .lock()
            .queues
            .get(queue)
            .is_some_and(|q| q.paused)
    }

    /// Snapshot of every job stored for `queue`, oldest first.
    pub fn jobs(&self, queue: &str) -> Vec<JobRecord> {
        let state = self.state.lock();
        let mut jobs: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|job| job.record.queue == queue)
            .collect();
        jobs.sort_by_key(|job| job.seq);
        jobs.into_iter().map(|job| job.record.clone()).collect()
    }
}

fn check_request(request: &EnqueueRequest) -> JobResult<()> {
    if request.name.is_empty() {
        return Err(JobError::Engine("job name must not be empty".to_string()));
    }
    if request.queue.is_empty() {
        return Err(JobError::Engine("queue name must not be empty".to_string()));
    }
    Ok(())
}

fn check_flow(node: &FlowNode) -> JobResult<()> {
    if node.name.is_empty() || node.queue.is_empty() {
        return Err(JobError::Engine(
            "flow nodes need a job name and a queue".to_string(),
        ));
    }
    node.children.iter().try_for_each(check_flow)
}

#[async_trait]
impl QueueEngine for MemoryQueueEngine {
    async fn enqueue(&self, request: EnqueueRequest) -> JobResult<JobHandle> {
        check_request(&request)?;
        let mut state = self.state.lock();
        Ok(state.insert(request, None, 0, Utc::now()))
    }

    async fn add_flow(&self, root: FlowNode) -> JobResult<FlowHandle> {
        check_flow(&root)?;
        let mut state = self.state.lock();
        Ok(state.insert_flow(root, None, Utc::now()))
    }

    async fn add_bulk(&self, requests: Vec<EnqueueRequest>) -> JobResult<Vec<JobHandle>> {
        requests.iter().try_for_each(check_request)?;
        let now = Utc::now();
        let mut state = self.state.lock();
        Ok(requests
            .into_iter()
            .map(|request| state.insert(request, None, 0, now))
            .collect())
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> JobResult<Option<JobRecord>> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .get(id)
            .filter(|job| job.record.queue == queue)
            .map(|job| job.record.clone()))
    }

    async fn get_flow(&self, queue: &str, id: &JobId) -> JobResult<Option<FlowTree>> {
        let state = self.state.lock();
        Ok(state.flow_tree(id).filter(|tree| tree.job.queue == queue))
    }

    async fn subscribe_events(&self, queue: &str) -> JobResult<EngineEventStream> {
        let rx = self.state.lock().queue_mut(queue).events.subscribe();

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Event subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn get_repeatable_jobs(&self, queue: &str) -> JobResult<Vec<RepeatableEntry>> {
        let state = self.state.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.repeatables.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_repeatable(
        &self,
        queue: &str,
        key: &str,
        repeat: RepeatSpec,
        template: RepeatTemplate,
    ) -> JobResult<RepeatableEntry> {
        repeat.validate()?;
        let next_run = repeat.next_after(Utc::now())?;

        let entry = RepeatableEntry {
            key: key.to_string(),
            queue: queue.to_string(),
            repeat,
            template,
            next_run,
        };

        self.state
            .lock()
            .queue_mut(queue)
            .repeatables
            .insert(key.to_string(), entry.clone());
        Ok(entry)
    }

    async fn remove_repeatable(&self, queue: &str, key: &str) -> JobResult<bool> {
        let mut state = self.state.lock();
        Ok(state
            .queues
            .get_mut(queue)
            .and_then(|q| q.repeatables.remove(key))
            .is_some())
    }

    async fn job_counts(&self, queue: &str) -> JobResult<JobCounts> {
        let state = self.state.lock();
        let mut counts = JobCounts::default();
        for job in state.jobs.values().filter(|job| job.record.queue == queue) {
            match job.record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::WaitingChildren => counts.waiting_children += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn clean(
        &self,
        queue: &str,
        grace: Duration,
        limit: usize,
        job_state: JobState,
    ) -> JobResult<u64> {
        let cutoff = shift_back(Utc::now(), grace);
        let mut state = self.state.lock();

        let mut candidates: Vec<(DateTime<Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|job| job.record.queue == queue && job.record.state == job_state)
            .map(|job| {
                (
                    job.record.finished_on.unwrap_or(job.record.created_at),
                    job.record.id.clone(),
                )
            })
            .filter(|(at, _)| *at <= cutoff)
            .collect();
        candidates.sort();
        if limit > 0 {
            candidates.truncate(limit);
        }

        for (_, id) in &candidates {
            state.jobs.remove(id);
        }
        Ok(candidates.len() as u64)
    }

    async fn pause(&self, queue: &str) -> JobResult<()> {
        let mut state = self.state.lock();
        state.queue_mut(queue).paused = true;
        state.emit(queue, EngineEvent::Paused);
        Ok(())
    }

    async fn resume(&self, queue: &str) -> JobResult<()> {
        let mut state = self.state.lock();
        state.queue_mut(queue).paused = false;
        state.emit(queue, EngineEvent::Resumed);
        state.wake(queue);
        Ok(())
    }

    async fn set_global_concurrency(&self, queue: &str, limit: Option<usize>) -> JobResult<()> {
        let mut state = self.state.lock();
        state.queue_mut(queue).global_concurrency = limit;
        state.wake(queue);
        Ok(())
    }

    async fn fetch_next(
        &self,
        queue: &str,
        token: &str,
        block: Duration,
    ) -> JobResult<Option<JobRecord>> {
        let deadline = tokio::time::Instant::now() + block;

        loop {
            let notify = self.state.lock().queue_mut(queue).notify.clone();
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wakeup = {
                let mut state = self.state.lock();
                let now = Utc::now();
                if let Some(record) = state.take_next(queue, token, now) {
                    return Ok(Some(record));
                }
                state
                    .next_wakeup(queue)
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
            };

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut wait = deadline - now;
            if let Some(delta) = wakeup {
                wait = wait.min(delta.max(Duration::from_millis(1)));
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn complete(&self, job: &JobRecord, token: &str, return_value: Value) -> JobResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.release_lock(job, token)?;

        let (record, parent) = {
            let stored = state
                .jobs
                .get_mut(&job.id)
                .ok_or_else(|| JobError::NotFound(format!("job {}", job.id)))?;
            stored.record.state = JobState::Completed;
            stored.record.return_value = Some(return_value.clone());
            stored.record.finished_on = Some(now);
            (stored.record.clone(), stored.record.parent.clone())
        };

        state.emit(
            &job.queue,
            EngineEvent::Completed {
                job_id: job.id.clone(),
                return_value,
            },
        );
        if let Some(parent) = parent {
            state.child_completed(&parent, now);
        }
        state.apply_removal(&record, record.options.remove_on_complete);
        state.wake(&job.queue);
        Ok(())
    }

    async fn fail(
        &self,
        job: &JobRecord,
        token: &str,
        reason: &str,
        retry: bool,
    ) -> JobResult<FailOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.release_lock(job, token)?;

        let (record, outcome) = {
            let stored = state
                .jobs
                .get_mut(&job.id)
                .ok_or_else(|| JobError::NotFound(format!("job {}", job.id)))?;
            stored.record.attempts_made += 1;
            stored.record.failed_reason = Some(reason.to_string());

            let attempts_made = stored.record.attempts_made;
            let outcome = if retry && attempts_made < stored.record.max_attempts() {
                let delay = stored.record.options.retry_delay(attempts_made);
                stored.record.state = if delay > Duration::ZERO {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                };
                stored.available_at = shift_forward(now, delay);
                FailOutcome::Retrying { delay }
            } else {
                stored.record.state = JobState::Failed;
                stored.record.finished_on = Some(now);
                FailOutcome::Failed
            };
            (stored.record.clone(), outcome)
        };

        let terminal = outcome == FailOutcome::Failed;
        state.emit(
            &job.queue,
            EngineEvent::Failed {
                job_id: job.id.clone(),
                reason: reason.to_string(),
                terminal,
            },
        );

        if terminal {
            if record.options.fail_parent_on_failure.unwrap_or(false) {
                if let Some(parent) = &record.parent {
                    state.fail_parent(parent, reason, now);
                }
            }
            state.apply_removal(&record, record.options.remove_on_fail);
        }
        state.wake(&job.queue);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::JobOptions;
    use serde_json::json;

    fn request(name: &str, queue: &str) -> EnqueueRequest {
        EnqueueRequest {
            name: name.to_string(),
            queue: queue.to_string(),
            data: json!({ "n": name }),
            options: JobOptions::default(),
        }
    }

    fn node(name: &str, children: Vec<FlowNode>) -> FlowNode {
        FlowNode {
            name: name.to_string(),
            queue: "default".to_string(),
            data: json!(null),
            options: JobOptions::default(),
            children,
        }
    }

    const NO_WAIT: Duration = Duration::ZERO;

    #[tokio::test]
    async fn test_enqueue_and_fetch_fifo() {
        let engine = MemoryQueueEngine::new();
        engine.enqueue(request("first", "default")).await.unwrap();
        engine.enqueue(request("second", "default")).await.unwrap();

        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(job.name, "first");
        assert_eq!(job.state, JobState::Active);
    }

    #[tokio::test]
    async fn test_priority_wins_over_order() {
        let engine = MemoryQueueEngine::new();
        engine.enqueue(request("normal", "default")).await.unwrap();
        let mut urgent = request("urgent", "default");
        urgent.options.priority = Some(20);
        engine.enqueue(urgent).await.unwrap();

        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(job.name, "urgent");
    }

    #[tokio::test]
    async fn test_duplicate_job_id_ignored() {
        let engine = MemoryQueueEngine::new();
        let mut req = request("a", "default");
        req.options.job_id = Some("fixed".to_string());

        let first = engine.enqueue(req.clone()).await.unwrap();
        let second = engine.enqueue(req).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.jobs("default").len(), 1);
    }

    #[tokio::test]
    async fn test_flow_parent_waits_for_children() {
        let engine = MemoryQueueEngine::new();
        let flow = engine
            .add_flow(node("parent", vec![node("child", vec![])]))
            .await
            .unwrap();
        assert_eq!(flow.len(), 2);

        let child = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(child.name, "child");
        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_none());

        engine.complete(&child, "t", json!(1)).await.unwrap();
        let parent = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(parent.name, "parent");
    }

    #[tokio::test]
    async fn test_retry_then_terminal_failure() {
        let engine = MemoryQueueEngine::new();
        let mut req = request("flaky", "default");
        req.options.attempts = Some(2);
        engine.enqueue(req).await.unwrap();

        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        let outcome = engine.fail(&job, "t", "boom", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Retrying { delay: Duration::ZERO });

        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        let outcome = engine.fail(&job, "t", "boom", true).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let stored = engine.get_job("default", &job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.failed_reason.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_fail_parent_on_failure() {
        let engine = MemoryQueueEngine::new();
        let mut child = node("child", vec![]);
        child.options.fail_parent_on_failure = Some(true);
        let flow = engine.add_flow(node("parent", vec![child])).await.unwrap();

        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        engine.fail(&job, "t", "broken", false).await.unwrap();

        let parent = engine
            .get_job("default", &flow.job.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(parent.state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_complete_requires_lock_token() {
        let engine = MemoryQueueEngine::new();
        engine.enqueue(request("a", "default")).await.unwrap();
        let job = engine.fetch_next("default", "mine", NO_WAIT).await.unwrap().unwrap();

        let err = engine.complete(&job, "other", json!(null)).await.unwrap_err();
        assert!(matches!(err, JobError::Engine(_)));
    }

    #[tokio::test]
    async fn test_global_concurrency_limits_fetch() {
        let engine = MemoryQueueEngine::new();
        engine.set_global_concurrency("default", Some(1)).await.unwrap();
        engine.enqueue(request("a", "default")).await.unwrap();
        engine.enqueue(request("b", "default")).await.unwrap();

        let first = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_none());

        engine.complete(&first, "t", json!(null)).await.unwrap();
        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_paused_queue_yields_nothing() {
        let engine = MemoryQueueEngine::new();
        engine.enqueue(request("a", "default")).await.unwrap();
        engine.pause("default").await.unwrap();
        assert!(engine.is_paused("default"));
        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_none());

        engine.resume("default").await.unwrap();
        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fetch_blocks_until_enqueue() {
        let engine = Arc::new(MemoryQueueEngine::new());
        let producer = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.enqueue(request("late", "default")).await.unwrap();
        });

        let job = engine
            .fetch_next("default", "t", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(job.map(|j| j.name), Some("late".to_string()));
    }

    #[tokio::test]
    async fn test_delayed_job_not_fetched_early() {
        let engine = MemoryQueueEngine::new();
        let mut req = request("later", "default");
        req.options.delay_ms = Some(60_000);
        engine.enqueue(req).await.unwrap();

        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_none());
        assert_eq!(engine.job_counts("default").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_remove_on_complete() {
        let engine = MemoryQueueEngine::new();
        let mut req = request("a", "default");
        req.options.remove_on_complete = Some(RemovalPolicy::Remove);
        engine.enqueue(req).await.unwrap();

        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        engine.complete(&job, "t", json!(null)).await.unwrap();
        assert!(engine.get_job("default", &job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_completed() {
        let engine = MemoryQueueEngine::new();
        engine.enqueue(request("a", "default")).await.unwrap();
        let job = engine.fetch_next("default", "t", NO_WAIT).await.unwrap().unwrap();
        engine.complete(&job, "t", json!(null)).await.unwrap();

        let removed = engine
            .clean("default", Duration::ZERO, 0, JobState::Completed)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(engine.job_counts("default").await.unwrap().completed, 0);
    }

    #[tokio::test]
    async fn test_repeatable_upsert_replaces() {
        let engine = MemoryQueueEngine::new();
        let template = RepeatTemplate {
            name: "cleanup".to_string(),
            data: json!({}),
            options: JobOptions::default(),
        };

        engine
            .upsert_repeatable("default", "nightly", RepeatSpec::cron("0 3 * * *"), template.clone())
            .await
            .unwrap();
        engine
            .upsert_repeatable("default", "nightly", RepeatSpec::cron("0 4 * * *"), template)
            .await
            .unwrap();

        let entries = engine.get_repeatable_jobs("default").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].repeat, RepeatSpec::cron("0 4 * * *"));
    }

    #[tokio::test]
    async fn test_run_due_repeatables() {
        let engine = MemoryQueueEngine::new();
        let template = RepeatTemplate {
            name: "tick".to_string(),
            data: json!({}),
            options: JobOptions::default(),
        };
        let entry = engine
            .upsert_repeatable("default", "tick", RepeatSpec::every(Duration::from_secs(60)), template)
            .await
            .unwrap();

        let due_at = entry.next_run.unwrap();
        let handles = engine.run_due_repeatables(due_at).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].name, "tick");

        let entries = engine.get_repeatable_jobs("default").await.unwrap();
        assert!(entries[0].next_run.unwrap() > due_at);
    }

    #[tokio::test]
    async fn test_oversized_delay_saturates() {
        let engine = MemoryQueueEngine::new();
        let mut req = request("later", "default");
        req.options.delay_ms = Some(u64::MAX);

        let handle = engine.enqueue(req).await.unwrap();
        let record = engine.get_job("default", &handle.id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Delayed);
        assert!(engine.fetch_next("default", "t", NO_WAIT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_are_scoped_per_queue() {
        let engine = MemoryQueueEngine::new();
        let mut emails = engine.subscribe_events("emails").await.unwrap();

        engine.enqueue(request("other", "default")).await.unwrap();
        let handle = engine.enqueue(request("mail", "emails")).await.unwrap();

        let event = emails.next().await.unwrap();
        assert_eq!(event, EngineEvent::Waiting { job_id: handle.id });
    }
}
