//! Metrics for dispatch and worker activity.
//!
//! Recorded through the `metrics` facade; install any exporter to collect them.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names.
pub mod names {
    /// Total jobs dispatched.
    pub const JOBS_DISPATCHED_TOTAL: &str = "hopper_jobs_dispatched_total";
    /// Total jobs picked up by a worker.
    pub const JOBS_STARTED_TOTAL: &str = "hopper_jobs_started_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "hopper_jobs_completed_total";
    /// Total failed attempts.
    pub const JOBS_ERRORED_TOTAL: &str = "hopper_jobs_errored_total";
    /// Total jobs failed for good.
    pub const JOBS_FAILED_TOTAL: &str = "hopper_jobs_failed_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "hopper_job_duration_seconds";

    /// Jobs currently executing in this process.
    pub const WORKER_IN_FLIGHT: &str = "hopper_worker_in_flight";
    /// Configured local concurrency.
    pub const WORKER_CONCURRENCY: &str = "hopper_worker_concurrency";

    /// Repeatable entries created or replaced.
    pub const SCHEDULES_UPSERTED_TOTAL: &str = "hopper_schedules_upserted_total";
    /// Repeatable entries removed.
    pub const SCHEDULES_REMOVED_TOTAL: &str = "hopper_schedules_removed_total";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_DISPATCHED_TOTAL, "Total number of jobs dispatched");
    describe_counter!(names::JOBS_STARTED_TOTAL, "Total number of jobs picked up by a worker");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_ERRORED_TOTAL, "Total number of failed job attempts");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed terminally");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");

    describe_gauge!(names::WORKER_IN_FLIGHT, "Jobs currently executing in this process");
    describe_gauge!(names::WORKER_CONCURRENCY, "Worker concurrency setting per queue");

    describe_counter!(names::SCHEDULES_UPSERTED_TOTAL, "Repeatable job entries created or replaced");
    describe_counter!(names::SCHEDULES_REMOVED_TOTAL, "Repeatable job entries removed");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record jobs dispatched to a queue.
    pub fn job_dispatched(queue: &str, count: usize) {
        counter!(names::JOBS_DISPATCHED_TOTAL, "queue" => queue.to_string()).increment(count as u64);
    }

    /// Record a job picked up.
    pub fn job_started(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_STARTED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, job_name: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn job_errored(queue: &str, job_name: &str, error_kind: &str, duration: Duration) {
        counter!(
            names::JOBS_ERRORED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "error_type" => error_kind.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string(),
            "status" => "errored"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a terminal failure.
    pub fn job_failed(queue: &str, job_name: &str) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }
}

/// Worker metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Update in-flight and concurrency gauges for one queue.
    pub fn update(queue: &str, in_flight: usize, concurrency: usize) {
        gauge!(names::WORKER_IN_FLIGHT, "queue" => queue.to_string()).set(in_flight as f64);
        gauge!(names::WORKER_CONCURRENCY, "queue" => queue.to_string()).set(concurrency as f64);
    }
}

/// Scheduler metrics recorder.
#[derive(Clone)]
pub struct SchedulerMetrics;

impl SchedulerMetrics {
    pub fn schedule_upserted(queue: &str, job_name: &str) {
        counter!(
            names::SCHEDULES_UPSERTED_TOTAL,
            "queue" => queue.to_string(),
            "job_name" => job_name.to_string()
        )
        .increment(1);
    }

    pub fn schedules_removed(count: usize) {
        counter!(names::SCHEDULES_REMOVED_TOTAL).increment(count as u64);
    }
}
