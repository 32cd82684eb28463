//! Integration tests for workers executing jobs.

mod common;

use common::{
    collect_events, names, Credentials, DoomedJob, Flaky, FlakyJob, Input, JobA, PanicJob,
    SlowJob, TestApp,
};
use hopper_jobs::engine::EnqueueRequest;
use hopper_jobs::{
    ClosureCodec, ClosureRegistry, JobError, JobEvent, JobId, JobOptions, JobRecord, JobState,
    QueueEngine, WorkerManager, WorkerState, CLOSURE_JOB_NAME,
};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_state(app: &TestApp, queue: &str, id: &JobId, state: JobState) -> JobRecord {
    let deadline = Instant::now() + WAIT;
    loop {
        let record = app.engine.get_job(queue, id).await.unwrap().unwrap();
        if record.state == state {
            return record;
        }
        assert!(Instant::now() < deadline, "job stuck in {:?}", record.state);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn is_final(event: &JobEvent) -> bool {
    matches!(event, JobEvent::Success { .. } | JobEvent::Failed { .. })
}

#[tokio::test]
async fn test_retries_emit_error_but_not_failed() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    app.manager
        .dispatch::<FlakyJob>(Flaky { fail_times: 2 })
        .unwrap()
        .dispatch()
        .await
        .unwrap();

    let seen = collect_events(&mut events, WAIT, is_final).await;
    workers.stop(false).await.unwrap();

    assert_eq!(
        names(&seen),
        vec![
            "job:dispatched",
            "job:started",
            "job:error",
            "job:started",
            "job:error",
            "job:started",
            "job:success",
        ]
    );
    let attempts: Vec<u32> = seen
        .iter()
        .filter_map(|event| match event {
            JobEvent::Error { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![1, 2]);
    assert!(matches!(seen.last(), Some(JobEvent::Success { result, .. }) if *result == json!(3)));
    assert_eq!(
        *app.failures.lock(),
        vec!["1:UserProcessError", "2:UserProcessError"]
    );
}

#[tokio::test]
async fn test_final_attempt_emits_failed() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let result = app
        .manager
        .dispatch::<FlakyJob>(Flaky { fail_times: 10 })
        .unwrap()
        .wait_result()
        .await;
    assert!(matches!(result, Err(JobError::JobFailed { .. })));

    let seen = collect_events(&mut events, WAIT, is_final).await;
    workers.stop(false).await.unwrap();

    assert_eq!(names(&seen).iter().filter(|n| **n == "job:error").count(), 3);
    match seen.last() {
        Some(JobEvent::Failed { attempts, error, .. }) => {
            assert_eq!(*attempts, 3);
            assert!(error.contains("attempt 3 failed"));
        }
        other => panic!("expected job:failed, got {other:?}"),
    }
    assert_eq!(workers.stats("default").unwrap().failed, 1);
}

#[tokio::test]
async fn test_attempts_override_applies() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let job = app
        .manager
        .dispatch::<FlakyJob>(Flaky { fail_times: 1 })
        .unwrap()
        .attempts(1)
        .dispatch()
        .await
        .unwrap();

    let seen = collect_events(&mut events, WAIT, is_final).await;
    workers.stop(false).await.unwrap();

    assert_eq!(
        names(&seen),
        vec!["job:dispatched", "job:started", "job:error", "job:failed"]
    );
    let record = job.record().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.attempts_made, 1);
}

#[tokio::test]
async fn test_unrecoverable_error_skips_remaining_attempts() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let job = app
        .manager
        .dispatch::<DoomedJob>(())
        .unwrap()
        .dispatch()
        .await
        .unwrap();

    let seen = collect_events(&mut events, WAIT, is_final).await;
    workers.stop(false).await.unwrap();

    assert!(matches!(seen.last(), Some(JobEvent::Failed { attempts: 1, .. })));
    let record = job.record().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Failed);
    assert_eq!(record.max_attempts(), 5);
    assert_eq!(record.attempts_made, 1);
}

#[tokio::test]
async fn test_panic_is_reported_as_failure() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    app.manager
        .dispatch::<PanicJob>(())
        .unwrap()
        .dispatch()
        .await
        .unwrap();
    let seen = collect_events(&mut events, WAIT, is_final).await;
    assert!(matches!(
        seen.last(),
        Some(JobEvent::Failed { error, .. }) if error.contains("boom")
    ));

    let value = app
        .manager
        .dispatch::<JobA>(Input::new("still alive"))
        .unwrap()
        .wait_result()
        .await
        .unwrap();
    workers.stop(false).await.unwrap();
    assert_eq!(value, json!("STILL ALIVE"));
}

#[tokio::test]
async fn test_unknown_job_type_is_not_retried() {
    let app = TestApp::new();
    let mut events = app.manager.events();

    let handle = app
        .engine
        .enqueue(EnqueueRequest {
            name: "Ghost".to_string(),
            queue: "default".to_string(),
            data: json!({}),
            options: JobOptions::default().with_attempts(3),
        })
        .await
        .unwrap();

    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();
    let record = wait_for_state(&app, "default", &handle.id, JobState::Failed).await;
    workers.stop(false).await.unwrap();

    assert_eq!(record.attempts_made, 1);
    assert!(record.failed_reason.unwrap().contains("Unknown job type"));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_undecryptable_payload_fails_terminally() {
    let app = TestApp::new();
    let mut events = app.manager.events();

    app.engine
        .enqueue(EnqueueRequest {
            name: "RotateToken".to_string(),
            queue: "default".to_string(),
            data: serde_json::to_value(Credentials {
                api_token: "plain".to_string(),
            })
            .unwrap(),
            options: JobOptions::default().with_attempts(3),
        })
        .await
        .unwrap();

    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();
    let seen = collect_events(&mut events, WAIT, is_final).await;
    workers.stop(false).await.unwrap();

    assert_eq!(names(&seen), vec!["job:error", "job:failed"]);
    assert!(matches!(
        &seen[1],
        JobEvent::Failed { error, attempts: 1, .. } if error.contains("Payload crypto")
    ));
}

#[tokio::test]
async fn test_encrypted_job_round_trip() {
    let app = TestApp::new();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let value = app
        .manager
        .dispatch::<common::RotateToken>(Credentials {
            api_token: "tok_live_4242".to_string(),
        })
        .unwrap()
        .wait_result()
        .await
        .unwrap();
    workers.stop(false).await.unwrap();

    assert_eq!(value, json!("tok_live_4242"));
}

#[tokio::test]
async fn test_closure_job_end_to_end() {
    let closures = ClosureRegistry::new().register_fn("sum", |_ctx, args: Vec<Value>| async move {
        Ok::<_, JobError>(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
    });
    let app = TestApp::with_closures(closures);
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let value = app
        .manager
        .closure("sum", vec![json!(1), json!(2), json!(39)])
        .unwrap()
        .wait_result()
        .await
        .unwrap();
    workers.stop(false).await.unwrap();

    assert_eq!(value, json!(42));
}

#[tokio::test]
async fn test_tampered_closure_is_rejected() {
    let closures = ClosureRegistry::new().register_fn("sum", |_ctx, args: Vec<Value>| async move {
        Ok::<_, JobError>(json!(args.len()))
    });
    let app = TestApp::with_closures(closures);
    let mut events = app.manager.events();

    let mut payload = ClosureCodec::new(common::APP_KEY)
        .serialize("sum", vec![json!(1)])
        .unwrap();
    payload.args.push(json!(1_000_000));

    app.engine
        .enqueue(EnqueueRequest {
            name: CLOSURE_JOB_NAME.to_string(),
            queue: "default".to_string(),
            data: serde_json::to_value(payload).unwrap(),
            options: JobOptions::default().with_attempts(3),
        })
        .await
        .unwrap();

    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();
    let seen = collect_events(&mut events, WAIT, is_final).await;
    workers.stop(false).await.unwrap();

    assert!(matches!(
        seen.last(),
        Some(JobEvent::Failed { attempts: 1, .. })
    ));
}

#[tokio::test]
async fn test_start_persists_global_concurrency() {
    let app = TestApp::new();
    let workers = WorkerManager::new(app.manager.clone());

    workers.start(&["reports".to_string()]).await.unwrap();
    assert_eq!(app.engine.global_concurrency("reports"), Some(1));
    assert_eq!(workers.running_queues(), vec!["reports"]);
    workers.stop(false).await.unwrap();
}

#[tokio::test]
async fn test_graceful_stop_waits_for_in_flight_jobs() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let job = app
        .manager
        .dispatch::<SlowJob>(200)
        .unwrap()
        .dispatch()
        .await
        .unwrap();
    collect_events(&mut events, WAIT, |event| event.name() == "job:started").await;

    workers.stop(false).await.unwrap();

    let record = job.record().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Completed);
    assert_eq!(workers.state("reports"), WorkerState::Stopped);
    assert_eq!(workers.stats("reports").unwrap().processed, 1);
}

#[tokio::test]
async fn test_forced_stop_abandons_in_flight_jobs() {
    let app = TestApp::new();
    let mut events = app.manager.events();
    let workers = WorkerManager::new(app.manager.clone());
    workers.start(&[]).await.unwrap();

    let job = app
        .manager
        .dispatch::<SlowJob>(10_000)
        .unwrap()
        .dispatch()
        .await
        .unwrap();
    collect_events(&mut events, WAIT, |event| event.name() == "job:started").await;

    let started = Instant::now();
    workers.stop(true).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let record = job.record().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Active);
    assert_eq!(workers.stats("reports").unwrap().in_flight, 0);
}

#[tokio::test]
async fn test_workers_restart_after_stop() {
    let app = TestApp::new();
    let workers = WorkerManager::new(app.manager.clone());

    workers.start(&[]).await.unwrap();
    workers.stop(false).await.unwrap();
    workers.start(&[]).await.unwrap();

    let value = app
        .manager
        .dispatch::<JobA>(Input::new("again"))
        .unwrap()
        .wait_result()
        .await
        .unwrap();
    workers.stop(false).await.unwrap();
    assert_eq!(value, json!("AGAIN"));
}
