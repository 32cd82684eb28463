//! Integration tests for single-job dispatch.

mod common;

use common::{Credentials, Input, JobA, RotateToken, SlowJob, TestApp};
use hopper_jobs::crypto::ENCRYPTED_PREFIX;
use hopper_jobs::{JobError, JobEvent, JobState, PayloadCipher, Priority};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_dispatch_resolves_configured_default_queue() {
    let app = TestApp::new();
    let mut events = app.manager.events();

    let job = app
        .manager
        .dispatch::<JobA>(Input::new("x"))
        .unwrap()
        .dispatch()
        .await
        .unwrap();

    assert_eq!(job.queue(), "default");
    assert_eq!(job.name(), "JobA");

    let record = job.record().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Waiting);
    assert_eq!(record.data, json!({"input": "x"}));

    match events.try_recv().unwrap() {
        JobEvent::Dispatched(handle) => assert_eq!(&handle, job.handle()),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_queue_precedence() {
    let app = TestApp::new();

    let job_default = app.manager.dispatch::<SlowJob>(10).unwrap();
    assert_eq!(job_default.resolve_queue().unwrap(), "reports");

    let explicit = app.manager.dispatch::<SlowJob>(10).unwrap().on_queue("emails");
    assert_eq!(explicit.resolve_queue().unwrap(), "emails");
}

#[tokio::test]
async fn test_undeclared_queue_fails_before_engine() {
    let app = TestApp::new();

    let err = app
        .manager
        .dispatch::<JobA>(Input::new("x"))
        .unwrap()
        .on_queue("nowhere")
        .dispatch()
        .await
        .unwrap_err();

    assert!(matches!(err, JobError::Configuration(_)));
    assert!(app.engine.jobs("nowhere").is_empty());
    assert!(app.engine.jobs("default").is_empty());
}

#[tokio::test]
async fn test_option_overrides() {
    let app = TestApp::new();

    let job = app
        .manager
        .dispatch::<JobA>(Input::new("x"))
        .unwrap()
        .attempts(4)
        .priority(Priority::High)
        .delay(Duration::from_secs(60))
        .dispatch()
        .await
        .unwrap();

    let record = job.record().await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Delayed);
    assert_eq!(record.max_attempts(), 4);
    assert_eq!(record.options.priority_level(), Priority::High);
}

#[tokio::test]
async fn test_invalid_option_rejected() {
    let app = TestApp::new();

    let err = app
        .manager
        .dispatch::<JobA>(Input::new("x"))
        .unwrap()
        .with_option("attempts", "many")
        .dispatch()
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::Configuration(_)));
}

#[tokio::test]
async fn test_job_id_deduplicates() {
    let app = TestApp::new();

    let first = app
        .manager
        .dispatch::<JobA>(Input::new("x"))
        .unwrap()
        .job_id("report-2024-01")
        .dispatch()
        .await
        .unwrap();
    let second = app
        .manager
        .dispatch::<JobA>(Input::new("y"))
        .unwrap()
        .job_id("report-2024-01")
        .dispatch()
        .await
        .unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(app.engine.jobs("default").len(), 1);
}

#[tokio::test]
async fn test_encrypted_payload_never_stored_in_clear() {
    let app = TestApp::new();
    let secret = Credentials {
        api_token: "tok_live_4242".to_string(),
    };

    let job = app
        .manager
        .dispatch::<RotateToken>(secret.clone())
        .unwrap()
        .dispatch()
        .await
        .unwrap();

    let stored = job.record().await.unwrap().unwrap().data;
    let wire = stored.as_str().unwrap();
    assert!(wire.starts_with(ENCRYPTED_PREFIX));
    assert!(!wire.contains("tok_live_4242"));

    let decrypted = app.manager.cipher().decrypt(&stored).unwrap();
    assert_eq!(decrypted, serde_json::to_value(&secret).unwrap());

    let foreign = PayloadCipher::new("another-app-key-entirely");
    assert!(matches!(
        foreign.decrypt(&stored),
        Err(JobError::PayloadCrypto(_))
    ));
}

#[tokio::test]
async fn test_wait_result_times_out_without_workers() {
    let app = TestApp::new();
    let job = app
        .manager
        .dispatch::<JobA>(Input::new("x"))
        .unwrap()
        .dispatch()
        .await
        .unwrap();

    let result = job
        .wait_until_finished_timeout(Duration::from_millis(50))
        .await;
    assert!(result.is_err());
}
