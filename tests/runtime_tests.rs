mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use durapix::client::Client;
use durapix::pipeline::{ImagePayload, IMAGE_PIPELINE, WATER_MARK};
use durapix::providers::in_memory::InMemoryHistoryStore;
use durapix::providers::HistoryStore;
use durapix::runtime::registry::{ActivityRegistry, OrchestrationRegistry};
use durapix::runtime::{OrchestrationStatus, Runtime, RuntimeOptions, StartError, WaitError};
use durapix::{ActivityError, ErrorKind};

use common::{fast_options, sample_image_uri, start_pipeline_runtime, FailingSink, RecordingSink};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn pipeline_completes_and_persists_side_output() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let sink = Arc::new(RecordingSink::default());
    let (runtime, client) = start_pipeline_runtime(store, sink.clone(), fast_options()).await;

    let instance = client.start(IMAGE_PIPELINE, sample_image_uri()).await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();

    // The orchestration returns the grayscale output, not the watermarked one.
    let OrchestrationStatus::Completed { output } = status else {
        panic!("expected completion, got {status:?}");
    };
    let image = ImagePayload::from_data_uri(&output).unwrap();
    assert_eq!(image.bytes, b"px|r|g");

    // The watermarked version went to the sink under the instance id.
    let saved = sink.saved.lock().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].0, instance);
    assert_eq!(saved[0].1.bytes, b"px|r|g|w");

    runtime.shutdown().await;
}

#[tokio::test]
async fn sink_failure_does_not_fail_the_pipeline() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let (runtime, client) = start_pipeline_runtime(store, Arc::new(FailingSink), fast_options()).await;

    let instance = client.start(IMAGE_PIPELINE, sample_image_uri()).await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();
    assert!(matches!(status, OrchestrationStatus::Completed { .. }));

    runtime.shutdown().await;
}

#[tokio::test]
async fn malformed_input_fails_without_retries() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let sink = Arc::new(RecordingSink::default());
    let (runtime, client) = start_pipeline_runtime(store.clone(), sink, fast_options()).await;

    let instance = client.start(IMAGE_PIPELINE, "not a data uri").await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error.kind, ErrorKind::InvalidImageEncoding);

    // Permanent failure commits on the first attempt: one schedule, one
    // failure, no redispatch.
    let records = store.read(&instance).await.unwrap();
    let schedules = records
        .iter()
        .filter(|r| matches!(r.event, durapix::Event::TaskScheduled { .. }))
        .count();
    assert_eq!(schedules, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn unknown_orchestration_is_rejected_at_start() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let (runtime, client) = start_pipeline_runtime(store, Arc::new(RecordingSink::default()), fast_options()).await;

    let err = client.start("NoSuchWorkflow", sample_image_uri()).await.unwrap_err();
    assert!(matches!(err, StartError::UnknownOrchestration(name) if name == "NoSuchWorkflow"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn duplicate_instance_id_is_rejected() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let (runtime, client) = start_pipeline_runtime(store, Arc::new(RecordingSink::default()), fast_options()).await;

    client
        .start_with_id("job-1", IMAGE_PIPELINE, sample_image_uri())
        .await
        .unwrap();
    let err = client
        .start_with_id("job-1", IMAGE_PIPELINE, sample_image_uri())
        .await
        .unwrap_err();
    assert!(matches!(err, StartError::AlreadyExists(id) if id == "job-1"));

    runtime.shutdown().await;
}

#[tokio::test]
async fn status_for_unknown_instance_is_not_found() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let (runtime, client) = start_pipeline_runtime(store, Arc::new(RecordingSink::default()), fast_options()).await;

    assert_eq!(client.status("missing").await, OrchestrationStatus::NotFound);

    runtime.shutdown().await;
}

async fn start_custom_runtime(
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
) -> (Arc<Runtime>, Client) {
    let store = Arc::new(InMemoryHistoryStore::default());
    let runtime = Runtime::start_with_options(store, Arc::new(activities), orchestrations, options).await;
    let client = Client::new(runtime.clone());
    (runtime, client)
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |_ctx, input: String| {
            let calls = counter.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ActivityError::transient("upstream hiccup"))
                } else {
                    Ok(input)
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("FlakyFlow", |ctx, input: String| async move {
            ctx.schedule_activity("Flaky", input).await
        })
        .build();

    let (runtime, client) = start_custom_runtime(activities, orchestrations, fast_options()).await;
    let instance = client.start("FlakyFlow", "payload").await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();

    assert_eq!(status, OrchestrationStatus::Completed { output: "payload".into() });
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    runtime.shutdown().await;
}

#[tokio::test]
async fn retries_exhaust_and_commit_the_failure() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("Down", move |_ctx, _input: String| {
            let calls = counter.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(ActivityError::transient("still down"))
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("DownFlow", |ctx, input: String| async move {
            ctx.schedule_activity("Down", input).await
        })
        .build();

    let options = RuntimeOptions {
        max_attempts: 2,
        ..fast_options()
    };
    let (runtime, client) = start_custom_runtime(activities, orchestrations, options).await;
    let instance = client.start("DownFlow", "payload").await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();

    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error.kind, ErrorKind::Transient);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    runtime.shutdown().await;
}

#[tokio::test]
async fn unregistered_activity_fails_the_orchestration() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("GhostFlow", |ctx, input: String| async move {
            ctx.schedule_activity("Ghost", input).await
        })
        .build();
    let (runtime, client) =
        start_custom_runtime(ActivityRegistry::builder().build(), orchestrations, fast_options()).await;

    let instance = client.start("GhostFlow", "payload").await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();
    let OrchestrationStatus::Failed { error } = status else {
        panic!("expected failure, got {status:?}");
    };
    assert_eq!(error.kind, ErrorKind::UnknownActivity);

    runtime.shutdown().await;
}

#[tokio::test]
async fn orchestration_can_catch_activity_failure() {
    let activities = ActivityRegistry::builder()
        .register("Boom", |_ctx, _input: String| async move {
            Err::<String, _>(ActivityError::permanent("kaput"))
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("CatchFlow", |ctx, input: String| async move {
            match ctx.schedule_activity("Boom", input).await {
                Ok(out) => Ok(out),
                Err(e) => Ok(format!("recovered from {:?}", e.kind)),
            }
        })
        .build();
    let (runtime, client) = start_custom_runtime(activities, orchestrations, fast_options()).await;

    let instance = client.start("CatchFlow", "payload").await.unwrap();
    let status = client.wait(&instance, WAIT).await.unwrap();
    assert_eq!(
        status,
        OrchestrationStatus::Completed { output: "recovered from Permanent".into() }
    );

    runtime.shutdown().await;
}

#[tokio::test]
async fn terminate_commits_and_signals_cancellation() {
    let cancelled = Arc::new(AtomicU32::new(0));
    let observed = cancelled.clone();
    let activities = ActivityRegistry::builder()
        .register("Nap", move |ctx, _input: String| {
            let observed = observed.clone();
            async move {
                ctx.cancelled().await;
                observed.fetch_add(1, Ordering::SeqCst);
                Ok("woke".into())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("NapFlow", |ctx, input: String| async move {
            ctx.schedule_activity("Nap", input).await
        })
        .build();
    let (runtime, client) = start_custom_runtime(activities, orchestrations, fast_options()).await;

    let instance = client.start("NapFlow", "payload").await.unwrap();
    // Give the runtime a moment to dispatch before terminating.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.terminate(&instance, "operator request").await;

    let status = client.wait(&instance, WAIT).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Terminated { reason: "operator request".into() });

    // The in-flight activity observes the cancel signal.
    tokio::time::timeout(WAIT, async {
        while cancelled.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("activity never observed cancellation");

    runtime.shutdown().await;
}

#[tokio::test]
async fn wait_times_out_on_stuck_instance() {
    let activities = ActivityRegistry::builder()
        .register("Forever", |ctx, _input: String| async move {
            ctx.cancelled().await;
            Ok(String::new())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("ForeverFlow", |ctx, input: String| async move {
            ctx.schedule_activity("Forever", input).await
        })
        .build();
    let (runtime, client) = start_custom_runtime(activities, orchestrations, fast_options()).await;

    let instance = client.start("ForeverFlow", "payload").await.unwrap();
    let err = client.wait(&instance, Duration::from_millis(100)).await.unwrap_err();
    assert_eq!(err, WaitError::Timeout);

    runtime.shutdown().await;
}

#[tokio::test]
async fn status_report_carries_timestamps() {
    let store = Arc::new(InMemoryHistoryStore::default());
    let (runtime, client) = start_pipeline_runtime(store, Arc::new(RecordingSink::default()), fast_options()).await;

    let instance = client.start(IMAGE_PIPELINE, sample_image_uri()).await.unwrap();
    client.wait(&instance, WAIT).await.unwrap();

    let report = client.status_report(&instance).await.unwrap();
    assert!(matches!(report.status, OrchestrationStatus::Completed { .. }));
    let created = report.created_ms.unwrap();
    let updated = report.updated_ms.unwrap();
    assert!(updated >= created);

    runtime.shutdown().await;
}

#[tokio::test]
async fn history_records_gap_free_sequence() {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    let sink = Arc::new(RecordingSink::default());
    let (runtime, client) = start_pipeline_runtime(store.clone(), sink, fast_options()).await;

    let instance = client.start(IMAGE_PIPELINE, sample_image_uri()).await.unwrap();
    client.wait(&instance, WAIT).await.unwrap();

    let records = store.read(&instance).await.unwrap();
    let scheduled: Vec<u64> = records
        .iter()
        .filter_map(|r| match &r.event {
            durapix::Event::TaskScheduled { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(scheduled, vec![0, 1, 2]);

    // Every scheduled task resolved exactly once.
    let resolved: Vec<u64> = records
        .iter()
        .filter_map(|r| match &r.event {
            durapix::Event::TaskCompleted { seq, .. } | durapix::Event::TaskFailed { seq, .. } => Some(*seq),
            _ => None,
        })
        .collect();
    assert_eq!(resolved, vec![0, 1, 2]);

    // The watermark step ran on the grayscale output.
    let marked_input = records.iter().find_map(|r| match &r.event {
        durapix::Event::TaskScheduled { seq: 2, name, input } if name == WATER_MARK => Some(input.clone()),
        _ => None,
    });
    let image = ImagePayload::from_data_uri(&marked_input.unwrap()).unwrap();
    assert_eq!(image.bytes, b"px|r|g");

    runtime.shutdown().await;
}
