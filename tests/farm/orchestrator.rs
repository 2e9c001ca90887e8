use std::{sync::Arc, time::Duration};

use crate::support::{
    helpers::{browse_plan, devices, farm, farm_with_config, init_tracing, settle, wait_until},
    mock_executor::{ExecutorBehavior, MockFleet, RecordingProfileStore},
};
use anyhow::Result;
use farmhand::{
    Credential, DeviceConfig, FarmConfig, FarmError, FarmOrchestrator, FarmState, SimulatedExecutorFactory,
    StopReport, TaskId, TaskKind, TaskPlan, TaskRequest, TaskStatus,
};
use serde_json::json;
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatch_fills_available_devices_in_queue_order() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    farm.start(devices(2), browse_plan(3)).await?;
    assert!(farm.is_running());

    wait_until("two tasks in flight", || farm.task_counts().in_flight() == 2).await?;
    settle().await;

    let counts = farm.task_counts();
    assert_eq!(counts.running, 2);
    assert_eq!(counts.pending, 1);
    assert_eq!(farm.stats().counters.active_sessions, 2);
    assert_eq!(
        fleet.executor("device_1").started_tasks(),
        vec![TaskId::new("task_1")]
    );
    assert_eq!(
        fleet.executor("device_2").started_tasks(),
        vec![TaskId::new("task_2")]
    );

    fleet.executor("device_1").finish();
    wait_until("third task picked up by the freed device", || {
        let counts = farm.task_counts();
        counts.completed == 1 && counts.running == 2
    })
    .await?;
    assert_eq!(
        fleet.executor("device_1").started_tasks(),
        vec![TaskId::new("task_1"), TaskId::new("task_3")]
    );

    let tasks = farm.tasks();
    assert_eq!(tasks[0].status, TaskStatus::Completed);
    assert_eq!(tasks[2].status, TaskStatus::Running);
    assert!(tasks[2].assigned_at.is_some());
    assert_eq!(farm.stats().counters.completed_tasks, 1);

    let report = farm.stop().await;
    assert!(report.was_running);
    assert_eq!(report.devices_stopped, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_task_is_rejected_without_touching_the_queue() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.start(devices(1), browse_plan(2)).await?;

    let before = farm.tasks().len();
    let err = farm
        .add_task(TaskRequest::new(TaskKind::EngagementSearch))
        .unwrap_err();
    assert!(matches!(err, FarmError::TaskValidation { .. }));
    assert_eq!(farm.tasks().len(), before);

    let request = TaskRequest::from_value(json!({
        "type": "youtube",
        "video_urls": ["https://video.example/1"]
    }))?;
    let first = farm.add_task(request.clone())?;
    let second = farm.add_task(request)?;
    assert_eq!(first, TaskId::new("task_3"));
    assert!(second.sequence() > first.sequence());

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_start_fails_without_side_effects() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.start(devices(2), browse_plan(1)).await?;
    wait_until("session started", || farm.task_counts().in_flight() == 1).await?;
    settle().await;
    let counts = farm.task_counts();
    let counters = farm.stats().counters;

    let err = farm.start(devices(5), browse_plan(4)).await.unwrap_err();
    assert!(matches!(err, FarmError::AlreadyRunning));
    assert_eq!(farm.device_ids(), vec!["device_1", "device_2"]);
    assert_eq!(farm.tasks().len(), 1);
    assert!(farm.is_running());

    assert_eq!(farm.task_counts(), counts);
    let after = farm.stats().counters;
    assert_eq!(after.total_devices, counters.total_devices);
    assert_eq!(after.active_sessions, counters.active_sessions);
    assert_eq!(after.completed_tasks, counters.completed_tasks);
    assert_eq!(after.start_time, counters.start_time);
    assert_eq!(fleet.start_order().len(), 1);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_is_idempotent() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    assert_eq!(farm.stop().await, StopReport::default());

    farm.start(devices(2), browse_plan(2)).await?;
    wait_until("sessions active", || farm.stats().counters.active_sessions == 2).await?;

    let report = farm.stop().await;
    assert_eq!(
        report,
        StopReport {
            was_running: true,
            devices_stopped: 2
        }
    );
    assert_eq!(farm.state(), FarmState::NotRunning);
    assert_eq!(farm.stats().counters.active_sessions, 0);
    assert_eq!(farm.stats().counters.completed_tasks, 0);

    assert_eq!(farm.stop().await, StopReport::default());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_failures_are_counted_not_propagated() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior {
        fail_stop: true,
        ..ExecutorBehavior::default()
    });
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.start(devices(2), TaskPlan::default()).await?;

    let report = farm.stop().await;
    assert!(report.was_running);
    assert_eq!(report.devices_stopped, 0);
    assert_eq!(fleet.executor("device_1").stop_calls(), 1);
    assert_eq!(farm.state(), FarmState::NotRunning);

    // the farm can be started again afterwards
    farm.start(devices(1), TaskPlan::default()).await?;
    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn force_cleanup_resets_everything() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.start(devices(2), browse_plan(3)).await?;
    wait_until("two tasks in flight", || farm.task_counts().in_flight() == 2).await?;

    let report = farm.force_cleanup().await;
    assert!(report.was_running);
    assert_eq!(report.devices_stopped, 2);

    assert_eq!(farm.state(), FarmState::NotRunning);
    assert!(farm.device_ids().is_empty());
    assert!(farm.tasks().is_empty());
    let stats = farm.stats();
    assert_eq!(stats.counters.total_devices, 0);
    assert_eq!(stats.counters.active_sessions, 0);
    assert_eq!(stats.counters.completed_tasks, 0);
    assert!(stats.counters.start_time.is_none());

    // ids restart after a cleanup
    let id = farm.add_task(TaskRequest::new(TaskKind::GenericBrowse))?;
    assert_eq!(id, TaskId::new("task_1"));

    // a cleanup from NotRunning is harmless
    let report = farm.force_cleanup().await;
    assert!(!report.was_running);
    Ok(())
}

#[tokio::test]
async fn missing_collaborators_are_reported() {
    init_tracing();
    let farm = FarmOrchestrator::builder()
        .executor_factory(Arc::new(SimulatedExecutorFactory::default()))
        .build();

    let err = farm.start(devices(1), TaskPlan::default()).await.unwrap_err();
    assert!(matches!(
        err,
        FarmError::NotInitialized {
            component: "profile store"
        }
    ));
    assert_eq!(farm.state(), FarmState::NotRunning);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_initialization_failure_rolls_back() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::failing_on(ExecutorBehavior::default(), "device_2");
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let err = farm.start(devices(3), browse_plan(1)).await.unwrap_err();
    match err {
        FarmError::DeviceInitialization { device_id, reason } => {
            assert_eq!(device_id, "device_2");
            assert!(reason.contains("no browser"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(farm.state(), FarmState::NotRunning);
    assert!(farm.device_ids().is_empty());

    farm.start(devices(1), browse_plan(1)).await?;
    assert!(farm.is_running());
    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accounts_fill_devices_without_credentials() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.update_accounts(vec![
        Credential::new("first@example.com", "one"),
        Credential::new("second@example.com", "two"),
    ]);

    let configs = vec![
        DeviceConfig::default(),
        DeviceConfig::default().with_credential(Credential::new("own@example.com", "own")),
    ];
    farm.start(configs, browse_plan(2)).await?;
    wait_until("both sessions started", || farm.task_counts().in_flight() == 2).await?;

    let account = |device: &str| {
        fleet
            .executor(device)
            .last_credential()
            .map(|credential| credential.account)
    };
    assert_eq!(account("device_1").as_deref(), Some("first@example.com"));
    assert_eq!(account("device_2").as_deref(), Some("own@example.com"));
    assert_eq!(farm.stats().total_accounts, 2);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn task_account_overrides_device_credential() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let plan = TaskPlan::new(vec![TaskRequest::new(TaskKind::GenericBrowse)
        .with_account(Credential::new("rotated@example.com", "pw"))]);
    farm.start(devices(1), plan).await?;
    wait_until("session started", || farm.task_counts().in_flight() == 1).await?;

    let credential = fleet.executor("device_1").last_credential();
    assert_eq!(
        credential.map(|credential| credential.account).as_deref(),
        Some("rotated@example.com")
    );

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn profile_failures_leave_the_task_pending() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    store.fail_for("device_1");
    let farm = farm(&fleet, &store);

    farm.start(devices(2), browse_plan(2)).await?;
    wait_until("device_2 busy", || farm.task_counts().in_flight() == 1).await?;
    settle().await;

    assert!(fleet.executor("device_1").started_tasks().is_empty());
    assert_eq!(farm.task_counts().pending, 1);
    assert!(store.requests().iter().filter(|id| *id == "device_1").count() >= 1);
    assert_eq!(farm.stats().counters.active_sessions, 1);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn device_statuses_cover_every_device() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.start(devices(3), browse_plan(1)).await?;
    wait_until("one session", || farm.task_counts().in_flight() == 1).await?;

    let statuses = farm.device_statuses().await;
    assert_eq!(statuses.len(), 3);
    assert!(statuses["device_1"].is_active);
    assert_eq!(
        statuses["device_1"].current_task.as_ref().map(|task| task.id.clone()),
        Some(TaskId::new("task_1"))
    );
    assert!(!statuses["device_3"].is_active);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cleanup_during_start_aborts_it() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::slow_to_build(ExecutorBehavior::default(), Duration::from_millis(100));
    let store = RecordingProfileStore::new();
    let farm = Arc::new(farm(&fleet, &store));

    let starting = {
        let farm = Arc::clone(&farm);
        tokio::spawn(async move { farm.start(devices(2), browse_plan(2)).await })
    };
    wait_until("start under way", || farm.state() == FarmState::Starting).await?;

    let report = farm.force_cleanup().await;
    assert!(report.was_running);

    let err = starting.await?.unwrap_err();
    assert!(matches!(err, FarmError::StartAborted));
    assert_eq!(farm.state(), FarmState::NotRunning);
    assert!(!farm.is_running());
    assert!(farm.device_ids().is_empty());
    assert_eq!(farm.stats().counters.total_devices, 0);

    settle().await;
    assert!(fleet.start_order().is_empty());

    // a later start is unaffected by the aborted one
    farm.start(devices(1), browse_plan(1)).await?;
    wait_until("session started", || farm.task_counts().in_flight() == 1).await?;
    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn declined_sessions_keep_the_task_pending() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior {
        decline_sessions: true,
        ..ExecutorBehavior::default()
    });
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);
    farm.start(devices(1), browse_plan(1)).await?;
    settle().await;

    let executor = fleet.executor("device_1");
    assert!(executor.started_tasks().is_empty());
    assert_eq!(farm.task_counts().pending, 1);
    assert_eq!(farm.stats().counters.active_sessions, 0);

    executor.set_accept(true);
    wait_until("task dispatched", || farm.task_counts().in_flight() == 1).await?;
    assert_eq!(executor.started_tasks(), vec![TaskId::new("task_1")]);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn uptime_is_current_between_aggregations() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let config = FarmConfig::builder()
        .dispatch_interval(Duration::from_millis(20))
        .health_check_interval(Duration::from_millis(15))
        .stats_interval(Duration::from_secs(30))
        .shutdown_timeout(Duration::from_millis(500))
        .status_timeout(Duration::from_millis(200))
        .build()?;
    let farm = farm_with_config(&fleet, &store, config);

    farm.start(devices(1), TaskPlan::default()).await?;
    sleep(Duration::from_millis(1100)).await;
    assert!(farm.stats().counters.uptime_secs >= 1);

    farm.stop().await;
    Ok(())
}
