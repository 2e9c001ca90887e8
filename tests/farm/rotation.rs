use std::time::Duration;

use crate::support::{
    helpers::{devices, farm, init_tracing, rotation_plan, settle, wait_until},
    mock_executor::{ExecutorBehavior, FleetEvent, MockFleet, RecordingProfileStore},
};
use anyhow::Result;
use farmhand::{
    RotationConfig, RotationMeta, RotationMode, TaskId, TaskKind, TaskPlan, TaskRequest,
};
use tokio::time::sleep;

const SESSION: Duration = Duration::from_millis(30);

fn started(device: &str, task: &str) -> (String, TaskId) {
    (device.to_string(), TaskId::new(task))
}

fn position(events: &[FleetEvent], wanted: &FleetEvent, nth: usize) -> usize {
    events
        .iter()
        .enumerate()
        .filter(|(_, event)| *event == wanted)
        .nth(nth)
        .map(|(index, _)| index)
        .unwrap_or_else(|| panic!("event {wanted:?} #{nth} never happened"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_runs_one_session_at_a_time() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::timed(SESSION));
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let plan = rotation_plan(&[(1, 0), (1, 1), (2, 0), (2, 1)]);
    let config = RotationConfig::new(RotationMode::Sequential, 2, 2);
    farm.start_with_rotation(devices(2), plan, config).await?;
    assert!(farm.stats().rotation_active);

    let mut observed = Vec::new();
    wait_until("rotation finished", || {
        let status = farm.rotation_status();
        observed.push(status.progress_percentage);
        !status.is_rotating
    })
    .await?;

    assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
    let status = farm.rotation_status();
    assert_eq!(status.progress_percentage, 100.0);
    assert_eq!(status.current_loop, 2);
    assert_eq!(status.mode, RotationMode::Sequential);

    let device = |id: &str| id.to_string();
    let task = |id: &str| TaskId::new(id);
    assert_eq!(
        fleet.events(),
        vec![
            FleetEvent::Started { device: device("device_1"), task: task("task_1") },
            FleetEvent::Finished { device: device("device_1") },
            FleetEvent::Started { device: device("device_2"), task: task("task_2") },
            FleetEvent::Finished { device: device("device_2") },
            FleetEvent::Started { device: device("device_1"), task: task("task_3") },
            FleetEvent::Finished { device: device("device_1") },
            FleetEvent::Started { device: device("device_2"), task: task("task_4") },
            FleetEvent::Finished { device: device("device_2") },
        ]
    );

    // rotation tasks never enter the dispatch queue
    assert!(farm.tasks().is_empty());
    settle().await;
    assert_eq!(farm.stats().counters.completed_tasks, 4);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn loops_run_in_ascending_order() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::timed(SESSION));
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    // task_1 belongs to loop 2, task_2 to loop 1
    let plan = rotation_plan(&[(2, 0), (1, 0)]);
    let config = RotationConfig::new(RotationMode::Sequential, 2, 1);
    farm.start_with_rotation(devices(1), plan, config).await?;
    wait_until("rotation finished", || !farm.rotation_status().is_rotating).await?;

    assert_eq!(
        fleet.start_order(),
        vec![started("device_1", "task_2"), started("device_1", "task_1")]
    );

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_accounts_report_no_progress() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::timed(SESSION));
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let config = RotationConfig::new(RotationMode::Sequential, 1, 0);
    farm.start_with_rotation(devices(1), rotation_plan(&[(1, 0)]), config)
        .await?;
    assert_eq!(farm.rotation_status().progress_percentage, 0.0);
    wait_until("rotation finished", || !farm.rotation_status().is_rotating).await?;
    assert_eq!(farm.rotation_status().progress_percentage, 0.0);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_drains_one_device_before_the_next() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::timed(SESSION));
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    // accounts 0 and 2 land on device_1, account 1 on device_2
    let plan = rotation_plan(&[(1, 0), (1, 2), (1, 1)]);
    let config = RotationConfig::new(RotationMode::Batch, 1, 3).with_max_concurrent_devices(1);
    farm.start_with_rotation(devices(2), plan, config).await?;
    wait_until("rotation finished", || !farm.rotation_status().is_rotating).await?;

    assert_eq!(
        fleet.start_order(),
        vec![
            started("device_1", "task_1"),
            started("device_1", "task_2"),
            started("device_2", "task_3"),
        ]
    );

    let events = fleet.events();
    let device_1_done = position(
        &events,
        &FleetEvent::Finished {
            device: "device_1".to_string(),
        },
        1,
    );
    let device_2_start = position(
        &events,
        &FleetEvent::Started {
            device: "device_2".to_string(),
            task: TaskId::new("task_3"),
        },
        0,
    );
    assert!(device_1_done < device_2_start);
    assert_eq!(farm.rotation_status().progress_percentage, 100.0);

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_waits_only_for_its_own_device() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::timed(Duration::from_millis(60)));
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let plan = rotation_plan(&[(1, 0), (1, 1), (1, 2), (1, 3)]);
    let config = RotationConfig::new(RotationMode::Concurrent, 1, 4).with_max_concurrent_devices(2);
    farm.start_with_rotation(devices(3), plan, config).await?;
    wait_until("rotation finished", || !farm.rotation_status().is_rotating).await?;

    assert_eq!(
        fleet.start_order(),
        vec![
            started("device_1", "task_1"),
            started("device_2", "task_2"),
            started("device_1", "task_3"),
            started("device_2", "task_4"),
        ]
    );

    let events = fleet.events();
    let second_start = position(
        &events,
        &FleetEvent::Started {
            device: "device_2".to_string(),
            task: TaskId::new("task_2"),
        },
        0,
    );
    let first_finish = position(
        &events,
        &FleetEvent::Finished {
            device: "device_1".to_string(),
        },
        0,
    );
    assert!(second_start < first_finish);

    // devices past the concurrency limit stay idle
    assert!(!events.iter().any(|event| matches!(
        event,
        FleetEvent::Started { device, .. } if device == "device_3"
    )));

    farm.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_interrupts_the_rotation() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::default());
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let plan = rotation_plan(&[(1, 0), (1, 1)]);
    let config = RotationConfig::new(RotationMode::Sequential, 1, 2)
        .with_delay(Duration::from_millis(10));
    farm.start_with_rotation(devices(2), plan, config).await?;
    wait_until("first session", || fleet.start_order().len() == 1).await?;

    let report = farm.stop().await;
    assert!(report.was_running);

    let status = farm.rotation_status();
    assert!(!status.is_rotating);
    assert_eq!(status.current_loop, 0);
    assert_eq!(status.progress_percentage, 0.0);
    assert!(!farm.stats().rotation_active);

    sleep(Duration::from_millis(50)).await;
    assert_eq!(fleet.start_order(), vec![started("device_1", "task_1")]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_device_is_skipped() -> Result<()> {
    init_tracing();
    let fleet = MockFleet::new(ExecutorBehavior::timed(SESSION));
    let store = RecordingProfileStore::new();
    let farm = farm(&fleet, &store);

    let plan = TaskPlan::new(vec![
        TaskRequest::new(TaskKind::GenericBrowse)
            .with_rotation(RotationMeta::new(1, 0).on_device("device_9")),
        TaskRequest::new(TaskKind::GenericBrowse).with_rotation(RotationMeta::new(1, 1)),
    ]);
    let config = RotationConfig::new(RotationMode::Sequential, 1, 2);
    farm.start_with_rotation(devices(1), plan, config).await?;
    wait_until("rotation finished", || !farm.rotation_status().is_rotating).await?;

    assert_eq!(fleet.start_order(), vec![started("device_1", "task_2")]);
    assert_eq!(farm.rotation_status().progress_percentage, 100.0);
    settle().await;
    assert_eq!(farm.stats().counters.completed_tasks, 1);

    farm.stop().await;
    Ok(())
}
