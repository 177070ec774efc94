//! Shutdown Integration Tests
//!
//! Tests that shutdown lets running hardware sequences finish and
//! force-closes only those that overrun their limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reef_orchestrator::adapters::SimulatedLab;
use reef_orchestrator::config::Settings;
use reef_orchestrator::core::{Orchestrator, TaskDocument, TaskStore};
use reef_orchestrator::domain::{SampleLocation, SampleSlot};
use reef_orchestrator::{OperationalState, ScanMode, Task, TaskSettings};
use tempfile::TempDir;

fn test_settings(temp: &TempDir) -> Settings {
    let mut settings = Settings::for_home(temp.path());
    settings.scheduler.poll_interval = Duration::from_millis(50);
    settings.scheduler.watch_task_file = false;
    settings.timeouts.scan_poll = Duration::from_millis(20);
    settings.timeouts.shutdown_grace = Duration::from_millis(500);
    settings
}

async fn start_with_exp1(settings: Settings, lab: &SimulatedLab) -> Orchestrator {
    let task = Task::new(
        "exp1",
        TaskSettings::new(ScanMode::FullAutomation, 3),
        vec!["2024-01-01T10:00:00".parse().unwrap()],
    );
    TaskStore::create(
        &settings.task_file,
        TaskDocument {
            tasks: vec![task],
            slots: vec![SampleSlot::occupied(3)],
        },
    )
    .await
    .unwrap();

    Orchestrator::start(settings, Arc::new(lab.clone()))
        .await
        .unwrap()
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_running_cycle() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(&temp);
    let task_file = settings.task_file.clone();
    let lab = SimulatedLab::new().with_sample(3, "exp1");
    lab.set_scan_polls(10);

    let orchestrator = start_with_exp1(settings, &lab).await;
    wait_until("scan running", || lab.count("scan_start") == 1).await;

    let report = orchestrator.shutdown().await;
    assert!(report.forced.is_empty());
    assert!(report.aborted.is_empty());

    // The cycle ran to the end: plate home, time point recorded
    assert_eq!(lab.sample_location(3), Some(SampleLocation::IncubatorSlot));
    let store = TaskStore::open(&task_file).await.unwrap();
    let task = store.task("exp1").unwrap();
    assert_eq!(task.operational_state, OperationalState::Completed);
    assert_eq!(task.imaged_time_points.len(), 1);
}

#[tokio::test]
async fn test_overrunning_section_is_forced_and_task_failed() {
    let temp = TempDir::new().unwrap();
    let mut settings = test_settings(&temp);
    settings.timeouts.unload = Duration::from_secs(30);
    settings.timeouts.max_section = Duration::from_millis(300);
    let task_file = settings.task_file.clone();
    let lab = SimulatedLab::new().with_sample(3, "exp1");
    lab.hang("microscope_to_incubator");

    let orchestrator = start_with_exp1(settings, &lab).await;
    wait_until("unload hanging", || lab.count("microscope_to_incubator") == 1).await;

    let started = Instant::now();
    let report = orchestrator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert!(!report.forced.is_empty());
    assert!(report
        .forced
        .iter()
        .all(|f| f.task.as_deref() == Some("exp1")));
    assert!(report.aborted.contains(&"scheduler"));
    assert!(report.aborted.contains(&"transport worker"));

    let store = TaskStore::open(&task_file).await.unwrap();
    let task = store.task("exp1").unwrap();
    assert_eq!(task.operational_state, OperationalState::Error);
    assert!(task
        .message
        .unwrap()
        .starts_with("CriticalSectionTimeout"));
}

#[tokio::test]
async fn test_long_scan_within_its_own_timeout_is_not_forced() {
    let temp = TempDir::new().unwrap();
    let mut settings = test_settings(&temp);
    settings.timeouts.max_section = Duration::from_millis(200);
    let task_file = settings.task_file.clone();

    let mut task = Task::new(
        "exp1",
        TaskSettings::new(ScanMode::FullAutomation, 3),
        vec!["2024-01-01T10:00:00".parse().unwrap()],
    );
    task.settings.imaging.scan_timeout_minutes = 120;
    TaskStore::create(
        &task_file,
        TaskDocument {
            tasks: vec![task],
            slots: vec![SampleSlot::occupied(3)],
        },
    )
    .await
    .unwrap();

    let lab = SimulatedLab::new().with_sample(3, "exp1");
    lab.set_scan_polls(30);
    let orchestrator = Orchestrator::start(settings, Arc::new(lab.clone()))
        .await
        .unwrap();
    wait_until("scan running", || lab.count("scan_start") == 1).await;

    // The scan outlasts max_section but not the task's own scan timeout
    let report = orchestrator.shutdown().await;
    assert!(report.forced.is_empty());
    assert!(report.aborted.is_empty());

    let store = TaskStore::open(&task_file).await.unwrap();
    let task = store.task("exp1").unwrap();
    assert_eq!(task.operational_state, OperationalState::Completed);
    assert_eq!(lab.sample_location(3), Some(SampleLocation::IncubatorSlot));
}

#[tokio::test]
async fn test_idle_shutdown_is_prompt() {
    let temp = TempDir::new().unwrap();
    let settings = test_settings(&temp);
    TaskStore::create(&settings.task_file, TaskDocument::default())
        .await
        .unwrap();

    let orchestrator = Orchestrator::start(settings, Arc::new(SimulatedLab::new()))
        .await
        .unwrap();

    let started = Instant::now();
    let report = orchestrator.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.forced.is_empty());
    assert!(report.aborted.is_empty());
}
