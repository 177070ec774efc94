//! Task scheduler: turns due time points into load → scan → unload cycles.
//!
//! Each tick takes a snapshot of the task document, completes tasks with no
//! pending time points, and runs one cycle per due task in (time point, name)
//! order. Cycles run one after another, so two tasks' transports never
//! interleave. Any hardware failure puts the owning task into `error`; a
//! failure to persist the task document halts dispatch until a later tick
//! manages to write the pending updates.

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{SchedulerSettings, ServiceSettings};
use crate::core::guard::{CriticalSectionGuard, SectionToken};
use crate::core::halt::{DispatchHalt, StoreOp};
use crate::core::health::ServiceTable;
use crate::core::imaging::{self, ScanPolicy};
use crate::core::task_store::TaskStore;
use crate::core::transport::TransportQueue;
use crate::domain::{OperationalState, ScanMode, Task, TimePoint, TransportRequest};
use crate::error::{OrchestratorError, Result};

/// Shortest sleep between ticks
const MIN_SLEEP: Duration = Duration::from_millis(100);

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub imaged: Vec<(String, TimePoint)>,
    pub failed: Vec<String>,
    /// Due tasks skipped because a required service is unreachable
    pub deferred: Vec<String>,
    pub completed: Vec<String>,
    pub halted: bool,
}

/// Why a cycle ended early
enum CycleError {
    /// Shutdown was requested before the cycle could begin
    Shutdown,
    /// Task store could not be written; dispatch is halted
    Halted,
    /// Hardware or state failure owned by the task
    Task(OrchestratorError),
}

impl From<OrchestratorError> for CycleError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::ShutdownPending => Self::Shutdown,
            other => Self::Task(other),
        }
    }
}

#[derive(Clone)]
pub struct Scheduler {
    store: TaskStore,
    services: ServiceTable,
    transport: TransportQueue,
    guard: CriticalSectionGuard,
    service_settings: ServiceSettings,
    settings: SchedulerSettings,
    scan_policy: ScanPolicy,
    halt: DispatchHalt,
    reload: Arc<Notify>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: TaskStore,
        services: ServiceTable,
        transport: TransportQueue,
        guard: CriticalSectionGuard,
        service_settings: ServiceSettings,
        settings: SchedulerSettings,
        scan_policy: ScanPolicy,
        halt: DispatchHalt,
    ) -> Self {
        Self {
            store,
            services,
            transport,
            guard,
            service_settings,
            settings,
            scan_policy,
            halt,
            reload: Arc::new(Notify::new()),
        }
    }

    /// Reason dispatch is halted, if it is
    pub fn halted(&self) -> Option<String> {
        self.halt.reason()
    }

    /// Ask the run loop to re-read the task file
    pub fn request_reload(&self) {
        self.reload.notify_one();
    }

    /// Re-read the task file now. A malformed file halts dispatch.
    pub async fn reload(&self) -> Result<bool> {
        match self.store.reload().await {
            Ok(changed) => {
                if changed {
                    info!("Task file reloaded");
                }
                Ok(changed)
            }
            Err(e) => {
                if e.halts_dispatch() {
                    self.halt.enter(&e, None);
                }
                Err(e)
            }
        }
    }

    /// Apply a store update; a halting failure keeps the update for retry
    async fn persist(&self, op: StoreOp) -> std::result::Result<(), CycleError> {
        match op.apply(&self.store).await {
            Ok(()) => Ok(()),
            Err(e) if e.halts_dispatch() => {
                self.halt.enter(&e, Some(op));
                Err(CycleError::Halted)
            }
            Err(e) => Err(CycleError::Task(e)),
        }
    }

    /// First service `task` needs that is not live, if any
    fn missing_service(&self, task: &Task) -> Option<String> {
        let ids = &self.service_settings;
        let mut required = vec![task.settings.allocated_microscope.as_str()];
        if task.settings.scan_mode == ScanMode::FullAutomation {
            required.push(ids.incubator_id.as_str());
            required.push(ids.arm_id.as_str());
        }
        required
            .into_iter()
            .find(|name| !self.services.is_live(name))
            .map(str::to_string)
    }

    /// Earliest pending time point among dispatchable tasks
    pub fn next_due(&self) -> Option<TimePoint> {
        self.store
            .tasks()
            .iter()
            .filter(|t| t.operational_state.is_dispatchable())
            .filter_map(Task::next_time_point)
            .min()
    }

    /// One scheduling pass at wall-clock time `now`
    pub async fn tick(&self, now: TimePoint) -> TickReport {
        let mut report = TickReport::default();

        if !self.halt.try_resume(&self.store).await {
            report.halted = true;
            return report;
        }

        let tasks = self.store.tasks();

        for task in tasks.iter().filter(|t| {
            t.operational_state.is_dispatchable() && t.pending_time_points.is_empty()
        }) {
            match self.complete(task).await {
                Ok(()) => report.completed.push(task.name.clone()),
                Err(CycleError::Halted) => {
                    report.halted = true;
                    return report;
                }
                Err(CycleError::Task(e)) => {
                    warn!(task = %task.name, error = %e, "Could not complete task")
                }
                Err(CycleError::Shutdown) => {}
            }
        }

        let mut due: Vec<(TimePoint, String)> = tasks
            .iter()
            .filter(|t| t.operational_state.is_dispatchable())
            .filter_map(|t| t.due_time_point(now).map(|tp| (tp, t.name.clone())))
            .collect();
        due.sort();

        for (time_point, name) in due {
            if self.guard.is_shutdown_requested() {
                debug!("Shutdown pending; no further dispatch this tick");
                break;
            }
            // A transport may have failed to record a slot during the last cycle
            if self.halt.is_halted() {
                report.halted = true;
                break;
            }

            // An earlier cycle may have taken long enough for the operator to intervene
            let Some(current) = self.store.task(&name) else { continue };
            if !current.operational_state.is_dispatchable()
                || current.due_time_point(now) != Some(time_point)
            {
                debug!(task = %name, "Task changed since tick began; skipped");
                continue;
            }
            let task = &current;

            if let Some(service) = self.missing_service(task) {
                info!(task = %task.name, %service, "Service unavailable; dispatch deferred");
                report.deferred.push(task.name.clone());
                continue;
            }

            match self.run_cycle(task, time_point).await {
                Ok(()) => report.imaged.push((task.name.clone(), time_point)),
                Err(CycleError::Shutdown) => break,
                Err(CycleError::Halted) => {
                    report.halted = true;
                    break;
                }
                Err(CycleError::Task(e)) => {
                    error!(task = %task.name, %time_point, error = %e, "Imaging cycle failed");
                    report.failed.push(task.name.clone());
                    let op = StoreOp::SetError {
                        task: task.name.clone(),
                        message: e.to_string(),
                    };
                    match self.persist(op).await {
                        Err(CycleError::Halted) => {
                            report.halted = true;
                            break;
                        }
                        Err(CycleError::Task(e)) => {
                            warn!(task = %task.name, error = %e, "Could not record task failure")
                        }
                        _ => {}
                    }
                }
            }
        }

        report
    }

    async fn complete(&self, task: &Task) -> std::result::Result<(), CycleError> {
        if task.operational_state == OperationalState::Pending {
            self.persist(StoreOp::Advance {
                task: task.name.clone(),
                to: OperationalState::Started,
            })
            .await?;
        }
        self.persist(StoreOp::Advance {
            task: task.name.clone(),
            to: OperationalState::Completed,
        })
        .await?;
        info!(task = %task.name, imaged = task.imaged_time_points.len(), "Task completed");
        Ok(())
    }

    #[instrument(skip_all, fields(task = %task.name, time_point = %time_point))]
    async fn run_cycle(
        &self,
        task: &Task,
        time_point: TimePoint,
    ) -> std::result::Result<(), CycleError> {
        let section = self.guard.begin_with_limit(
            format!("cycle {}", task.name),
            Some(task.name.as_str()),
            self.scan_policy.cycle_limit(task),
        )?;

        if task.operational_state == OperationalState::Pending {
            self.persist(StoreOp::Advance {
                task: task.name.clone(),
                to: OperationalState::Started,
            })
            .await?;
        }

        info!(mode = ?task.settings.scan_mode, microscope = %task.settings.allocated_microscope, "Imaging cycle started");

        match task.settings.scan_mode {
            ScanMode::FullAutomation => self.full_cycle(task, &section).await?,
            ScanMode::MicroscopeOnly => self.scan(task).await?,
        }

        // Completion is decided inside the store write, against the plan as
        // it is now; the operator may have edited it during the cycle
        let imaged = self
            .persist(StoreOp::MarkImaged {
                task: task.name.clone(),
                time_point,
            })
            .await;
        match imaged {
            Ok(()) => {}
            Err(CycleError::Task(e)) => {
                warn!(error = %e, "Imaged time point no longer in the plan; not recorded")
            }
            Err(other) => return Err(other),
        }

        section.end();
        info!("Imaging cycle finished");
        Ok(())
    }

    async fn full_cycle(&self, task: &Task, section: &SectionToken) -> Result<()> {
        let slot = task.settings.incubator_slot;
        let microscope = &task.settings.allocated_microscope;

        self.transport
            .enqueue_within(
                TransportRequest::load(slot, microscope.clone()).for_task(&task.name),
                section,
            )
            .wait()
            .await?;

        if let Err(scan_err) = self.scan(task).await {
            if self.settings.cleanup_unload_on_imaging_failure {
                warn!(task = %task.name, "Returning sample to incubator after imaging failure");
                let cleanup = self
                    .transport
                    .enqueue_within(
                        TransportRequest::unload(slot, microscope.clone()).for_task(&task.name),
                        section,
                    )
                    .wait()
                    .await;
                if let Err(e) = cleanup {
                    error!(task = %task.name, error = %e, "Clean-up unload failed");
                }
            }
            return Err(scan_err);
        }

        self.transport
            .enqueue_within(
                TransportRequest::unload(slot, microscope.clone()).for_task(&task.name),
                section,
            )
            .wait()
            .await?;
        Ok(())
    }

    async fn scan(&self, task: &Task) -> Result<()> {
        let microscope_id = &task.settings.allocated_microscope;
        let microscope = self.services.live_microscope(microscope_id).ok_or_else(|| {
            OrchestratorError::ServiceUnavailable {
                service: microscope_id.clone(),
            }
        })?;
        let incubator = self
            .services
            .live_incubator(&self.service_settings.incubator_id);

        imaging::run_scan(task, incubator, microscope, &self.scan_policy).await
    }

    fn sleep_for(&self, now: TimePoint) -> Duration {
        let until_due = self
            .next_due()
            .and_then(|due| (due - now).to_std().ok())
            .unwrap_or(self.settings.poll_interval);
        until_due.min(self.settings.poll_interval).max(MIN_SLEEP)
    }

    /// Tick until `stop` fires
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            poll_s = self.settings.poll_interval.as_secs_f64(),
            "Scheduler started"
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let now = Local::now().naive_local();
            let report = self.tick(now).await;
            if !report.imaged.is_empty() || !report.failed.is_empty() {
                info!(
                    imaged = report.imaged.len(),
                    failed = report.failed.len(),
                    deferred = report.deferred.len(),
                    "Tick finished"
                );
            }

            let pause = self.sleep_for(Local::now().naive_local());
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.reload.notified() => {
                    // Errors are logged and halt dispatch inside reload()
                    let _ = self.reload().await;
                }
                _ = stop.changed() => break,
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ServiceConnector, SimulatedLab};
    use crate::config::Timeouts;
    use crate::core::task_store::TaskDocument;
    use crate::domain::{SampleLocation, SampleSlot, ServiceKind, TaskSettings};
    use tempfile::TempDir;

    const MICROSCOPE: &str = "microscope-control-squid-1";

    fn tp(s: &str) -> TimePoint {
        s.parse().unwrap()
    }

    struct Rig {
        _temp: TempDir,
        lab: SimulatedLab,
        services: ServiceTable,
        guard: CriticalSectionGuard,
        store: TaskStore,
        scheduler: Scheduler,
    }

    async fn rig(tasks: Vec<Task>, timeouts: Timeouts) -> Rig {
        let temp = TempDir::new().unwrap();
        let mut lab = SimulatedLab::new();
        let slots = tasks
            .iter()
            .map(|t| SampleSlot::occupied(t.settings.incubator_slot))
            .collect();
        for task in &tasks {
            lab = lab.with_sample(task.settings.incubator_slot, task.name.clone());
        }

        let settings = ServiceSettings::default();
        let services = ServiceTable::new();
        for (name, kind) in [
            (settings.incubator_id.clone(), ServiceKind::Incubator),
            (settings.arm_id.clone(), ServiceKind::RoboticArm),
            (MICROSCOPE.to_string(), ServiceKind::Microscope),
        ] {
            let proxy = lab.connect(kind, &name).await.unwrap();
            services.register(&name, kind, Some(proxy));
        }

        let store = TaskStore::create(temp.path().join("tasks.json"), TaskDocument { tasks, slots })
            .await
            .unwrap();
        let guard = CriticalSectionGuard::new(Duration::from_secs(60));
        let halt = DispatchHalt::new();
        let (transport, worker) = TransportQueue::new(
            services.clone(),
            settings.clone(),
            timeouts.clone(),
            guard.clone(),
            store.clone(),
            halt.clone(),
        );
        worker.spawn();

        let scan_policy = ScanPolicy {
            poll_interval: Duration::from_millis(5),
            ..ScanPolicy::from_timeouts(&timeouts)
        };
        let scheduler = Scheduler::new(
            store.clone(),
            services.clone(),
            transport,
            guard.clone(),
            settings,
            SchedulerSettings::default(),
            scan_policy,
            halt,
        );

        Rig {
            _temp: temp,
            lab,
            services,
            guard,
            store,
            scheduler,
        }
    }

    fn full_task(name: &str, slot: u8, points: &[&str]) -> Task {
        Task::new(
            name,
            TaskSettings::new(ScanMode::FullAutomation, slot),
            points.iter().map(|p| tp(p)).collect(),
        )
    }

    #[tokio::test]
    async fn test_due_time_point_is_imaged() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00", "2024-01-01T12:00:00"])],
            Timeouts::default(),
        )
        .await;

        let report = rig.scheduler.tick(tp("2024-01-01T10:30:00")).await;
        assert_eq!(report.imaged, vec![("exp1".to_string(), tp("2024-01-01T10:00:00"))]);

        let task = rig.store.task("exp1").unwrap();
        assert_eq!(task.operational_state, OperationalState::Started);
        assert_eq!(task.imaged_time_points, vec![tp("2024-01-01T10:00:00")]);
        assert_eq!(task.pending_time_points, vec![tp("2024-01-01T12:00:00")]);
        assert_eq!(rig.lab.sample_location(3), Some(SampleLocation::IncubatorSlot));
        assert_eq!(rig.guard.active_count(), 0);
    }

    #[tokio::test]
    async fn test_not_yet_due_is_left_alone() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;

        let report = rig.scheduler.tick(tp("2024-01-01T09:00:00")).await;
        assert_eq!(report, TickReport::default());
        assert!(rig.lab.operations().is_empty());
        assert_eq!(rig.scheduler.next_due(), Some(tp("2024-01-01T10:00:00")));
    }

    #[tokio::test]
    async fn test_last_time_point_completes_task() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;

        rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert_eq!(
            rig.store.task("exp1").unwrap().operational_state,
            OperationalState::Completed
        );
    }

    #[tokio::test]
    async fn test_plan_extended_during_cycle_keeps_task_running() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;
        rig.lab.delay("scan_start", Duration::from_millis(300));

        let scheduler = rig.scheduler.clone();
        let cycle = tokio::spawn(async move { scheduler.tick(tp("2024-01-01T10:00:00")).await });

        while rig.lab.count("scan_start") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut edited = rig.store.task("exp1").unwrap();
        edited.pending_time_points.push(tp("2024-01-02T10:00:00"));
        rig.store.upsert_task(edited).await.unwrap();

        let report = cycle.await.unwrap();
        assert_eq!(report.imaged, vec![("exp1".to_string(), tp("2024-01-01T10:00:00"))]);
        assert!(report.failed.is_empty());

        let task = rig.store.task("exp1").unwrap();
        assert_eq!(task.operational_state, OperationalState::Started);
        assert!(task.message.is_none());
        assert_eq!(task.imaged_time_points, vec![tp("2024-01-01T10:00:00")]);
        assert_eq!(task.pending_time_points, vec![tp("2024-01-02T10:00:00")]);
    }

    #[tokio::test]
    async fn test_time_point_dropped_during_cycle_is_not_an_error() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00", "2024-01-01T12:00:00"])],
            Timeouts::default(),
        )
        .await;
        rig.lab.delay("scan_start", Duration::from_millis(300));

        let scheduler = rig.scheduler.clone();
        let cycle = tokio::spawn(async move { scheduler.tick(tp("2024-01-01T10:00:00")).await });

        while rig.lab.count("scan_start") == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut edited = rig.store.task("exp1").unwrap();
        edited.pending_time_points = vec![tp("2024-01-01T12:00:00")];
        rig.store.upsert_task(edited).await.unwrap();

        let report = cycle.await.unwrap();
        assert!(report.failed.is_empty());
        let task = rig.store.task("exp1").unwrap();
        assert_eq!(task.operational_state, OperationalState::Started);
        assert!(task.imaged_time_points.is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_goes_to_completed() {
        let rig = rig(vec![full_task("empty", 4, &[])], Timeouts::default()).await;

        let report = rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert_eq!(report.completed, vec!["empty".to_string()]);
        assert_eq!(
            rig.store.task("empty").unwrap().operational_state,
            OperationalState::Completed
        );
    }

    #[tokio::test]
    async fn test_unreachable_service_defers_dispatch() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;
        rig.services.record_failure("robotic-arm-control", 1);

        let report = rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert_eq!(report.deferred, vec!["exp1".to_string()]);
        assert!(rig.lab.operations().is_empty());
        assert_eq!(
            rig.store.task("exp1").unwrap().operational_state,
            OperationalState::Pending
        );
    }

    #[tokio::test]
    async fn test_imaging_failure_sets_error_and_unloads() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;
        rig.lab.fail_scan("stage limit hit");

        let report = rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert_eq!(report.failed, vec!["exp1".to_string()]);

        let task = rig.store.task("exp1").unwrap();
        assert_eq!(task.operational_state, OperationalState::Error);
        assert!(task.message.unwrap().starts_with("ImagingError"));
        assert_eq!(task.pending_time_points.len(), 1);
        assert_eq!(rig.lab.count("microscope_to_incubator"), 1);
        assert_eq!(rig.lab.sample_location(3), Some(SampleLocation::IncubatorSlot));

        // Error tasks are not dispatched again
        let report = rig.scheduler.tick(tp("2024-01-01T10:05:00")).await;
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn test_paused_task_is_skipped() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;
        rig.store.pause("exp1").await.unwrap();

        let report = rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert_eq!(report, TickReport::default());
    }

    #[tokio::test]
    async fn test_microscope_only_skips_transport() {
        let mut task = full_task("scope", 9, &["2024-01-01T10:00:00"]);
        task.settings.scan_mode = ScanMode::MicroscopeOnly;
        let rig = rig(vec![task], Timeouts::default()).await;
        rig.services.record_failure("robotic-arm-control", 1);

        let report = rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert_eq!(report.imaged.len(), 1);
        assert_eq!(rig.lab.count("incubator_to_microscope"), 0);
        assert_eq!(rig.lab.count("scan_start"), 1);
    }

    #[tokio::test]
    async fn test_write_failure_halts_then_resumes() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00", "2024-01-01T11:00:00"])],
            Timeouts::default(),
        )
        .await;
        let path = rig.store.path().to_path_buf();
        let saved = std::fs::read(&path).unwrap();

        // Make the task file unwritable mid-run
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let report = rig.scheduler.tick(tp("2024-01-01T11:30:00")).await;
        assert!(report.halted);
        assert!(rig.scheduler.halted().unwrap().starts_with("PersistenceError"));

        let report = rig.scheduler.tick(tp("2024-01-01T11:30:00")).await;
        assert!(report.halted);
        assert!(report.imaged.is_empty());

        std::fs::remove_dir(&path).unwrap();
        std::fs::write(&path, saved).unwrap();

        let report = rig.scheduler.tick(tp("2024-01-01T11:30:00")).await;
        assert!(!report.halted);
        assert!(rig.scheduler.halted().is_none());
        assert_eq!(report.imaged, vec![("exp1".to_string(), tp("2024-01-01T10:00:00"))]);

        rig.scheduler.tick(tp("2024-01-01T11:30:00")).await;
        let task = rig.store.task("exp1").unwrap();
        assert_eq!(task.imaged_time_points.len(), 2);
        assert_eq!(task.operational_state, OperationalState::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_stops_new_cycles() {
        let rig = rig(
            vec![full_task("exp1", 3, &["2024-01-01T10:00:00"])],
            Timeouts::default(),
        )
        .await;
        rig.guard.request_shutdown();

        let report = rig.scheduler.tick(tp("2024-01-01T10:00:00")).await;
        assert!(report.imaged.is_empty());
        assert!(rig.lab.operations().is_empty());
        assert_eq!(
            rig.store.task("exp1").unwrap().operational_state,
            OperationalState::Pending
        );
    }
}
