//! Orchestrator: owns the actors and is the operator's handle on them.
//!
//! `start` loads the task file, connects the hardware services and spawns the
//! transport worker, health monitor, scheduler, status writer and task file
//! watcher. `shutdown` stops them in an order that never leaves a hardware
//! sequence half done unless it has already overrun its hard limit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::ServiceConnector;
use crate::config::Settings;
use crate::domain::{
    OperationalState, ServiceHandle, ServiceKind, TimePoint, TransportOutcome, TransportRequest,
};
use crate::error::Result;

use super::guard::{CriticalSectionGuard, ForcedSection, SectionInfo};
use super::halt::DispatchHalt;
use super::health::{HealthMonitor, ServiceEvent, ServiceTable};
use super::imaging::ScanPolicy;
use super::scheduler::Scheduler;
use super::task_store::{write_atomic, TaskStore};
use super::transport::{TransportQueue, TransportStatus};
use super::watcher::{watch_task_file, WatchHandle};

/// One task as shown in status output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub name: String,
    pub state: OperationalState,
    pub message: Option<String>,
    pub next_time_point: Option<TimePoint>,
    pub pending: usize,
    pub imaged: usize,
}

/// Snapshot of everything the orchestrator is doing
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub generated_at: DateTime<Utc>,
    pub tasks: Vec<TaskStatus>,
    pub services: Vec<ServiceHandle>,
    pub transport: TransportStatus,
    pub active_sections: Vec<SectionInfo>,
    pub shutdown_requested: bool,
    /// Why dispatch is halted, if it is
    pub dispatch_halted: Option<String>,
}

/// What shutdown had to force
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Sections closed after overrunning their limit
    pub forced: Vec<ForcedSection>,
    /// Actors that did not stop within the grace period
    pub aborted: Vec<&'static str>,
}

/// Running orchestrator
pub struct Orchestrator {
    settings: Settings,
    store: TaskStore,
    services: ServiceTable,
    guard: CriticalSectionGuard,
    transport: TransportQueue,
    scheduler: Scheduler,
    stop_tx: watch::Sender<bool>,
    actors: Vec<(&'static str, JoinHandle<()>)>,
    watcher: Option<WatchHandle>,
}

impl Orchestrator {
    /// Load the task file, connect services and start every actor
    #[instrument(skip_all, fields(task_file = %settings.task_file.display()))]
    pub async fn start(settings: Settings, connector: Arc<dyn ServiceConnector>) -> Result<Self> {
        let store = TaskStore::open(&settings.task_file).await?;
        info!(tasks = store.tasks().len(), "Task file loaded");

        let services = ServiceTable::new();
        connect_services(&settings, connector.as_ref(), &services).await;

        let guard = CriticalSectionGuard::new(settings.timeouts.max_section);
        let halt = DispatchHalt::new();
        let (transport, worker) = TransportQueue::new(
            services.clone(),
            settings.services.clone(),
            settings.timeouts.clone(),
            guard.clone(),
            store.clone(),
            halt.clone(),
        );
        let scheduler = Scheduler::new(
            store.clone(),
            services.clone(),
            transport.clone(),
            guard.clone(),
            settings.services.clone(),
            settings.scheduler.clone(),
            ScanPolicy::from_timeouts(&settings.timeouts),
            halt,
        );
        let monitor = HealthMonitor::new(
            services.clone(),
            connector,
            settings.health.clone(),
            settings.timeouts.ping,
        );

        let lab = SlotSync {
            store: store.clone(),
            services: services.clone(),
            incubator_id: settings.services.incubator_id.clone(),
            call_timeout: settings.timeouts.call,
        };
        if let Err(e) = lab.reconcile().await {
            warn!(error = %e, "Slot reconciliation at startup failed");
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let events = monitor.subscribe();

        // Joined in this order at shutdown: the scheduler goes before the
        // worker it feeds, so a stuck cycle cannot observe the worker vanishing
        let worker = worker.spawn();
        let mut actors = vec![("scheduler", tokio::spawn(scheduler.clone().run(stop_rx.clone())))];
        actors.push(("transport worker", worker));
        actors.push(("health monitor", tokio::spawn(monitor.run(stop_rx.clone()))));
        actors.push(("slot sync", tokio::spawn(lab.run(events, stop_rx.clone()))));

        let watcher = if settings.scheduler.watch_task_file {
            let reloader = scheduler.clone();
            match watch_task_file(&settings.task_file, move || reloader.request_reload()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(error = %e, "Task file watcher unavailable; use reload instead");
                    None
                }
            }
        } else {
            None
        };

        let mut orchestrator = Self {
            settings,
            store,
            services,
            guard,
            transport,
            scheduler,
            stop_tx,
            actors,
            watcher,
        };

        let status_writer = orchestrator.status_writer(stop_rx);
        orchestrator
            .actors
            .push(("status writer", tokio::spawn(status_writer)));

        info!("Orchestrator started");
        Ok(orchestrator)
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn services(&self) -> &ServiceTable {
        &self.services
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn get_status(&self) -> OrchestratorStatus {
        collect_status(
            &self.store,
            &self.services,
            &self.transport,
            &self.guard,
            &self.scheduler,
        )
    }

    pub async fn pause_task(&self, name: &str) -> Result<()> {
        self.store.pause(name).await?;
        info!(task = name, "Task paused");
        Ok(())
    }

    /// Un-pause a task, or clear its error; returns the state it resumed to
    pub async fn resume_task(&self, name: &str) -> Result<OperationalState> {
        let state = self.store.resume(name).await?;
        info!(task = name, %state, "Task resumed");
        Ok(state)
    }

    /// Re-read the task file; true if it changed
    pub async fn reload_tasks(&self) -> Result<bool> {
        self.scheduler.reload().await
    }

    /// Move the plate in `slot` onto `microscope` outside of any task
    pub async fn load_sample(&self, slot: u8, microscope: &str) -> Result<TransportOutcome> {
        let ticket = self.transport.enqueue(TransportRequest::load(slot, microscope));
        Ok(ticket.wait().await?)
    }

    /// Return the plate on `microscope` to `slot` outside of any task
    pub async fn unload_sample(&self, slot: u8, microscope: &str) -> Result<TransportOutcome> {
        let ticket = self
            .transport
            .enqueue(TransportRequest::unload(slot, microscope));
        Ok(ticket.wait().await?)
    }

    pub fn transport_status(&self) -> TransportStatus {
        self.transport.status()
    }

    fn status_writer(&self, mut stop: watch::Receiver<bool>) -> impl std::future::Future<Output = ()> {
        let store = self.store.clone();
        let services = self.services.clone();
        let transport = self.transport.clone();
        let guard = self.guard.clone();
        let scheduler = self.scheduler.clone();
        let path = self.settings.status_file();
        let every = self.settings.scheduler.status_interval;

        async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = collect_status(&store, &services, &transport, &guard, &scheduler);
                        write_status(&path, &status).await;
                    }
                    _ = stop.changed() => break,
                }
            }
        }
    }

    /// Stop everything. Running hardware sequences are allowed to finish
    /// unless they overrun the section limit.
    pub async fn shutdown(self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        info!(active = self.guard.active_count(), "Shutting down");

        self.guard.request_shutdown();

        let grace = self.settings.timeouts.shutdown_grace;
        let bound = self.guard.longest_remaining() + grace;
        match timeout(bound, self.guard.wait_for_clearance()).await {
            Ok(clearance) => report.forced = clearance.forced,
            Err(_) => error!(
                active = self.guard.active_count(),
                "Hardware sequences still open after {:?}; stopping anyway", bound
            ),
        }

        for forced in &report.forced {
            if let Some(task) = forced.task.as_deref() {
                if let Err(e) = self.store.set_error(task, forced.to_error().to_string()).await {
                    error!(task, error = %e, "Could not record forced section");
                }
            }
        }

        // Receivers may already be gone
        let _ = self.stop_tx.send(true);
        self.transport.close();

        if let Some(watcher) = self.watcher {
            if let Err(e) = watcher.stop().await {
                warn!(error = %e, "Task file watcher did not stop cleanly");
            }
        }

        for (name, mut handle) in self.actors {
            match timeout(grace, &mut handle).await {
                Ok(Ok(())) => debug!(actor = name, "Stopped"),
                Ok(Err(e)) => error!(actor = name, error = %e, "Actor failed"),
                Err(_) => {
                    warn!(actor = name, "Did not stop within grace period; aborting");
                    handle.abort();
                    report.aborted.push(name);
                }
            }
        }

        let status = collect_status(
            &self.store,
            &self.services,
            &self.transport,
            &self.guard,
            &self.scheduler,
        );
        write_status(&self.settings.status_file(), &status).await;

        info!(
            forced = report.forced.len(),
            aborted = report.aborted.len(),
            "Shutdown complete"
        );
        report
    }
}

/// Connect every configured service; failures start out unreachable
async fn connect_services(settings: &Settings, connector: &dyn ServiceConnector, services: &ServiceTable) {
    let ids = &settings.services;
    let mut wanted = vec![
        (ids.incubator_id.clone(), ServiceKind::Incubator),
        (ids.arm_id.clone(), ServiceKind::RoboticArm),
    ];
    wanted.extend(
        ids.microscopes
            .iter()
            .map(|m| (m.id.clone(), ServiceKind::Microscope)),
    );

    for (name, kind) in wanted {
        let connected = timeout(settings.timeouts.call, connector.connect(kind, &name))
            .await
            .map_err(|_| format!("no reply within {:?}", settings.timeouts.call))
            .and_then(|r| r.map_err(|e| e.to_string()));

        match connected {
            Ok(proxy) => {
                info!(service = %name, %kind, "Service connected");
                services.register(&name, kind, Some(proxy));
            }
            Err(reason) => {
                warn!(service = %name, %kind, %reason, "Service unreachable at startup");
                services.register(&name, kind, None);
            }
        }
    }
}

fn collect_status(
    store: &TaskStore,
    services: &ServiceTable,
    transport: &TransportQueue,
    guard: &CriticalSectionGuard,
    scheduler: &Scheduler,
) -> OrchestratorStatus {
    let tasks = store
        .tasks()
        .into_iter()
        .map(|t| TaskStatus {
            next_time_point: t.next_time_point(),
            pending: t.pending_time_points.len(),
            imaged: t.imaged_time_points.len(),
            name: t.name,
            state: t.operational_state,
            message: t.message,
        })
        .collect();

    OrchestratorStatus {
        generated_at: Utc::now(),
        tasks,
        services: services.handles(),
        transport: transport.status(),
        active_sections: guard.active_sections(),
        shutdown_requested: guard.is_shutdown_requested(),
        dispatch_halted: scheduler.halted(),
    }
}

async fn write_status(path: &std::path::Path, status: &OrchestratorStatus) {
    let bytes = match serde_json::to_vec_pretty(status) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Could not serialize status");
            return;
        }
    };
    let path = path.to_path_buf();
    let written = tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await;
    match written {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Could not write status file"),
        Err(e) => warn!(error = %e, "Status writer panicked"),
    }
}

/// Keeps the slot table in line with what the incubator reports
struct SlotSync {
    store: TaskStore,
    services: ServiceTable,
    incubator_id: String,
    call_timeout: Duration,
}

impl SlotSync {
    async fn reconcile(&self) -> Result<usize> {
        let Some(incubator) = self.services.live_incubator(&self.incubator_id) else {
            debug!("Incubator unreachable; slot reconciliation skipped");
            return Ok(0);
        };

        let reports = match timeout(self.call_timeout, incubator.get_slot_information()).await {
            Ok(Ok(reports)) => reports,
            Ok(Err(e)) => {
                warn!(error = %e, "Could not read slot information");
                return Ok(0);
            }
            Err(_) => {
                warn!("Slot information query timed out");
                return Ok(0);
            }
        };

        let changed = self.store.reconcile_slots(reports).await?;
        if changed > 0 {
            info!(changed, "Slot table reconciled with incubator");
        }
        Ok(changed)
    }

    async fn run(self, mut events: broadcast::Receiver<ServiceEvent>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(ServiceEvent::Recovered { kind: ServiceKind::Incubator, .. }) => {
                        if let Err(e) = self.reconcile().await {
                            warn!(error = %e, "Slot reconciliation after reconnect failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed service events; reconciling slots");
                        if let Err(e) = self.reconcile().await {
                            warn!(error = %e, "Slot reconciliation failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = stop.changed() => break,
            }
        }
    }
}
