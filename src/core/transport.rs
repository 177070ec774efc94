//! Serialized sample transport.
//!
//! All physical sample movement goes through one queue drained by a single
//! worker, so two movements never overlap. `enqueue` returns immediately with
//! a ticket that resolves when the request has completed or failed. Requests
//! are never retried.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{CallResult, Incubator, Microscope, RoboticArm};
use crate::config::{ServiceSettings, Timeouts};
use crate::core::guard::{CriticalSectionGuard, SectionToken};
use crate::core::halt::{DispatchHalt, StoreOp};
use crate::core::health::ServiceTable;
use crate::core::task_store::TaskStore;
use crate::domain::{SampleLocation, TransportKind, TransportOutcome, TransportRequest};
use crate::error::TransportError;

type Reply = oneshot::Sender<Result<TransportOutcome, TransportError>>;

enum Message {
    Job {
        request: TransportRequest,
        /// Section opened by the caller, if the move is part of a larger sequence
        section: Option<SectionToken>,
        reply: Reply,
    },
    Close,
}

/// Lifecycle of the transport worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    NotStarted,
    Running,
    Stopped,
}

/// Queue depth and worker state, for status output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransportStatus {
    pub queue_size: usize,
    pub worker: WorkerState,
}

/// Resolves with the outcome of one transport request
#[must_use = "a ticket does nothing unless awaited"]
#[derive(Debug)]
pub struct TransportTicket {
    request_id: Uuid,
    kind: TransportKind,
    slot_id: u8,
    rx: oneshot::Receiver<Result<TransportOutcome, TransportError>>,
}

impl TransportTicket {
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Wait for the worker to finish this request
    pub async fn wait(self) -> Result<TransportOutcome, TransportError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::new(
                self.kind,
                self.slot_id,
                "transport queue is not accepting requests",
            )),
        }
    }
}

/// Sending side of the transport queue
#[derive(Debug, Clone)]
pub struct TransportQueue {
    tx: mpsc::UnboundedSender<Message>,
    depth: Arc<AtomicUsize>,
    state: Arc<Mutex<WorkerState>>,
    guard: CriticalSectionGuard,
}

impl TransportQueue {
    /// Create the queue and its (not yet started) worker
    pub fn new(
        services: ServiceTable,
        service_settings: ServiceSettings,
        timeouts: Timeouts,
        guard: CriticalSectionGuard,
        store: TaskStore,
        halt: DispatchHalt,
    ) -> (Self, TransportWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(Mutex::new(WorkerState::NotStarted));

        let queue = Self {
            tx,
            depth: Arc::clone(&depth),
            state: Arc::clone(&state),
            guard: guard.clone(),
        };
        let worker = TransportWorker {
            rx,
            depth,
            state,
            services,
            service_settings,
            timeouts,
            guard,
            store,
            halt,
        };
        (queue, worker)
    }

    fn submit(&self, request: TransportRequest, section: Option<SectionToken>) -> TransportTicket {
        let (reply, rx) = oneshot::channel();
        let ticket = TransportTicket {
            request_id: request.id,
            kind: request.kind,
            slot_id: request.slot_id,
            rx,
        };

        info!(
            id = %request.id,
            kind = %request.kind,
            slot = request.slot_id,
            microscope = %request.microscope,
            "Transport request queued"
        );

        self.depth.fetch_add(1, Ordering::SeqCst);
        let message = Message::Job {
            request,
            section,
            reply,
        };
        if self.tx.send(message).is_err() {
            // Dropping the reply resolves the ticket with an error
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        ticket
    }

    /// Queue a standalone movement; the worker opens its own critical section
    pub fn enqueue(&self, request: TransportRequest) -> TransportTicket {
        self.submit(request, None)
    }

    /// Queue a movement that belongs to the caller's open section. It is
    /// carried out even if shutdown is requested meanwhile.
    pub fn enqueue_within(
        &self,
        request: TransportRequest,
        parent: &SectionToken,
    ) -> TransportTicket {
        let label = format!("{} slot {}", request.kind, request.slot_id);
        let section = self.guard.begin_within(parent, label, request.task.as_deref());
        self.submit(request, Some(section))
    }

    /// Queued plus in-flight requests
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn worker_state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn status(&self) -> TransportStatus {
        TransportStatus {
            queue_size: self.depth(),
            worker: self.worker_state(),
        }
    }

    /// Stop accepting work once everything queued so far has been handled
    pub fn close(&self) {
        let _ = self.tx.send(Message::Close);
    }
}

/// Receiving side; processes one request at a time to completion
pub struct TransportWorker {
    rx: mpsc::UnboundedReceiver<Message>,
    depth: Arc<AtomicUsize>,
    state: Arc<Mutex<WorkerState>>,
    services: ServiceTable,
    service_settings: ServiceSettings,
    timeouts: Timeouts,
    guard: CriticalSectionGuard,
    store: TaskStore,
    halt: DispatchHalt,
}

/// Proxies a request needs, all confirmed live
struct Crew {
    incubator: Arc<dyn Incubator>,
    arm: Arc<dyn RoboticArm>,
    microscope: Arc<dyn Microscope>,
    station: u8,
}

impl TransportWorker {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        self.set_state(WorkerState::Running);
        info!("Transport worker started");

        while let Some(message) = self.rx.recv().await {
            match message {
                Message::Job {
                    request,
                    section,
                    reply,
                } => {
                    let result = self.process(&request, section).await;
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    // The requester may have stopped waiting
                    let _ = reply.send(result);
                }
                Message::Close => break,
            }
        }

        self.rx.close();
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Job { request, reply, .. } = message {
                self.depth.fetch_sub(1, Ordering::SeqCst);
                let _ = reply.send(Err(TransportError::new(
                    request.kind,
                    request.slot_id,
                    "transport queue closed",
                )));
            }
        }

        self.set_state(WorkerState::Stopped);
        info!("Transport worker stopped");
    }

    fn crew(&self, request: &TransportRequest) -> Result<Crew, String> {
        let ids = &self.service_settings;
        let station = ids
            .arm_station(&request.microscope)
            .ok_or_else(|| format!("no arm station configured for {}", request.microscope))?;
        let unavailable = |name: &str| format!("service unavailable: {}", name);

        Ok(Crew {
            incubator: self
                .services
                .live_incubator(&ids.incubator_id)
                .ok_or_else(|| unavailable(&ids.incubator_id))?,
            arm: self
                .services
                .live_robotic_arm(&ids.arm_id)
                .ok_or_else(|| unavailable(&ids.arm_id))?,
            microscope: self
                .services
                .live_microscope(&request.microscope)
                .ok_or_else(|| unavailable(&request.microscope))?,
            station,
        })
    }

    #[instrument(skip_all, fields(id = %request.id, kind = %request.kind, slot = request.slot_id))]
    async fn process(
        &self,
        request: &TransportRequest,
        section: Option<SectionToken>,
    ) -> Result<TransportOutcome, TransportError> {
        let fail = |reason: String| {
            let err = TransportError::new(request.kind, request.slot_id, reason);
            error!(error = %err, "Transport failed");
            err
        };

        let _section = match section {
            Some(section) => section,
            None => self
                .guard
                .begin(
                    format!("{} slot {}", request.kind, request.slot_id),
                    request.task.as_deref(),
                )
                .map_err(|e| fail(e.to_string()))?,
        };

        let crew = self.crew(request).map_err(fail)?;

        let limit = match request.kind {
            TransportKind::Load => self.timeouts.load,
            TransportKind::Unload => self.timeouts.unload,
        };

        let started = Instant::now();
        let sequence = async {
            match request.kind {
                TransportKind::Load => load_sequence(&crew, request.slot_id).await,
                TransportKind::Unload => unload_sequence(&crew, request.slot_id).await,
            }
        };

        let (final_location, skipped) = tokio::time::timeout(limit, sequence)
            .await
            .map_err(|_| fail(format!("timed out after {}s", limit.as_secs_f64())))?
            .map_err(|e| fail(e.to_string()))?;

        let location_recorded = self.record_location(request.slot_id, final_location).await;

        let duration = started.elapsed();
        info!(
            location = %final_location,
            skipped,
            duration_ms = duration.as_millis() as u64,
            "Transport completed"
        );

        Ok(TransportOutcome {
            request_id: request.id,
            kind: request.kind,
            slot_id: request.slot_id,
            final_location,
            skipped,
            location_recorded,
            duration_ms: duration_millis(duration),
        })
    }

    /// Persist where the plate ended up. The move itself already happened, so
    /// a failed write halts dispatch and is retried instead of failing the move.
    async fn record_location(&self, slot_id: u8, location: SampleLocation) -> bool {
        let op = StoreOp::RecordSlot { slot_id, location };
        match op.apply(&self.store).await {
            Ok(()) => true,
            Err(e) if e.halts_dispatch() => {
                error!(error = %e, "Could not record slot location");
                self.halt.enter(&e, Some(op));
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not record slot location");
                false
            }
        }
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Incubator slot → microscope stage
async fn load_sequence(crew: &Crew, slot: u8) -> CallResult<(SampleLocation, bool)> {
    tokio::try_join!(
        crew.incubator.get_sample_from_slot_to_transfer_station(slot),
        crew.microscope.home_stage(),
    )?;
    crew.incubator
        .update_sample_location(slot, SampleLocation::RoboticArm)
        .await?;
    crew.arm.incubator_to_microscope(crew.station).await?;
    let on_stage = SampleLocation::Microscope(crew.station);
    crew.incubator.update_sample_location(slot, on_stage).await?;
    crew.microscope.return_stage().await?;
    Ok((on_stage, false))
}

/// Microscope stage → incubator slot; a no-op if the plate is already home
async fn unload_sequence(crew: &Crew, slot: u8) -> CallResult<(SampleLocation, bool)> {
    let location = crew.incubator.get_sample_location(slot).await?;
    if location == SampleLocation::IncubatorSlot {
        info!(slot, "Sample already in its slot; nothing to unload");
        return Ok((SampleLocation::IncubatorSlot, true));
    }

    crew.microscope.home_stage().await?;
    crew.incubator
        .update_sample_location(slot, SampleLocation::RoboticArm)
        .await?;
    crew.arm.microscope_to_incubator(crew.station).await?;
    tokio::try_join!(
        crew.incubator.put_sample_from_transfer_station_to_slot(slot),
        crew.microscope.return_stage(),
    )?;
    crew.incubator
        .update_sample_location(slot, SampleLocation::IncubatorSlot)
        .await?;
    Ok((SampleLocation::IncubatorSlot, false))
}
