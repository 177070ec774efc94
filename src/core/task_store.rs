//! Durable store for the task document (tasks + incubator slots).
//!
//! The document is a single JSON file replaced atomically on every mutation
//! (temp file in the same directory, fsync, rename). Mutations are serialized
//! in-process by a writer mutex and across processes by an advisory lock on
//! `<file>.lock`, so CLI edits and the running orchestrator never interleave.
//! Before each mutation the on-disk digest is compared with the digest of the
//! last load/save: an external edit is read back first and the mutation is
//! applied on top of it.
//!
//! Readers get cloned snapshots; they never observe a half-applied mutation.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::domain::{
    Occupancy, OperationalState, SampleLocation, SampleSlot, SlotReport, Task, TimePoint,
    MAX_SLOT_ID,
};
use crate::error::{OrchestratorError, Result};

/// On-disk task document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default)]
    pub slots: Vec<SampleSlot>,
}

impl TaskDocument {
    /// Parse and validate a document; any bad entry rejects the whole file
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut doc: TaskDocument = serde_json::from_slice(bytes)
            .map_err(|e| OrchestratorError::Config(format!("malformed task file: {}", e)))?;
        for task in &mut doc.tasks {
            task.normalize();
        }
        doc.validate()?;
        Ok(doc)
    }

    /// Check every document-level invariant
    pub fn validate(&self) -> Result<()> {
        let mut names = BTreeSet::new();
        let mut active_slots: HashMap<u8, &str> = HashMap::new();

        for task in &self.tasks {
            task.validate().map_err(OrchestratorError::Config)?;

            if !names.insert(task.name.as_str()) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }

            if task.operational_state != OperationalState::Completed {
                let slot = task.settings.incubator_slot;
                if let Some(other) = active_slots.insert(slot, task.name.as_str()) {
                    return Err(OrchestratorError::Config(format!(
                        "tasks '{}' and '{}' both use incubator slot {}",
                        other, task.name, slot
                    )));
                }
            }
        }

        let mut slot_ids = BTreeSet::new();
        for slot in &self.slots {
            if slot.slot_id == 0 || slot.slot_id > MAX_SLOT_ID {
                return Err(OrchestratorError::Config(format!(
                    "slot id {} out of range 1..={}",
                    slot.slot_id, MAX_SLOT_ID
                )));
            }
            if !slot_ids.insert(slot.slot_id) {
                return Err(OrchestratorError::Config(format!(
                    "duplicate slot entry {}",
                    slot.slot_id
                )));
            }
        }

        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    fn task_mut(&mut self, name: &str) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.name == name)
            .ok_or_else(|| OrchestratorError::TaskNotFound(name.to_string()))
    }

    fn slot_mut(&mut self, slot_id: u8) -> &mut SampleSlot {
        let idx = match self.slots.iter().position(|s| s.slot_id == slot_id) {
            Some(idx) => idx,
            None => {
                self.slots.push(SampleSlot::occupied(slot_id));
                self.slots.sort_by_key(|s| s.slot_id);
                self.slots
                    .iter()
                    .position(|s| s.slot_id == slot_id)
                    .unwrap_or(self.slots.len() - 1)
            }
        };
        &mut self.slots[idx]
    }
}

/// Apply one edge of the task state graph
fn transition(task: &mut Task, to: OperationalState) -> Result<()> {
    let from = task.operational_state;
    let invalid = || OrchestratorError::InvalidTransition {
        task: task.name.clone(),
        from,
        to,
    };

    if !from.can_transition(to, task.paused_from) {
        return Err(invalid());
    }
    if to == OperationalState::Completed && !task.pending_time_points.is_empty() {
        return Err(invalid());
    }

    task.paused_from = match to {
        OperationalState::Paused => Some(from),
        _ => None,
    };
    task.operational_state = to;
    Ok(())
}

/// Hex SHA-256 of the file contents
fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` so readers see either the old or the new file
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn persistence(context: &str, path: &Path, err: impl std::fmt::Display) -> OrchestratorError {
    OrchestratorError::Persistence(format!("{} {}: {}", context, path.display(), err))
}

struct Inner {
    path: PathBuf,
    lock_path: PathBuf,
    /// Digest of the file as last loaded or saved; held while mutating
    writer: Mutex<String>,
    snapshot: RwLock<Arc<TaskDocument>>,
}

impl Inner {
    fn snapshot(&self) -> Arc<TaskDocument> {
        let guard = self.snapshot.read().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&guard)
    }

    fn publish(&self, doc: TaskDocument) {
        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        *guard = Arc::new(doc);
    }

    /// Cross-process lock; released when the returned file is dropped
    fn lock_file(&self) -> Result<File> {
        if let Some(dir) = self.lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| persistence("failed to create", dir, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| persistence("failed to open lock file", &self.lock_path, e))?;
        file.lock_exclusive()
            .map_err(|e| persistence("failed to lock", &self.lock_path, e))?;
        Ok(file)
    }

    /// The document as it is on disk now, re-reading it after an external edit
    fn current(&self, known_digest: &mut String) -> Result<TaskDocument> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "Task file missing; it will be rewritten");
                return Ok((*self.snapshot()).clone());
            }
            Err(e) => return Err(persistence("failed to read", &self.path, e)),
        };

        let on_disk = digest(&bytes);
        if on_disk == *known_digest {
            return Ok((*self.snapshot()).clone());
        }

        let doc = TaskDocument::parse(&bytes)?;
        info!(path = %self.path.display(), "Task file changed on disk; reloaded");
        *known_digest = on_disk;
        self.publish(doc.clone());
        Ok(doc)
    }

    fn write(&self, doc: &TaskDocument) -> Result<String> {
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| persistence("failed to serialize", &self.path, e))?;
        write_atomic(&self.path, &bytes)
            .map_err(|e| persistence("failed to write", &self.path, e))?;
        Ok(digest(&bytes))
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut TaskDocument) -> Result<R>) -> Result<R> {
        let mut known_digest = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let _lock = self.lock_file()?;

        let mut doc = self.current(&mut known_digest)?;
        let result = f(&mut doc)?;
        doc.validate()?;

        *known_digest = self.write(&doc)?;
        self.publish(doc);
        Ok(result)
    }

    fn reload(&self) -> Result<bool> {
        let mut known_digest = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let _lock = self.lock_file()?;
        let before = known_digest.clone();
        self.current(&mut known_digest)?;
        Ok(before != *known_digest)
    }

    fn save(&self) -> Result<()> {
        let mut known_digest = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let _lock = self.lock_file()?;
        *known_digest = self.write(&self.snapshot())?;
        Ok(())
    }
}

/// Shared handle to the task document
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl TaskStore {
    fn with_document(path: PathBuf, doc: TaskDocument, digest: String) -> Self {
        let mut lock_path = path.as_os_str().to_os_string();
        lock_path.push(".lock");
        Self {
            inner: Arc::new(Inner {
                lock_path: PathBuf::from(lock_path),
                path,
                writer: Mutex::new(digest),
                snapshot: RwLock::new(Arc::new(doc)),
            }),
        }
    }

    /// Load an existing task file. Missing or invalid files are a `Config` error.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            OrchestratorError::Config(format!("cannot read task file {}: {}", path.display(), e))
        })?;
        let doc = TaskDocument::parse(&bytes)?;
        info!(
            path = %path.display(),
            tasks = doc.tasks.len(),
            slots = doc.slots.len(),
            "Task file loaded"
        );
        Ok(Self::with_document(path, doc, digest(&bytes)))
    }

    /// Open the task file, creating an empty one if it does not exist
    pub async fn open_or_create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Self::open(path).await;
        }
        let store = Self::with_document(path, TaskDocument::default(), String::new());
        store.save().await?;
        Ok(store)
    }

    /// Write `doc` as a fresh task file, replacing any existing one
    pub async fn create(path: impl Into<PathBuf>, doc: TaskDocument) -> Result<Self> {
        doc.validate()?;
        let store = Self::with_document(path.into(), doc, String::new());
        store.save().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn blocking<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Inner) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| OrchestratorError::Persistence(format!("task store worker failed: {}", e)))?
    }

    async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TaskDocument) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.blocking(move |inner| inner.mutate(f)).await
    }

    /// Write the in-memory document to disk
    pub async fn save(&self) -> Result<()> {
        self.blocking(|inner| inner.save()).await
    }

    /// Pick up external edits. Returns true if the document changed.
    pub async fn reload(&self) -> Result<bool> {
        self.blocking(|inner| inner.reload()).await
    }

    /// Snapshot of the whole document
    pub fn document(&self) -> Arc<TaskDocument> {
        self.inner.snapshot()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.inner.snapshot().tasks.clone()
    }

    pub fn task(&self, name: &str) -> Option<Task> {
        self.inner.snapshot().task(name).cloned()
    }

    pub fn slots(&self) -> Vec<SampleSlot> {
        self.inner.snapshot().slots.clone()
    }

    /// Move `time_point` from pending to imaged. A started task whose plan is
    /// now empty completes in the same write. Returns true if it did.
    pub async fn mark_imaged(&self, name: &str, time_point: TimePoint) -> Result<bool> {
        let name = name.to_string();
        self.mutate(move |doc| {
            let task = doc.task_mut(&name)?;
            let idx = task
                .pending_time_points
                .binary_search(&time_point)
                .map_err(|_| OrchestratorError::TimePointNotPending {
                    task: name.clone(),
                    time_point,
                })?;
            task.pending_time_points.remove(idx);
            if let Err(pos) = task.imaged_time_points.binary_search(&time_point) {
                task.imaged_time_points.insert(pos, time_point);
            }
            debug!(task = %name, %time_point, remaining = task.pending_time_points.len(), "Time point imaged");

            let completed = task.pending_time_points.is_empty()
                && task.operational_state == OperationalState::Started;
            if completed {
                transition(task, OperationalState::Completed)?;
                info!(task = %name, imaged = task.imaged_time_points.len(), "Last time point imaged; task completed");
            }
            Ok(completed)
        })
        .await
    }

    /// Move a task along one edge of the state graph
    pub async fn advance_state(&self, name: &str, to: OperationalState) -> Result<()> {
        let name = name.to_string();
        self.mutate(move |doc| {
            let task = doc.task_mut(&name)?;
            let from = task.operational_state;
            transition(task, to)?;
            info!(task = %name, %from, %to, "Task state changed");
            Ok(())
        })
        .await
    }

    /// Put a task into `error` with a message naming the failure
    pub async fn set_error(&self, name: &str, message: impl Into<String>) -> Result<()> {
        let name = name.to_string();
        let message = message.into();
        self.mutate(move |doc| {
            let task = doc.task_mut(&name)?;
            if task.operational_state != OperationalState::Error {
                transition(task, OperationalState::Error)?;
            }
            warn!(task = %name, error = %message, "Task set to error");
            task.message = Some(message);
            Ok(())
        })
        .await
    }

    /// Leave `error`: back to `started` if anything was imaged, else `pending`
    pub async fn clear_error(&self, name: &str) -> Result<OperationalState> {
        let name = name.to_string();
        self.mutate(move |doc| {
            let task = doc.task_mut(&name)?;
            if task.operational_state != OperationalState::Error {
                return Err(OrchestratorError::InvalidTransition {
                    task: name.clone(),
                    from: task.operational_state,
                    to: OperationalState::Pending,
                });
            }
            let to = if task.imaged_time_points.is_empty() {
                OperationalState::Pending
            } else {
                OperationalState::Started
            };
            task.operational_state = to;
            task.message = None;
            info!(task = %name, %to, "Task error cleared");
            Ok(to)
        })
        .await
    }

    /// Pause a dispatchable task
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.advance_state(name, OperationalState::Paused).await
    }

    /// Undo a pause, or clear an error. Returns the new state.
    pub async fn resume(&self, name: &str) -> Result<OperationalState> {
        let task = self
            .task(name)
            .ok_or_else(|| OrchestratorError::TaskNotFound(name.to_string()))?;
        match (task.operational_state, task.paused_from) {
            (OperationalState::Error, _) => self.clear_error(name).await,
            (OperationalState::Paused, Some(prior)) => {
                self.advance_state(name, prior).await?;
                Ok(prior)
            }
            (from, _) => Err(OrchestratorError::InvalidTransition {
                task: name.to_string(),
                from,
                to: OperationalState::Started,
            }),
        }
    }

    /// Add a task or replace the one with the same name
    pub async fn upsert_task(&self, mut task: Task) -> Result<()> {
        task.normalize();
        self.mutate(move |doc| {
            match doc.tasks.iter_mut().find(|t| t.name == task.name) {
                Some(existing) => *existing = task,
                None => doc.tasks.push(task),
            }
            Ok(())
        })
        .await
    }

    pub async fn remove_task(&self, name: &str) -> Result<Task> {
        let name = name.to_string();
        self.mutate(move |doc| {
            let idx = doc
                .tasks
                .iter()
                .position(|t| t.name == name)
                .ok_or_else(|| OrchestratorError::TaskNotFound(name.clone()))?;
            Ok(doc.tasks.remove(idx))
        })
        .await
    }

    /// Record where a slot's plate is after a transport
    pub async fn record_slot_location(&self, slot_id: u8, location: SampleLocation) -> Result<()> {
        self.mutate(move |doc| {
            let slot = doc.slot_mut(slot_id);
            slot.occupancy = Occupancy::Occupied;
            slot.location = location;
            Ok(())
        })
        .await
    }

    /// Align persisted slots with the incubator's report. Returns the number
    /// of slots that changed.
    pub async fn reconcile_slots(&self, reports: Vec<SlotReport>) -> Result<usize> {
        let now = chrono::Local::now().naive_local();
        self.mutate(move |doc| {
            let mut changed = 0;
            for report in reports {
                if report.slot_id == 0 || report.slot_id > MAX_SLOT_ID {
                    continue;
                }
                let occupancy = if report.occupied {
                    Occupancy::Occupied
                } else {
                    Occupancy::Empty
                };
                let sample_info = report
                    .sample_name
                    .filter(|_| report.occupied)
                    .map(|name| {
                        let mut info = serde_json::Map::new();
                        info.insert("name".to_string(), serde_json::Value::String(name));
                        info
                    });

                let slot = doc.slot_mut(report.slot_id);
                let was_empty = slot.occupancy == Occupancy::Empty;
                let mut touched = false;
                if slot.occupancy != occupancy || slot.location != report.location {
                    slot.occupancy = occupancy;
                    slot.location = report.location;
                    touched = true;
                }

                match occupancy {
                    Occupancy::Empty => {
                        if slot.sample_info.is_some() || slot.incubation_start.is_some() {
                            slot.sample_info = None;
                            slot.incubation_start = None;
                            touched = true;
                        }
                    }
                    Occupancy::Occupied => {
                        if sample_info.is_some() && slot.sample_info != sample_info {
                            slot.sample_info = sample_info;
                            touched = true;
                        }
                        if was_empty || slot.incubation_start.is_none() {
                            slot.incubation_start = Some(now);
                            touched = true;
                        }
                    }
                }

                if touched {
                    changed += 1;
                }
            }
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ScanMode, TaskSettings};
    use tempfile::TempDir;

    fn tp(s: &str) -> TimePoint {
        s.parse().unwrap()
    }

    fn sample_doc() -> TaskDocument {
        TaskDocument {
            tasks: vec![Task::new(
                "exp1",
                TaskSettings::new(ScanMode::FullAutomation, 5),
                vec![tp("2024-01-01T10:00:00"), tp("2024-01-01T11:00:00")],
            )],
            slots: vec![SampleSlot::occupied(5)],
        }
    }

    async fn store(temp: &TempDir) -> TaskStore {
        TaskStore::create(temp.path().join("tasks.json"), sample_doc())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_missing_file_is_config_error() {
        let temp = TempDir::new().unwrap();
        let err = TaskStore::open(temp.path().join("nope.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn test_mark_imaged_moves_time_point() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        store
            .mark_imaged("exp1", tp("2024-01-01T10:00:00"))
            .await
            .unwrap();

        let task = store.task("exp1").unwrap();
        assert_eq!(task.pending_time_points, vec![tp("2024-01-01T11:00:00")]);
        assert_eq!(task.imaged_time_points, vec![tp("2024-01-01T10:00:00")]);

        let err = store
            .mark_imaged("exp1", tp("2024-01-01T10:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TimePointNotPending { .. }));

        let reopened = TaskStore::open(store.path()).await.unwrap();
        assert_eq!(reopened.task("exp1").unwrap(), task);
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_state() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        let err = store
            .advance_state("exp1", OperationalState::Completed)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(
            store.task("exp1").unwrap().operational_state,
            OperationalState::Pending
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_restore_prior_state() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        store
            .advance_state("exp1", OperationalState::Started)
            .await
            .unwrap();
        store.pause("exp1").await.unwrap();
        let task = store.task("exp1").unwrap();
        assert_eq!(task.operational_state, OperationalState::Paused);
        assert_eq!(task.paused_from, Some(OperationalState::Started));

        assert_eq!(
            store.resume("exp1").await.unwrap(),
            OperationalState::Started
        );
        assert_eq!(store.task("exp1").unwrap().paused_from, None);
    }

    #[tokio::test]
    async fn test_error_is_left_only_by_clear_error() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        store
            .set_error("exp1", "TransportError: load of slot 5 failed")
            .await
            .unwrap();
        assert!(store
            .advance_state("exp1", OperationalState::Started)
            .await
            .is_err());

        assert_eq!(
            store.clear_error("exp1").await.unwrap(),
            OperationalState::Pending
        );
        let task = store.task("exp1").unwrap();
        assert_eq!(task.operational_state, OperationalState::Pending);
        assert!(task.message.is_none());
    }

    #[tokio::test]
    async fn test_external_edit_is_merged_before_mutation() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        // Another process adds a task
        let mut doc = (*store.document()).clone();
        doc.tasks.push(Task::new(
            "exp2",
            TaskSettings::new(ScanMode::MicroscopeOnly, 6),
            vec![tp("2024-01-02T10:00:00")],
        ));
        std::fs::write(store.path(), serde_json::to_vec_pretty(&doc).unwrap()).unwrap();

        store
            .mark_imaged("exp1", tp("2024-01-01T10:00:00"))
            .await
            .unwrap();

        let reopened = TaskStore::open(store.path()).await.unwrap();
        assert!(reopened.task("exp2").is_some());
        assert_eq!(reopened.task("exp1").unwrap().imaged_time_points.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_external_edit_is_config_error() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        std::fs::write(store.path(), "{ not json").unwrap();
        let err = store.reload().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert!(err.halts_dispatch());
        assert!(store.task("exp1").is_some());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_memory_unchanged() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        // Replace the file with a directory so neither read nor rename can succeed
        std::fs::remove_file(store.path()).unwrap();
        std::fs::create_dir(store.path()).unwrap();

        let err = store
            .mark_imaged("exp1", tp("2024-01-01T10:00:00"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Persistence(_)));
        assert_eq!(store.task("exp1").unwrap().pending_time_points.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_slot_use_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        let clash = Task::new(
            "exp2",
            TaskSettings::new(ScanMode::FullAutomation, 5),
            vec![tp("2024-01-02T10:00:00")],
        );
        let err = store.upsert_task(clash).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
        assert_eq!(store.tasks().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_slots() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;

        let changed = store
            .reconcile_slots(vec![
                SlotReport {
                    slot_id: 5,
                    occupied: true,
                    sample_name: Some("plate".into()),
                    location: SampleLocation::Microscope(1),
                },
                SlotReport {
                    slot_id: 7,
                    occupied: false,
                    sample_name: None,
                    location: SampleLocation::IncubatorSlot,
                },
            ])
            .await
            .unwrap();
        assert_eq!(changed, 2);

        let slots = store.slots();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].location, SampleLocation::Microscope(1));
        assert_eq!(slots[0].sample_info.as_ref().unwrap()["name"], "plate");
        assert!(slots[0].incubation_start.is_some());
        assert_eq!(slots[1].occupancy, Occupancy::Empty);
        assert!(slots[1].sample_info.is_none());

        // Same report again changes nothing, incubation start included
        let started = slots[0].incubation_start;
        let changed = store
            .reconcile_slots(vec![SlotReport {
                slot_id: 5,
                occupied: true,
                sample_name: Some("plate".into()),
                location: SampleLocation::Microscope(1),
            }])
            .await
            .unwrap();
        assert_eq!(changed, 0);
        assert_eq!(store.slots()[0].incubation_start, started);
    }

    #[tokio::test]
    async fn test_last_time_point_completes_in_same_write() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        store
            .advance_state("exp1", OperationalState::Started)
            .await
            .unwrap();

        assert!(!store
            .mark_imaged("exp1", tp("2024-01-01T10:00:00"))
            .await
            .unwrap());
        assert!(store
            .mark_imaged("exp1", tp("2024-01-01T11:00:00"))
            .await
            .unwrap());

        let reopened = TaskStore::open(store.path()).await.unwrap();
        assert_eq!(
            reopened.task("exp1").unwrap().operational_state,
            OperationalState::Completed
        );
    }

    #[tokio::test]
    async fn test_paused_task_is_not_completed_by_last_time_point() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp).await;
        store
            .advance_state("exp1", OperationalState::Started)
            .await
            .unwrap();
        store.pause("exp1").await.unwrap();

        store
            .mark_imaged("exp1", tp("2024-01-01T10:00:00"))
            .await
            .unwrap();
        assert!(!store
            .mark_imaged("exp1", tp("2024-01-01T11:00:00"))
            .await
            .unwrap());
        assert_eq!(
            store.task("exp1").unwrap().operational_state,
            OperationalState::Paused
        );
    }
}
