//! Critical-section guard for physical hardware sequences.
//!
//! Every load/image/unload runs inside a section. Once shutdown is requested
//! no new section may begin, and shutdown waits until the open ones end.
//! Each section has a limit (`max_section` unless opened with its own). A
//! section that outlives it while shutdown is waiting is force-closed along
//! with the other open sections of the same task, and reported so the task
//! can be marked as failed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::error::{OrchestratorError, Result};

#[derive(Debug)]
struct Section {
    label: String,
    task: Option<String>,
    started: Instant,
    limit: Duration,
}

impl Section {
    fn is_overdue(&self) -> bool {
        self.started.elapsed() >= self.limit
    }
}

#[derive(Debug, Default)]
struct GuardState {
    next_id: u64,
    active: BTreeMap<u64, Section>,
    shutdown: bool,
}

#[derive(Debug)]
struct GuardInner {
    state: Mutex<GuardState>,
    /// Bumped whenever a section ends or shutdown is requested
    changed: watch::Sender<u64>,
    max_section: Duration,
}

impl GuardInner {
    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn release(&self, id: u64) {
        let removed = self.lock().active.remove(&id);
        if let Some(section) = removed {
            debug!(
                label = %section.label,
                elapsed_ms = section.started.elapsed().as_millis() as u64,
                "Critical section ended"
            );
            self.notify();
        }
    }
}

/// Open section, as shown in status output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionInfo {
    pub label: String,
    pub task: Option<String>,
    pub elapsed_ms: u64,
}

/// A section closed by the guard instead of by its owner
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedSection {
    pub label: String,
    pub task: Option<String>,
    pub elapsed: Duration,
}

impl ForcedSection {
    pub fn to_error(&self) -> OrchestratorError {
        OrchestratorError::CriticalSectionTimeout {
            label: self.label.clone(),
            task: self.task.clone(),
            elapsed: self.elapsed,
        }
    }
}

/// Outcome of waiting for all sections to end
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClearanceReport {
    pub forced: Vec<ForcedSection>,
}

/// Marker for an open section; dropping it (or `end()`) closes the section
#[must_use = "the section ends as soon as the token is dropped"]
#[derive(Debug)]
pub struct SectionToken {
    id: u64,
    guard: Arc<GuardInner>,
}

impl SectionToken {
    pub fn end(self) {
        // Drop does the work
    }
}

impl Drop for SectionToken {
    fn drop(&mut self) {
        self.guard.release(self.id);
    }
}

/// Shared guard handle
#[derive(Debug, Clone)]
pub struct CriticalSectionGuard {
    inner: Arc<GuardInner>,
}

impl CriticalSectionGuard {
    pub fn new(max_section: Duration) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(GuardInner {
                state: Mutex::new(GuardState::default()),
                changed,
                max_section,
            }),
        }
    }

    fn open(
        &self,
        state: &mut GuardState,
        label: String,
        task: Option<&str>,
        limit: Duration,
    ) -> SectionToken {
        let id = state.next_id;
        state.next_id += 1;
        state.active.insert(
            id,
            Section {
                label,
                task: task.map(str::to_string),
                started: Instant::now(),
                limit,
            },
        );
        SectionToken {
            id,
            guard: Arc::clone(&self.inner),
        }
    }

    /// Open a section. Fails once shutdown has been requested.
    pub fn begin(&self, label: impl Into<String>, task: Option<&str>) -> Result<SectionToken> {
        self.begin_with_limit(label, task, self.inner.max_section)
    }

    /// Open a section that may run for up to `limit` before shutdown forces it
    pub fn begin_with_limit(
        &self,
        label: impl Into<String>,
        task: Option<&str>,
        limit: Duration,
    ) -> Result<SectionToken> {
        let label = label.into();
        let mut state = self.inner.lock();
        if state.shutdown {
            return Err(OrchestratorError::ShutdownPending);
        }
        debug!(%label, task = task.unwrap_or("-"), limit_s = limit.as_secs(), "Critical section begun");
        Ok(self.open(&mut state, label, task, limit))
    }

    /// Open a section inside `parent`'s sequence. Never refused: the
    /// enclosing sequence has already started and must be able to finish.
    pub fn begin_within(
        &self,
        parent: &SectionToken,
        label: impl Into<String>,
        task: Option<&str>,
    ) -> SectionToken {
        let label = label.into();
        let mut state = self.inner.lock();
        debug!(%label, parent = parent.id, "Nested critical section begun");
        self.open(&mut state, label, task, self.inner.max_section)
    }

    /// Latch shutdown; later `begin` calls fail
    pub fn request_shutdown(&self) {
        let newly = {
            let mut state = self.inner.lock();
            !std::mem::replace(&mut state.shutdown, true)
        };
        if newly {
            info!("Shutdown requested; no new hardware sequences will start");
            self.inner.notify();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.lock().shutdown
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn active_sections(&self) -> Vec<SectionInfo> {
        self.inner
            .lock()
            .active
            .values()
            .map(|s| SectionInfo {
                label: s.label.clone(),
                task: s.task.clone(),
                elapsed_ms: s.started.elapsed().as_millis() as u64,
            })
            .collect()
    }

    /// Longest time an open section, or one opened from now on, may still
    /// run before shutdown forces it
    pub fn longest_remaining(&self) -> Duration {
        self.inner
            .lock()
            .active
            .values()
            .map(|s| s.limit.saturating_sub(s.started.elapsed()))
            .fold(self.inner.max_section, Duration::max)
    }

    /// Resolve once no section is open. While shutdown is pending, sections
    /// past their limit are force-closed, together with the rest of their
    /// task's sections, and returned in the report.
    pub async fn wait_for_clearance(&self) -> ClearanceReport {
        let mut report = ClearanceReport::default();

        loop {
            let mut changed = self.inner.changed.subscribe();

            let deadline = {
                let mut state = self.inner.lock();
                if state.active.is_empty() {
                    return report;
                }

                if state.shutdown {
                    let overdue_tasks: Vec<String> = state
                        .active
                        .values()
                        .filter(|s| s.is_overdue())
                        .filter_map(|s| s.task.clone())
                        .collect();
                    let expired: Vec<u64> = state
                        .active
                        .iter()
                        .filter(|(_, s)| {
                            s.is_overdue()
                                || s.task.as_ref().is_some_and(|t| overdue_tasks.contains(t))
                        })
                        .map(|(id, _)| *id)
                        .collect();

                    for id in expired {
                        if let Some(section) = state.active.remove(&id) {
                            let elapsed = section.started.elapsed();
                            error!(
                                label = %section.label,
                                task = section.task.as_deref().unwrap_or("-"),
                                elapsed_s = elapsed.as_secs(),
                                "Critical section exceeded its limit; force-closing"
                            );
                            report.forced.push(ForcedSection {
                                label: section.label,
                                task: section.task,
                                elapsed,
                            });
                        }
                    }

                    if state.active.is_empty() {
                        return report;
                    }

                    state
                        .active
                        .values()
                        .filter_map(|s| s.started.checked_add(s.limit))
                        .min()
                } else {
                    None
                }
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = changed.changed() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => {
                    // Sender lives as long as the guard; an error cannot happen here
                    let _ = changed.changed().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant as StdInstant;

    #[tokio::test]
    async fn test_clearance_when_idle() {
        let guard = CriticalSectionGuard::new(Duration::from_secs(60));
        let token = guard.begin("load slot 1", Some("exp1")).unwrap();
        assert_eq!(guard.active_count(), 1);
        assert_eq!(guard.active_sections()[0].task.as_deref(), Some("exp1"));

        token.end();
        assert_eq!(guard.active_count(), 0);
        assert_eq!(guard.wait_for_clearance().await, ClearanceReport::default());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_open_section() {
        let guard = CriticalSectionGuard::new(Duration::from_secs(60));
        let outer = guard.begin("cycle exp1", Some("exp1")).unwrap();
        let inner = guard.begin("unload slot 1", Some("exp1")).unwrap();

        guard.request_shutdown();
        assert!(matches!(
            guard.begin("load slot 2", None),
            Err(OrchestratorError::ShutdownPending)
        ));

        let started = StdInstant::now();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(inner);
            tokio::time::sleep(Duration::from_millis(20)).await;
            outer.end();
        });

        let report = guard.wait_for_clearance().await;
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert!(report.forced.is_empty());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_overdue_section_is_force_closed() {
        let guard = CriticalSectionGuard::new(Duration::from_millis(50));
        let stuck = guard.begin("unload slot 3", Some("exp2")).unwrap();

        guard.request_shutdown();
        let report = tokio::time::timeout(Duration::from_secs(5), guard.wait_for_clearance())
            .await
            .unwrap();

        assert_eq!(report.forced.len(), 1);
        assert_eq!(report.forced[0].task.as_deref(), Some("exp2"));
        assert!(matches!(
            report.forced[0].to_error(),
            OrchestratorError::CriticalSectionTimeout { .. }
        ));
        assert_eq!(guard.active_count(), 0);

        // Late release of a force-closed section is harmless
        drop(stuck);
        assert_eq!(guard.active_count(), 0);
    }

    #[tokio::test]
    async fn test_section_runs_to_its_own_limit() {
        let guard = CriticalSectionGuard::new(Duration::from_millis(20));
        let cycle = guard
            .begin_with_limit("cycle exp1", Some("exp1"), Duration::from_secs(60))
            .unwrap();
        assert!(guard.longest_remaining() > Duration::from_secs(59));

        guard.request_shutdown();
        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            cycle.end();
        });

        // Well past max_section, still inside the cycle's own limit
        let report = guard.wait_for_clearance().await;
        assert!(report.forced.is_empty());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_section_takes_its_task_along() {
        let guard = CriticalSectionGuard::new(Duration::from_millis(50));
        let cycle = guard
            .begin_with_limit("cycle exp1", Some("exp1"), Duration::from_secs(60))
            .unwrap();
        let _unload = guard.begin_within(&cycle, "unload slot 3", Some("exp1"));
        let _other = guard
            .begin_with_limit("cycle exp2", Some("exp2"), Duration::from_millis(300))
            .unwrap();

        guard.request_shutdown();
        let report = tokio::time::timeout(Duration::from_secs(5), guard.wait_for_clearance())
            .await
            .unwrap();

        let exp1: Vec<_> = report
            .forced
            .iter()
            .filter(|f| f.task.as_deref() == Some("exp1"))
            .collect();
        assert_eq!(exp1.len(), 2);
        assert_eq!(report.forced.len(), 3);
        assert_eq!(guard.active_count(), 0);
    }

    #[tokio::test]
    async fn test_no_escalation_without_shutdown() {
        let guard = CriticalSectionGuard::new(Duration::from_millis(10));
        let _token = guard.begin("scan exp1", Some("exp1")).unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(100), guard.wait_for_clearance()).await;
        assert!(waited.is_err());
        assert_eq!(guard.active_count(), 1);
    }
}
