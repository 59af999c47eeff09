use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AttemptRecord, FailureKind, Task, TaskFailure, TaskId, TaskSpec, TaskStatus};
use crate::extract::AnalysisResult;

/// A terminal write lost the race against an earlier one.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task `{id}` already reached terminal status `{status}`")]
pub struct AlreadyTerminal {
    pub id: TaskId,
    pub status: TaskStatus,
}

/// Outcome of [`TaskRegistry::register`].
#[derive(Debug)]
pub enum Registration<P> {
    Created { id: TaskId, permit: P },
    /// A live task with the same fingerprint already exists.
    Existing(TaskId),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.queued + self.processing + self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    started_instant: Option<Instant>,
    finished_instant: Option<Instant>,
    attempt_log: Vec<AttemptRecord>,
    result: Option<Arc<AnalysisResult>>,
    failure: Option<TaskFailure>,
}

#[derive(Debug)]
struct TaskEntry {
    id: TaskId,
    spec: TaskSpec,
    fingerprint: String,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    processing: AtomicBool,
    cancel_requested: AtomicBool,
}

impl TaskEntry {
    fn new(id: TaskId, spec: TaskSpec, fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            spec,
            fingerprint,
            created_at: now,
            state: Mutex::new(TaskState {
                status: TaskStatus::Queued,
                updated_at: now,
                started_at: None,
                started_instant: None,
                finished_instant: None,
                attempt_log: Vec::new(),
                result: None,
                failure: None,
            }),
            processing: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
        }
    }

    fn snapshot(&self) -> Task {
        let state = self.state.lock();
        Task {
            id: self.id,
            spec: self.spec.clone(),
            status: state.status,
            created_at: self.created_at,
            updated_at: state.updated_at,
            started_at: state.started_at,
            attempt_log: state.attempt_log.clone(),
            result: state.result.clone(),
            failure: state.failure.clone(),
            cancel_requested: self.cancel_requested.load(Ordering::Acquire),
        }
    }

    /// First terminal write wins; later ones are discarded.
    fn finalize(
        &self,
        status: TaskStatus,
        result: Option<Arc<AnalysisResult>>,
        failure: Option<TaskFailure>,
    ) -> Result<(), AlreadyTerminal> {
        let mut state = self.state.lock();
        self.finalize_locked(&mut state, status, result, failure)
    }

    fn finalize_locked(
        &self,
        state: &mut TaskState,
        status: TaskStatus,
        result: Option<Arc<AnalysisResult>>,
        failure: Option<TaskFailure>,
    ) -> Result<(), AlreadyTerminal> {
        if state.status.is_terminal() {
            warn!(
                task = %self.id,
                current = %state.status,
                attempted = %status,
                "discarding late terminal write"
            );
            return Err(AlreadyTerminal {
                id: self.id,
                status: state.status,
            });
        }
        let failure = failure.map(|failure| {
            if failure.attempts.is_empty() && !state.attempt_log.is_empty() {
                failure.with_attempts(state.attempt_log.clone())
            } else {
                failure
            }
        });
        state.status = status;
        state.result = result;
        state.failure = failure;
        state.updated_at = Utc::now();
        state.finished_instant = Some(Instant::now());
        info!(task = %self.id, status = %status, "task finished");
        Ok(())
    }
}

/// Owns every task record and its lifecycle transitions.
///
/// Lock order is dedup index, then task table, then a task's state.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Arc<TaskEntry>>>,
    dedup: Mutex<HashMap<String, TaskId>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a task, or return the live duplicate when `dedup` is set.
    ///
    /// `admit` runs only when a new task is about to be created, while the dedup index
    /// is held; if it fails nothing is recorded.
    pub fn register<P, E>(
        &self,
        spec: TaskSpec,
        dedup: bool,
        admit: impl FnOnce() -> Result<P, E>,
    ) -> Result<Registration<P>, E> {
        let fingerprint = spec.fingerprint();
        let mut index = self.dedup.lock();
        if dedup {
            if let Some(existing) = index.get(&fingerprint).copied() {
                if let Some(entry) = self.entry(existing) {
                    let status = entry.state.lock().status;
                    if matches!(
                        status,
                        TaskStatus::Queued | TaskStatus::Processing | TaskStatus::Completed
                    ) {
                        debug!(task = %existing, %status, "duplicate submission collapsed");
                        return Ok(Registration::Existing(existing));
                    }
                }
            }
        }

        let permit = admit()?;
        let id = TaskId::new();
        let entry = Arc::new(TaskEntry::new(id, spec, fingerprint.clone()));
        self.tasks.write().insert(id, entry);
        if dedup {
            index.insert(fingerprint, id);
        }
        debug!(task = %id, "task queued");
        Ok(Registration::Created { id, permit })
    }

    pub fn snapshot(&self, id: TaskId) -> Option<Task> {
        self.entry(id).map(|entry| entry.snapshot())
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.read().contains_key(&id)
    }

    /// Take the per-task processing lock and move `Queued -> Processing`.
    ///
    /// Returns `None` if the task is unknown, not queued, or already held.
    pub fn begin_processing(&self, id: TaskId) -> Option<ProcessingGuard> {
        let entry = self.entry(id)?;
        if entry
            .processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        {
            let mut state = entry.state.lock();
            if state.status != TaskStatus::Queued {
                drop(state);
                entry.processing.store(false, Ordering::Release);
                return None;
            }
            let now = Utc::now();
            state.status = TaskStatus::Processing;
            state.updated_at = now;
            state.started_at = Some(now);
            state.started_instant = Some(Instant::now());
        }
        debug!(task = %id, "task processing");
        Some(ProcessingGuard { entry })
    }

    /// Request cancellation and return the status afterwards.
    ///
    /// Queued tasks are cancelled on the spot; processing tasks get the cooperative
    /// flag; terminal tasks are left alone.
    pub fn cancel(&self, id: TaskId) -> Option<TaskStatus> {
        let entry = self.entry(id)?;
        let mut state = entry.state.lock();
        match state.status {
            TaskStatus::Queued => {
                entry.cancel_requested.store(true, Ordering::Release);
                state.status = TaskStatus::Cancelled;
                state.updated_at = Utc::now();
                state.finished_instant = Some(Instant::now());
                info!(task = %id, "queued task cancelled");
            }
            TaskStatus::Processing => {
                if !entry.cancel_requested.swap(true, Ordering::AcqRel) {
                    info!(task = %id, "cancellation requested for running task");
                }
            }
            _ => {}
        }
        Some(state.status)
    }

    /// Fail every task that has been processing for longer than `deadline`.
    pub fn sweep_expired(&self, deadline: Duration) -> Vec<TaskId> {
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        let mut expired = Vec::new();
        for entry in entries {
            let overdue = {
                let state = entry.state.lock();
                state.status == TaskStatus::Processing
                    && state
                        .started_instant
                        .map_or(false, |started| started.elapsed() >= deadline)
            };
            if !overdue {
                continue;
            }
            entry.cancel_requested.store(true, Ordering::Release);
            let failure = TaskFailure::new(
                FailureKind::TaskTimeout,
                format!(
                    "task exceeded the processing deadline of {}",
                    humantime::format_duration(deadline)
                ),
            );
            let outcome = entry.finalize(TaskStatus::Failed, None, Some(failure));
            if outcome.is_ok() {
                warn!(task = %entry.id, "task timed out");
                expired.push(entry.id);
            }
        }
        expired
    }

    /// Fail every task still waiting in the queue. Only meaningful once no worker
    /// will pick up further ids.
    pub fn abandon_queued(&self, reason: &str) -> Vec<TaskId> {
        // Serialises with `register`, whose admission check sees the shutdown first.
        let _index = self.dedup.lock();
        let entries: Vec<Arc<TaskEntry>> = self.tasks.read().values().cloned().collect();
        let mut abandoned = Vec::new();
        for entry in entries {
            let mut state = entry.state.lock();
            if state.status != TaskStatus::Queued {
                continue;
            }
            let failure = TaskFailure::new(FailureKind::EngineShutdown, reason);
            let outcome =
                entry.finalize_locked(&mut state, TaskStatus::Failed, None, Some(failure));
            if outcome.is_ok() {
                abandoned.push(entry.id);
            }
        }
        abandoned
    }

    /// Drop terminal tasks that finished at least `older_than` ago.
    pub fn purge_terminal(&self, older_than: Duration) -> usize {
        let mut index = self.dedup.lock();
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let state = entry.state.lock();
            let expired = state.status.is_terminal()
                && state
                    .finished_instant
                    .map_or(false, |finished| finished.elapsed() >= older_than);
            if expired && index.get(&entry.fingerprint) == Some(&entry.id) {
                index.remove(&entry.fingerprint);
            }
            !expired
        });
        let purged = before - tasks.len();
        if purged > 0 {
            debug!(purged, "purged terminal tasks");
        }
        purged
    }

    /// Non-terminal tasks, oldest first.
    pub fn active(&self) -> Vec<Task> {
        let mut active: Vec<Task> = self
            .tasks
            .read()
            .values()
            .map(|entry| entry.snapshot())
            .filter(|task| !task.status.is_terminal())
            .collect();
        active.sort_by_key(|task| (task.created_at, task.id));
        active
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.tasks.read().values() {
            match entry.state.lock().status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    fn entry(&self, id: TaskId) -> Option<Arc<TaskEntry>> {
        self.tasks.read().get(&id).cloned()
    }
}

/// Exclusive handle on a processing task. Dropping it without a terminal write fails
/// the task as `Internal`.
#[derive(Debug)]
pub struct ProcessingGuard {
    entry: Arc<TaskEntry>,
}

impl ProcessingGuard {
    pub fn id(&self) -> TaskId {
        self.entry.id
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.entry.spec
    }

    pub fn cancel_requested(&self) -> bool {
        self.entry.cancel_requested.load(Ordering::Acquire)
    }

    /// Append to the attempt log; ignored once the task is terminal.
    pub fn record_attempt(&self, record: AttemptRecord) {
        let mut state = self.entry.state.lock();
        if state.status == TaskStatus::Processing {
            state.attempt_log.push(record);
            state.updated_at = Utc::now();
        }
    }

    pub fn attempts(&self) -> Vec<AttemptRecord> {
        self.entry.state.lock().attempt_log.clone()
    }

    pub fn complete(&self, result: AnalysisResult) -> Result<(), AlreadyTerminal> {
        self.entry
            .finalize(TaskStatus::Completed, Some(Arc::new(result)), None)
    }

    pub fn fail(&self, failure: TaskFailure) -> Result<(), AlreadyTerminal> {
        self.entry.finalize(TaskStatus::Failed, None, Some(failure))
    }

    pub fn cancelled(&self) -> Result<(), AlreadyTerminal> {
        self.entry.finalize(TaskStatus::Cancelled, None, None)
    }
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        let unfinished = self.entry.state.lock().status == TaskStatus::Processing;
        if unfinished {
            let _ = self.entry.finalize(
                TaskStatus::Failed,
                None,
                Some(TaskFailure::new(
                    FailureKind::Internal,
                    "worker released the task without a terminal state",
                )),
            );
        }
        self.entry.processing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{RiskBand, RiskFinding};
    use crate::task::{AnalysisType, AttemptOutcome, RiskCategory};

    fn spec(doc: &str) -> TaskSpec {
        TaskSpec::new(doc, AnalysisType::Quick, Vec::<String>::new(), 0.5).unwrap()
    }

    fn admit() -> Result<(), ()> {
        Ok(())
    }

    fn created(registration: Registration<()>) -> TaskId {
        match registration {
            Registration::Created { id, .. } => id,
            Registration::Existing(id) => panic!("expected a new task, got existing {id}"),
        }
    }

    fn result() -> AnalysisResult {
        AnalysisResult {
            findings: vec![RiskFinding {
                category: RiskCategory::Liability,
                severity: 80.0,
                description: "unlimited liability".into(),
                confidence: 0.9,
                source_span: Some((0, 10)),
                recommendations: vec![],
            }],
            aggregate_score: 80.0,
            risk_band: RiskBand::High,
            no_risks_identified: false,
            provider_used: "primary".into(),
            degraded: false,
            confidence: 0.9,
            summary: None,
            recommendations: vec![],
        }
    }

    #[test]
    fn dedup_returns_live_task_and_skips_admission() {
        let registry = TaskRegistry::new();
        let first = created(registry.register(spec("doc"), true, admit).unwrap());
        let second = registry
            .register(spec("doc"), true, || -> Result<(), ()> {
                panic!("admission must not run for duplicates")
            })
            .unwrap();
        assert!(matches!(second, Registration::Existing(id) if id == first));
    }

    #[test]
    fn without_dedup_each_submission_is_distinct() {
        let registry = TaskRegistry::new();
        let a = created(registry.register(spec("doc"), false, admit).unwrap());
        let b = created(registry.register(spec("doc"), false, admit).unwrap());
        assert_ne!(a, b);
        assert_eq!(registry.counts().queued, 2);
    }

    #[test]
    fn dedup_does_not_reuse_cancelled_task() {
        let registry = TaskRegistry::new();
        let first = created(registry.register(spec("doc"), true, admit).unwrap());
        registry.cancel(first);
        let second = created(registry.register(spec("doc"), true, admit).unwrap());
        assert_ne!(first, second);
    }

    #[test]
    fn failed_admission_creates_nothing() {
        let registry = TaskRegistry::new();
        let err = registry
            .register(spec("doc"), true, || Err::<(), _>("full"))
            .unwrap_err();
        assert_eq!(err, "full");
        assert_eq!(registry.counts().total(), 0);
    }

    #[test]
    fn processing_lock_is_exclusive() {
        let registry = TaskRegistry::new();
        let id = created(registry.register(spec("doc"), false, admit).unwrap());
        let guard = registry
            .begin_processing(id)
            .expect("first worker takes the task");
        assert!(registry.begin_processing(id).is_none());
        guard.complete(result()).unwrap();
        drop(guard);
        assert!(
            registry.begin_processing(id).is_none(),
            "terminal tasks are never re-processed"
        );
    }

    #[test]
    fn cancelling_queued_task_skips_processing() {
        let registry = TaskRegistry::new();
        let id = created(registry.register(spec("doc"), false, admit).unwrap());
        assert_eq!(registry.cancel(id), Some(TaskStatus::Cancelled));
        assert!(registry.begin_processing(id).is_none());
        let task = registry.snapshot(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.started_at.is_none());
        assert_eq!(registry.cancel(id), Some(TaskStatus::Cancelled));
    }

    #[test]
    fn cancelling_running_task_sets_flag_only() {
        let registry = TaskRegistry::new();
        let id = created(registry.register(spec("doc"), false, admit).unwrap());
        let guard = registry.begin_processing(id).unwrap();
        assert_eq!(registry.cancel(id), Some(TaskStatus::Processing));
        assert!(guard.cancel_requested());
        guard.cancelled().unwrap();
        assert_eq!(registry.snapshot(id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn first_terminal_write_wins() {
        let registry = TaskRegistry::new();
        let id = created(registry.register(spec("doc"), false, admit).unwrap());
        let guard = registry.begin_processing(id).unwrap();
        let failure = TaskFailure::new(FailureKind::AllProvidersExhausted, "none left");
        guard.fail(failure).unwrap();
        let err = guard.complete(result()).unwrap_err();
        assert_eq!(err.status, TaskStatus::Failed);
        let task = registry.snapshot(id).unwrap();
        assert!(task.result.is_none());
        assert_eq!(
            task.failure.unwrap().kind,
            FailureKind::AllProvidersExhausted
        );
    }

    #[test]
    fn failure_inherits_attempt_log() {
        let registry = TaskRegistry::new();
        let id = created(registry.register(spec("doc"), false, admit).unwrap());
        let guard = registry.begin_processing(id).unwrap();
        guard.record_attempt(AttemptRecord {
            provider: "a".into(),
            outcome: AttemptOutcome::Timeout,
            latency_ms: 5,
        });
        let failure = TaskFailure::new(FailureKind::AllProvidersExhausted, "none left");
        guard.fail(failure).unwrap();
        let failure = registry.snapshot(id).unwrap().failure.unwrap();
        assert_eq!(failure.attempts.len(), 1);
        assert_eq!(failure.last_error_class.as_deref(), Some("ProviderTimeout"));
    }

    #[test]
    fn dropped_guard_fails_task_as_internal() {
        let registry = TaskRegistry::new();
        let id = created(registry.register(spec("doc"), false, admit).unwrap());
        drop(registry.begin_processing(id).unwrap());
        let task = registry.snapshot(id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure.unwrap().kind, FailureKind::Internal);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_times_out_long_running_tasks() {
        let registry = TaskRegistry::new();
        let slow = created(registry.register(spec("slow"), false, admit).unwrap());
        let guard = registry.begin_processing(slow).unwrap();
        let queued = created(registry.register(spec("queued"), false, admit).unwrap());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(registry.sweep_expired(Duration::from_secs(60)).is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.sweep_expired(Duration::from_secs(60)), vec![slow]);
        assert!(guard.cancel_requested());
        assert!(guard.complete(result()).is_err());

        let task = registry.snapshot(slow).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure.unwrap().kind, FailureKind::TaskTimeout);
        let queued = registry.snapshot(queued).unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
    }

    #[test]
    fn abandon_fails_only_queued_tasks() {
        let registry = TaskRegistry::new();
        let running = created(registry.register(spec("running"), false, admit).unwrap());
        let guard = registry.begin_processing(running).unwrap();
        let waiting = created(registry.register(spec("waiting"), false, admit).unwrap());
        let cancelled = created(registry.register(spec("cancelled"), false, admit).unwrap());
        registry.cancel(cancelled);

        assert_eq!(registry.abandon_queued("engine stopped"), vec![waiting]);
        let task = registry.snapshot(waiting).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.failure.unwrap().kind, FailureKind::EngineShutdown);
        let cancelled = registry.snapshot(cancelled).unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(registry.begin_processing(waiting).is_none());

        guard.complete(result()).unwrap();
        assert!(registry.abandon_queued("engine stopped").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_old_terminal_tasks_and_dedup_entries() {
        let registry = TaskRegistry::new();
        let done = created(registry.register(spec("doc"), true, admit).unwrap());
        let guard = registry.begin_processing(done).unwrap();
        guard.complete(result()).unwrap();
        let live = created(registry.register(spec("other"), true, admit).unwrap());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(registry.purge_terminal(Duration::from_secs(60)), 0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(registry.purge_terminal(Duration::from_secs(60)), 1);

        assert!(!registry.contains(done));
        assert!(registry.contains(live));
        let again = created(registry.register(spec("doc"), true, admit).unwrap());
        assert_ne!(again, done);
    }

    #[test]
    fn active_lists_only_non_terminal_tasks() {
        let registry = TaskRegistry::new();
        let a = created(registry.register(spec("a"), false, admit).unwrap());
        let b = created(registry.register(spec("b"), false, admit).unwrap());
        registry.cancel(a);
        let active = registry.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b);
    }
}
