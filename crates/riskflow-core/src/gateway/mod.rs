//! Submission and polling boundary.
//!
//! [`Engine`] owns the task registry, a bounded submission queue, a fixed pool of
//! workers and the deadline sweeper. Callers submit work, poll status and collect
//! results; everything else happens on background tasks.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod resolver;
mod worker;

pub use resolver::{
    DocumentResolver, FsDocumentResolver, MemoryDocumentResolver, ResolvedDocument,
};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::extract::{AnalysisResult, Extractor};
use crate::orchestrator::Orchestrator;
use crate::provider::{ProviderHealth, ProviderTable};
use crate::task::{
    registry::{Registration, StatusCounts, TaskRegistry},
    AnalysisType, Task, TaskFailure, TaskId, TaskSpec, TaskStatus,
};

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Parameters of one analysis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub document_ref: String,
    pub analysis_type: AnalysisType,
    /// Category tags; empty means all.
    pub risk_categories: Vec<String>,
    pub confidence_threshold: f32,
}

impl SubmitRequest {
    pub fn new(document_ref: impl Into<String>, analysis_type: AnalysisType) -> Self {
        Self {
            document_ref: document_ref.into(),
            analysis_type,
            risk_categories: Vec::new(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.risk_categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_threshold(mut self, confidence_threshold: f32) -> Self {
        self.confidence_threshold = confidence_threshold;
        self
    }
}

/// What a poller sees of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub id: TaskId,
    pub status: TaskStatus,
    pub document_ref: String,
    pub analysis_type: AnalysisType,
    pub attempt_count: usize,
    pub degraded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub provider_used: Option<String>,
    pub cancel_requested: bool,
    pub failure: Option<TaskFailure>,
}

impl From<&Task> for TaskStatusView {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id,
            status: task.status,
            document_ref: task.spec.document_ref.clone(),
            analysis_type: task.spec.analysis_type,
            attempt_count: task.attempt_count(),
            degraded: task.degraded(),
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            provider_used: task
                .result
                .as_ref()
                .map(|result| result.provider_used.clone()),
            cancel_requested: task.cancel_requested,
            failure: task.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub tasks: StatusCounts,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Task ids waiting in the submission queue.
    pub queue_depth: usize,
    pub in_flight: usize,
}

pub(crate) struct Shared {
    pub(crate) registry: TaskRegistry,
    pub(crate) orchestrator: Orchestrator,
    pub(crate) extractor: Extractor,
    pub(crate) resolver: Arc<dyn DocumentResolver>,
    pub(crate) config: EngineConfig,
}

/// Running engine handle. Dropping it stops the background tasks.
pub struct Engine {
    shared: Arc<Shared>,
    sender: mpsc::Sender<TaskId>,
    receiver: worker::SharedReceiver,
    shutdown: CancellationToken,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Validate `config` and spawn the worker pool and sweeper on the current runtime.
    pub fn start(
        config: EngineConfig,
        providers: ProviderTable,
        resolver: Arc<dyn DocumentResolver>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver: worker::SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            registry: TaskRegistry::new(),
            orchestrator: Orchestrator::new(Arc::new(providers)),
            extractor: Extractor::new(config.extraction.clone()),
            resolver,
            config,
        });

        let mut handles = Vec::with_capacity(shared.config.workers + 1);
        for index in 0..shared.config.workers {
            handles.push(tokio::spawn(worker::run_worker(
                index,
                Arc::clone(&shared),
                Arc::clone(&receiver),
                shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(worker::run_sweeper(
            Arc::clone(&shared),
            shutdown.clone(),
        )));
        info!(
            workers = shared.config.workers,
            queue_capacity = shared.config.queue_capacity,
            providers = shared.orchestrator.providers().len(),
            "engine started"
        );

        Ok(Self {
            shared,
            sender,
            receiver,
            shutdown,
            handles: parking_lot::Mutex::new(handles),
        })
    }

    /// Build every configured provider and start.
    pub fn from_config(
        config: EngineConfig,
        resolver: Arc<dyn DocumentResolver>,
    ) -> anyhow::Result<Self> {
        let providers = ProviderTable::from_config(&config.providers, &config.circuit)?;
        Ok(Self::start(config, providers, resolver)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Queue a new analysis, or return the live duplicate's id when dedup is on.
    ///
    /// Fails fast with [`EngineError::Backpressure`] when the queue is full; no task is
    /// created in that case.
    pub fn submit(&self, request: SubmitRequest) -> Result<TaskId, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }
        let spec = TaskSpec::new(
            request.document_ref,
            request.analysis_type,
            &request.risk_categories,
            request.confidence_threshold,
        )?;
        let capacity = self.shared.config.queue_capacity;
        let admit = || {
            if self.shutdown.is_cancelled() {
                return Err(EngineError::ShuttingDown);
            }
            self.sender.try_reserve().map_err(|err| match err {
                TrySendError::Full(()) => EngineError::Backpressure { capacity },
                TrySendError::Closed(()) => EngineError::ShuttingDown,
            })
        };
        let registration = self
            .shared
            .registry
            .register(spec, self.shared.config.dedup_enabled, admit)?;
        match registration {
            Registration::Created { id, permit } => {
                permit.send(id);
                Ok(id)
            }
            Registration::Existing(id) => Ok(id),
        }
    }

    pub fn get_status(&self, id: TaskId) -> Result<TaskStatusView, EngineError> {
        self.task(id).map(|task| TaskStatusView::from(&task))
    }

    pub fn get_result(&self, id: TaskId) -> Result<Arc<AnalysisResult>, EngineError> {
        let task = self.task(id)?;
        match (task.status, task.result) {
            (TaskStatus::Completed, Some(result)) => Ok(result),
            (status, _) => Err(EngineError::ResultNotReady { id, status }),
        }
    }

    /// Idempotent; terminal tasks are left untouched.
    pub fn cancel(&self, id: TaskId) -> Result<TaskStatus, EngineError> {
        self.shared
            .registry
            .cancel(id)
            .ok_or(EngineError::TaskNotFound(id))
    }

    /// Poll until the task is terminal.
    pub async fn wait(
        &self,
        id: TaskId,
        poll_interval: Duration,
    ) -> Result<TaskStatusView, EngineError> {
        loop {
            let view = self.get_status(id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    pub fn active_tasks(&self) -> Vec<TaskStatusView> {
        self.shared
            .registry
            .active()
            .iter()
            .map(TaskStatusView::from)
            .collect()
    }

    pub fn metrics(&self) -> EngineMetrics {
        let tasks = self.shared.registry.counts();
        EngineMetrics {
            tasks,
            workers: self.shared.config.workers,
            queue_capacity: self.shared.config.queue_capacity,
            queue_depth: self.shared.config.queue_capacity - self.sender.capacity(),
            in_flight: tasks.processing,
        }
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.shared.orchestrator.providers().health()
    }

    /// Stop accepting work, let in-flight tasks finish and wait for the background tasks.
    ///
    /// Tasks still queued afterwards fail with `EngineShutdown`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                debug!(error = %err, "background task ended abnormally");
            }
        }
        {
            let mut receiver = self.receiver.lock().await;
            receiver.close();
            while receiver.try_recv().is_ok() {}
        }
        let abandoned = self
            .shared
            .registry
            .abandon_queued("engine shut down before the task was processed");
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "queued tasks failed at shutdown");
        }
        info!("engine stopped");
    }

    fn task(&self, id: TaskId) -> Result<Task, EngineError> {
        self.shared
            .registry
            .snapshot(id)
            .ok_or(EngineError::TaskNotFound(id))
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
