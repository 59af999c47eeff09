use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::Shared;
use crate::extract::Provenance;
use crate::orchestrator::{AcceptedOutput, Orchestration};
use crate::preprocess;
use crate::task::{registry::ProcessingGuard, FailureKind, TaskFailure, TaskId};

pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<TaskId>>>;

/// Pull task ids until shutdown; one task at a time per worker.
pub(crate) async fn run_worker(
    index: usize,
    shared: Arc<Shared>,
    receiver: SharedReceiver,
    shutdown: CancellationToken,
) {
    debug!(worker = index, "worker started");
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                id = receiver.recv() => id,
            }
        };
        let Some(id) = next else {
            break;
        };
        process_task(&shared, id).await;
    }
    debug!(worker = index, "worker stopped");
}

#[instrument(name = "process_task", skip_all, fields(task = %id))]
pub(crate) async fn process_task(shared: &Shared, id: TaskId) {
    let Some(guard) = shared.registry.begin_processing(id) else {
        debug!("task is no longer queued; skipping");
        return;
    };
    let spec = guard.spec().clone();

    let document = match shared.resolver.resolve(&spec.document_ref).await {
        Ok(document) => document,
        Err(err) => {
            warn!(error = %err, "document could not be resolved");
            let failure = TaskFailure::new(FailureKind::DocumentUnreadable, err.reason);
            finish(&guard, Err(failure));
            return;
        }
    };
    let segments = match preprocess::prepare_with(
        &document.bytes,
        document.format,
        &shared.config.segmenter,
    ) {
        Ok(segments) => segments,
        Err(err) => {
            warn!(error = %err, "document could not be prepared");
            let failure = TaskFailure::new(FailureKind::DocumentUnreadable, err.reason);
            finish(&guard, Err(failure));
            return;
        }
    };
    debug!(segments = segments.len(), "document prepared");

    match shared.orchestrator.run(&segments, &spec, &guard).await {
        Orchestration::Accepted(AcceptedOutput {
            raw,
            report,
            confidence,
            degraded,
            severity_scale,
        }) => {
            let result = shared.extractor.assemble(
                report,
                &segments,
                &spec,
                Provenance {
                    provider: &raw.provider,
                    severity_scale,
                    confidence,
                    degraded,
                },
            );
            finish(&guard, Ok(result));
        }
        Orchestration::Exhausted(attempts) => {
            let message = if attempts.is_empty() {
                format!(
                    "no provider offers the `{}` capability",
                    spec.analysis_type.required_capability()
                )
            } else {
                format!("all {} provider attempts failed", attempts.len())
            };
            let failure = TaskFailure::new(FailureKind::AllProvidersExhausted, message)
                .with_attempts(attempts);
            finish(&guard, Err(failure));
        }
        Orchestration::Cancelled => {
            if guard.cancelled().is_err() {
                debug!("task finished before cancellation was applied");
            }
        }
    }
}

fn finish(guard: &ProcessingGuard, outcome: Result<crate::extract::AnalysisResult, TaskFailure>) {
    let written = match outcome {
        Ok(result) => guard.complete(result),
        Err(failure) => guard.fail(failure),
    };
    // A sweeper timeout may have landed first; the registry already logged it.
    if let Err(err) = written {
        debug!(error = %err, "terminal write skipped");
    }
}

/// Enforce the task deadline and, when configured, retention.
pub(crate) async fn run_sweeper(shared: Arc<Shared>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let expired = shared.registry.sweep_expired(shared.config.task_deadline);
                if !expired.is_empty() {
                    info!(count = expired.len(), "sweeper failed overdue tasks");
                }
                if let Some(retention) = shared.config.retention {
                    shared.registry.purge_terminal(retention);
                }
            }
        }
    }
    debug!("sweeper stopped");
}
