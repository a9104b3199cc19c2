//! Registries for submitted pipelines and the runs started from them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use pixelpilot_core::abort::{abort_pair, AbortHandle};
use pixelpilot_core::action::InputInjector;
use pixelpilot_core::error::{ApiError, ConfigError};
use pixelpilot_core::frame::CaptureProvider;
use pixelpilot_core::pipeline::PipelineGraph;
use pixelpilot_core::protocol::{PipelineInfo, RunInfo, RunPhase};
use pixelpilot_core::{Outcome, RunStatus, Scheduler};

/// Maximum number of stored pipelines.
const MAX_PIPELINES: usize = 100;

/// Maximum number of runs in flight at once.
const MAX_ACTIVE_RUNS: usize = 32;

/// Finished runs kept for `run_status`; the oldest are forgotten first.
const MAX_FINISHED_RUNS: usize = 256;

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A validated graph kept for later runs.
struct StoredPipeline {
    id: String,
    name: Option<String>,
    graph: Arc<PipelineGraph>,
    submitted_at: DateTime<Utc>,
}

impl StoredPipeline {
    fn info(&self) -> PipelineInfo {
        PipelineInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            nodes: self.graph.len(),
            resource_base: self.graph.resource_base().display().to_string(),
            submitted_at: self.submitted_at.to_rfc3339(),
        }
    }
}

/// Submitted pipelines, keyed by id.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, StoredPipeline>>,
}

impl PipelineRegistry {
    /// Store a graph and return its id.
    pub async fn insert(
        &self,
        graph: PipelineGraph,
        name: Option<String>,
    ) -> Result<String, ApiError> {
        let mut pipelines = self.pipelines.write().await;
        if pipelines.len() >= MAX_PIPELINES {
            return Err(ApiError::pipeline_limit_reached(MAX_PIPELINES));
        }
        let id = new_id();
        info!(pipeline = %id, nodes = graph.len(), "Pipeline submitted");
        pipelines.insert(
            id.clone(),
            StoredPipeline {
                id: id.clone(),
                name,
                graph: Arc::new(graph),
                submitted_at: Utc::now(),
            },
        );
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<PipelineGraph>, ApiError> {
        let pipelines = self.pipelines.read().await;
        pipelines
            .get(id)
            .map(|p| Arc::clone(&p.graph))
            .ok_or_else(|| ApiError::pipeline_not_found(id))
    }

    /// All pipelines, oldest first.
    pub async fn list(&self) -> Vec<PipelineInfo> {
        let pipelines = self.pipelines.read().await;
        let mut stored: Vec<_> = pipelines.values().collect();
        stored.sort_by_key(|p| p.submitted_at);
        stored.into_iter().map(StoredPipeline::info).collect()
    }
}

/// Published once by the run task when the scheduler returns.
#[derive(Debug, Clone)]
struct Finished {
    phase: RunPhase,
    outcome: Option<Outcome>,
    at: DateTime<Utc>,
}

impl Finished {
    fn from_outcome(outcome: Outcome) -> Self {
        let phase = match outcome.status {
            RunStatus::Succeeded => RunPhase::Succeeded,
            RunStatus::Failed { .. } => RunPhase::Failed,
            RunStatus::Aborted { .. } => RunPhase::Aborted,
        };
        Self {
            phase,
            outcome: Some(outcome),
            at: Utc::now(),
        }
    }
}

struct Run {
    id: String,
    pipeline_id: String,
    entry: String,
    started_at: DateTime<Utc>,
    abort: AbortHandle,
    finished: watch::Receiver<Option<Finished>>,
}

impl Run {
    fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }

    fn info(&self) -> RunInfo {
        let finished = self.finished.borrow().clone();
        RunInfo {
            id: self.id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            entry: self.entry.clone(),
            phase: finished.as_ref().map_or(RunPhase::Running, |f| f.phase),
            started_at: self.started_at.to_rfc3339(),
            finished_at: finished.as_ref().map(|f| f.at.to_rfc3339()),
            outcome: finished.and_then(|f| f.outcome),
        }
    }
}

/// Runs in flight and recently finished.
///
/// Each run is a tokio task owning its scheduler state; the manager only
/// keeps the abort handle and a receiver for the final outcome.
#[derive(Default)]
pub struct RunManager {
    runs: RwLock<HashMap<String, Run>>,
}

impl RunManager {
    /// Start `entry` of `graph` on a background task and return the run id.
    pub async fn start(
        &self,
        pipeline_id: &str,
        graph: Arc<PipelineGraph>,
        entry: &str,
        capture: Arc<dyn CaptureProvider>,
        injector: Arc<dyn InputInjector>,
    ) -> Result<String, ApiError> {
        if !graph.contains(entry) {
            return Err(ApiError::invalid_pipeline(&ConfigError::UnknownEntry {
                node: entry.to_string(),
            }));
        }

        let mut runs = self.runs.write().await;
        let active = runs.values().filter(|r| !r.is_finished()).count();
        if active >= MAX_ACTIVE_RUNS {
            return Err(ApiError::run_limit_reached(MAX_ACTIVE_RUNS));
        }
        evict_finished(&mut runs);

        let id = new_id();
        let (handle, signal) = abort_pair();
        let (tx, rx) = watch::channel(None);

        let scheduler = Scheduler::new(graph);
        let entry_name = entry.to_string();
        let run_id = id.clone();
        let task = tokio::spawn(async move {
            scheduler
                .run_with_abort(&entry_name, capture, injector, signal)
                .await
        });
        tokio::spawn(async move {
            let finished = match task.await {
                Ok(outcome) => {
                    info!(run = %run_id, status = ?outcome.status, "Run finished");
                    Finished::from_outcome(outcome)
                }
                Err(e) => {
                    warn!(run = %run_id, "Run task died: {}", e);
                    Finished {
                        phase: RunPhase::Failed,
                        outcome: None,
                        at: Utc::now(),
                    }
                }
            };
            let _ = tx.send(Some(finished));
        });

        info!(run = %id, pipeline = %pipeline_id, entry = %entry, "Run started");
        runs.insert(
            id.clone(),
            Run {
                id: id.clone(),
                pipeline_id: pipeline_id.to_string(),
                entry: entry.to_string(),
                started_at: Utc::now(),
                abort: handle,
                finished: rx,
            },
        );
        Ok(id)
    }

    pub async fn status(&self, id: &str) -> Result<RunInfo, ApiError> {
        let runs = self.runs.read().await;
        runs.get(id)
            .map(Run::info)
            .ok_or_else(|| ApiError::run_not_found(id))
    }

    /// Wait for a run to finish. Returns whether it did and its latest state.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<(bool, RunInfo), ApiError> {
        // Clone the receiver so the lock is not held while waiting.
        let mut finished = {
            let runs = self.runs.read().await;
            let run = runs.get(id).ok_or_else(|| ApiError::run_not_found(id))?;
            run.finished.clone()
        };
        let done = matches!(
            tokio::time::timeout(timeout, finished.wait_for(Option::is_some)).await,
            Ok(Ok(_))
        );
        let info = self.status(id).await?;
        Ok((done && info.phase.is_finished(), info))
    }

    /// Request cancellation. Aborting a finished run is a no-op.
    pub async fn abort(&self, id: &str) -> Result<RunInfo, ApiError> {
        let runs = self.runs.read().await;
        let run = runs.get(id).ok_or_else(|| ApiError::run_not_found(id))?;
        if !run.is_finished() {
            info!(run = %id, "Abort requested");
            run.abort.abort();
        }
        Ok(run.info())
    }

    pub async fn abort_all(&self) {
        let runs = self.runs.read().await;
        for run in runs.values().filter(|r| !r.is_finished()) {
            run.abort.abort();
        }
    }

    /// All runs, oldest first.
    pub async fn list(&self) -> Vec<RunInfo> {
        let runs = self.runs.read().await;
        let mut all: Vec<_> = runs.values().collect();
        all.sort_by_key(|r| r.started_at);
        all.into_iter().map(Run::info).collect()
    }

    #[cfg(test)]
    pub async fn run_count(&self) -> usize {
        self.runs.read().await.len()
    }
}

fn evict_finished(runs: &mut HashMap<String, Run>) {
    let mut finished: Vec<(DateTime<Utc>, String)> = runs
        .values()
        .filter(|r| r.is_finished())
        .map(|r| (r.started_at, r.id.clone()))
        .collect();
    if finished.len() < MAX_FINISHED_RUNS {
        return;
    }
    finished.sort();
    let excess = finished.len() + 1 - MAX_FINISHED_RUNS;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}
