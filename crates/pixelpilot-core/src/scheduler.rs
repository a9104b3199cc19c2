//! The polling control loop.
//!
//! A run walks the graph one frontier at a time. The frontier starts as the
//! entry node; every cycle the scheduler attempts each live candidate whose
//! rate limit has elapsed, in listed order, and the first success acts. After
//! acting the frontier becomes the node's enabled successors, or the run ends
//! when there are none.
//!
//! ```text
//! Idle -> Polling -> Acting -> Polling | Succeeded
//!            |          |
//!            +----------+--> Failed | Aborted
//! ```
//!
//! Timing is cooperative: each candidate gets at least one attempt, and stops
//! being polled once its own `timeout` (measured from frontier activation) has
//! elapsed. Sleeps between cycles, delays, holds and injector calls all yield
//! to an abort request.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::action::{ActionError, ActionExecutor, InputInjector};
use crate::error::ConfigError;
use crate::frame::{CaptureProvider, Frame};
use crate::pipeline::{PipelineGraph, PipelineNode};
use crate::recognition::{recognize_frame, RecognitionResult};

/// Shortest pause between cycles, so a zero `rate_limit` does not spin.
const MIN_CYCLE_INTERVAL: Duration = Duration::from_millis(5);

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("{error}")]
    Config { error: ConfigError },

    #[error("node '{node}' was not recognized within {timeout_ms} ms")]
    RecognitionTimeout { node: String, timeout_ms: u64 },

    #[error("node '{node}': {action} failed: {message}")]
    ActionExecution {
        node: String,
        action: String,
        message: String,
    },

    #[error("node '{node}': capture failed: {message}")]
    Capture { node: String, message: String },
}

impl From<ConfigError> for FailureReason {
    fn from(error: ConfigError) -> Self {
        FailureReason::Config { error }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed { reason: FailureReason },
    Aborted { node: String },
}

impl RunStatus {
    fn failed(reason: impl Into<FailureReason>) -> Self {
        RunStatus::Failed {
            reason: reason.into(),
        }
    }
}

/// A node that was recognized and acted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub attempts: u32,
    /// From frontier activation until recognition succeeded.
    pub elapsed_ms: u64,
}

/// What a run did and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: RunStatus,
    pub entry: String,
    pub visited: Vec<NodeRecord>,
    /// The node that was being polled or acting when the run ended.
    pub last_node: Option<String>,
    pub last_recognition: Option<RecognitionResult>,
    pub elapsed_ms: u64,
}

impl Outcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded)
    }

    #[must_use]
    pub fn visited_names(&self) -> Vec<&str> {
        self.visited.iter().map(|r| r.name.as_str()).collect()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `entry` to completion without a way to abort.
pub async fn run(
    graph: Arc<PipelineGraph>,
    entry: &str,
    capture: Arc<dyn CaptureProvider>,
    injector: Arc<dyn InputInjector>,
) -> Outcome {
    Scheduler::new(graph)
        .run_with_abort(entry, capture, injector, AbortSignal::never())
        .await
}

/// Executes runs over a shared, immutable graph.
#[derive(Debug, Clone)]
pub struct Scheduler {
    graph: Arc<PipelineGraph>,
}

/// Mutable state owned by one run.
#[derive(Default)]
struct RunState {
    visited: Vec<NodeRecord>,
    last_node: Option<String>,
    last_recognition: Option<RecognitionResult>,
}

impl RunState {
    fn aborted(&self) -> RunStatus {
        RunStatus::Aborted {
            node: self.last_node.clone().unwrap_or_default(),
        }
    }
}

/// A frontier member being polled.
struct Candidate<'g> {
    node: &'g PipelineNode,
    activated: Instant,
    last_attempt: Option<Instant>,
    attempts: u32,
    expired: bool,
}

impl Candidate<'_> {
    fn due_at(&self) -> Option<Instant> {
        self.last_attempt.map(|t| t + self.node.rate_limit)
    }

    fn deadline(&self) -> Instant {
        self.activated + self.node.timeout
    }

    fn is_due(&self, now: Instant) -> bool {
        self.due_at().map_or(true, |due| now >= due)
    }
}

/// The frame of one poll cycle, captured on first use.
struct CycleFrame<'a> {
    capture: &'a dyn CaptureProvider,
    frame: OnceCell<Frame>,
}

impl<'a> CycleFrame<'a> {
    fn new(capture: &'a dyn CaptureProvider) -> Self {
        Self {
            capture,
            frame: OnceCell::new(),
        }
    }

    async fn get(&self) -> anyhow::Result<Frame> {
        self.frame
            .get_or_try_init(|| self.capture.capture())
            .await
            .cloned()
    }
}

impl Scheduler {
    #[must_use]
    pub fn new(graph: Arc<PipelineGraph>) -> Self {
        Self { graph }
    }

    #[must_use]
    pub fn graph(&self) -> &Arc<PipelineGraph> {
        &self.graph
    }

    pub async fn run_with_abort(
        &self,
        entry: &str,
        capture: Arc<dyn CaptureProvider>,
        injector: Arc<dyn InputInjector>,
        abort: AbortSignal,
    ) -> Outcome {
        let started = Instant::now();
        let mut state = RunState::default();
        let status = self
            .drive(entry, capture.as_ref(), injector, &abort, &mut state)
            .await;
        let elapsed_ms = millis(started.elapsed());

        match &status {
            RunStatus::Succeeded => info!(entry, elapsed_ms, "Run succeeded"),
            RunStatus::Failed { reason } => warn!(entry, elapsed_ms, %reason, "Run failed"),
            RunStatus::Aborted { node } => info!(entry, elapsed_ms, node = %node, "Run aborted"),
        }

        Outcome {
            status,
            entry: entry.to_string(),
            visited: state.visited,
            last_node: state.last_node,
            last_recognition: state.last_recognition,
            elapsed_ms,
        }
    }

    async fn drive(
        &self,
        entry: &str,
        capture: &dyn CaptureProvider,
        injector: Arc<dyn InputInjector>,
        abort: &AbortSignal,
        state: &mut RunState,
    ) -> RunStatus {
        if !self.graph.contains(entry) {
            return RunStatus::failed(ConfigError::UnknownEntry {
                node: entry.to_string(),
            });
        }
        info!(entry, nodes = self.graph.len(), "Run started");

        let executor = ActionExecutor::new(injector, abort.clone());
        let mut frontier = vec![entry.to_string()];

        loop {
            let (node, result, record) = match self.poll(&frontier, capture, abort, state).await {
                Ok(hit) => hit,
                Err(status) => return status,
            };
            state.last_node = Some(node.name.clone());
            info!(
                node = %node.name,
                algorithm = %result.algorithm,
                score = result.score,
                attempts = record.attempts,
                "Node recognized"
            );

            if abort.sleep(node.pre_delay).await.is_err() {
                return state.aborted();
            }
            match executor.execute(node, &result).await {
                Ok(()) => {}
                Err(ActionError::Aborted(_)) => return state.aborted(),
                Err(ActionError::Failed(message)) => {
                    return RunStatus::failed(FailureReason::ActionExecution {
                        node: node.name.clone(),
                        action: node.action.name().to_string(),
                        message,
                    })
                }
            }
            state.visited.push(record);
            if abort.sleep(node.post_delay).await.is_err() {
                return state.aborted();
            }

            if node.is_terminal() {
                return RunStatus::Succeeded;
            }
            frontier = node
                .successors
                .iter()
                .filter(|name| self.graph.get(name).is_some_and(|n| n.enabled))
                .cloned()
                .collect();
            if frontier.is_empty() {
                return RunStatus::failed(ConfigError::NoViableSuccessor {
                    node: node.name.clone(),
                });
            }
            debug!(from = %node.name, frontier = ?frontier, "Transition");
        }
    }

    /// Poll a frontier until one candidate is recognized.
    async fn poll(
        &self,
        frontier: &[String],
        capture: &dyn CaptureProvider,
        abort: &AbortSignal,
        state: &mut RunState,
    ) -> Result<(&PipelineNode, RecognitionResult, NodeRecord), RunStatus> {
        let activated = Instant::now();
        let mut candidates: Vec<Candidate<'_>> = frontier
            .iter()
            .filter_map(|name| self.graph.get(name))
            .map(|node| Candidate {
                node,
                activated,
                last_attempt: None,
                attempts: 0,
                expired: false,
            })
            .collect();

        loop {
            if let Some(first) = candidates.iter().find(|c| !c.expired) {
                state.last_node = Some(first.node.name.clone());
            }
            if abort.is_aborted() {
                return Err(state.aborted());
            }

            let cycle = CycleFrame::new(capture);
            let now = Instant::now();
            for candidate in candidates.iter_mut() {
                if candidate.expired || !candidate.is_due(now) {
                    continue;
                }
                // Stamped when this attempt starts; earlier candidates in the
                // cycle may have taken a while.
                candidate.last_attempt = Some(Instant::now());
                candidate.attempts += 1;

                let node = candidate.node;
                let result = match self.evaluate(node, &cycle).await {
                    Ok(result) => result,
                    Err(e) => {
                        state.last_node = Some(node.name.clone());
                        return Err(RunStatus::failed(FailureReason::Capture {
                            node: node.name.clone(),
                            message: format!("{:#}", e),
                        }));
                    }
                };
                debug!(
                    node = %node.name,
                    attempt = candidate.attempts,
                    success = result.success,
                    score = result.score,
                    "Recognition attempt"
                );
                let success = result.success;
                state.last_recognition = Some(result.clone());
                if success {
                    let record = NodeRecord {
                        name: node.name.clone(),
                        attempts: candidate.attempts,
                        elapsed_ms: millis(activated.elapsed()),
                    };
                    return Ok((node, result, record));
                }
            }

            let now = Instant::now();
            let mut last_expired = None;
            for candidate in candidates.iter_mut() {
                if !candidate.expired && candidate.attempts > 0 && now >= candidate.deadline() {
                    candidate.expired = true;
                    debug!(node = %candidate.node.name, attempts = candidate.attempts, "Candidate timed out");
                    last_expired = Some(candidate.node);
                }
            }
            let live: Vec<&Candidate<'_>> = candidates.iter().filter(|c| !c.expired).collect();
            if live.is_empty() {
                let node = last_expired
                    .or_else(|| candidates.last().map(|c| c.node))
                    .map(|n| (n.name.clone(), millis(n.timeout)))
                    .unwrap_or_default();
                state.last_node = Some(node.0.clone());
                return Err(RunStatus::failed(FailureReason::RecognitionTimeout {
                    node: node.0,
                    timeout_ms: node.1,
                }));
            }

            let wake = live
                .iter()
                .map(|c| match c.due_at() {
                    Some(due) => due.min(c.deadline()),
                    None => now,
                })
                .min()
                .unwrap_or(now)
                .max(now + MIN_CYCLE_INTERVAL);
            if abort.sleep_until(wake).await.is_err() {
                return Err(state.aborted());
            }
        }
    }

    /// Recognize one node, inversion applied.
    async fn evaluate(
        &self,
        node: &PipelineNode,
        cycle: &CycleFrame<'_>,
    ) -> anyhow::Result<RecognitionResult> {
        if !node.recognition.needs_frame() {
            let result = RecognitionResult::direct_hit(node.roi);
            return Ok(if node.inverse {
                result.invert(node.roi)
            } else {
                result
            });
        }

        let frame = cycle.get().await?;
        let bounds = frame.bounds();
        let owned = node.clone();
        let result = tokio::task::spawn_blocking(move || recognize_frame(&owned, &frame))
            .await
            .unwrap_or_else(|e| std::panic::resume_unwind(e.into_panic()));
        Ok(if node.inverse {
            result.invert(Some(node.roi.unwrap_or(bounds)))
        } else {
            result
        })
    }
}
