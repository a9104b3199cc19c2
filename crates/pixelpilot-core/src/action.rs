//! Action execution: target resolution and synthetic input.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::abort::{AbortSignal, Aborted};
use crate::geometry::{Point, Rect};
use crate::pipeline::{Action, PipelineNode, Target};
use crate::recognition::RecognitionResult;

/// Synthetic input into the target application.
///
/// Hold and wait durations are realized by the executor with cancellable
/// sleeps, so implementations only need the primitive operations.
#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn click(&self, at: Point) -> Result<()>;
    async fn press(&self, at: Point) -> Result<()>;
    async fn release(&self, at: Point) -> Result<()>;
    async fn drag(&self, from: Point, to: Point, duration: Duration) -> Result<()>;
    async fn type_text(&self, text: &str) -> Result<()>;
}

/// One injector call, as recorded by [`RecordingInjector`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InputEvent {
    Click { at: Point },
    Press { at: Point },
    Release { at: Point },
    Drag { from: Point, to: Point, duration_ms: u64 },
    TypeText { text: String },
}

/// Injector that only records and logs what it was asked to do.
///
/// Backs dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingInjector {
    events: Mutex<Vec<InputEvent>>,
}

impl RecordingInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<InputEvent> {
        self.events.lock().await.clone()
    }

    async fn record(&self, event: InputEvent) -> Result<()> {
        info!(event = ?event, "Input");
        self.events.lock().await.push(event);
        Ok(())
    }
}

#[async_trait]
impl InputInjector for RecordingInjector {
    async fn click(&self, at: Point) -> Result<()> {
        self.record(InputEvent::Click { at }).await
    }

    async fn press(&self, at: Point) -> Result<()> {
        self.record(InputEvent::Press { at }).await
    }

    async fn release(&self, at: Point) -> Result<()> {
        self.record(InputEvent::Release { at }).await
    }

    async fn drag(&self, from: Point, to: Point, duration: Duration) -> Result<()> {
        self.record(InputEvent::Drag {
            from,
            to,
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        })
        .await
    }

    async fn type_text(&self, text: &str) -> Result<()> {
        self.record(InputEvent::TypeText {
            text: text.to_string(),
        })
        .await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error(transparent)]
    Aborted(#[from] Aborted),
    #[error("{0}")]
    Failed(String),
}

/// Resolve where an action lands.
///
/// The base rectangle is the recognized one, a fixed rectangle, or a
/// zero-sized rectangle on a fixed point; `offset` moves its edges and the
/// center is taken.
#[must_use]
pub fn resolve_target(target: Target, offset: [i32; 4], recognized: Option<Rect>) -> Option<Point> {
    let rect = match target {
        Target::Recognized => recognized?,
        Target::Point(p) => Rect::at_point(p),
        Target::Region(r) => r,
    };
    Some(rect.adjust_edges(offset).center())
}

/// Drives an injector for one run.
#[derive(Clone)]
pub struct ActionExecutor {
    injector: Arc<dyn InputInjector>,
    abort: AbortSignal,
}

impl ActionExecutor {
    pub fn new(injector: Arc<dyn InputInjector>, abort: AbortSignal) -> Self {
        Self { injector, abort }
    }

    pub async fn execute(
        &self,
        node: &PipelineNode,
        result: &RecognitionResult,
    ) -> Result<(), ActionError> {
        let recognized = result.rect();
        let aim = |target: Target, offset: [i32; 4]| {
            resolve_target(target, offset, recognized).ok_or_else(|| {
                ActionError::Failed("no recognized region to aim at".to_string())
            })
        };

        match &node.action {
            Action::DoNothing => Ok(()),
            Action::Wait { duration } => Ok(self.abort.sleep(*duration).await?),
            Action::Click { target, offset } => {
                let at = aim(*target, *offset)?;
                debug!(node = %node.name, x = at.x, y = at.y, "Click");
                self.call(self.injector.click(at)).await
            }
            Action::LongPress {
                target,
                offset,
                duration,
            } => {
                let at = aim(*target, *offset)?;
                debug!(node = %node.name, x = at.x, y = at.y, hold_ms = duration.as_millis() as u64, "Long press");
                self.call(self.injector.press(at)).await?;
                let held = self.abort.sleep(*duration).await;
                // The button must not stay down, aborted or not.
                let released = self.injector.release(at).await;
                held?;
                released.map_err(|e| ActionError::Failed(format!("{:#}", e)))
            }
            Action::Swipe {
                begin,
                begin_offset,
                end,
                duration,
            } => {
                let from = aim(*begin, *begin_offset)?;
                debug!(node = %node.name, ?from, to = ?end, "Swipe");
                self.call(self.injector.drag(from, *end, *duration)).await
            }
            Action::InputText { text } => {
                debug!(node = %node.name, chars = text.chars().count(), "Input text");
                self.call(self.injector.type_text(text)).await
            }
        }
    }

    async fn call(
        &self,
        op: impl std::future::Future<Output = Result<()>>,
    ) -> Result<(), ActionError> {
        self.abort
            .guard(op)
            .await?
            .map_err(|e| ActionError::Failed(format!("{:#}", e)))
    }
}
