//! Recognition engine.
//!
//! Every strategy reduces to the same shape: a list of passing candidates
//! (rectangle plus score) that is de-duplicated, ordered by the node's
//! `order_by` and indexed by its `index`. The winner, if any, is what actions
//! aim at.
//!
//! Matching is CPU-bound and synchronous ([`recognize_frame`]); the
//! scheduler runs it on the blocking pool. [`recognize`] is the convenience
//! entry point that captures a frame itself.

mod color;
mod feature;
mod template;

use std::cmp::Ordering;
use std::time::Instant;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::{CaptureProvider, Frame};
use crate::geometry::Rect;
use crate::pipeline::{OrderBy, PipelineNode, Recognition};

/// Passing candidates kept per template before the cross-template merge.
pub const MAX_CANDIDATES_PER_TEMPLATE: usize = 50;
/// IoU above which two candidates of the same template are duplicates.
pub const TEMPLATE_NMS_IOU: f64 = 0.7;
/// IoU above which candidates of different templates are duplicates.
pub const MERGE_NMS_IOU: f64 = 0.5;

/// One located match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub rect: Rect,
    pub score: f64,
}

impl MatchCandidate {
    #[must_use]
    pub fn new(rect: Rect, score: f64) -> Self {
        Self { rect, score }
    }
}

/// Uniform result of every recognition strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub algorithm: String,
    pub success: bool,
    /// The candidate selected by `order_by` and `index`.
    pub best: Option<MatchCandidate>,
    /// Best raw score seen, reported even when nothing passed.
    pub score: f64,
    /// Every passing candidate, in `order_by` order.
    pub candidates: Vec<MatchCandidate>,
    pub elapsed_ms: u64,
}

impl RecognitionResult {
    pub(crate) fn direct_hit(roi: Option<Rect>) -> Self {
        let best = roi.map(|r| MatchCandidate::new(r, 1.0));
        Self {
            algorithm: "DirectHit".to_string(),
            success: true,
            best,
            score: 1.0,
            candidates: best.into_iter().collect(),
            elapsed_ms: 0,
        }
    }

    fn failed(algorithm: &str, score: f64, started: Instant) -> Self {
        Self {
            algorithm: algorithm.to_string(),
            success: false,
            best: None,
            score,
            candidates: Vec::new(),
            elapsed_ms: elapsed_ms(started),
        }
    }

    /// Pick the winner from already ordered candidates.
    fn select(
        algorithm: &str,
        candidates: Vec<MatchCandidate>,
        index: i32,
        score: f64,
        started: Instant,
    ) -> Self {
        let best = pick(&candidates, index);
        Self {
            algorithm: algorithm.to_string(),
            success: best.is_some(),
            best,
            score,
            candidates,
            elapsed_ms: elapsed_ms(started),
        }
    }

    /// Flip success for nodes that fire when something is absent.
    ///
    /// A success produced by inversion has no match of its own; its
    /// rectangle is `region` (the node's ROI, or the frame bounds).
    #[must_use]
    pub fn invert(self, region: Option<Rect>) -> Self {
        if self.success {
            Self {
                success: false,
                best: None,
                candidates: Vec::new(),
                ..self
            }
        } else {
            let best = region.map(|r| MatchCandidate::new(r, self.score));
            Self {
                success: true,
                best,
                candidates: best.into_iter().collect(),
                ..self
            }
        }
    }

    /// The rectangle actions aim at when their target is the recognized region.
    #[must_use]
    pub fn rect(&self) -> Option<Rect> {
        self.best.map(|c| c.rect)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Evaluate a node's recognition against a frame. Pure and deterministic.
///
/// Inversion is not applied here; see [`RecognitionResult::invert`].
#[must_use]
pub fn recognize_frame(node: &PipelineNode, frame: &Frame) -> RecognitionResult {
    let started = Instant::now();
    if let Recognition::DirectHit = node.recognition {
        return RecognitionResult::direct_hit(node.roi);
    }
    let Some(region) = frame.region(node.roi) else {
        tracing::debug!(node = %node.name, roi = ?node.roi, "ROI lies outside the frame");
        return RecognitionResult::failed(node.recognition.name(), 0.0, started);
    };
    match &node.recognition {
        Recognition::DirectHit => RecognitionResult::direct_hit(node.roi),
        Recognition::TemplateMatch(params) => template::recognize(params, frame, region, started),
        Recognition::FeatureMatch(params) => feature::recognize(params, frame, region, started),
        Recognition::ColorMatch(params) => color::recognize(params, frame, region, started),
    }
}

/// Evaluate a node, capturing a frame only when the strategy needs one.
pub async fn recognize(
    node: &PipelineNode,
    capture: &dyn CaptureProvider,
) -> Result<RecognitionResult> {
    if !node.recognition.needs_frame() {
        return Ok(RecognitionResult::direct_hit(node.roi));
    }
    let frame = capture.capture().await?;
    Ok(recognize_frame(node, &frame))
}

// ============================================================================
// Candidate reduction
// ============================================================================

/// Best score first; ties broken top-to-bottom, left-to-right.
fn by_score(a: &MatchCandidate, b: &MatchCandidate, higher_is_better: bool) -> Ordering {
    let by = if higher_is_better {
        b.score.total_cmp(&a.score)
    } else {
        a.score.total_cmp(&b.score)
    };
    by.then(a.rect.y.cmp(&b.rect.y))
        .then(a.rect.x.cmp(&b.rect.x))
}

/// Greedy non-maximum suppression, best first. Keeps at most `cap`.
pub(crate) fn suppress(
    mut candidates: Vec<MatchCandidate>,
    iou: f64,
    higher_is_better: bool,
    cap: usize,
) -> Vec<MatchCandidate> {
    candidates.sort_by(|a, b| by_score(a, b, higher_is_better));
    let mut kept: Vec<MatchCandidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= cap {
            break;
        }
        if kept.iter().all(|k| k.rect.iou(&candidate.rect) <= iou) {
            kept.push(candidate);
        }
    }
    kept
}

pub(crate) fn order(candidates: &mut [MatchCandidate], order_by: OrderBy, higher_is_better: bool) {
    candidates.sort_by(|a, b| match order_by {
        OrderBy::Score => by_score(a, b, higher_is_better),
        OrderBy::Horizontal => a
            .rect
            .x
            .cmp(&b.rect.x)
            .then(a.rect.y.cmp(&b.rect.y))
            .then_with(|| by_score(a, b, higher_is_better)),
        OrderBy::Vertical => a
            .rect
            .y
            .cmp(&b.rect.y)
            .then(a.rect.x.cmp(&b.rect.x))
            .then_with(|| by_score(a, b, higher_is_better)),
        OrderBy::Area => b
            .rect
            .area()
            .cmp(&a.rect.area())
            .then_with(|| by_score(a, b, higher_is_better)),
    });
}

/// `index` counts from the front, or from the back when negative.
pub(crate) fn pick(candidates: &[MatchCandidate], index: i32) -> Option<MatchCandidate> {
    let len = candidates.len() as i64;
    let i = i64::from(index);
    let i = if i < 0 { len + i } else { i };
    if (0..len).contains(&i) {
        Some(candidates[i as usize])
    } else {
        None
    }
}
