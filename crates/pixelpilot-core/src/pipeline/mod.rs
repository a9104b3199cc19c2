//! Pipeline graph: immutable nodes, closed recognition/action variants.
//!
//! A pipeline document is a JSON object of node name to node. The loader in
//! [`loader`] validates it completely (fields, successor references, template
//! images) and produces a [`PipelineGraph`], which is read-only from then on
//! and can be shared across concurrent runs behind an `Arc`.
//!
//! # Example document
//!
//! ```json
//! {
//!     "$resource_base": "images",
//!     "start":     { "recognition": "DirectHit", "action": "DoNothing", "next": ["pick_tool"] },
//!     "pick_tool": { "recognition": "TemplateMatch", "template": "tool.png",
//!                    "action": "Click", "next": ["place"] },
//!     "place":     { "recognition": "DirectHit", "action": "Click", "target": [600, 300] }
//! }
//! ```

pub mod loader;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::geometry::{Point, Rect};

pub use loader::{submit_pipeline, LoadOptions};

/// Keys starting with this character are annotations, not node fields.
pub const ANNOTATION_MARKER: char = '$';

/// Top-level annotation key declaring where template images live.
pub const RESOURCE_BASE_KEY: &str = "$resource_base";

// ============================================================================
// Recognition
// ============================================================================

/// A decoded template image together with the path it was loaded from.
#[derive(Clone)]
pub struct TemplateImage {
    pub path: PathBuf,
    pub image: Arc<RgbImage>,
}

impl fmt::Debug for TemplateImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateImage")
            .field("path", &self.path)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .finish()
    }
}

/// Scoring metric for template matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchMethod {
    /// Normalized correlation coefficient in `-1.0..=1.0`; higher is better.
    #[default]
    CcoeffNormed,
    /// Normalized squared difference, `0.0` is a perfect match; lower is better.
    SqdiffNormed,
}

impl MatchMethod {
    #[must_use]
    pub fn higher_is_better(self) -> bool {
        matches!(self, MatchMethod::CcoeffNormed)
    }

    /// Whether `score` clears `threshold` under this metric's polarity.
    #[must_use]
    pub fn accepts(self, score: f64, threshold: f64) -> bool {
        if self.higher_is_better() {
            score >= threshold
        } else {
            score <= threshold
        }
    }

    /// True when `a` is a strictly better score than `b`.
    #[must_use]
    pub fn better(self, a: f64, b: f64) -> bool {
        if self.higher_is_better() {
            a > b
        } else {
            a < b
        }
    }
}

/// How candidates that all pass recognition are ordered before `index`
/// picks one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OrderBy {
    /// Best score first.
    #[default]
    Score,
    /// Leftmost first, then topmost, then best score.
    Horizontal,
    /// Topmost first, then leftmost, then best score.
    Vertical,
    /// Largest area first.
    Area,
}

#[derive(Debug, Clone)]
pub struct TemplateMatchParams {
    pub templates: Vec<TemplateImage>,
    /// One threshold shared by all templates, or one per template.
    pub thresholds: Vec<f64>,
    pub method: MatchMethod,
    pub multi_scale: bool,
    pub scale_range: (f64, f64),
    pub scale_step: f64,
    pub green_mask: bool,
    pub order_by: OrderBy,
    pub index: i32,
}

impl TemplateMatchParams {
    #[must_use]
    pub fn threshold_for(&self, template_index: usize) -> f64 {
        self.thresholds
            .get(template_index)
            .or_else(|| self.thresholds.last())
            .copied()
            .unwrap_or(loader::DEFAULT_THRESHOLD)
    }

    /// The scales to try, ascending. Always contains at least one entry.
    #[must_use]
    pub fn scales(&self) -> Vec<f64> {
        if !self.multi_scale {
            return vec![1.0];
        }
        let (min, max) = self.scale_range;
        // Integer stepping avoids accumulating float error across the range.
        let steps = ((max - min) / self.scale_step + 1e-9).floor() as usize;
        let steps = steps.min(loader::MAX_SCALE_STEPS);
        (0..=steps)
            .map(|i| min + i as f64 * self.scale_step)
            .collect()
    }
}

/// Keypoint detector family.
///
/// `Orb`, `Brisk` and `Akaze` produce binary descriptors compared by Hamming
/// distance; `Sift` and `Kaze` produce float patch descriptors compared by
/// Euclidean distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Detector {
    Sift,
    Orb,
    Brisk,
    Kaze,
    #[default]
    Akaze,
}

impl Detector {
    #[must_use]
    pub fn binary_descriptors(self) -> bool {
        matches!(self, Detector::Orb | Detector::Brisk | Detector::Akaze)
    }
}

#[derive(Debug, Clone)]
pub struct FeatureMatchParams {
    pub templates: Vec<TemplateImage>,
    pub detector: Detector,
    pub ratio: f64,
    pub count: usize,
    pub green_mask: bool,
    pub order_by: OrderBy,
    pub index: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ColorSpace {
    #[default]
    Hsv,
    Rgb,
}

/// Inclusive per-channel bounds.
///
/// In HSV a hue bound with `lower > upper` wraps around 180, so reds can be
/// expressed as `[170, ..] .. [10, ..]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRange {
    pub lower: [u8; 3],
    pub upper: [u8; 3],
}

impl ColorRange {
    #[must_use]
    pub fn contains(&self, px: [u8; 3], space: ColorSpace) -> bool {
        let hue_wraps = space == ColorSpace::Hsv && self.lower[0] > self.upper[0];
        (0..3).all(|c| {
            if c == 0 && hue_wraps {
                px[0] >= self.lower[0] || px[0] <= self.upper[0]
            } else {
                px[c] >= self.lower[c] && px[c] <= self.upper[c]
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ColorMatchParams {
    pub ranges: Vec<ColorRange>,
    pub color_space: ColorSpace,
    pub count: usize,
    pub connected: bool,
    pub order_by: OrderBy,
    pub index: i32,
}

/// Recognition strategy for a node.
#[derive(Debug, Clone)]
pub enum Recognition {
    /// Always succeeds without looking at the screen.
    DirectHit,
    TemplateMatch(TemplateMatchParams),
    FeatureMatch(FeatureMatchParams),
    ColorMatch(ColorMatchParams),
}

impl Recognition {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Recognition::DirectHit => "DirectHit",
            Recognition::TemplateMatch(_) => "TemplateMatch",
            Recognition::FeatureMatch(_) => "FeatureMatch",
            Recognition::ColorMatch(_) => "ColorMatch",
        }
    }

    /// Whether evaluating this strategy needs a frame.
    #[must_use]
    pub fn needs_frame(&self) -> bool {
        !matches!(self, Recognition::DirectHit)
    }
}

// ============================================================================
// Action
// ============================================================================

/// Where an action is aimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    /// The rectangle produced by recognition.
    Recognized,
    /// A fixed point.
    Point(Point),
    /// A fixed rectangle; its center is used.
    Region(Rect),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    DoNothing,
    Click {
        target: Target,
        offset: [i32; 4],
    },
    LongPress {
        target: Target,
        offset: [i32; 4],
        duration: Duration,
    },
    Swipe {
        begin: Target,
        begin_offset: [i32; 4],
        end: Point,
        duration: Duration,
    },
    InputText {
        text: String,
    },
    Wait {
        duration: Duration,
    },
}

impl Action {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Action::DoNothing => "DoNothing",
            Action::Click { .. } => "Click",
            Action::LongPress { .. } => "LongPress",
            Action::Swipe { .. } => "Swipe",
            Action::InputText { .. } => "InputText",
            Action::Wait { .. } => "Wait",
        }
    }

    /// The target resolved from recognition, if this action aims at one.
    #[must_use]
    pub fn aims_at_recognized(&self) -> bool {
        matches!(
            self,
            Action::Click {
                target: Target::Recognized,
                ..
            } | Action::LongPress {
                target: Target::Recognized,
                ..
            } | Action::Swipe {
                begin: Target::Recognized,
                ..
            }
        )
    }
}

// ============================================================================
// Node and graph
// ============================================================================

#[derive(Debug, Clone)]
pub struct PipelineNode {
    pub name: String,
    pub recognition: Recognition,
    pub action: Action,
    /// Candidates polled after this node acts, in priority order.
    pub successors: Vec<String>,
    /// Search region; `None` is the whole frame.
    pub roi: Option<Rect>,
    pub timeout: Duration,
    pub rate_limit: Duration,
    pub pre_delay: Duration,
    pub post_delay: Duration,
    pub inverse: bool,
    pub enabled: bool,
}

impl PipelineNode {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.successors.is_empty()
    }
}

/// Short description of a node for listings and protocol responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub recognition: String,
    pub action: String,
    pub next: Vec<String>,
    pub enabled: bool,
}

/// Immutable arena of nodes keyed by name.
///
/// Successor lists hold names, so cycles (a node polling back to itself)
/// need no owning pointers.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: Vec<PipelineNode>,
    index: HashMap<String, usize>,
    resource_base: PathBuf,
}

impl PipelineGraph {
    pub(crate) fn from_parts(nodes: Vec<PipelineNode>, resource_base: PathBuf) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Self {
            nodes,
            index,
            resource_base,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PipelineNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in document order.
    pub fn nodes(&self) -> impl Iterator<Item = &PipelineNode> {
        self.nodes.iter()
    }

    /// Directory relative template paths were resolved against.
    #[must_use]
    pub fn resource_base(&self) -> &Path {
        &self.resource_base
    }

    /// Nodes no other node names as a successor; natural run entries.
    #[must_use]
    pub fn roots(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|candidate| {
                !self
                    .nodes
                    .iter()
                    .any(|n| n.successors.iter().any(|s| s == &candidate.name))
            })
            .map(|n| n.name.as_str())
            .collect()
    }

    #[must_use]
    pub fn summary(&self) -> Vec<NodeSummary> {
        self.nodes
            .iter()
            .map(|n| NodeSummary {
                name: n.name.clone(),
                recognition: n.recognition.name().to_string(),
                action: n.action.name().to_string(),
                next: n.successors.clone(),
                enabled: n.enabled,
            })
            .collect()
    }
}
