//! Pipeline document loader.
//!
//! Turns a JSON document into a [`PipelineGraph`], or a [`ConfigError`]
//! naming the offending node and field. Everything that can be checked
//! before touching the target application is checked here, including that
//! every template image exists and decodes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{
    Action, ColorMatchParams, ColorRange, ColorSpace, Detector, FeatureMatchParams, MatchMethod,
    OrderBy, PipelineGraph, PipelineNode, Recognition, Target, TemplateImage,
    TemplateMatchParams, ANNOTATION_MARKER, RESOURCE_BASE_KEY,
};
use crate::error::ConfigError;
use crate::geometry::{Point, Rect};

pub const DEFAULT_TIMEOUT_MS: u64 = 20_000;
pub const DEFAULT_RATE_LIMIT_MS: u64 = 1_000;
pub const DEFAULT_DELAY_MS: u64 = 200;
pub const DEFAULT_THRESHOLD: f64 = 0.2;
pub const DEFAULT_SCALE_RANGE: (f64, f64) = (0.5, 1.5);
pub const DEFAULT_SCALE_STEP: f64 = 0.1;
pub const DEFAULT_RATIO: f64 = 0.75;
pub const DEFAULT_FEATURE_COUNT: usize = 10;
pub const DEFAULT_COLOR_COUNT: usize = 1;
pub const DEFAULT_HOLD_MS: u64 = 1_000;
pub const DEFAULT_SWIPE_MS: u64 = 200;
pub const DEFAULT_WAIT_MS: u64 = 1_000;
/// Largest template scale a document may ask for.
pub const MAX_SCALE: f64 = 8.0;
/// Most scales a single template may be tried at.
pub const MAX_SCALE_STEPS: usize = 1_000;

/// Every field a node object may carry.
const KNOWN_FIELDS: &[&str] = &[
    "recognition",
    "action",
    "template",
    "threshold",
    "method",
    "multi_scale",
    "scale_range",
    "scale_step",
    "green_mask",
    "order_by",
    "index",
    "detector",
    "ratio",
    "count",
    "lower",
    "upper",
    "color_space",
    "connected",
    "target",
    "target_offset",
    "begin",
    "begin_offset",
    "end",
    "duration",
    "input_text",
    "roi",
    "next",
    "timeout",
    "rate_limit",
    "pre_delay",
    "post_delay",
    "inverse",
    "enabled",
];

/// Where relative template paths are resolved from.
///
/// Priority: `resource_override`, then the document's `$resource_base`
/// (relative to `base_dir`), then `resource_fallback`, then `base_dir`.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Directory containing the document.
    pub base_dir: PathBuf,
    /// Explicit override, e.g. from a command line flag.
    pub resource_override: Option<PathBuf>,
    /// Used when the document declares no resource base, e.g. from the
    /// environment.
    pub resource_fallback: Option<PathBuf>,
}

impl LoadOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_resource_override(mut self, dir: Option<PathBuf>) -> Self {
        self.resource_override = dir;
        self
    }

    #[must_use]
    pub fn with_resource_fallback(mut self, dir: Option<PathBuf>) -> Self {
        self.resource_fallback = dir;
        self
    }

    fn resource_base(&self, declared: Option<&str>) -> PathBuf {
        if let Some(dir) = &self.resource_override {
            return dir.clone();
        }
        if let Some(declared) = declared {
            return resolve(&self.base_dir, declared);
        }
        if let Some(dir) = &self.resource_fallback {
            return dir.clone();
        }
        self.base_dir.clone()
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(home) = dirs::home_dir() {
        if raw == "~" {
            return home;
        }
        if let Some(rest) = raw.strip_prefix("~/") {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

fn resolve(base: &Path, raw: &str) -> PathBuf {
    let path = expand_home(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Validate a parsed document and build a graph, resolving templates
/// against `base_dir`.
pub fn submit_pipeline(document: &Value, base_dir: &Path) -> Result<PipelineGraph, ConfigError> {
    PipelineGraph::from_value(document, &LoadOptions::new(base_dir))
}

impl PipelineGraph {
    pub fn from_json_str(text: &str, options: &LoadOptions) -> Result<Self, ConfigError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ConfigError::document(format!("not valid JSON: {}", e)))?;
        Self::from_value(&value, options)
    }

    /// Read a document from disk. `options.base_dir` is replaced by the
    /// document's directory.
    pub fn load(path: impl AsRef<Path>, options: LoadOptions) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::document(format!("cannot read {:?}: {}", path, e)))?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self::from_json_str(&text, &LoadOptions { base_dir, ..options })
    }

    pub fn from_value(value: &Value, options: &LoadOptions) -> Result<Self, ConfigError> {
        let root = value
            .as_object()
            .ok_or_else(|| ConfigError::document("expected a JSON object of node name to node"))?;

        let declared = match root.get(RESOURCE_BASE_KEY) {
            None | Some(Value::Null) => None,
            Some(Value::String(dir)) => Some(dir.as_str()),
            Some(_) => {
                return Err(ConfigError::document(format!(
                    "'{}' must be a string",
                    RESOURCE_BASE_KEY
                )))
            }
        };
        let resource_base = options.resource_base(declared);
        let mut templates = TemplateCache::new(&resource_base);

        let mut nodes = Vec::new();
        for (name, body) in root {
            if name.starts_with(ANNOTATION_MARKER) {
                continue;
            }
            if name.is_empty() {
                return Err(ConfigError::document("node names must not be empty"));
            }
            let fields = body.as_object().ok_or_else(|| {
                ConfigError::document(format!("node '{}' must be a JSON object", name))
            })?;
            nodes.push(parse_node(name, fields, &mut templates)?);
        }
        if nodes.is_empty() {
            return Err(ConfigError::document("pipeline has no nodes"));
        }

        let names: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        for node in &nodes {
            if let Some(missing) = node.successors.iter().find(|s| !names.contains(s.as_str())) {
                return Err(ConfigError::DanglingSuccessor {
                    node: node.name.clone(),
                    successor: missing.clone(),
                });
            }
        }

        debug!(
            nodes = nodes.len(),
            templates = templates.decoded.len(),
            resource_base = %resource_base.display(),
            "Pipeline loaded"
        );
        Ok(PipelineGraph::from_parts(nodes, resource_base))
    }
}

// ============================================================================
// Templates
// ============================================================================

/// Decodes each distinct template path once per document.
struct TemplateCache {
    base: PathBuf,
    decoded: HashMap<PathBuf, Arc<RgbImage>>,
}

impl TemplateCache {
    fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            decoded: HashMap::new(),
        }
    }

    fn load(&mut self, node: &str, raw: &str) -> Result<TemplateImage, ConfigError> {
        let path = resolve(&self.base, raw);
        if let Some(image) = self.decoded.get(&path) {
            return Ok(TemplateImage {
                path,
                image: Arc::clone(image),
            });
        }
        if !path.is_file() {
            return Err(ConfigError::MissingTemplate {
                node: node.to_string(),
                path: path.display().to_string(),
            });
        }
        let unreadable = |message: String| ConfigError::UnreadableTemplate {
            node: node.to_string(),
            path: path.display().to_string(),
            message,
        };
        let image = image::open(&path)
            .map_err(|e| unreadable(e.to_string()))?
            .to_rgb8();
        if image.width() == 0 || image.height() == 0 {
            return Err(unreadable("image is empty".to_string()));
        }
        let image = Arc::new(image);
        self.decoded.insert(path.clone(), Arc::clone(&image));
        Ok(TemplateImage { path, image })
    }
}

// ============================================================================
// Node parsing
// ============================================================================

/// Typed access to one node's fields, producing errors that name the node.
struct Fields<'a> {
    node: &'a str,
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    /// `null` counts as absent.
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn invalid(&self, key: &str, message: impl Into<String>) -> ConfigError {
        ConfigError::invalid(self.node, key, message)
    }

    fn required(&self, key: &str) -> Result<&'a Value, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::missing(self.node, key))
    }

    fn required_str(&self, key: &str) -> Result<&'a str, ConfigError> {
        self.required(key)?
            .as_str()
            .ok_or_else(|| self.invalid(key, "expected a string"))
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v.as_bool().ok_or_else(|| self.invalid(key, "expected true or false")),
        }
    }

    fn millis(&self, key: &str, default_ms: u64) -> Result<Duration, ConfigError> {
        let ms = match self.get(key) {
            None => default_ms,
            Some(v) => v.as_u64().ok_or_else(|| {
                self.invalid(key, "expected a non-negative integer number of milliseconds")
            })?,
        };
        Ok(Duration::from_millis(ms))
    }

    fn number(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => finite(v).ok_or_else(|| self.invalid(key, "expected a finite number")),
        }
    }

    fn count(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_u64()
                .filter(|&n| n >= 1)
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| self.invalid(key, "expected an integer >= 1")),
        }
    }

    fn index(&self) -> Result<i32, ConfigError> {
        match self.get("index") {
            None => Ok(0),
            Some(v) => v
                .as_i64()
                .and_then(|n| i32::try_from(n).ok())
                .ok_or_else(|| self.invalid("index", "expected an integer")),
        }
    }

    /// A single string or a list of strings; absent is empty.
    fn string_list(&self, key: &str) -> Result<Vec<String>, ConfigError> {
        let items = match self.get(key) {
            None => return Ok(Vec::new()),
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| self.invalid(key, "expected a string or a list of strings"))?,
            Some(_) => return Err(self.invalid(key, "expected a string or a list of strings")),
        };
        if items.iter().any(String::is_empty) {
            return Err(self.invalid(key, "names must not be empty"));
        }
        Ok(items)
    }

    /// Parse a string enum through its serde representation.
    fn choice<T: DeserializeOwned + Default>(
        &self,
        key: &str,
        choices: &str,
        uppercase: bool,
    ) -> Result<T, ConfigError> {
        let Some(v) = self.get(key) else {
            return Ok(T::default());
        };
        let v = match (v, uppercase) {
            (Value::String(s), true) => Value::String(s.to_ascii_uppercase()),
            _ => v.clone(),
        };
        serde_json::from_value(v)
            .map_err(|_| self.invalid(key, format!("expected one of {}", choices)))
    }

    fn roi(&self) -> Result<Option<Rect>, ConfigError> {
        let Some(v) = self.get("roi") else {
            return Ok(None);
        };
        match int_array(v).as_deref() {
            Some(&[x, y, w, h]) if w > 0 && h > 0 => Ok(Some(Rect::new(x, y, w, h))),
            _ => Err(self.invalid("roi", "expected [x, y, width, height] with positive size")),
        }
    }

    fn offset(&self, key: &str) -> Result<[i32; 4], ConfigError> {
        let Some(v) = self.get(key) else {
            return Ok([0; 4]);
        };
        match int_array(v).as_deref() {
            Some(&[l, t, r, b]) => Ok([l, t, r, b]),
            _ => Err(self.invalid(key, "expected [left, top, right, bottom] edge offsets")),
        }
    }

    /// `true` (or absent) aims at the recognized rectangle.
    fn target(&self, key: &str) -> Result<Target, ConfigError> {
        let Some(v) = self.get(key) else {
            return Ok(Target::Recognized);
        };
        if v.as_bool() == Some(true) {
            return Ok(Target::Recognized);
        }
        match int_array(v).as_deref() {
            Some(&[x, y]) => Ok(Target::Point(Point::new(x, y))),
            Some(&[x, y, w, h]) if w >= 0 && h >= 0 => Ok(Target::Region(Rect::new(x, y, w, h))),
            _ => Err(self.invalid(key, "expected true, [x, y] or [x, y, width, height]")),
        }
    }

    fn point(&self, key: &str) -> Result<Point, ConfigError> {
        match int_array(self.required(key)?).as_deref() {
            Some(&[x, y]) => Ok(Point::new(x, y)),
            _ => Err(self.invalid(key, "expected [x, y]")),
        }
    }
}

fn finite(v: &Value) -> Option<f64> {
    v.as_f64().filter(|x| x.is_finite())
}

fn int_array(v: &Value) -> Option<Vec<i32>> {
    v.as_array()?
        .iter()
        .map(|item| item.as_i64().and_then(|n| i32::try_from(n).ok()))
        .collect()
}

fn parse_node(
    name: &str,
    map: &Map<String, Value>,
    templates: &mut TemplateCache,
) -> Result<PipelineNode, ConfigError> {
    let f = Fields { node: name, map };

    for key in map.keys() {
        if !key.starts_with(ANNOTATION_MARKER) && !KNOWN_FIELDS.contains(&key.as_str()) {
            warn!(node = name, field = %key, "Ignoring unknown field");
        }
    }

    let recognition = parse_recognition(&f, templates)?;
    let action = parse_action(&f)?;
    let roi = f.roi()?;

    for key in map.keys() {
        if KNOWN_FIELDS.contains(&key.as_str())
            && !applies(key, recognition.name(), action.name())
        {
            warn!(
                node = name,
                field = %key,
                recognition = recognition.name(),
                action = action.name(),
                "Field has no effect for this node"
            );
        }
    }

    if matches!(recognition, Recognition::DirectHit) && roi.is_none() && action.aims_at_recognized()
    {
        let field = if matches!(action, Action::Swipe { .. }) {
            "begin"
        } else {
            "target"
        };
        return Err(f.invalid(
            field,
            "DirectHit without an roi has no recognized region to aim at; \
             give coordinates or set roi",
        ));
    }

    Ok(PipelineNode {
        name: name.to_string(),
        recognition,
        action,
        successors: f.string_list("next")?,
        roi,
        timeout: f.millis("timeout", DEFAULT_TIMEOUT_MS)?,
        rate_limit: f.millis("rate_limit", DEFAULT_RATE_LIMIT_MS)?,
        pre_delay: f.millis("pre_delay", DEFAULT_DELAY_MS)?,
        post_delay: f.millis("post_delay", DEFAULT_DELAY_MS)?,
        inverse: f.bool("inverse", false)?,
        enabled: f.bool("enabled", true)?,
    })
}

/// Whether a known field means anything for the given kinds.
fn applies(field: &str, recognition: &str, action: &str) -> bool {
    match field {
        "recognition" | "action" | "roi" | "next" | "timeout" | "rate_limit" | "pre_delay"
        | "post_delay" | "inverse" | "enabled" => true,
        "template" | "green_mask" => matches!(recognition, "TemplateMatch" | "FeatureMatch"),
        "threshold" | "method" | "multi_scale" | "scale_range" | "scale_step" => {
            recognition == "TemplateMatch"
        }
        "order_by" | "index" => recognition != "DirectHit",
        "detector" | "ratio" => recognition == "FeatureMatch",
        "count" => matches!(recognition, "FeatureMatch" | "ColorMatch"),
        "lower" | "upper" | "color_space" | "connected" => recognition == "ColorMatch",
        "target" | "target_offset" => matches!(action, "Click" | "LongPress"),
        "begin" | "begin_offset" | "end" => action == "Swipe",
        "duration" => matches!(action, "LongPress" | "Swipe" | "Wait"),
        "input_text" => action == "InputText",
        _ => false,
    }
}

fn parse_recognition(
    f: &Fields<'_>,
    templates: &mut TemplateCache,
) -> Result<Recognition, ConfigError> {
    let kind = f.required_str("recognition")?;
    match kind {
        "DirectHit" => Ok(Recognition::DirectHit),
        "TemplateMatch" => {
            let templates = parse_templates(f, templates)?;
            let thresholds = parse_thresholds(f, templates.len())?;
            let scale_range = parse_scale_range(f)?;
            let scale_step = f.number("scale_step", DEFAULT_SCALE_STEP)?;
            if scale_step <= 0.0 {
                return Err(f.invalid("scale_step", "must be greater than 0"));
            }
            let steps = (scale_range.1 - scale_range.0) / scale_step;
            if steps > MAX_SCALE_STEPS as f64 {
                return Err(f.invalid(
                    "scale_step",
                    format!(
                        "{} steps across scale_range; at most {} allowed",
                        steps.ceil(),
                        MAX_SCALE_STEPS
                    ),
                ));
            }
            Ok(Recognition::TemplateMatch(TemplateMatchParams {
                templates,
                thresholds,
                method: parse_method(f)?,
                multi_scale: f.bool("multi_scale", true)?,
                scale_range,
                scale_step,
                green_mask: f.bool("green_mask", false)?,
                order_by: f.choice::<OrderBy>("order_by", ORDER_BY_CHOICES, false)?,
                index: f.index()?,
            }))
        }
        "FeatureMatch" => {
            let ratio = f.number("ratio", DEFAULT_RATIO)?;
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(f.invalid("ratio", "must be in (0, 1]"));
            }
            Ok(Recognition::FeatureMatch(FeatureMatchParams {
                templates: parse_templates(f, templates)?,
                detector: f.choice::<Detector>("detector", "SIFT, ORB, BRISK, KAZE, AKAZE", true)?,
                ratio,
                count: f.count("count", DEFAULT_FEATURE_COUNT)?,
                green_mask: f.bool("green_mask", false)?,
                order_by: f.choice::<OrderBy>("order_by", ORDER_BY_CHOICES, false)?,
                index: f.index()?,
            }))
        }
        "ColorMatch" => {
            let color_space = f.choice::<ColorSpace>("color_space", "HSV, RGB", true)?;
            Ok(Recognition::ColorMatch(ColorMatchParams {
                ranges: parse_color_ranges(f, color_space)?,
                color_space,
                count: f.count("count", DEFAULT_COLOR_COUNT)?,
                connected: f.bool("connected", false)?,
                order_by: f.choice::<OrderBy>("order_by", ORDER_BY_CHOICES, false)?,
                index: f.index()?,
            }))
        }
        other => Err(f.invalid(
            "recognition",
            format!(
                "unknown recognition '{}'; expected DirectHit, TemplateMatch, FeatureMatch or ColorMatch",
                other
            ),
        )),
    }
}

const ORDER_BY_CHOICES: &str = "Score, Horizontal, Vertical, Area";

fn parse_templates(
    f: &Fields<'_>,
    cache: &mut TemplateCache,
) -> Result<Vec<TemplateImage>, ConfigError> {
    f.required("template")?;
    let paths = f.string_list("template")?;
    if paths.is_empty() {
        return Err(f.invalid("template", "at least one template path is required"));
    }
    paths.iter().map(|p| cache.load(f.node, p)).collect()
}

fn parse_thresholds(f: &Fields<'_>, template_count: usize) -> Result<Vec<f64>, ConfigError> {
    let not_numbers = || f.invalid("threshold", "expected a number or a list of numbers");
    let values = match f.get("threshold") {
        None => vec![DEFAULT_THRESHOLD],
        Some(Value::Array(items)) => items
            .iter()
            .map(finite)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(not_numbers)?,
        Some(v) => vec![finite(v).ok_or_else(not_numbers)?],
    };
    if values.is_empty() || (values.len() != 1 && values.len() != template_count) {
        return Err(f.invalid(
            "threshold",
            format!(
                "expected one threshold or one per template ({}), got {}",
                template_count,
                values.len()
            ),
        ));
    }
    Ok(values)
}

/// Accepts the metric name or its OpenCV constant (1 or 5).
fn parse_method(f: &Fields<'_>) -> Result<MatchMethod, ConfigError> {
    match f.get("method") {
        None => Ok(MatchMethod::default()),
        Some(v) => match (v.as_str(), v.as_u64()) {
            (Some("CcoeffNormed"), _) | (_, Some(5)) => Ok(MatchMethod::CcoeffNormed),
            (Some("SqdiffNormed"), _) | (_, Some(1)) => Ok(MatchMethod::SqdiffNormed),
            _ => Err(f.invalid("method", "expected CcoeffNormed or SqdiffNormed")),
        },
    }
}

fn parse_scale_range(f: &Fields<'_>) -> Result<(f64, f64), ConfigError> {
    let Some(v) = f.get("scale_range") else {
        return Ok(DEFAULT_SCALE_RANGE);
    };
    let pair = v
        .as_array()
        .and_then(|items| items.iter().map(finite).collect::<Option<Vec<_>>>());
    match pair.as_deref() {
        Some(&[min, max]) if min > 0.0 && min <= max && max <= MAX_SCALE => Ok((min, max)),
        _ => Err(f.invalid(
            "scale_range",
            format!("expected [min, max] with 0 < min <= max <= {}", MAX_SCALE),
        )),
    }
}

fn parse_color_ranges(
    f: &Fields<'_>,
    space: ColorSpace,
) -> Result<Vec<ColorRange>, ConfigError> {
    let lower = parse_triples(f, "lower", space)?;
    let upper = parse_triples(f, "upper", space)?;
    if lower.len() != upper.len() {
        return Err(f.invalid(
            "upper",
            format!(
                "expected {} range(s) to pair with 'lower', got {}",
                lower.len(),
                upper.len()
            ),
        ));
    }
    let ranges: Vec<ColorRange> = lower
        .into_iter()
        .zip(upper)
        .map(|(lower, upper)| ColorRange { lower, upper })
        .collect();
    // Hue may wrap in HSV; every other channel must be ordered.
    let first_ordered_channel = if space == ColorSpace::Hsv { 1 } else { 0 };
    for range in &ranges {
        if (first_ordered_channel..3).any(|c| range.lower[c] > range.upper[c]) {
            return Err(f.invalid(
                "upper",
                format!(
                    "range {:?}..{:?} has a lower bound above its upper bound",
                    range.lower, range.upper
                ),
            ));
        }
    }
    Ok(ranges)
}

/// One `[c0, c1, c2]` triple or a list of them.
fn parse_triples(
    f: &Fields<'_>,
    key: &str,
    space: ColorSpace,
) -> Result<Vec<[u8; 3]>, ConfigError> {
    let v = f.required(key)?;
    let items = v
        .as_array()
        .ok_or_else(|| f.invalid(key, "expected [c0, c1, c2] or a list of them"))?;
    if items.is_empty() {
        return Err(f.invalid(key, "expected at least one color"));
    }
    if items[0].is_array() {
        items.iter().map(|t| parse_triple(f, key, t, space)).collect()
    } else {
        Ok(vec![parse_triple(f, key, v, space)?])
    }
}

fn parse_triple(
    f: &Fields<'_>,
    key: &str,
    v: &Value,
    space: ColorSpace,
) -> Result<[u8; 3], ConfigError> {
    let limits: [u64; 3] = match space {
        ColorSpace::Hsv => [180, 255, 255],
        ColorSpace::Rgb => [255, 255, 255],
    };
    let channels = v
        .as_array()
        .filter(|items| items.len() == 3)
        .ok_or_else(|| f.invalid(key, "expected three channels"))?;
    let mut out = [0u8; 3];
    for (c, item) in channels.iter().enumerate() {
        let value = item
            .as_u64()
            .filter(|&n| n <= limits[c])
            .ok_or_else(|| {
                f.invalid(
                    key,
                    format!("channel {} must be an integer in 0..={}", c, limits[c]),
                )
            })?;
        out[c] = value as u8;
    }
    Ok(out)
}

fn parse_action(f: &Fields<'_>) -> Result<Action, ConfigError> {
    let kind = f.required_str("action")?;
    match kind {
        "DoNothing" => Ok(Action::DoNothing),
        "Click" => Ok(Action::Click {
            target: f.target("target")?,
            offset: f.offset("target_offset")?,
        }),
        "LongPress" => Ok(Action::LongPress {
            target: f.target("target")?,
            offset: f.offset("target_offset")?,
            duration: f.millis("duration", DEFAULT_HOLD_MS)?,
        }),
        "Swipe" => Ok(Action::Swipe {
            begin: f.target("begin")?,
            begin_offset: f.offset("begin_offset")?,
            end: f.point("end")?,
            duration: f.millis("duration", DEFAULT_SWIPE_MS)?,
        }),
        "InputText" => {
            let text = f
                .required("input_text")?
                .as_str()
                .ok_or_else(|| f.invalid("input_text", "expected a string"))?;
            Ok(Action::InputText {
                text: text.to_string(),
            })
        }
        "Wait" => Ok(Action::Wait {
            duration: f.millis("duration", DEFAULT_WAIT_MS)?,
        }),
        other => Err(f.invalid(
            "action",
            format!(
                "unknown action '{}'; expected DoNothing, Click, LongPress, Swipe, InputText or Wait",
                other
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use serde_json::json;
    use tempfile::TempDir;

    fn write_png(dir: &Path, name: &str) -> PathBuf {
        let mut img = RgbImage::new(8, 8);
        img.put_pixel(2, 3, Rgb([255, 255, 255]));
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        img.save(&path).unwrap();
        path
    }

    fn load(doc: Value, dir: &Path) -> Result<PipelineGraph, ConfigError> {
        submit_pipeline(&doc, dir)
    }

    #[test]
    fn test_minimal_document_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let graph = load(
            json!({ "start": { "recognition": "DirectHit", "action": "DoNothing" } }),
            dir.path(),
        )
        .unwrap();

        let node = graph.get("start").unwrap();
        assert!(matches!(node.recognition, Recognition::DirectHit));
        assert_eq!(node.action, Action::DoNothing);
        assert_eq!(node.timeout, Duration::from_millis(20_000));
        assert_eq!(node.rate_limit, Duration::from_millis(1_000));
        assert_eq!(node.pre_delay, Duration::from_millis(200));
        assert_eq!(node.post_delay, Duration::from_millis(200));
        assert!(node.enabled);
        assert!(!node.inverse);
        assert!(node.is_terminal());
    }

    #[test]
    fn test_annotations_are_ignored() {
        let dir = TempDir::new().unwrap();
        let graph = load(
            json!({
                "$comment": "top-level note",
                "start": { "$note": 42, "recognition": "DirectHit", "action": "DoNothing" }
            }),
            dir.path(),
        )
        .unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_document_order_is_preserved() {
        let dir = TempDir::new().unwrap();
        let graph = load(
            json!({
                "zeta": { "recognition": "DirectHit", "action": "DoNothing", "next": "alpha" },
                "alpha": { "recognition": "DirectHit", "action": "DoNothing" }
            }),
            dir.path(),
        )
        .unwrap();
        let names: Vec<&str> = graph.nodes().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(graph.roots(), vec!["zeta"]);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let dir = TempDir::new().unwrap();
        let graph = load(
            json!({ "start": { "recognition": "DirectHit", "action": "DoNothing", "tresh": 1 } }),
            dir.path(),
        )
        .unwrap();
        assert!(graph.get("start").is_some());
    }

    #[test]
    fn test_scale_search_is_bounded() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "a.png");
        let node = |extra: Value| {
            let mut node = json!({ "recognition": "TemplateMatch", "action": "Click", "template": "a.png" });
            if let (Some(node), Some(extra)) = (node.as_object_mut(), extra.as_object()) {
                node.extend(extra.clone());
            }
            json!({ "m": node })
        };

        let err = load(node(json!({ "scale_step": 1e-7 })), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "scale_step"));

        let err = load(node(json!({ "scale_range": [0.5, 1e6] })), dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "scale_range"));

        let graph = load(
            node(json!({ "scale_range": [0.5, MAX_SCALE], "scale_step": 0.01 })),
            dir.path(),
        )
        .unwrap();
        let Recognition::TemplateMatch(p) = &graph.get("m").unwrap().recognition else {
            panic!("expected TemplateMatch");
        };
        assert!(p.scales().len() <= MAX_SCALE_STEPS + 1);
    }

    #[test]
    fn test_missing_recognition() {
        let dir = TempDir::new().unwrap();
        let err = load(json!({ "start": { "action": "DoNothing" } }), dir.path()).unwrap_err();
        assert_eq!(err, ConfigError::missing("start", "recognition"));
    }

    #[test]
    fn test_unknown_kinds_are_invalid() {
        let dir = TempDir::new().unwrap();
        let err = load(
            json!({ "start": { "recognition": "OCR", "action": "DoNothing" } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "recognition"));

        let err = load(
            json!({ "start": { "recognition": "DirectHit", "action": "Scroll" } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "action"));
    }

    #[test]
    fn test_dangling_successor() {
        let dir = TempDir::new().unwrap();
        let err = load(
            json!({ "start": { "recognition": "DirectHit", "action": "DoNothing", "next": ["gone"] } }),
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::DanglingSuccessor {
                node: "start".into(),
                successor: "gone".into()
            }
        );
    }

    #[test]
    fn test_self_cycle_is_legal() {
        let dir = TempDir::new().unwrap();
        let graph = load(
            json!({ "loop": { "recognition": "DirectHit", "action": "DoNothing", "next": "loop" } }),
            dir.path(),
        )
        .unwrap();
        assert_eq!(graph.get("loop").unwrap().successors, vec!["loop"]);
    }

    #[test]
    fn test_template_required_and_resolved() {
        let dir = TempDir::new().unwrap();
        let err = load(
            json!({ "find": { "recognition": "TemplateMatch", "action": "Click" } }),
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::missing("find", "template"));

        let err = load(
            json!({ "find": { "recognition": "TemplateMatch", "action": "Click", "template": "nope.png" } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingTemplate { ref node, .. } if node == "find"));

        write_png(dir.path(), "tool.png");
        let graph = load(
            json!({ "find": { "recognition": "TemplateMatch", "action": "Click", "template": "tool.png" } }),
            dir.path(),
        )
        .unwrap();
        let Recognition::TemplateMatch(params) = &graph.get("find").unwrap().recognition else {
            panic!("expected TemplateMatch");
        };
        assert_eq!(params.templates.len(), 1);
        assert_eq!(params.templates[0].image.dimensions(), (8, 8));
        assert_eq!(params.thresholds, vec![DEFAULT_THRESHOLD]);
        assert!(params.multi_scale);
        assert_eq!(params.scale_range, (0.5, 1.5));
    }

    #[test]
    fn test_undecodable_template() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not a png").unwrap();
        let err = load(
            json!({ "find": { "recognition": "FeatureMatch", "action": "Click", "template": "broken.png" } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::UnreadableTemplate { ref node, .. } if node == "find"));
    }

    #[test]
    fn test_shared_template_decoded_once() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "a.png");
        write_png(dir.path(), "b.png");
        let graph = load(
            json!({
                "one": { "recognition": "TemplateMatch", "action": "Click", "template": ["a.png", "b.png"],
                         "threshold": [0.5, 0.6] },
                "two": { "recognition": "FeatureMatch", "action": "Click", "template": "a.png" }
            }),
            dir.path(),
        )
        .unwrap();
        let Recognition::TemplateMatch(one) = &graph.get("one").unwrap().recognition else {
            panic!("expected TemplateMatch");
        };
        let Recognition::FeatureMatch(two) = &graph.get("two").unwrap().recognition else {
            panic!("expected FeatureMatch");
        };
        assert_eq!(one.thresholds, vec![0.5, 0.6]);
        assert!(Arc::ptr_eq(&one.templates[0].image, &two.templates[0].image));
    }

    #[test]
    fn test_threshold_count_must_match_templates() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "a.png");
        let err = load(
            json!({ "one": { "recognition": "TemplateMatch", "action": "Click", "template": "a.png",
                             "threshold": [0.5, 0.6] } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "threshold"));
    }

    #[test]
    fn test_resource_base_priority() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "declared/t.png");
        write_png(dir.path(), "override/t.png");
        write_png(dir.path(), "env/t.png");
        write_png(dir.path(), "t.png");

        let node = json!({ "recognition": "TemplateMatch", "action": "Click", "template": "t.png" });
        let with_declared = json!({ "$resource_base": "declared", "find": node.clone() });
        let without = json!({ "find": node });

        let base = LoadOptions::new(dir.path());
        let path_of = |graph: &PipelineGraph| match &graph.get("find").unwrap().recognition {
            Recognition::TemplateMatch(p) => p.templates[0].path.clone(),
            _ => panic!("expected TemplateMatch"),
        };

        let overridden = base
            .clone()
            .with_resource_override(Some(dir.path().join("override")))
            .with_resource_fallback(Some(dir.path().join("env")));
        let graph = PipelineGraph::from_value(&with_declared, &overridden).unwrap();
        assert_eq!(path_of(&graph), dir.path().join("override/t.png"));

        let fallback = base.clone().with_resource_fallback(Some(dir.path().join("env")));
        let graph = PipelineGraph::from_value(&with_declared, &fallback).unwrap();
        assert_eq!(path_of(&graph), dir.path().join("declared/t.png"));

        let graph = PipelineGraph::from_value(&without, &fallback).unwrap();
        assert_eq!(path_of(&graph), dir.path().join("env/t.png"));

        let graph = PipelineGraph::from_value(&without, &base).unwrap();
        assert_eq!(path_of(&graph), dir.path().join("t.png"));
        assert_eq!(graph.resource_base(), dir.path());
    }

    #[test]
    fn test_load_from_file_uses_document_directory() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "img/t.png");
        let doc = json!({
            "$resource_base": "img",
            "find": { "recognition": "TemplateMatch", "action": "Click", "template": "t.png" }
        });
        let path = dir.path().join("pipeline.json");
        std::fs::write(&path, doc.to_string()).unwrap();

        let graph = PipelineGraph::load(&path, LoadOptions::default()).unwrap();
        assert_eq!(graph.resource_base(), dir.path().join("img"));
    }

    #[test]
    fn test_color_ranges() {
        let dir = TempDir::new().unwrap();
        let graph = load(
            json!({ "red": { "recognition": "ColorMatch", "action": "Click",
                             "lower": [[0, 100, 100], [170, 100, 100]],
                             "upper": [[10, 255, 255], [180, 255, 255]],
                             "connected": true, "count": 20 } }),
            dir.path(),
        )
        .unwrap();
        let Recognition::ColorMatch(params) = &graph.get("red").unwrap().recognition else {
            panic!("expected ColorMatch");
        };
        assert_eq!(params.ranges.len(), 2);
        assert_eq!(params.color_space, ColorSpace::Hsv);
        assert!(params.connected);
        assert_eq!(params.count, 20);

        let err = load(
            json!({ "red": { "recognition": "ColorMatch", "action": "Click",
                             "lower": [0, 0, 0], "upper": [200, 255, 255] } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "upper"));

        let err = load(
            json!({ "red": { "recognition": "ColorMatch", "action": "Click",
                             "color_space": "rgb", "lower": [200, 0, 0], "upper": [100, 50, 50] } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "upper"));
    }

    #[test]
    fn test_direct_hit_click_needs_something_to_aim_at() {
        let dir = TempDir::new().unwrap();
        let err = load(
            json!({ "tap": { "recognition": "DirectHit", "action": "Click" } }),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidField { ref field, .. } if field == "target"));

        let graph = load(
            json!({
                "tap": { "recognition": "DirectHit", "action": "Click", "target": [600, 300] },
                "tap_roi": { "recognition": "DirectHit", "action": "Click", "roi": [0, 0, 10, 10] },
                "swipe": { "recognition": "DirectHit", "action": "Swipe", "begin": [1, 2], "end": [3, 4] }
            }),
            dir.path(),
        )
        .unwrap();
        assert_eq!(
            graph.get("tap").unwrap().action,
            Action::Click {
                target: Target::Point(Point::new(600, 300)),
                offset: [0; 4]
            }
        );
        assert_eq!(
            graph.get("swipe").unwrap().action,
            Action::Swipe {
                begin: Target::Point(Point::new(1, 2)),
                begin_offset: [0; 4],
                end: Point::new(3, 4),
                duration: Duration::from_millis(DEFAULT_SWIPE_MS)
            }
        );
    }

    #[test]
    fn test_action_required_fields() {
        let dir = TempDir::new().unwrap();
        let err = load(
            json!({ "s": { "recognition": "DirectHit", "action": "Swipe", "begin": [0, 0] } }),
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::missing("s", "end"));

        let err = load(
            json!({ "t": { "recognition": "DirectHit", "action": "InputText" } }),
            dir.path(),
        )
        .unwrap_err();
        assert_eq!(err, ConfigError::missing("t", "input_text"));
    }

    #[test]
    fn test_bad_values() {
        let dir = TempDir::new().unwrap();
        let cases = [
            ("timeout", json!(-1)),
            ("roi", json!([0, 0, 0, 10])),
            ("enabled", json!("yes")),
            ("next", json!(3)),
        ];
        for (field, value) in cases {
            let mut node = json!({ "recognition": "DirectHit", "action": "DoNothing" });
            node[field] = value;
            let err = load(json!({ "n": node }), dir.path()).unwrap_err();
            assert!(
                matches!(err, ConfigError::InvalidField { field: ref f, .. } if f == field),
                "{} should be rejected, got {:?}",
                field,
                err
            );
        }
    }

    #[test]
    fn test_document_level_errors() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            load(json!([1, 2]), dir.path()),
            Err(ConfigError::Document { .. })
        ));
        assert!(matches!(
            load(json!({ "$comment": "only notes" }), dir.path()),
            Err(ConfigError::Document { .. })
        ));
        assert!(matches!(
            load(json!({ "n": 5 }), dir.path()),
            Err(ConfigError::Document { .. })
        ));
        assert!(matches!(
            PipelineGraph::from_json_str("{ not json", &LoadOptions::new(dir.path())),
            Err(ConfigError::Document { .. })
        ));
    }

    #[test]
    fn test_method_accepts_names_and_codes() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "a.png");
        for (value, expected) in [
            (json!("SqdiffNormed"), MatchMethod::SqdiffNormed),
            (json!(1), MatchMethod::SqdiffNormed),
            (json!(5), MatchMethod::CcoeffNormed),
        ] {
            let graph = load(
                json!({ "m": { "recognition": "TemplateMatch", "action": "Click",
                               "template": "a.png", "method": value } }),
                dir.path(),
            )
            .unwrap();
            let Recognition::TemplateMatch(p) = &graph.get("m").unwrap().recognition else {
                panic!("expected TemplateMatch");
            };
            assert_eq!(p.method, expected);
        }
    }

    #[test]
    fn test_detector_is_case_insensitive() {
        let dir = TempDir::new().unwrap();
        write_png(dir.path(), "a.png");
        let graph = load(
            json!({ "f": { "recognition": "FeatureMatch", "action": "Click",
                           "template": "a.png", "detector": "orb", "order_by": "Horizontal" } }),
            dir.path(),
        )
        .unwrap();
        let Recognition::FeatureMatch(p) = &graph.get("f").unwrap().recognition else {
            panic!("expected FeatureMatch");
        };
        assert_eq!(p.detector, Detector::Orb);
        assert_eq!(p.order_by, OrderBy::Horizontal);
        assert_eq!(p.count, DEFAULT_FEATURE_COUNT);
    }
}
