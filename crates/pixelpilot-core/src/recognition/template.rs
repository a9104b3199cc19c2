//! Template matching on grayscale planes.
//!
//! Every scale of every template yields at most
//! [`MAX_CANDIDATES_PER_TEMPLATE`] local peaks of its score map. Small
//! searches score every position. Large ones run coarse to fine: frame and
//! template are box averaged by an integer factor, and the strongest coarse
//! peaks seed a short full-resolution search each.

use std::time::Instant;

use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::trace;

use super::{
    order, suppress, MatchCandidate, RecognitionResult, MAX_CANDIDATES_PER_TEMPLATE,
    MERGE_NMS_IOU, TEMPLATE_NMS_IOU,
};
use crate::frame::{is_mask_green, Frame, GrayPlane};
use crate::geometry::Rect;
use crate::pipeline::{MatchMethod, TemplateMatchParams};

/// Standard deviation (in gray levels) under which a patch counts as flat.
const FLAT_EPSILON: f64 = 1e-3;
/// Positions times template pixels that are scored directly.
const DIRECT_SEARCH_BUDGET: f64 = 4_000_000.0;
/// Shortest template side kept at the coarse level.
const MIN_COARSE_SIDE: usize = 8;
/// Hill-climbing steps allowed after the window search around a seed.
const MAX_CLIMB_STEPS: usize = 16;

pub(super) fn recognize(
    params: &TemplateMatchParams,
    frame: &Frame,
    region: Rect,
    started: Instant,
) -> RecognitionResult {
    let method = params.method;
    let mut search = Pyramid::new(GrayPlane::from_rgb(&frame.crop(region)));
    let mut best_raw = worst_score(method);
    let mut merged = Vec::new();

    for (t, template) in params.templates.iter().enumerate() {
        let threshold = params.threshold_for(t);
        let mut passing = Vec::new();

        for scale in params.scales() {
            let Some(scaled) = scale_template(&template.image, scale) else {
                continue;
            };
            let needle = Needle::new(&scaled, params.green_mask);
            if !search.full.fits(&needle) {
                continue;
            }
            for peak in search.peaks(&needle, method) {
                if method.better(peak.score, best_raw) {
                    best_raw = peak.score;
                }
                if method.accepts(peak.score, threshold) {
                    passing.push(MatchCandidate::new(
                        Rect::new(
                            region.x + peak.x as i32,
                            region.y + peak.y as i32,
                            needle.width as i32,
                            needle.height as i32,
                        ),
                        peak.score,
                    ));
                }
            }
        }

        trace!(
            template = %template.path.display(),
            passing = passing.len(),
            "Template scored"
        );
        merged.extend(suppress(
            passing,
            TEMPLATE_NMS_IOU,
            method.higher_is_better(),
            MAX_CANDIDATES_PER_TEMPLATE,
        ));
    }

    let mut candidates = suppress(merged, MERGE_NMS_IOU, method.higher_is_better(), usize::MAX);
    order(&mut candidates, params.order_by, method.higher_is_better());
    RecognitionResult::select("TemplateMatch", candidates, params.index, best_raw, started)
}

fn worst_score(method: MatchMethod) -> f64 {
    match method {
        MatchMethod::CcoeffNormed => -1.0,
        MatchMethod::SqdiffNormed => 1.0,
    }
}

fn scale_template(template: &RgbImage, scale: f64) -> Option<RgbImage> {
    if (scale - 1.0).abs() < 1e-9 {
        return Some(template.clone());
    }
    let width = (f64::from(template.width()) * scale).round() as u32;
    let height = (f64::from(template.height()) * scale).round() as u32;
    if width == 0 || height == 0 {
        return None;
    }
    Some(imageops::resize(template, width, height, FilterType::Triangle))
}

/// Box average by an integer factor, dropping the ragged edge.
fn shrink(plane: &GrayPlane, factor: usize) -> GrayPlane {
    let width = plane.width / factor;
    let height = plane.height / factor;
    let area = (factor * factor) as f32;
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        for x in 0..width {
            let mut total = 0.0f32;
            for dy in 0..factor {
                let start = (y * factor + dy) * plane.width + x * factor;
                total += plane.data[start..start + factor].iter().sum::<f32>();
            }
            data.push(total / area);
        }
    }
    GrayPlane {
        width,
        height,
        data,
    }
}

/// A template at one scale, with the statistics scoring needs.
struct Needle {
    width: usize,
    height: usize,
    plane: GrayPlane,
    /// False under the green mask.
    keep: Vec<bool>,
    /// `(dx, dy, gray)` of every kept pixel.
    pixels: Vec<(usize, usize, f32)>,
    masked: bool,
    sum: f64,
    sum_sq: f64,
}

impl Needle {
    fn new(template: &RgbImage, green_mask: bool) -> Self {
        let plane = GrayPlane::from_rgb(template);
        let keep = template
            .pixels()
            .map(|px| !(green_mask && is_mask_green(px)))
            .collect();
        Self::from_plane(plane, keep)
    }

    fn from_plane(plane: GrayPlane, keep: Vec<bool>) -> Self {
        let pixels: Vec<(usize, usize, f32)> = keep
            .iter()
            .enumerate()
            .filter(|(_, &kept)| kept)
            .map(|(i, _)| (i % plane.width, i / plane.width, plane.data[i]))
            .collect();
        let masked = pixels.len() < plane.data.len();
        let sum = pixels.iter().map(|p| f64::from(p.2)).sum();
        let sum_sq = pixels.iter().map(|p| f64::from(p.2).powi(2)).sum();
        Self {
            width: plane.width,
            height: plane.height,
            plane,
            keep,
            pixels,
            masked,
            sum,
            sum_sq,
        }
    }

    /// Coarse copy; a coarse pixel is kept only if all of its sources are.
    fn shrink(&self, factor: usize) -> Self {
        let plane = shrink(&self.plane, factor);
        let keep = (0..plane.height)
            .flat_map(|y| (0..plane.width).map(move |x| (x, y)))
            .map(|(x, y)| {
                (0..factor).all(|dy| {
                    let row = (y * factor + dy) * self.width + x * factor;
                    self.keep[row..row + factor].iter().all(|&kept| kept)
                })
            })
            .collect();
        Self::from_plane(plane, keep)
    }

    fn count(&self) -> f64 {
        self.pixels.len() as f64
    }
}

/// Integral images of values and squared values for O(1) window sums.
struct WindowSums {
    stride: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl WindowSums {
    fn new(plane: &GrayPlane) -> Self {
        let stride = plane.width + 1;
        let mut sum = vec![0.0; stride * (plane.height + 1)];
        let mut sum_sq = vec![0.0; stride * (plane.height + 1)];
        for y in 0..plane.height {
            let mut row = 0.0;
            let mut row_sq = 0.0;
            for x in 0..plane.width {
                let v = f64::from(plane.at(x, y));
                row += v;
                row_sq += v * v;
                let i = (y + 1) * stride + x + 1;
                sum[i] = sum[i - stride] + row;
                sum_sq[i] = sum_sq[i - stride] + row_sq;
            }
        }
        Self {
            stride,
            sum,
            sum_sq,
        }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let s = self.stride;
        table[(y + h) * s + x + w] - table[y * s + x + w] - table[(y + h) * s + x]
            + table[y * s + x]
    }
}

/// A template position (top-left corner) and its score.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Peak {
    x: usize,
    y: usize,
    score: f64,
}

/// A search plane at one resolution.
struct Level {
    plane: GrayPlane,
    sums: WindowSums,
}

impl Level {
    fn new(plane: GrayPlane) -> Self {
        let sums = WindowSums::new(&plane);
        Self { plane, sums }
    }

    fn fits(&self, needle: &Needle) -> bool {
        !needle.pixels.is_empty()
            && needle.width <= self.plane.width
            && needle.height <= self.plane.height
    }

    /// Number of template positions along each axis.
    fn positions(&self, needle: &Needle) -> (usize, usize) {
        (
            self.plane.width - needle.width + 1,
            self.plane.height - needle.height + 1,
        )
    }

    fn score(&self, needle: &Needle, x: usize, y: usize, method: MatchMethod) -> f64 {
        let (cross, win_sum, win_sq) = if needle.masked {
            let (mut cross, mut win_sum, mut win_sq) = (0.0f64, 0.0f64, 0.0f64);
            for &(dx, dy, t) in &needle.pixels {
                let w = f64::from(self.plane.at(x + dx, y + dy));
                cross += f64::from(t) * w;
                win_sum += w;
                win_sq += w * w;
            }
            (cross, win_sum, win_sq)
        } else {
            let mut cross = 0.0f64;
            for dy in 0..needle.height {
                let start = (y + dy) * self.plane.width + x;
                let row = &self.plane.data[start..start + needle.width];
                let t = &needle.plane.data[dy * needle.width..(dy + 1) * needle.width];
                cross += row
                    .iter()
                    .zip(t)
                    .map(|(w, t)| f64::from(*w) * f64::from(*t))
                    .sum::<f64>();
            }
            (
                cross,
                self.sums.window(&self.sums.sum, x, y, needle.width, needle.height),
                self.sums.window(&self.sums.sum_sq, x, y, needle.width, needle.height),
            )
        };
        match method {
            MatchMethod::CcoeffNormed => {
                ccoeff_normed(needle.count(), needle.sum, needle.sum_sq, win_sum, win_sq, cross)
            }
            MatchMethod::SqdiffNormed => sqdiff_normed(needle.sum_sq, win_sq, cross),
        }
    }

    /// Local maxima of the full score map, best first, at most `cap`.
    fn peaks(&self, needle: &Needle, method: MatchMethod, cap: usize) -> Vec<Peak> {
        let (out_w, out_h) = self.positions(needle);
        let mut scores = Vec::with_capacity(out_w * out_h);
        for y in 0..out_h {
            for x in 0..out_w {
                scores.push(self.score(needle, x, y, method));
            }
        }

        let mut peaks = Vec::new();
        for y in 0..out_h {
            for x in 0..out_w {
                if is_peak(&scores, out_w, out_h, x, y, method) {
                    peaks.push(Peak {
                        x,
                        y,
                        score: scores[y * out_w + x],
                    });
                }
            }
        }
        rank(&mut peaks, method);
        peaks.truncate(cap);
        peaks
    }

    /// Best position within `radius` of `(x, y)`, then climbed to a local peak.
    fn refine(
        &self,
        needle: &Needle,
        method: MatchMethod,
        x: usize,
        y: usize,
        radius: usize,
    ) -> Peak {
        let (out_w, out_h) = self.positions(needle);
        let (x, y) = (x.min(out_w - 1), y.min(out_h - 1));
        let mut best = Peak {
            x,
            y,
            score: self.score(needle, x, y, method),
        };
        best = self.best_near(needle, method, best, radius, out_w, out_h);
        for _ in 0..MAX_CLIMB_STEPS {
            let next = self.best_near(needle, method, best, 1, out_w, out_h);
            if (next.x, next.y) == (best.x, best.y) {
                break;
            }
            best = next;
        }
        best
    }

    fn best_near(
        &self,
        needle: &Needle,
        method: MatchMethod,
        center: Peak,
        radius: usize,
        out_w: usize,
        out_h: usize,
    ) -> Peak {
        let mut best = center;
        for y in center.y.saturating_sub(radius)..=(center.y + radius).min(out_h - 1) {
            for x in center.x.saturating_sub(radius)..=(center.x + radius).min(out_w - 1) {
                if (x, y) == (center.x, center.y) {
                    continue;
                }
                let score = self.score(needle, x, y, method);
                if method.better(score, best.score) {
                    best = Peak { x, y, score };
                }
            }
        }
        best
    }
}

/// 3x3 maximum under the method's polarity; plateaus keep only their first
/// position in raster order.
fn is_peak(scores: &[f64], w: usize, h: usize, x: usize, y: usize, method: MatchMethod) -> bool {
    let score = scores[y * w + x];
    for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
            if (nx, ny) == (x, y) {
                continue;
            }
            let other = scores[ny * w + nx];
            if method.better(other, score) || ((ny, nx) < (y, x) && other == score) {
                return false;
            }
        }
    }
    true
}

/// Best score first; ties broken top-to-bottom, left-to-right.
fn rank(peaks: &mut [Peak], method: MatchMethod) {
    peaks.sort_by(|a, b| {
        let by = if method.higher_is_better() {
            b.score.total_cmp(&a.score)
        } else {
            a.score.total_cmp(&b.score)
        };
        by.then(a.y.cmp(&b.y)).then(a.x.cmp(&b.x))
    });
}

/// The search region at full resolution plus coarse copies built on demand.
struct Pyramid {
    full: Level,
    coarse: Vec<(usize, Level)>,
}

impl Pyramid {
    fn new(plane: GrayPlane) -> Self {
        Self {
            full: Level::new(plane),
            coarse: Vec::new(),
        }
    }

    /// Shrink factor that brings the search under budget, limited by how
    /// small the template may get.
    fn factor_for(&self, needle: &Needle) -> usize {
        let (out_w, out_h) = self.full.positions(needle);
        let cost = (out_w * out_h) as f64 * needle.count();
        if cost <= DIRECT_SEARCH_BUDGET {
            return 1;
        }
        // A factor f divides both positions and template pixels by f^2.
        let wanted = (cost / DIRECT_SEARCH_BUDGET).powf(0.25).ceil() as usize;
        let allowed = needle.width.min(needle.height) / MIN_COARSE_SIDE;
        wanted.min(allowed).max(1)
    }

    /// Local peaks of the template's score map at full resolution.
    fn peaks(&mut self, needle: &Needle, method: MatchMethod) -> Vec<Peak> {
        let factor = self.factor_for(needle);
        if factor > 1 {
            if !self.coarse.iter().any(|(f, _)| *f == factor) {
                let level = Level::new(shrink(&self.full.plane, factor));
                self.coarse.push((factor, level));
            }
            let small = needle.shrink(factor);
            let coarse = self
                .coarse
                .iter()
                .find(|(f, _)| *f == factor)
                .map(|(_, level)| level);
            if let Some(coarse) = coarse.filter(|level| level.fits(&small)) {
                let radius = (factor + 1) / 2;
                let mut refined: Vec<Peak> = coarse
                    .peaks(&small, method, MAX_CANDIDATES_PER_TEMPLATE)
                    .into_iter()
                    .map(|seed| {
                        self.full
                            .refine(needle, method, seed.x * factor, seed.y * factor, radius)
                    })
                    .collect();
                rank(&mut refined, method);
                refined.dedup_by(|a, b| (a.x, a.y) == (b.x, b.y));
                return refined;
            }
        }
        self.full.peaks(needle, method, MAX_CANDIDATES_PER_TEMPLATE)
    }
}

fn ccoeff_normed(n: f64, t_sum: f64, t_sq: f64, w_sum: f64, w_sq: f64, cross: f64) -> f64 {
    let t_var = (t_sq - t_sum * t_sum / n).max(0.0);
    let w_var = (w_sq - w_sum * w_sum / n).max(0.0);
    let flat = FLAT_EPSILON * FLAT_EPSILON * n;
    match (t_var <= flat, w_var <= flat) {
        // Two flat patches match when they have the same level.
        (true, true) => {
            if ((t_sum - w_sum) / n).abs() <= 1.0 {
                1.0
            } else {
                0.0
            }
        }
        (true, false) | (false, true) => 0.0,
        (false, false) => {
            let covariance = cross - t_sum * w_sum / n;
            (covariance / (t_var * w_var).sqrt()).clamp(-1.0, 1.0)
        }
    }
}

fn sqdiff_normed(t_sq: f64, w_sq: f64, cross: f64) -> f64 {
    let diff = (t_sq - 2.0 * cross + w_sq).max(0.0);
    let norm = (t_sq * w_sq).sqrt();
    if norm <= f64::EPSILON {
        if diff <= f64::EPSILON {
            0.0
        } else {
            1.0
        }
    } else {
        (diff / norm).clamp(0.0, 1.0)
    }
}
