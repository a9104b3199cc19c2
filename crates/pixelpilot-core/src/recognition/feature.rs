//! Keypoint matching.
//!
//! Harris corners on a lightly blurred grayscale plane, described either by
//! 256 intensity comparisons (binary, Hamming distance) or by a normalized
//! 8x8 grid of patch averages (float, Euclidean distance). Matches go
//! through Lowe's ratio test against the two nearest frame descriptors.

use std::sync::OnceLock;
use std::time::Instant;

use image::{imageops, RgbImage};
use tracing::debug;

use super::{order, MatchCandidate, RecognitionResult};
use crate::frame::{is_mask_green, Frame, GrayPlane};
use crate::geometry::Rect;
use crate::pipeline::{Detector, FeatureMatchParams};

const MAX_KEYPOINTS: usize = 500;
/// Keypoints closer than this to an edge cannot be described.
const BORDER: usize = 8;
const PATCH_RADIUS: i32 = 8;
const HARRIS_K: f64 = 0.04;
const HARRIS_WINDOW: usize = 2;
/// Responses below this fraction of the strongest are dropped.
const RESPONSE_FRACTION: f64 = 0.01;
const BLUR_SIGMA: f32 = 1.2;
/// Templates with fewer keypoints are skipped.
const MIN_TEMPLATE_KEYPOINTS: usize = 4;

pub(super) fn recognize(
    params: &FeatureMatchParams,
    frame: &Frame,
    region: Rect,
    started: Instant,
) -> RecognitionResult {
    let scene = Features::extract(&frame.crop(region), params.detector, false);
    let mut best_raw = 0.0f64;
    let mut candidates = Vec::new();

    for template in &params.templates {
        let features = Features::extract(&template.image, params.detector, params.green_mask);
        if features.len() < MIN_TEMPLATE_KEYPOINTS {
            debug!(
                template = %template.path.display(),
                keypoints = features.len(),
                "Template has too few keypoints, skipping"
            );
            continue;
        }

        let matched = features.good_matches(&scene, params.ratio);
        let count = matched.len();
        best_raw = best_raw.max(count as f64);
        debug!(
            template = %template.path.display(),
            template_keypoints = features.len(),
            scene_keypoints = scene.len(),
            matches = count,
            "Features matched"
        );

        if count >= params.count {
            if let Some(rect) = bounding_box(matched.iter().map(|&i| &scene.points[i])) {
                candidates.push(MatchCandidate::new(
                    rect.translate(region.x, region.y),
                    count as f64,
                ));
            }
        }
    }

    order(&mut candidates, params.order_by, true);
    RecognitionResult::select("FeatureMatch", candidates, params.index, best_raw, started)
}

#[derive(Debug, Clone, Copy)]
struct Keypoint {
    x: usize,
    y: usize,
    response: f64,
}

enum Descriptors {
    Binary(Vec<[u64; 4]>),
    Float(Vec<[f32; 64]>),
}

struct Features {
    points: Vec<Keypoint>,
    descriptors: Descriptors,
}

impl Features {
    fn extract(image: &RgbImage, detector: Detector, green_mask: bool) -> Self {
        let blurred = imageops::blur(image, BLUR_SIGMA);
        let gray = GrayPlane::from_rgb(&blurred);
        let mut points = harris(&gray);
        if green_mask {
            points.retain(|p| !is_mask_green(image.get_pixel(p.x as u32, p.y as u32)));
        }
        let descriptors = if detector.binary_descriptors() {
            Descriptors::Binary(points.iter().map(|p| binary_descriptor(&gray, p)).collect())
        } else {
            Descriptors::Float(points.iter().map(|p| patch_descriptor(&gray, p)).collect())
        };
        Self {
            points,
            descriptors,
        }
    }

    fn len(&self) -> usize {
        self.points.len()
    }

    /// Indices of scene keypoints that pass the ratio test, one per
    /// template keypoint that found a match.
    fn good_matches(&self, scene: &Features, ratio: f64) -> Vec<usize> {
        match (&self.descriptors, &scene.descriptors) {
            (Descriptors::Binary(ours), Descriptors::Binary(theirs)) => {
                ratio_test(ours, theirs, ratio, |a, b| f64::from(hamming(a, b)))
            }
            (Descriptors::Float(ours), Descriptors::Float(theirs)) => {
                ratio_test(ours, theirs, ratio, euclidean)
            }
            _ => Vec::new(),
        }
    }
}

fn ratio_test<D>(
    ours: &[D],
    theirs: &[D],
    ratio: f64,
    distance: impl Fn(&D, &D) -> f64,
) -> Vec<usize> {
    if theirs.len() < 2 {
        return Vec::new();
    }
    let mut matched = Vec::new();
    for d in ours {
        let mut nearest = (f64::INFINITY, 0usize);
        let mut second = f64::INFINITY;
        for (j, candidate) in theirs.iter().enumerate() {
            let dist = distance(d, candidate);
            if dist < nearest.0 {
                second = nearest.0;
                nearest = (dist, j);
            } else if dist < second {
                second = dist;
            }
        }
        if nearest.0 < ratio * second {
            matched.push(nearest.1);
        }
    }
    matched
}

fn hamming(a: &[u64; 4], b: &[u64; 4]) -> u32 {
    a.iter().zip(b).map(|(x, y)| (x ^ y).count_ones()).sum()
}

fn euclidean(a: &[f32; 64], b: &[f32; 64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

fn bounding_box<'a>(points: impl Iterator<Item = &'a Keypoint>) -> Option<Rect> {
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for p in points {
        bounds = Some(match bounds {
            None => (p.x, p.y, p.x, p.y),
            Some((x0, y0, x1, y1)) => (x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| {
        Rect::new(
            x0 as i32,
            y0 as i32,
            (x1 - x0 + 1) as i32,
            (y1 - y0 + 1) as i32,
        )
    })
}

// ============================================================================
// Detection
// ============================================================================

fn harris(gray: &GrayPlane) -> Vec<Keypoint> {
    let (w, h) = (gray.width, gray.height);
    if w <= 2 * BORDER || h <= 2 * BORDER {
        return Vec::new();
    }
    let p = |x: usize, y: usize| f64::from(gray.at(x, y));

    let mut ixx = vec![0.0f64; w * h];
    let mut iyy = vec![0.0f64; w * h];
    let mut ixy = vec![0.0f64; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = (p(x + 1, y - 1) + 2.0 * p(x + 1, y) + p(x + 1, y + 1))
                - (p(x - 1, y - 1) + 2.0 * p(x - 1, y) + p(x - 1, y + 1));
            let gy = (p(x - 1, y + 1) + 2.0 * p(x, y + 1) + p(x + 1, y + 1))
                - (p(x - 1, y - 1) + 2.0 * p(x, y - 1) + p(x + 1, y - 1));
            let i = y * w + x;
            ixx[i] = gx * gx;
            iyy[i] = gy * gy;
            ixy[i] = gx * gy;
        }
    }

    let mut response = vec![0.0f64; w * h];
    let mut strongest = 0.0f64;
    for y in BORDER..h - BORDER {
        for x in BORDER..w - BORDER {
            let (mut a, mut b, mut c) = (0.0, 0.0, 0.0);
            for wy in y - HARRIS_WINDOW..=y + HARRIS_WINDOW {
                for wx in x - HARRIS_WINDOW..=x + HARRIS_WINDOW {
                    let i = wy * w + wx;
                    a += ixx[i];
                    b += ixy[i];
                    c += iyy[i];
                }
            }
            let r = a * c - b * b - HARRIS_K * (a + c) * (a + c);
            response[y * w + x] = r;
            strongest = strongest.max(r);
        }
    }
    if strongest <= 0.0 {
        return Vec::new();
    }

    let floor = strongest * RESPONSE_FRACTION;
    let mut points = Vec::new();
    for y in BORDER..h - BORDER {
        for x in BORDER..w - BORDER {
            let r = response[y * w + x];
            if r <= floor || !is_local_max(&response, w, x, y) {
                continue;
            }
            points.push(Keypoint { x, y, response: r });
        }
    }
    points.sort_by(|a, b| {
        b.response
            .total_cmp(&a.response)
            .then(a.y.cmp(&b.y))
            .then(a.x.cmp(&b.x))
    });
    points.truncate(MAX_KEYPOINTS);
    points
}

/// 3x3 maximum; plateaus keep only their first pixel in raster order.
fn is_local_max(response: &[f64], w: usize, x: usize, y: usize) -> bool {
    let r = response[y * w + x];
    for ny in y - 1..=y + 1 {
        for nx in x - 1..=x + 1 {
            if (nx, ny) == (x, y) {
                continue;
            }
            let other = response[ny * w + nx];
            let earlier = (ny, nx) < (y, x);
            if other > r || (earlier && other == r) {
                return false;
            }
        }
    }
    true
}

// ============================================================================
// Description
// ============================================================================

/// Fixed comparison pairs inside the patch, shared by every image.
fn sampling_pairs() -> &'static [(i32, i32, i32, i32)] {
    static PAIRS: OnceLock<Vec<(i32, i32, i32, i32)>> = OnceLock::new();
    PAIRS.get_or_init(|| {
        let mut state: u64 = 0x2545_f491_4f6c_dd1d;
        let span = (2 * PATCH_RADIUS + 1) as u64;
        let mut next = move || {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 33) % span) as i32 - PATCH_RADIUS
        };
        let mut pairs = Vec::with_capacity(256);
        while pairs.len() < 256 {
            let pair = (next(), next(), next(), next());
            if (pair.0, pair.1) != (pair.2, pair.3) {
                pairs.push(pair);
            }
        }
        pairs
    })
}

fn binary_descriptor(gray: &GrayPlane, kp: &Keypoint) -> [u64; 4] {
    let sample = |dx: i32, dy: i32| {
        gray.at(
            (kp.x as i32 + dx) as usize,
            (kp.y as i32 + dy) as usize,
        )
    };
    let mut bits = [0u64; 4];
    for (i, &(x1, y1, x2, y2)) in sampling_pairs().iter().enumerate() {
        if sample(x1, y1) < sample(x2, y2) {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    bits
}

/// 16x16 patch pooled into 8x8 cells, zero mean and unit length.
fn patch_descriptor(gray: &GrayPlane, kp: &Keypoint) -> [f32; 64] {
    let mut cells = [0.0f32; 64];
    let x0 = kp.x - PATCH_RADIUS as usize;
    let y0 = kp.y - PATCH_RADIUS as usize;
    for (i, cell) in cells.iter_mut().enumerate() {
        let cx = x0 + (i % 8) * 2;
        let cy = y0 + (i / 8) * 2;
        *cell = (gray.at(cx, cy) + gray.at(cx + 1, cy) + gray.at(cx, cy + 1) + gray.at(cx + 1, cy + 1))
            / 4.0;
    }
    let mean = cells.iter().sum::<f32>() / 64.0;
    for cell in &mut cells {
        *cell -= mean;
    }
    let norm = cells.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for cell in &mut cells {
            *cell /= norm;
        }
    }
    cells
}
