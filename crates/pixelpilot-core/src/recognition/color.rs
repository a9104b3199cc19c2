//! Color range matching.

use std::collections::VecDeque;
use std::time::Instant;

use super::{order, MatchCandidate, RecognitionResult};
use crate::frame::{rgb_to_hsv, Frame};
use crate::geometry::Rect;
use crate::pipeline::{ColorMatchParams, ColorSpace};

pub(super) fn recognize(
    params: &ColorMatchParams,
    frame: &Frame,
    region: Rect,
    started: Instant,
) -> RecognitionResult {
    let crop = frame.crop(region);
    let (w, h) = (crop.width() as usize, crop.height() as usize);
    let mask: Vec<bool> = crop
        .pixels()
        .map(|px| {
            let value = match params.color_space {
                ColorSpace::Hsv => rgb_to_hsv(px),
                ColorSpace::Rgb => px.0,
            };
            params
                .ranges
                .iter()
                .any(|r| r.contains(value, params.color_space))
        })
        .collect();

    let (mut candidates, best_raw) = if params.connected {
        let components = components(&mask, w, h);
        let largest = components.iter().map(|c| c.pixels).max().unwrap_or(0);
        let passing = components
            .into_iter()
            .filter(|c| c.pixels >= params.count)
            .map(|c| MatchCandidate::new(c.bounds.translate(region.x, region.y), c.pixels as f64))
            .collect();
        (passing, largest as f64)
    } else {
        let total = mask.iter().filter(|&&m| m).count();
        let passing = match bounds_of(&mask, w) {
            Some(bounds) if total >= params.count => vec![MatchCandidate::new(
                bounds.translate(region.x, region.y),
                total as f64,
            )],
            _ => Vec::new(),
        };
        (passing, total as f64)
    };

    order(&mut candidates, params.order_by, true);
    RecognitionResult::select("ColorMatch", candidates, params.index, best_raw, started)
}

struct Component {
    pixels: usize,
    bounds: Rect,
}

fn bounds_of(mask: &[bool], w: usize) -> Option<Rect> {
    let mut bounds: Option<(usize, usize, usize, usize)> = None;
    for (i, &hit) in mask.iter().enumerate() {
        if !hit {
            continue;
        }
        let (x, y) = (i % w, i / w);
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds.map(|(x0, y0, x1, y1)| span(x0, y0, x1, y1))
}

fn span(x0: usize, y0: usize, x1: usize, y1: usize) -> Rect {
    Rect::new(
        x0 as i32,
        y0 as i32,
        (x1 - x0 + 1) as i32,
        (y1 - y0 + 1) as i32,
    )
}

/// 8-connected components of the mask, in raster order of their first pixel.
fn components(mask: &[bool], w: usize, h: usize) -> Vec<Component> {
    let mut seen = vec![false; mask.len()];
    let mut out = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        queue.push_back(start);
        let (mut x0, mut y0, mut x1, mut y1) = (w, h, 0, 0);
        let mut pixels = 0;

        while let Some(i) = queue.pop_front() {
            let (x, y) = (i % w, i / w);
            pixels += 1;
            x0 = x0.min(x);
            y0 = y0.min(y);
            x1 = x1.max(x);
            y1 = y1.max(y);
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    let j = ny * w + nx;
                    if mask[j] && !seen[j] {
                        seen[j] = true;
                        queue.push_back(j);
                    }
                }
            }
        }
        out.push(Component {
            pixels,
            bounds: span(x0, y0, x1, y1),
        });
    }
    out
}
