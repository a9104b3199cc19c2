//! Screen geometry shared by recognition and actions.
//!
//! All coordinates are in frame pixels with the origin at the top-left
//! corner. Rectangles are half-open: a rectangle at `x` with `width` covers
//! columns `x..x + width`.

use serde::{Deserialize, Serialize};

/// A point in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[must_use]
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// An axis-aligned rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    #[must_use]
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// A zero-sized rectangle sitting on a point.
    #[must_use]
    pub fn at_point(point: Point) -> Self {
        Self::new(point.x, point.y, 0, 0)
    }

    #[must_use]
    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.width)
    }

    #[must_use]
    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.height)
    }

    #[must_use]
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Center point, rounded toward the top-left.
    #[must_use]
    pub fn center(&self) -> Point {
        Point::new(
            self.x.saturating_add(self.width / 2),
            self.y.saturating_add(self.height / 2),
        )
    }

    /// Move each edge by a delta: `[left, top, right, bottom]`.
    ///
    /// Positive deltas move an edge right (or down), so `[-5, -5, 5, 5]`
    /// grows the rectangle by five pixels on every side.
    #[must_use]
    pub fn adjust_edges(&self, deltas: [i32; 4]) -> Self {
        let [left, top, right, bottom] = deltas;
        let x0 = self.x.saturating_add(left);
        let y0 = self.y.saturating_add(top);
        let x1 = self.right().saturating_add(right);
        let y1 = self.bottom().saturating_add(bottom);
        Self::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    /// Overlap with another rectangle, or `None` if they do not intersect.
    #[must_use]
    pub fn intersection(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0)))
    }

    /// Intersection-over-union in `0.0..=1.0`.
    #[must_use]
    pub fn iou(&self, other: &Rect) -> f64 {
        let Some(overlap) = self.intersection(other) else {
            return 0.0;
        };
        let inter = overlap.area() as f64;
        let union = self.area() as f64 + other.area() as f64 - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Clamp this rectangle into `0..width` x `0..height`.
    ///
    /// Returns `None` if nothing of the rectangle lies inside the bounds.
    #[must_use]
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Rect> {
        let bounds = Rect::new(0, 0, width as i32, height as i32);
        self.intersection(&bounds)
    }

    #[must_use]
    pub fn translate(&self, dx: i32, dy: i32) -> Self {
        Self::new(
            self.x.saturating_add(dx),
            self.y.saturating_add(dy),
            self.width,
            self.height,
        )
    }
}
