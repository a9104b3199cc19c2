//! Captured frames and the pixel planes recognition works on.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::{imageops, Rgb, RgbImage};

use crate::geometry::Rect;

/// One captured view of the target application, in RGB.
///
/// The pixel buffer is reference counted so a frame captured once per poll
/// cycle can be handed to several recognizers without copying.
#[derive(Debug, Clone)]
pub struct Frame {
    image: Arc<RgbImage>,
}

impl Frame {
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self {
            image: Arc::new(image),
        }
    }

    /// Decode an image file (PNG, JPEG or BMP) into a frame.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("Failed to decode image {:?}", path))?
            .to_rgb8();
        Ok(Self::new(image))
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    #[must_use]
    pub fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.width() as i32, self.height() as i32)
    }

    #[must_use]
    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Resolve an optional region of interest against this frame.
    ///
    /// `None` means the whole frame. A region partially outside the frame is
    /// clamped; a region entirely outside yields `None`.
    #[must_use]
    pub fn region(&self, roi: Option<Rect>) -> Option<Rect> {
        match roi {
            Some(r) => r.clamp_to(self.width(), self.height()),
            None => Some(self.bounds()),
        }
    }

    /// Copy out the pixels under `region` (already clamped via [`Frame::region`]).
    #[must_use]
    pub fn crop(&self, region: Rect) -> RgbImage {
        imageops::crop_imm(
            self.image.as_ref(),
            region.x as u32,
            region.y as u32,
            region.width as u32,
            region.height as u32,
        )
        .to_image()
    }
}

/// Supplies frames of the target application.
///
/// Implementations are external collaborators (a screen grabber, a window
/// capture, a replay of stored screenshots). The scheduler calls `capture`
/// at most once per poll cycle.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn capture(&self) -> Result<Frame>;
}

/// Single-channel `f32` plane used by the matchers.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayPlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl GrayPlane {
    /// Luminance with the BT.601 weights.
    #[must_use]
    pub fn from_rgb(image: &RgbImage) -> Self {
        let width = image.width() as usize;
        let height = image.height() as usize;
        let data = image.pixels().map(|p| luma(*p)).collect();
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    #[must_use]
    pub fn at(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }
}

#[inline]
fn luma(p: Rgb<u8>) -> f32 {
    0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2])
}

/// Pure green `RGB(0, 255, 0)` with a little tolerance.
///
/// Templates paint dynamic overlays in this color so the matchers can skip
/// them.
#[inline]
#[must_use]
pub fn is_mask_green(p: &Rgb<u8>) -> bool {
    p[0] <= 10 && p[1] >= 250 && p[2] <= 10
}

/// RGB to HSV using the 8-bit OpenCV convention: H in `0..=180`, S and V in
/// `0..=255`.
#[must_use]
pub fn rgb_to_hsv(p: &Rgb<u8>) -> [u8; 3] {
    let r = f32::from(p[0]);
    let g = f32::from(p[1]);
    let b = f32::from(p[2]);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let h = if delta <= 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    [
        (h / 2.0).round().min(180.0) as u8,
        s.round().min(255.0) as u8,
        v.round() as u8,
    ]
}
