//! Replay capture: serves recorded screenshots as if they were live frames.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use pixelpilot_core::frame::{CaptureProvider, Frame};
use tracing::debug;

/// Frames are returned in order; once exhausted the last one repeats.
#[derive(Debug)]
pub struct ReplayCapture {
    frames: Vec<Frame>,
    next: AtomicUsize,
}

impl ReplayCapture {
    pub fn new(frames: Vec<Frame>) -> Result<Self> {
        if frames.is_empty() {
            anyhow::bail!("Replay capture needs at least one frame");
        }
        Ok(Self {
            frames,
            next: AtomicUsize::new(0),
        })
    }

    /// Decode every image up front so a bad path fails before the run starts.
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        let frames = paths
            .iter()
            .map(|path| {
                Frame::open(path).with_context(|| format!("Failed to load frame {:?}", path))
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(frames)
    }

    /// Number of captures served so far.
    pub fn served(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl CaptureProvider for ReplayCapture {
    async fn capture(&self) -> Result<Frame> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let index = n.min(self.frames.len() - 1);
        debug!(capture = n, frame = index, "Replaying frame");
        Ok(self.frames[index].clone())
    }
}
