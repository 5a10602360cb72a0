//! Frame-differencing motion gate.
//!
//! absdiff → binary threshold → 3x3 dilation → 8-connected components.
//! The largest component at or above `min_area` pixels is reported.

use crate::types::Rect;
use image::{GrayImage, Luma};
use thiserror::Error;

pub const DEFAULT_THRESHOLD: u8 = 25;
pub const DEFAULT_MIN_AREA: u32 = 1200;
pub const DEFAULT_DILATE_ITERATIONS: u32 = 2;

const ON: u8 = 255;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MotionError {
    #[error("frame size changed: previous {prev:?}, current {curr:?}")]
    DimensionMismatch { prev: (u32, u32), curr: (u32, u32) },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionConfig {
    /// Pixels whose absolute difference exceeds this are "changed".
    pub threshold: u8,
    /// Smallest component, in pixels, that counts as motion.
    pub min_area: u32,
    pub dilate_iterations: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            min_area: DEFAULT_MIN_AREA,
            dilate_iterations: DEFAULT_DILATE_ITERATIONS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MotionResult {
    pub motion_detected: bool,
    /// Bounding box of the largest qualifying region.
    pub bbox: Option<Rect>,
    /// Dilated binary change mask (0 or 255), for visualization.
    pub mask: GrayImage,
}

impl MotionResult {
    /// Result for a frame where motion gating is switched off.
    pub fn none(width: u32, height: u32) -> Self {
        Self {
            motion_detected: false,
            bbox: None,
            mask: GrayImage::new(width, height),
        }
    }
}

/// Stateless comparator of two smoothed grayscale frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct MotionGate {
    config: MotionConfig,
}

impl MotionGate {
    pub fn new(config: MotionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn detect(&self, prev: &GrayImage, curr: &GrayImage) -> Result<MotionResult, MotionError> {
        if prev.dimensions() != curr.dimensions() {
            return Err(MotionError::DimensionMismatch {
                prev: prev.dimensions(),
                curr: curr.dimensions(),
            });
        }

        let mut mask = threshold_diff(prev, curr, self.config.threshold);
        for _ in 0..self.config.dilate_iterations {
            mask = dilate3x3(&mask);
        }

        let mut best: Option<Region> = None;
        for region in connected_regions(&mask) {
            if region.area < self.config.min_area as u64 {
                continue;
            }
            // Strictly greater: equal areas keep the earlier region.
            if best.map_or(true, |b| region.area > b.area) {
                best = Some(region);
            }
        }

        if let Some(r) = best {
            tracing::trace!(area = r.area, bbox = ?r.bbox, "motion region");
        }

        Ok(MotionResult {
            motion_detected: best.is_some(),
            bbox: best.map(|r| r.bbox),
            mask,
        })
    }
}

fn threshold_diff(prev: &GrayImage, curr: &GrayImage, threshold: u8) -> GrayImage {
    let (w, h) = curr.dimensions();
    let mut out = GrayImage::new(w, h);
    for ((o, p), c) in out.pixels_mut().zip(prev.pixels()).zip(curr.pixels()) {
        if p[0].abs_diff(c[0]) > threshold {
            *o = Luma([ON]);
        }
    }
    out
}

/// One pass of binary dilation with a 3x3 square kernel.
fn dilate3x3(src: &GrayImage) -> GrayImage {
    let (w, h) = src.dimensions();
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            if src.get_pixel(x, y)[0] != ON {
                continue;
            }
            for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                    out.put_pixel(nx, ny, Luma([ON]));
                }
            }
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
struct Region {
    area: u64,
    bbox: Rect,
}

/// 8-connected foreground components, in raster order of their first pixel.
fn connected_regions(mask: &GrayImage) -> Vec<Region> {
    let (w, h) = mask.dimensions();
    let (wu, hu) = (w as usize, h as usize);
    let mut seen = vec![false; wu * hu];
    let mut stack = Vec::new();
    let mut regions = Vec::new();

    for start in 0..wu * hu {
        if seen[start] || mask.as_raw()[start] != ON {
            continue;
        }
        seen[start] = true;
        stack.push(start);

        let (mut min_x, mut min_y, mut max_x, mut max_y) = (wu, hu, 0usize, 0usize);
        let mut area = 0u64;

        while let Some(idx) = stack.pop() {
            let (x, y) = (idx % wu, idx / wu);
            area += 1;
            min_x = min_x.min(x);
            max_x = max_x.max(x);
            min_y = min_y.min(y);
            max_y = max_y.max(y);

            for ny in y.saturating_sub(1)..=(y + 1).min(hu - 1) {
                for nx in x.saturating_sub(1)..=(x + 1).min(wu - 1) {
                    let n = ny * wu + nx;
                    if !seen[n] && mask.as_raw()[n] == ON {
                        seen[n] = true;
                        stack.push(n);
                    }
                }
            }
        }

        regions.push(Region {
            area,
            bbox: Rect::new(
                min_x as i32,
                min_y as i32,
                (max_x - min_x + 1) as u32,
                (max_y - min_y + 1) as u32,
            ),
        });
    }

    regions
}
