//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes an RGB frame to the 640x640 model input, decodes the three
//! anchor-free stride heads, and runs NMS over the union of detections.

use crate::types::BoundingBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
/// Raw decode cutoff. The provider applies its own, usually stricter, minimum.
const SCRFD_DECODE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0} — download buffalo_l from insightface and place det_10g.onnx in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: usize, height: usize, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    /// Map a point in model-input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor indices for one stride head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideHead {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    heads: [StrideHead; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let heads = resolve_heads(&output_names);
        tracing::info!(path = model_path, outputs = ?output_names, ?heads, "loaded SCRFD model");

        Ok(Self { session, heads })
    }

    /// Detect faces in an RGB frame, returning boxes sorted by descending confidence.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame, SCRFD_INPUT_SIZE);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (head, &stride) in self.heads.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let scores = extract(head.score, "scores")?;
            let bboxes = extract(head.bbox, "bboxes")?;
            let kps = extract(head.kps, "kps")?;

            candidates.extend(decode_stride(
                StrideTensors { scores, bboxes, kps },
                stride,
                SCRFD_INPUT_SIZE,
                &letterbox,
                SCRFD_DECODE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Letterbox an RGB frame into an NCHW tensor normalized for SCRFD.
fn preprocess(frame: &RgbImage, target: usize) -> (Array4<f32>, Letterbox) {
    let (width, height) = (frame.width() as usize, frame.height() as usize);
    let letterbox = Letterbox::fit(width, height, target);

    let new_w = ((width as f32 * letterbox.scale).round() as usize).min(target);
    let new_h = ((height as f32 * letterbox.scale).round() as usize).min(target);
    let x_off = letterbox.pad_x.floor() as usize;
    let y_off = letterbox.pad_y.floor() as usize;

    // Padding uses the mean so it normalizes to 0.0.
    let mut tensor = Array4::<f32>::zeros((1, 3, target, target));
    let inv_scale = 1.0 / letterbox.scale;

    for y in 0..new_h {
        let sy = (y as f32 + 0.5) * inv_scale - 0.5;
        let y0 = (sy.floor() as i64).clamp(0, height as i64 - 1) as u32;
        let y1 = (y0 + 1).min(height as u32 - 1);
        let fy = (sy - sy.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let sx = (x as f32 + 0.5) * inv_scale - 0.5;
            let x0 = (sx.floor() as i64).clamp(0, width as i64 - 1) as u32;
            let x1 = (x0 + 1).min(width as u32 - 1);
            let fx = (sx - sx.floor()).clamp(0.0, 1.0);

            let (tl, tr) = (frame.get_pixel(x0, y0), frame.get_pixel(x1, y0));
            let (bl, br) = (frame.get_pixel(x0, y1), frame.get_pixel(x1, y1));

            for c in 0..3 {
                let v = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                    + tr[c] as f32 * fx * (1.0 - fy)
                    + bl[c] as f32 * (1.0 - fx) * fy
                    + br[c] as f32 * fx * fy;
                tensor[[0, c, y + y_off, x + x_off]] = (v.round() - SCRFD_MEAN) / SCRFD_STD;
            }
        }
    }

    (tensor, letterbox)
}

/// Map stride heads to output tensor indices.
///
/// Exports name tensors either "score_8"/"bbox_16"/"kps_32" or with opaque
/// numeric ids; the latter follow the positional layout
/// [scores 8/16/32, bboxes 8/16/32, kps 8/16/32].
fn resolve_heads(names: &[String]) -> [StrideHead; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideHead>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(StrideHead {
                score: find("score", stride)?,
                bbox: find("bbox", stride)?,
                kps: find("kps", stride)?,
            })
        })
        .collect();

    match named {
        Some(heads) => [heads[0], heads[1], heads[2]],
        None => {
            tracing::debug!(?names, "SCRFD output names not recognized, using positional mapping");
            std::array::from_fn(|i| StrideHead {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

struct StrideTensors<'a> {
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// Decode detections for a single stride level into frame coordinates.
fn decode_stride(
    t: StrideTensors<'_>,
    stride: usize,
    input_size: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = input_size / stride;
    let grid_h = input_size / stride;
    let step = stride as f32;
    let mut out = Vec::new();

    for idx in 0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL {
        let score = t.scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }
        let Some(d) = t.bboxes.get(idx * 4..idx * 4 + 4) else {
            continue;
        };

        let cell = idx / SCRFD_ANCHORS_PER_CELL;
        let ax = (cell % grid_w) as f32 * step;
        let ay = (cell / grid_w) as f32 * step;

        let (x1, y1) = letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
        let (x2, y2) = letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

        let landmarks: Option<[(f32, f32); 5]> = t.kps.get(idx * 10..idx * 10 + 10).map(|k| {
            std::array::from_fn(|i| letterbox.unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step))
        });

        out.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    out
}

fn by_confidence_desc(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal)
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(by_confidence_desc);

    let mut keep: Vec<BoundingBox> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
