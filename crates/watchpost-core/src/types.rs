use serde::{Deserialize, Serialize};

/// Dimension of the ArcFace embeddings produced by the detection provider.
pub const EMBEDDING_DIM: usize = 512;

/// Tolerance used when checking that an embedding has unit length.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-6;

const NORM_EPSILON: f32 = 1e-12;

/// Sub-pixel face box in frame coordinates, as decoded by the SCRFD detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Round to an integer pixel rectangle clipped to a `width` x `height` frame.
    pub fn to_rect(&self, width: u32, height: u32) -> Rect {
        let x1 = self.x.round().clamp(0.0, width as f32) as i32;
        let y1 = self.y.round().clamp(0.0, height as f32) as i32;
        let x2 = (self.x + self.width).round().clamp(0.0, width as f32) as i32;
        let y2 = (self.y + self.height).round().clamp(0.0, height as f32) as i32;
        Rect {
            x: x1,
            y: y1,
            width: (x2 - x1).max(0) as u32,
            height: (y2 - y1).max(0) as u32,
        }
    }
}

/// Integer pixel rectangle `(x, y, w, h)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Build an embedding scaled to unit L2 norm.
    ///
    /// An all-zero vector stays all-zero rather than turning into NaNs.
    pub fn normalized(values: Vec<f32>, model_version: Option<String>) -> Self {
        let norm = l2_norm(&values);
        let values = values
            .into_iter()
            .map(|v| v / (norm + NORM_EPSILON))
            .collect();
        Self {
            values,
            model_version,
        }
    }

    /// Re-normalize in place. Provider output is trusted to be close to unit
    /// length, but gallery entries are always stored exactly normalized.
    pub fn renormalize(&mut self) {
        let norm = l2_norm(&self.values);
        for v in &mut self.values {
            *v /= norm + NORM_EPSILON;
        }
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Unit length within [`UNIT_NORM_TOLERANCE`], measured in f64.
    pub fn is_unit(&self) -> bool {
        (l2_norm_f64(&self.values) - 1.0).abs() <= f64::from(UNIT_NORM_TOLERANCE)
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Dot product. For two unit vectors this is their cosine similarity.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    l2_norm_f64(values) as f32
}

fn l2_norm_f64(values: &[f32]) -> f64 {
    values.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>().sqrt()
}

/// An enrolled person on the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub created_at: String,
}

/// One face found by the detection provider in a single frame.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: Rect,
    pub confidence: f32,
    pub embedding: Embedding,
}

/// Closest enrolled identity for a probe embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Identity id of the best match, `None` when no identity has gallery entries.
    pub identity: Option<String>,
    /// Distance to the best match; `f32::INFINITY` when nothing was compared.
    pub distance: f32,
}

impl MatchResult {
    pub fn none() -> Self {
        Self {
            identity: None,
            distance: f32::INFINITY,
        }
    }

    /// Recognition policy: known iff there is a match within `max_distance`.
    pub fn is_known(&self, max_distance: f32) -> bool {
        self.identity.is_some() && self.distance <= max_distance
    }
}
