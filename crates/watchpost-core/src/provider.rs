//! Detection-and-embedding provider.
//!
//! [`DetectionProvider`] is the seam the gallery builder and the frame
//! pipeline call through. [`OnnxFaceEngine`] is the production
//! implementation (SCRFD + ArcFace); [`EngineCell`] owns it and loads it
//! lazily, at most once per process, no matter how many threads ask first.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default minimum detector confidence for a face to be reported.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.60;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("face models failed to load: {0}")]
    Load(#[source] Box<ProviderError>),
    #[error("face engine lock poisoned")]
    Poisoned,
}

impl ProviderError {
    /// True when the failure is about one frame, not the provider itself.
    pub fn is_per_frame(&self) -> bool {
        !matches!(self, ProviderError::Load(_) | ProviderError::Poisoned)
    }
}

/// Anything that turns a frame into a list of faces with embeddings.
pub trait DetectionProvider: Send + Sync {
    /// Detect faces and embed each one.
    ///
    /// Faces narrower or shorter than `min_face_size` pixels, or below the
    /// provider's confidence floor, are dropped. Returned embeddings are
    /// unit-norm.
    fn detect_and_embed(
        &self,
        frame: &RgbImage,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError>;
}

impl<P: DetectionProvider + ?Sized> DetectionProvider for Arc<P> {
    fn detect_and_embed(
        &self,
        frame: &RgbImage,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        (**self).detect_and_embed(frame, min_face_size)
    }
}

/// Where to find the models and how strict to be about detections.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model_dir: PathBuf,
    pub min_confidence: f32,
}

impl EngineConfig {
    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

/// `$XDG_DATA_HOME/watchpost/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("watchpost")
        .join("models")
}

struct Models {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

/// SCRFD detector + ArcFace recognizer behind one lock.
///
/// ONNX sessions need exclusive access to run, so concurrent callers (the
/// frame pipeline and a gallery refresh) take turns.
pub struct OnnxFaceEngine {
    models: Mutex<Models>,
    min_confidence: f32,
}

impl OnnxFaceEngine {
    pub fn load(config: &EngineConfig) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(&config.scrfd_model_path())?;
        let recognizer = FaceRecognizer::load(&config.arcface_model_path())?;
        tracing::info!(
            model_dir = %config.model_dir.display(),
            min_confidence = config.min_confidence,
            "face engine ready"
        );
        Ok(Self {
            models: Mutex::new(Models {
                detector,
                recognizer,
            }),
            min_confidence: config.min_confidence,
        })
    }
}

impl DetectionProvider for OnnxFaceEngine {
    fn detect_and_embed(
        &self,
        frame: &RgbImage,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        let mut models = self.models.lock().map_err(|_| ProviderError::Poisoned)?;
        let boxes = models.detector.detect(frame)?;

        let mut faces = Vec::with_capacity(boxes.len());
        for b in &boxes {
            if b.width < min_face_size as f32 || b.height < min_face_size as f32 {
                continue;
            }
            if b.confidence < self.min_confidence {
                continue;
            }
            let embedding = match models.recognizer.extract(frame, b) {
                Ok(e) => e,
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = b.confidence, "face without landmarks skipped");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            faces.push(DetectedFace {
                bbox: b.to_rect(frame.width(), frame.height()),
                confidence: b.confidence,
                embedding,
            });
        }

        tracing::trace!(raw = boxes.len(), kept = faces.len(), "detect_and_embed");
        Ok(faces)
    }
}

type Loader<P> = Box<dyn Fn() -> Result<P, ProviderError> + Send + Sync>;

/// Owns a provider that is expensive to construct and builds it on first use.
///
/// Construct one at process start and share it by `Arc`. The first caller
/// runs the loader under a mutex; everyone racing it waits and then sees the
/// same instance. A failed load is not cached, so a later call retries.
pub struct EngineCell<P = OnnxFaceEngine> {
    engine: OnceLock<Arc<P>>,
    init: Mutex<()>,
    loader: Loader<P>,
}

impl EngineCell<OnnxFaceEngine> {
    pub fn onnx(config: EngineConfig) -> Self {
        Self::with_loader(move || OnnxFaceEngine::load(&config))
    }
}

impl<P: Send + Sync + 'static> EngineCell<P> {
    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn() -> Result<P, ProviderError> + Send + Sync + 'static,
    {
        Self {
            engine: OnceLock::new(),
            init: Mutex::new(()),
            loader: Box::new(loader),
        }
    }

    /// Wrap an already-constructed provider.
    pub fn ready(provider: P) -> Self {
        let cell = Self::with_loader(|| Err(ProviderError::Poisoned));
        let _ = cell.engine.set(Arc::new(provider));
        cell
    }

    /// Return the provider, loading it if this is the first call.
    pub fn get(&self) -> Result<Arc<P>, ProviderError> {
        if let Some(engine) = self.engine.get() {
            return Ok(Arc::clone(engine));
        }

        let _guard = self.init.lock().map_err(|_| ProviderError::Poisoned)?;
        if let Some(engine) = self.engine.get() {
            return Ok(Arc::clone(engine));
        }

        let engine = Arc::new((self.loader)().map_err(|e| ProviderError::Load(Box::new(e)))?);
        let _ = self.engine.set(Arc::clone(&engine));
        Ok(engine)
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.get().is_some()
    }
}

impl<P: DetectionProvider + 'static> DetectionProvider for EngineCell<P> {
    fn detect_and_embed(
        &self,
        frame: &RgbImage,
        min_face_size: u32,
    ) -> Result<Vec<DetectedFace>, ProviderError> {
        self.get()?.detect_and_embed(frame, min_face_size)
    }
}
