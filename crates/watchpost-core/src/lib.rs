//! watchpost-core: face pipeline building blocks.
//!
//! SCRFD detection and ArcFace embeddings via ONNX Runtime, a swappable
//! reference gallery, nearest-identity matching, frame-differencing motion
//! gating, and the on-disk roster and event log.

pub mod alignment;
pub mod detector;
pub mod events;
pub mod gallery;
pub mod matcher;
pub mod motion;
pub mod provider;
pub mod recognizer;
pub mod roster;
pub mod types;

pub use events::{EventLog, EventRecord, SnapshotStore, UNKNOWN_LABEL};
pub use gallery::{Gallery, GalleryStore};
pub use matcher::{best_match, MatchMetric};
pub use motion::{MotionConfig, MotionGate, MotionResult};
pub use provider::{DetectionProvider, EngineCell, EngineConfig, OnnxFaceEngine};
pub use roster::Roster;
pub use types::{BoundingBox, DetectedFace, Embedding, Identity, MatchResult, Rect};
