//! Motion-gated throttle in front of the detection provider.

use watchpost_core::DetectedFace;

/// Caches the last detection result and decides when to refresh it.
///
/// The provider runs only on motion frames whose global index is a multiple
/// of `every`; motion frames in between reuse the cached list. A frame
/// without motion clears the cache.
#[derive(Debug)]
pub struct FaceSampler {
    every: u64,
    last_faces: Vec<DetectedFace>,
}

impl FaceSampler {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            last_faces: Vec::new(),
        }
    }

    pub fn should_sample(&self, frame_index: u64, motion: bool) -> bool {
        motion && frame_index % self.every == 0
    }

    /// Faces for this frame, calling `detect` only on sampling slots.
    pub fn sample<E>(
        &mut self,
        frame_index: u64,
        motion: bool,
        detect: impl FnOnce() -> Result<Vec<DetectedFace>, E>,
    ) -> Result<&[DetectedFace], E> {
        if !motion {
            self.last_faces.clear();
        } else if self.should_sample(frame_index, motion) {
            self.last_faces = detect()?;
        }
        Ok(&self.last_faces)
    }

    pub fn last_faces(&self) -> &[DetectedFace] {
        &self.last_faces
    }
}
