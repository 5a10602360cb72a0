use crate::camera::CameraError;
use crate::frame::Frame;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("video source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Anything that yields frames one at a time.
///
/// A failed `read` ends the stream; callers do not retry.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Frame, SourceError>;

    /// Give the underlying device back. Idempotent.
    fn release(&mut self) {}
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn read(&mut self) -> Result<Frame, SourceError> {
        (**self).read()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
