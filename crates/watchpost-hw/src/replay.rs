//! Frame source that plays back a directory of still images.

use crate::frame::Frame;
use crate::source::{FrameSource, SourceError};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Yields every image under a directory in sorted path order, then stops.
pub struct ReplaySource {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
    first: Option<Frame>,
    sequence: u32,
}

impl ReplaySource {
    /// Scan `dir` and decode the first image.
    ///
    /// Fails if the directory is unreadable, empty, or its first image
    /// does not decode.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref().to_path_buf();
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| SourceError::SourceUnavailable(format!("{}: {e}", dir.display())))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        files.sort();

        let mut source = Self {
            dir,
            pending: files.into(),
            first: None,
            sequence: 0,
        };
        let first = source.next_frame()?;
        tracing::info!(
            dir = %source.dir.display(),
            frames = source.pending.len() + 1,
            width = first.width(),
            height = first.height(),
            "replay source opened"
        );
        source.first = Some(first);
        Ok(source)
    }

    fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let path = self.pending.pop_front().ok_or_else(|| {
            SourceError::SourceUnavailable(format!("{}: no more frames", self.dir.display()))
        })?;
        let image = image::open(&path)
            .map_err(|source| SourceError::Decode { path, source })?
            .to_rgb8();
        let frame = Frame::new(image, self.sequence);
        self.sequence += 1;
        Ok(frame)
    }
}

impl FrameSource for ReplaySource {
    fn read(&mut self) -> Result<Frame, SourceError> {
        match self.first.take() {
            Some(frame) => Ok(frame),
            None => self.next_frame(),
        }
    }

    fn release(&mut self) {
        self.pending.clear();
        self.first = None;
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
