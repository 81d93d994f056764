//! Where camera frames and spectra come from.
//!
//! Hardware drivers live outside this crate; they only need to implement
//! [`FrameSource`] or [`SpectrumSource`]. The replay sources here feed
//! recorded data through the same path, for the CLI and for tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

use crate::data::loader::load_frame;
use crate::data::model::{Frame, RecordedSpectrum};

/// Image extensions accepted by [`ImageDirectory`].
const FRAME_EXTENSIONS: [&str; 3] = ["png", "tif", "tiff"];

/// Something that yields camera frames on demand. `None` ends the stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>>;
}

/// Something that yields spectra on demand. `None` ends the stream.
pub trait SpectrumSource {
    fn next_spectrum(&mut self) -> Result<Option<RecordedSpectrum>>;
}

// ---------------------------------------------------------------------------
// In-memory replay
// ---------------------------------------------------------------------------

pub struct ReplayFrames {
    queue: VecDeque<Frame>,
}

impl ReplayFrames {
    pub fn new(frames: impl IntoIterator<Item = Frame>) -> Self {
        Self {
            queue: frames.into_iter().collect(),
        }
    }
}

impl FrameSource for ReplayFrames {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(self.queue.pop_front())
    }
}

pub struct ReplaySpectra {
    queue: VecDeque<RecordedSpectrum>,
}

impl ReplaySpectra {
    pub fn new(spectra: impl IntoIterator<Item = RecordedSpectrum>) -> Self {
        Self {
            queue: spectra.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

impl SpectrumSource for ReplaySpectra {
    fn next_spectrum(&mut self) -> Result<Option<RecordedSpectrum>> {
        Ok(self.queue.pop_front())
    }
}

// ---------------------------------------------------------------------------
// Image directory
// ---------------------------------------------------------------------------

/// Frames read lazily from a directory of images, in file-name order.
pub struct ImageDirectory {
    paths: VecDeque<PathBuf>,
}

impl ImageDirectory {
    pub fn open(dir: &Path) -> Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| FRAME_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if is_image {
                paths.push(path);
            }
        }
        paths.sort();
        debug!("{} frames found in {}", paths.len(), dir.display());
        Ok(Self {
            paths: paths.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageDirectory {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match self.paths.pop_front() {
            Some(path) => load_frame(&path).map(Some),
            None => Ok(None),
        }
    }
}
