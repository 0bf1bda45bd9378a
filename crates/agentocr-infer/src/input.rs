use std::path::{Path, PathBuf};

use image::{DynamicImage, RgbImage};

use crate::error::InferError;
use crate::image_io::read_image;

/// Image handed to the text system, either decoded or still on disk.
#[derive(Debug, Clone)]
pub enum OcrInput {
    Image(RgbImage),
    Path(PathBuf),
}

impl OcrInput {
    /// Returns the decoded image, reading it from disk for the path variant.
    pub fn into_image(self) -> Result<RgbImage, InferError> {
        match self {
            OcrInput::Image(image) => Ok(image),
            OcrInput::Path(path) => read_image(&path),
        }
    }
}

impl From<RgbImage> for OcrInput {
    fn from(value: RgbImage) -> Self {
        OcrInput::Image(value)
    }
}

impl From<DynamicImage> for OcrInput {
    fn from(value: DynamicImage) -> Self {
        OcrInput::Image(value.to_rgb8())
    }
}

impl From<PathBuf> for OcrInput {
    fn from(value: PathBuf) -> Self {
        OcrInput::Path(value)
    }
}

impl From<&Path> for OcrInput {
    fn from(value: &Path) -> Self {
        OcrInput::Path(value.to_path_buf())
    }
}

impl From<&str> for OcrInput {
    fn from(value: &str) -> Self {
        OcrInput::Path(PathBuf::from(value))
    }
}

impl From<String> for OcrInput {
    fn from(value: String) -> Self {
        OcrInput::Path(PathBuf::from(value))
    }
}

/// Selects which pipeline stages run for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageFlags {
    pub det: bool,
    pub cls: bool,
    pub rec: bool,
    /// Include orientation results in the returned value.
    pub return_cls: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            det: true,
            cls: true,
            rec: true,
            return_cls: false,
        }
    }
}

impl StageFlags {
    pub fn with_det(mut self, value: bool) -> Self {
        self.det = value;
        self
    }

    pub fn with_cls(mut self, value: bool) -> Self {
        self.cls = value;
        self
    }

    pub fn with_rec(mut self, value: bool) -> Self {
        self.rec = value;
        self
    }

    pub fn with_return_cls(mut self, value: bool) -> Self {
        self.return_cls = value;
        self
    }
}
