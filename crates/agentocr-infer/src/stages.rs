use image::RgbImage;

use crate::error::InferError;
use crate::result::{Orientation, Recognition, TextBox};

/// Locates text regions in a full image.
pub trait TextDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn detect(&self, image: &RgbImage) -> Result<Vec<TextBox>, InferError>;
}

/// Decides the orientation of text crops.
///
/// Implementations rotate crops in place when they are confidently upside down
/// and return one orientation per crop.
pub trait TextClassifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, crops: &mut [RgbImage]) -> Result<Vec<Orientation>, InferError>;
}

/// Converts cropped text lines into strings.
pub trait TextRecognizer: Send + Sync {
    fn name(&self) -> &'static str;

    fn recognize(&self, crops: &[RgbImage]) -> Result<Vec<Recognition>, InferError>;
}
