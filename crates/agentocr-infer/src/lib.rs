pub mod args;
mod backends;
pub mod batch;
mod error;
pub mod image_io;
mod input;
pub mod postprocess;
pub mod preprocess;
mod result;
mod stages;
mod system;

pub use args::{ImageShape, InferArgs, LimitType, init_args, merge_overrides, parse_args};
pub use backends::{build_classifier, build_detector, build_recognizer};
#[cfg(feature = "engine-onnx")]
pub use backends::onnx::{OnnxClassifier, OnnxDetector, OnnxRecognizer};
pub use batch::{
    BatchMode, BatchSummary, UnknownMode, predict_cls, predict_det, predict_rec, predict_system,
};
pub use error::InferError;
pub use input::{OcrInput, StageFlags};
pub use result::{OcrLine, OcrResult, Orientation, Recognition, TextBox};
pub use stages::{TextClassifier, TextDetector, TextRecognizer};
pub use system::{TextPipeline, TextSystem, crop_box, sort_boxes};
