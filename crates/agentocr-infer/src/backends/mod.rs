#[cfg(feature = "engine-onnx")]
pub mod onnx;

use crate::args::InferArgs;
use crate::error::InferError;
use crate::stages::{TextClassifier, TextDetector, TextRecognizer};

#[cfg(feature = "engine-onnx")]
pub fn build_detector(args: &InferArgs) -> Result<Box<dyn TextDetector>, InferError> {
    Ok(Box::new(onnx::OnnxDetector::new(args)?))
}

#[cfg(feature = "engine-onnx")]
pub fn build_classifier(args: &InferArgs) -> Result<Box<dyn TextClassifier>, InferError> {
    Ok(Box::new(onnx::OnnxClassifier::new(args)?))
}

#[cfg(feature = "engine-onnx")]
pub fn build_recognizer(args: &InferArgs) -> Result<Box<dyn TextRecognizer>, InferError> {
    Ok(Box::new(onnx::OnnxRecognizer::new(args)?))
}

#[cfg(not(feature = "engine-onnx"))]
pub fn build_detector(_: &InferArgs) -> Result<Box<dyn TextDetector>, InferError> {
    Err(no_backend())
}

#[cfg(not(feature = "engine-onnx"))]
pub fn build_classifier(_: &InferArgs) -> Result<Box<dyn TextClassifier>, InferError> {
    Err(no_backend())
}

#[cfg(not(feature = "engine-onnx"))]
pub fn build_recognizer(_: &InferArgs) -> Result<Box<dyn TextRecognizer>, InferError> {
    Err(no_backend())
}

#[cfg(not(feature = "engine-onnx"))]
fn no_backend() -> InferError {
    InferError::backend("no inference backend compiled; rebuild with the \"engine-onnx\" feature")
}
