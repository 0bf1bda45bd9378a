use image::RgbImage;
use image::imageops;
use tracing::debug;

use crate::args::InferArgs;
use crate::backends::{build_classifier, build_detector, build_recognizer};
use crate::error::InferError;
use crate::input::StageFlags;
use crate::result::{OcrLine, OcrResult, Orientation, TextBox};
use crate::stages::{TextClassifier, TextDetector, TextRecognizer};

/// Boxes whose tops differ by less than this many pixels share a line.
const SAME_LINE_TOLERANCE: f32 = 10.0;
/// Crops at least this much taller than wide are treated as vertical text.
const VERTICAL_RATIO: f32 = 1.5;

/// Handle that answers single-image OCR calls.
pub trait TextPipeline: Send {
    fn predict(&mut self, image: &RgbImage, flags: StageFlags) -> Result<OcrResult, InferError>;
}

/// Detector, classifier and recognizer composed into one pipeline.
pub struct TextSystem {
    detector: Option<Box<dyn TextDetector>>,
    classifier: Option<Box<dyn TextClassifier>>,
    recognizer: Option<Box<dyn TextRecognizer>>,
    drop_score: f32,
}

impl TextSystem {
    pub fn from_stages(
        detector: Option<Box<dyn TextDetector>>,
        classifier: Option<Box<dyn TextClassifier>>,
        recognizer: Option<Box<dyn TextRecognizer>>,
        drop_score: f32,
    ) -> Self {
        Self {
            detector,
            classifier,
            recognizer,
            drop_score,
        }
    }

    /// Loads every model the arguments point at.
    ///
    /// The classifier is only loaded when `use_angle_cls` is set.
    pub fn new(args: &InferArgs) -> Result<Self, InferError> {
        let detector = match args.det_model_dir {
            Some(_) => Some(build_detector(args)?),
            None => None,
        };
        let classifier = match (args.use_angle_cls, args.cls_model_dir.is_some()) {
            (true, true) => Some(build_classifier(args)?),
            (true, false) => {
                return Err(InferError::configuration(
                    "use_angle_cls is set but cls_model_dir is missing",
                ));
            }
            (false, _) => None,
        };
        let recognizer = match args.rec_model_dir {
            Some(_) => Some(build_recognizer(args)?),
            None => None,
        };
        if detector.is_none() && recognizer.is_none() {
            return Err(InferError::configuration(
                "neither det_model_dir nor rec_model_dir is configured",
            ));
        }
        Ok(Self::from_stages(
            detector,
            classifier,
            recognizer,
            args.drop_score,
        ))
    }

    pub fn detect(&self, image: &RgbImage) -> Result<Vec<TextBox>, InferError> {
        let detector = self
            .detector
            .as_deref()
            .ok_or_else(|| InferError::configuration("detection requested without a detector"))?;
        let mut boxes = detector.detect(image)?;
        sort_boxes(&mut boxes);
        Ok(boxes)
    }

    fn classify(
        &self,
        crops: &mut [RgbImage],
        enabled: bool,
    ) -> Result<Option<Vec<Orientation>>, InferError> {
        match self.classifier.as_deref() {
            Some(classifier) if enabled => classifier.classify(crops).map(Some),
            _ => Ok(None),
        }
    }

    fn recognizer(&self) -> Result<&dyn TextRecognizer, InferError> {
        self.recognizer
            .as_deref()
            .ok_or_else(|| InferError::configuration("recognition requested without a recognizer"))
    }

    pub fn run(&self, image: &RgbImage, flags: StageFlags) -> Result<OcrResult, InferError> {
        let mut result = OcrResult::empty();

        if flags.det {
            let boxes = self.detect(image)?;
            debug!(boxes = boxes.len(), "detected text regions");
            if !flags.rec {
                result.lines = boxes
                    .into_iter()
                    .map(|bbox| OcrLine {
                        bbox: Some(bbox),
                        recognition: None,
                    })
                    .collect();
                return Ok(result);
            }

            let mut crops: Vec<RgbImage> =
                boxes.iter().map(|bbox| crop_box(image, bbox)).collect();
            let orientations = self.classify(&mut crops, flags.cls)?;
            let recognitions = self.recognizer()?.recognize(&crops)?;
            if recognitions.len() != boxes.len() {
                return Err(InferError::backend(format!(
                    "recognizer returned {} results for {} regions",
                    recognitions.len(),
                    boxes.len()
                )));
            }

            // Orientations stay index-aligned with the kept lines.
            let mut orientations = orientations.map(Vec::into_iter);
            let mut kept_orientations = Vec::new();
            for (bbox, rec) in boxes.into_iter().zip(recognitions) {
                let orientation = orientations.as_mut().and_then(Iterator::next);
                if rec.score < self.drop_score {
                    continue;
                }
                result.lines.push(OcrLine {
                    bbox: Some(bbox),
                    recognition: Some(rec),
                });
                kept_orientations.extend(orientation);
            }
            if flags.return_cls && orientations.is_some() {
                result.orientations = Some(kept_orientations);
            }
            return Ok(result);
        }

        let mut crops = vec![image.clone()];
        let orientations = self.classify(&mut crops, flags.cls)?;
        if flags.rec {
            result.lines = self
                .recognizer()?
                .recognize(&crops)?
                .into_iter()
                .map(|rec| OcrLine {
                    bbox: None,
                    recognition: Some(rec),
                })
                .collect();
        }
        // Without recognition the orientation is the only output.
        if flags.return_cls || !flags.rec {
            result.orientations = orientations;
        }
        Ok(result)
    }
}

impl TextPipeline for TextSystem {
    fn predict(&mut self, image: &RgbImage, flags: StageFlags) -> Result<OcrResult, InferError> {
        self.run(image, flags)
    }
}

/// Orders boxes top-to-bottom, then left-to-right within a line.
pub fn sort_boxes(boxes: &mut [TextBox]) {
    boxes.sort_by(|a, b| {
        a.top()
            .total_cmp(&b.top())
            .then_with(|| a.left().total_cmp(&b.left()))
    });
    for i in 0..boxes.len().saturating_sub(1) {
        let mut j = i;
        while (boxes[j + 1].top() - boxes[j].top()).abs() < SAME_LINE_TOLERANCE
            && boxes[j + 1].left() < boxes[j].left()
        {
            boxes.swap(j, j + 1);
            if j == 0 {
                break;
            }
            j -= 1;
        }
    }
}

/// Cuts the bounding rectangle of `bbox` out of `image`.
///
/// Tall crops are turned a quarter counter-clockwise so vertical text reads
/// left to right.
pub fn crop_box(image: &RgbImage, bbox: &TextBox) -> RgbImage {
    let (width, height) = image.dimensions();
    let left = bbox.left().floor().clamp(0.0, width as f32) as u32;
    let top = bbox.top().floor().clamp(0.0, height as f32) as u32;
    let right = bbox.right().ceil().clamp(left as f32, width as f32) as u32;
    let bottom = bbox.bottom().ceil().clamp(top as f32, height as f32) as u32;
    let crop_w = (right - left).max(1).min(width.saturating_sub(left).max(1));
    let crop_h = (bottom - top).max(1).min(height.saturating_sub(top).max(1));

    let crop = imageops::crop_imm(image, left, top, crop_w, crop_h).to_image();
    if crop_h as f32 >= crop_w as f32 * VERTICAL_RATIO {
        imageops::rotate270(&crop)
    } else {
        crop
    }
}
