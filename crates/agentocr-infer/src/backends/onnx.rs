use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use image::RgbImage;
use image::imageops;
use ndarray::{Array4, CowArray, IxDyn};
use once_cell::sync::OnceCell;
use ort::environment::Environment;
use ort::error::OrtError;
use ort::execution_providers::ExecutionProvider;
use ort::session::{Session, SessionBuilder};
use ort::value::Value;
use tracing::{debug, info};

use crate::args::{ImageShape, InferArgs, LimitType};
use crate::error::InferError;
use crate::postprocess::{
    CharacterSet, DbParams, ProbabilityMap, boxes_from_map, decode_ctc, decode_orientations,
};
use crate::preprocess::{batch_tensor, detection_tensor};
use crate::result::{Orientation, Recognition, TextBox};
use crate::stages::{TextClassifier, TextDetector, TextRecognizer};

const ROTATED_LABEL: &str = "180";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Device {
    Cpu,
    Cuda,
}

impl Device {
    fn from_args(args: &InferArgs) -> Self {
        if args.use_gpu { Device::Cuda } else { Device::Cpu }
    }
}

#[derive(Debug, Clone)]
struct ModelHandle {
    _environment: Arc<Environment>,
    session: Arc<Session>,
}

struct ModelRegistry {
    environment: Arc<Environment>,
    handles: Mutex<HashMap<(PathBuf, Device), Arc<ModelHandle>>>,
}

impl ModelRegistry {
    fn new() -> Result<Self, InferError> {
        let environment = Environment::builder()
            .with_name("agentocr")
            .build()
            .map_err(map_environment_error)?;
        Ok(Self {
            environment: Arc::new(environment),
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn get(&self, path: &Path, device: Device) -> Result<Arc<ModelHandle>, InferError> {
        if !path.exists() {
            return Err(InferError::configuration(format!(
                "onnx model file '{}' does not exist",
                path.display()
            )));
        }

        let mut guard = self
            .handles
            .lock()
            .map_err(|_| InferError::backend("onnx registry poisoned"))?;
        let key = (path.to_path_buf(), device);
        if let Some(handle) = guard.get(&key) {
            return Ok(handle.clone());
        }

        let mut builder = SessionBuilder::new(&self.environment).map_err(map_session_error)?;
        if device == Device::Cuda {
            builder = builder
                .with_execution_providers([ExecutionProvider::CUDA(Default::default())])
                .map_err(map_session_error)?;
        }
        let session = builder
            .with_model_from_file(path)
            .map_err(map_session_error)?;
        info!(model = %path.display(), device = ?device, "loaded onnx model");

        let handle = Arc::new(ModelHandle {
            _environment: Arc::clone(&self.environment),
            session: Arc::new(session),
        });
        guard.insert(key, handle.clone());
        Ok(handle)
    }
}

static MODEL_REGISTRY: OnceCell<ModelRegistry> = OnceCell::new();

fn registry() -> Result<&'static ModelRegistry, InferError> {
    MODEL_REGISTRY.get_or_try_init(ModelRegistry::new)
}

fn load_model(
    path: Option<&PathBuf>,
    flag: &str,
    args: &InferArgs,
) -> Result<Arc<ModelHandle>, InferError> {
    let path = path.ok_or_else(|| InferError::configuration(format!("{flag} is not set")))?;
    registry()?.get(path, Device::from_args(args))
}

impl ModelHandle {
    fn run(
        &self,
        data: Vec<f32>,
        shape: [usize; 4],
    ) -> Result<(Vec<f32>, Vec<usize>), InferError> {
        let input = Array4::from_shape_vec(shape, data).map_err(|err| {
            InferError::backend(format!("failed to build ONNX input tensor: {err}"))
        })?;
        let session = &self.session;
        let allocator = session.allocator();
        let input_dyn: CowArray<'_, f32, IxDyn> = CowArray::from(input.view().into_dyn());
        let tensor = Value::from_array(allocator, &input_dyn).map_err(map_input_error)?;
        let outputs = session.run(vec![tensor]).map_err(map_inference_error)?;
        let tensor = outputs
            .into_iter()
            .next()
            .ok_or_else(|| InferError::backend("onnx model produced no output"))?
            .try_extract::<f32>()
            .map_err(map_inference_error)?;
        let view = tensor.view();
        let shape = view.shape().to_vec();
        let data = view.iter().copied().collect::<Vec<f32>>();
        Ok((data, shape))
    }
}

#[derive(Debug)]
pub struct OnnxDetector {
    model: Arc<ModelHandle>,
    limit_side_len: u32,
    limit_type: LimitType,
    params: DbParams,
}

impl OnnxDetector {
    pub fn new(args: &InferArgs) -> Result<Self, InferError> {
        let model = load_model(args.det_model_dir.as_ref(), "det_model_dir", args)?;
        Ok(Self {
            model,
            limit_side_len: args.det_limit_side_len,
            limit_type: args.det_limit_type,
            params: DbParams {
                thresh: args.det_db_thresh,
                box_thresh: args.det_db_box_thresh,
                unclip_ratio: args.det_db_unclip_ratio,
                max_candidates: args.max_candidates,
                ..DbParams::default()
            },
        })
    }
}

impl TextDetector for OnnxDetector {
    fn name(&self) -> &'static str {
        "onnx_det"
    }

    fn detect(&self, image: &RgbImage) -> Result<Vec<TextBox>, InferError> {
        let (data, shape) = detection_tensor(image, self.limit_side_len, self.limit_type);
        let (output, output_shape) = self.model.run(data, shape)?;
        let (height, width) = match output_shape.as_slice() {
            [_, _, h, w] | [_, h, w] | [h, w] => (*h, *w),
            other => {
                return Err(InferError::backend(format!(
                    "unexpected detector output dimensions {other:?}"
                )));
            }
        };
        let map = ProbabilityMap {
            data: &output,
            width,
            height,
        };
        let boxes = boxes_from_map(map, &self.params, image.dimensions())?;
        debug!(boxes = boxes.len(), "onnx detector finished");
        Ok(boxes)
    }
}

#[derive(Debug)]
pub struct OnnxClassifier {
    model: Arc<ModelHandle>,
    shape: ImageShape,
    labels: Vec<String>,
    batch_size: usize,
    thresh: f32,
}

impl OnnxClassifier {
    pub fn new(args: &InferArgs) -> Result<Self, InferError> {
        let model = load_model(args.cls_model_dir.as_ref(), "cls_model_dir", args)?;
        Ok(Self {
            model,
            shape: args.cls_image_shape,
            labels: args.label_list.clone(),
            batch_size: args.cls_batch_num.max(1),
            thresh: args.cls_thresh,
        })
    }
}

impl TextClassifier for OnnxClassifier {
    fn name(&self) -> &'static str {
        "onnx_cls"
    }

    fn classify(&self, crops: &mut [RgbImage]) -> Result<Vec<Orientation>, InferError> {
        let mut orientations = Vec::with_capacity(crops.len());
        for chunk in crops.chunks_mut(self.batch_size) {
            let (data, shape) = batch_tensor(chunk, self.shape);
            let (output, output_shape) = self.model.run(data, shape)?;
            let decoded = decode_orientations(&output, &output_shape, &self.labels)?;
            for (crop, orientation) in chunk.iter_mut().zip(decoded.iter()) {
                if orientation.label.contains(ROTATED_LABEL) && orientation.score > self.thresh {
                    imageops::rotate180_in_place(crop);
                }
            }
            orientations.extend(decoded);
        }
        Ok(orientations)
    }
}

#[derive(Debug)]
pub struct OnnxRecognizer {
    model: Arc<ModelHandle>,
    shape: ImageShape,
    charset: Arc<CharacterSet>,
    batch_size: usize,
}

impl OnnxRecognizer {
    pub fn new(args: &InferArgs) -> Result<Self, InferError> {
        let model = load_model(args.rec_model_dir.as_ref(), "rec_model_dir", args)?;
        let charset = match args.rec_char_dict_path.as_ref() {
            Some(path) => {
                let contents =
                    fs::read_to_string(path).map_err(|err| InferError::io(path, err))?;
                CharacterSet::from_dictionary(&contents, args.use_space_char)
            }
            None => CharacterSet::ascii(args.use_space_char),
        };
        Ok(Self {
            model,
            shape: args.rec_image_shape,
            charset: Arc::new(charset),
            batch_size: args.rec_batch_num.max(1),
        })
    }
}

impl TextRecognizer for OnnxRecognizer {
    fn name(&self) -> &'static str {
        "onnx_rec"
    }

    fn recognize(&self, crops: &[RgbImage]) -> Result<Vec<Recognition>, InferError> {
        let mut recognitions = Vec::with_capacity(crops.len());
        for chunk in crops.chunks(self.batch_size) {
            let (data, shape) = batch_tensor(chunk, self.shape);
            let (output, output_shape) = self.model.run(data, shape)?;
            recognitions.extend(decode_ctc(&output, &output_shape, &self.charset)?);
        }
        Ok(recognitions)
    }
}

fn map_environment_error(err: OrtError) -> InferError {
    map_schema_conflict(err, "failed to initialise ONNX runtime environment")
}

fn map_session_error(err: OrtError) -> InferError {
    map_schema_conflict(err, "failed to load ONNX model")
}

fn map_input_error(err: OrtError) -> InferError {
    InferError::backend(format!("failed to prepare ONNX input: {err}"))
}

fn map_inference_error(err: OrtError) -> InferError {
    InferError::backend(format!("ONNX inference failed: {err}"))
}

fn map_schema_conflict(err: OrtError, context: &str) -> InferError {
    let message = err.to_string();
    if message.contains("Trying to register schema with name") {
        InferError::backend(format!(
            "{context}: detected ONNX Runtime schema registration conflict ({message})"
        ))
    } else {
        InferError::backend(format!("{context}: {message}"))
    }
}
