use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Command, FromArgMatches, ValueEnum};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::InferError;

pub const DEFAULT_DET_LIMIT_SIDE_LEN: u32 = 960;
pub const DEFAULT_DET_DB_THRESH: f32 = 0.3;
pub const DEFAULT_DET_DB_BOX_THRESH: f32 = 0.6;
pub const DEFAULT_DET_DB_UNCLIP_RATIO: f32 = 1.5;
pub const DEFAULT_MAX_CANDIDATES: usize = 1000;
pub const DEFAULT_REC_BATCH_NUM: usize = 6;
pub const DEFAULT_CLS_BATCH_NUM: usize = 6;
pub const DEFAULT_DROP_SCORE: f32 = 0.5;
pub const DEFAULT_CLS_THRESH: f32 = 0.9;
pub const DEFAULT_OUTPUT_DIR: &str = "./inference_results";

/// Input tensor shape as `channels, height, width`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageShape {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
}

impl ImageShape {
    pub const fn new(channels: u32, height: u32, width: u32) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }
}

impl FromStr for ImageShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dims = s
            .split(',')
            .map(|part| part.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("invalid image shape '{s}': {err}"))?;
        match dims.as_slice() {
            [channels, height, width] if *height > 0 && *width > 0 => {
                Ok(Self::new(*channels, *height, *width))
            }
            _ => Err(format!(
                "invalid image shape '{s}': expected 'channels, height, width'"
            )),
        }
    }
}

impl fmt::Display for ImageShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}, {}", self.channels, self.height, self.width)
    }
}

impl Serialize for ImageShape {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageShape {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How `det_limit_side_len` constrains the detector input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitType {
    /// Shrink so the longest side is at most the limit.
    Max,
    /// Grow so the shortest side is at least the limit.
    Min,
}

/// Options shared by every stage of the text system and the batch functions.
#[derive(Debug, Clone, PartialEq, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct InferArgs {
    /// Run inference on the CUDA execution provider
    #[arg(long = "use_gpu", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_gpu: bool,

    /// Text detection model (ONNX file)
    #[arg(long = "det_model_dir", value_name = "PATH")]
    pub det_model_dir: Option<PathBuf>,

    /// Side length limit applied before detection
    #[arg(long = "det_limit_side_len", default_value_t = DEFAULT_DET_LIMIT_SIDE_LEN)]
    pub det_limit_side_len: u32,

    /// Whether the side limit is a maximum or a minimum
    #[arg(long = "det_limit_type", value_enum, default_value_t = LimitType::Max)]
    pub det_limit_type: LimitType,

    /// Binarization threshold for the detection probability map
    #[arg(long = "det_db_thresh", default_value_t = DEFAULT_DET_DB_THRESH)]
    pub det_db_thresh: f32,

    /// Minimum mean probability for a detected box
    #[arg(long = "det_db_box_thresh", default_value_t = DEFAULT_DET_DB_BOX_THRESH)]
    pub det_db_box_thresh: f32,

    /// Expansion ratio applied to detected boxes
    #[arg(long = "det_db_unclip_ratio", default_value_t = DEFAULT_DET_DB_UNCLIP_RATIO)]
    pub det_db_unclip_ratio: f32,

    /// Upper bound on candidate regions per image
    #[arg(long = "max_candidates", default_value_t = DEFAULT_MAX_CANDIDATES)]
    pub max_candidates: usize,

    /// Text recognition model (ONNX file)
    #[arg(long = "rec_model_dir", value_name = "PATH")]
    pub rec_model_dir: Option<PathBuf>,

    /// Recognizer input shape as "channels, height, width"
    #[arg(long = "rec_image_shape", default_value_t = ImageShape::new(3, 48, 320))]
    pub rec_image_shape: ImageShape,

    /// Number of text lines recognized per forward pass
    #[arg(long = "rec_batch_num", default_value_t = DEFAULT_REC_BATCH_NUM, value_parser = clap::value_parser!(usize))]
    pub rec_batch_num: usize,

    /// Character dictionary, one symbol per line
    #[arg(long = "rec_char_dict_path", value_name = "PATH")]
    pub rec_char_dict_path: Option<PathBuf>,

    /// Append a space symbol to the character dictionary
    #[arg(long = "use_space_char", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_space_char: bool,

    /// Recognized lines scoring below this value are dropped
    #[arg(long = "drop_score", default_value_t = DEFAULT_DROP_SCORE)]
    pub drop_score: f32,

    /// Run the orientation classifier inside the text system
    #[arg(long = "use_angle_cls", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub use_angle_cls: bool,

    /// Text orientation classification model (ONNX file)
    #[arg(long = "cls_model_dir", value_name = "PATH")]
    pub cls_model_dir: Option<PathBuf>,

    /// Classifier input shape as "channels, height, width"
    #[arg(long = "cls_image_shape", default_value_t = ImageShape::new(3, 48, 192))]
    pub cls_image_shape: ImageShape,

    /// Orientation labels in model output order
    #[arg(long = "label_list", value_delimiter = ',', default_values_t = default_label_list())]
    pub label_list: Vec<String>,

    /// Number of crops classified per forward pass
    #[arg(long = "cls_batch_num", default_value_t = DEFAULT_CLS_BATCH_NUM)]
    pub cls_batch_num: usize,

    /// Minimum score before a crop labelled 180 is rotated
    #[arg(long = "cls_thresh", default_value_t = DEFAULT_CLS_THRESH)]
    pub cls_thresh: f32,

    /// Directory receiving batch result files
    #[arg(long = "output_dir", default_value = DEFAULT_OUTPUT_DIR)]
    pub output_dir: PathBuf,

    /// Number of worker processes used by batch modes
    #[arg(long = "total_process_num", default_value_t = 1, value_parser = clap::value_parser!(usize))]
    pub total_process_num: usize,

    /// Index of this worker inside a batch run
    #[arg(long = "process_id", default_value_t = 0)]
    pub process_id: usize,

    /// Draw a progress bar during single-process batch runs
    #[arg(long = "show_progress", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    pub show_progress: bool,
}

fn default_label_list() -> Vec<String> {
    vec!["0".to_string(), "180".to_string()]
}

impl Default for InferArgs {
    fn default() -> Self {
        Self {
            use_gpu: false,
            det_model_dir: None,
            det_limit_side_len: DEFAULT_DET_LIMIT_SIDE_LEN,
            det_limit_type: LimitType::Max,
            det_db_thresh: DEFAULT_DET_DB_THRESH,
            det_db_box_thresh: DEFAULT_DET_DB_BOX_THRESH,
            det_db_unclip_ratio: DEFAULT_DET_DB_UNCLIP_RATIO,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            rec_model_dir: None,
            rec_image_shape: ImageShape::new(3, 48, 320),
            rec_batch_num: DEFAULT_REC_BATCH_NUM,
            rec_char_dict_path: None,
            use_space_char: true,
            drop_score: DEFAULT_DROP_SCORE,
            use_angle_cls: false,
            cls_model_dir: None,
            cls_image_shape: ImageShape::new(3, 48, 192),
            label_list: default_label_list(),
            cls_batch_num: DEFAULT_CLS_BATCH_NUM,
            cls_thresh: DEFAULT_CLS_THRESH,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            total_process_num: 1,
            process_id: 0,
            show_progress: true,
        }
    }
}

impl InferArgs {
    /// Worker count with the zero case folded into a single process.
    pub fn process_count(&self) -> usize {
        self.total_process_num.max(1)
    }

    /// Copy of these arguments bound to one worker index.
    pub fn for_process(&self, process_id: Option<usize>) -> InferArgs {
        InferArgs {
            process_id: process_id.unwrap_or(self.process_id),
            ..self.clone()
        }
    }
}

/// Argument definitions for the inference options, ready to be extended by a binary.
pub fn init_args() -> Command {
    InferArgs::augment_args(Command::new("agentocr"))
}

/// Parses a command line against [`init_args`] alone.
pub fn parse_cli_args<I, T>(argv: I) -> Result<InferArgs, InferError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = init_args()
        .try_get_matches_from(argv)
        .map_err(|err| InferError::configuration(err.to_string()))?;
    InferArgs::from_arg_matches(&matches).map_err(|err| InferError::configuration(err.to_string()))
}

/// Builds an argument set from a configuration object layered over the defaults.
pub fn parse_args(config: &Value) -> Result<InferArgs, InferError> {
    let Value::Object(overrides) = config else {
        return Err(InferError::configuration(format!(
            "configuration must be a JSON object, got {}",
            value_kind(config)
        )));
    };
    merge_overrides(&InferArgs::default(), overrides)
}

/// Overlays `overrides` onto the serialized form of `base`.
///
/// Keys present in `overrides` replace same-named values in `base`. Keys that
/// `base` does not know are reported and skipped.
pub fn merge_overrides<T>(base: &T, overrides: &Map<String, Value>) -> Result<T, InferError>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged = match serde_json::to_value(base) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            return Err(InferError::configuration(format!(
                "cannot merge configuration into {}",
                value_kind(&other)
            )));
        }
        Err(err) => return Err(InferError::configuration(err.to_string())),
    };

    for (key, value) in overrides {
        if !merged.contains_key(key) {
            warn!(key = %key, "ignoring unknown configuration key");
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }

    serde_json::from_value(Value::Object(merged))
        .map_err(|err| InferError::configuration(format!("invalid configuration value: {err}")))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn image_shape_parses_python_style_strings() {
        let shape: ImageShape = "3, 32, 320".parse().unwrap();
        assert_eq!(shape, ImageShape::new(3, 32, 320));
        assert_eq!(shape.to_string(), "3, 32, 320");
        assert!("3,48".parse::<ImageShape>().is_err());
        assert!("3, 0, 100".parse::<ImageShape>().is_err());
    }

    #[test]
    fn cli_defaults_match_default_impl() {
        let parsed = parse_cli_args(["agentocr"]).unwrap();
        assert_eq!(parsed, InferArgs::default());
    }

    #[test]
    fn cli_flags_use_underscore_names() {
        let parsed = parse_cli_args([
            "agentocr",
            "--use_gpu",
            "true",
            "--total_process_num",
            "4",
            "--label_list",
            "0,90,180,270",
            "--rec_image_shape",
            "3, 32, 100",
        ])
        .unwrap();
        assert!(parsed.use_gpu);
        assert_eq!(parsed.total_process_num, 4);
        assert_eq!(parsed.label_list, vec!["0", "90", "180", "270"]);
        assert_eq!(parsed.rec_image_shape, ImageShape::new(3, 32, 100));
    }

    #[test]
    fn parse_args_layers_config_over_defaults() {
        let args = parse_args(&json!({
            "total_process_num": 3,
            "det_model_dir": "models/det.onnx",
            "rec_image_shape": "3, 32, 320",
        }))
        .unwrap();
        assert_eq!(args.total_process_num, 3);
        assert_eq!(args.det_model_dir, Some(PathBuf::from("models/det.onnx")));
        assert_eq!(args.rec_image_shape, ImageShape::new(3, 32, 320));
        assert_eq!(args.drop_score, DEFAULT_DROP_SCORE);
    }

    #[test]
    fn parse_args_rejects_non_objects() {
        let err = parse_args(&json!(["total_process_num", 2])).unwrap_err();
        assert!(matches!(err, InferError::Configuration { .. }));
    }

    #[test]
    fn parse_args_rejects_mistyped_values() {
        let err = parse_args(&json!({ "total_process_num": "many" })).unwrap_err();
        assert!(matches!(err, InferError::Configuration { .. }));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let args = parse_args(&json!({ "enable_mkldnn": true, "cls_thresh": 0.5 })).unwrap();
        assert_eq!(args.cls_thresh, 0.5);
    }

    #[test]
    fn process_count_never_reports_zero() {
        let args = InferArgs {
            total_process_num: 0,
            ..InferArgs::default()
        };
        assert_eq!(args.process_count(), 1);
    }
}
