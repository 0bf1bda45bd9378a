use serde::{Deserialize, Serialize};

/// Quadrilateral text region in image coordinates, clockwise from top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    pub points: [[f32; 2]; 4],
    pub score: f32,
}

impl TextBox {
    pub fn from_rect(left: f32, top: f32, right: f32, bottom: f32, score: f32) -> Self {
        Self {
            points: [[left, top], [right, top], [right, bottom], [left, bottom]],
            score,
        }
    }

    pub fn left(&self) -> f32 {
        self.points.iter().map(|p| p[0]).fold(f32::INFINITY, f32::min)
    }

    pub fn top(&self) -> f32 {
        self.points.iter().map(|p| p[1]).fold(f32::INFINITY, f32::min)
    }

    pub fn right(&self) -> f32 {
        self.points
            .iter()
            .map(|p| p[0])
            .fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn bottom(&self) -> f32 {
        self.points
            .iter()
            .map(|p| p[1])
            .fold(f32::NEG_INFINITY, f32::max)
    }
}

/// Orientation label assigned to a text crop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub label: String,
    pub score: f32,
}

impl Orientation {
    pub fn new(label: impl Into<String>, score: f32) -> Self {
        Self {
            label: label.into(),
            score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub text: String,
    pub score: f32,
}

impl Recognition {
    pub fn new(text: impl Into<String>, score: f32) -> Self {
        Self {
            text: text.into(),
            score,
        }
    }
}

/// One line of output; which half is filled depends on the stages that ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<TextBox>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recognition: Option<Recognition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub lines: Vec<OcrLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orientations: Option<Vec<Orientation>>,
}

impl OcrResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .filter_map(|line| line.recognition.as_ref())
            .map(|rec| rec.text.as_str())
    }
}
