//! Model-agnostic decoding of detector, classifier and recognizer outputs.

use crate::error::InferError;
use crate::result::{Orientation, Recognition, TextBox};

/// Thresholds for turning a DB probability map into boxes.
#[derive(Debug, Clone, Copy)]
pub struct DbParams {
    pub thresh: f32,
    pub box_thresh: f32,
    pub unclip_ratio: f32,
    pub max_candidates: usize,
    pub min_size: f32,
}

impl Default for DbParams {
    fn default() -> Self {
        Self {
            thresh: 0.3,
            box_thresh: 0.6,
            unclip_ratio: 1.5,
            max_candidates: 1000,
            min_size: 3.0,
        }
    }
}

/// Probability map produced by a detector, row-major.
#[derive(Debug, Clone, Copy)]
pub struct ProbabilityMap<'a> {
    pub data: &'a [f32],
    pub width: usize,
    pub height: usize,
}

/// Extracts text boxes from a probability map and scales them to `target`.
///
/// Pixels above `thresh` are grouped into 4-connected components; each
/// component becomes its bounding rectangle, scored by the mean probability of
/// its pixels, expanded by the unclip distance and mapped to the source image.
pub fn boxes_from_map(
    map: ProbabilityMap<'_>,
    params: &DbParams,
    target: (u32, u32),
) -> Result<Vec<TextBox>, InferError> {
    let ProbabilityMap {
        data,
        width,
        height,
    } = map;
    if data.len() < width * height {
        return Err(InferError::backend(format!(
            "probability map holds {} values, expected {}",
            data.len(),
            width * height
        )));
    }
    if width == 0 || height == 0 {
        return Ok(Vec::new());
    }

    let scale_x = target.0 as f32 / width as f32;
    let scale_y = target.1 as f32 / height as f32;
    let mut visited = vec![false; width * height];
    let mut stack = Vec::new();
    let mut boxes = Vec::new();
    let mut candidates = 0usize;

    for start in 0..width * height {
        if visited[start] || data[start] <= params.thresh {
            continue;
        }
        if candidates >= params.max_candidates {
            break;
        }
        candidates += 1;

        let mut min_x = usize::MAX;
        let mut min_y = usize::MAX;
        let mut max_x = 0usize;
        let mut max_y = 0usize;
        let mut score_sum = 0.0f32;
        let mut pixels = 0usize;

        visited[start] = true;
        stack.push(start);
        while let Some(index) = stack.pop() {
            let x = index % width;
            let y = index / width;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            score_sum += data[index];
            pixels += 1;

            let mut visit = |next: usize| {
                if !visited[next] && data[next] > params.thresh {
                    visited[next] = true;
                    stack.push(next);
                }
            };
            if x > 0 {
                visit(index - 1);
            }
            if x + 1 < width {
                visit(index + 1);
            }
            if y > 0 {
                visit(index - width);
            }
            if y + 1 < height {
                visit(index + width);
            }
        }

        let box_w = (max_x - min_x + 1) as f32;
        let box_h = (max_y - min_y + 1) as f32;
        if box_w.min(box_h) < params.min_size {
            continue;
        }
        let score = score_sum / pixels as f32;
        if score < params.box_thresh {
            continue;
        }

        let distance = box_w * box_h * params.unclip_ratio / (2.0 * (box_w + box_h));
        let left = min_x as f32 - distance;
        let top = min_y as f32 - distance;
        let right = (max_x + 1) as f32 + distance;
        let bottom = (max_y + 1) as f32 + distance;
        if (right - left).min(bottom - top) < params.min_size + 2.0 {
            continue;
        }

        boxes.push(TextBox::from_rect(
            (left * scale_x).clamp(0.0, target.0 as f32),
            (top * scale_y).clamp(0.0, target.1 as f32),
            (right * scale_x).clamp(0.0, target.0 as f32),
            (bottom * scale_y).clamp(0.0, target.1 as f32),
            score,
        ));
    }

    Ok(boxes)
}

/// Symbol table for CTC decoding; index 0 is the blank.
#[derive(Debug, Clone)]
pub struct CharacterSet {
    symbols: Vec<String>,
}

impl CharacterSet {
    pub fn new<I, S>(symbols: I, use_space_char: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = vec![String::new()];
        table.extend(symbols.into_iter().map(Into::into));
        if use_space_char && !table.iter().skip(1).any(|s| s == " ") {
            table.push(" ".to_string());
        }
        Self { symbols: table }
    }

    /// Reads one symbol per line, keeping the line's raw content.
    pub fn from_dictionary(contents: &str, use_space_char: bool) -> Self {
        let lines = contents
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .filter(|line| !line.is_empty());
        Self::new(lines, use_space_char)
    }

    /// Printable ASCII fallback used when no dictionary is configured.
    pub fn ascii(use_space_char: bool) -> Self {
        let symbols = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~"
            .chars()
            .map(String::from);
        Self::new(symbols, use_space_char)
    }

    /// Number of classes including the blank.
    pub fn classes(&self) -> usize {
        self.symbols.len()
    }

    fn symbol(&self, index: usize) -> Option<&str> {
        if index == 0 {
            None
        } else {
            self.symbols.get(index).map(String::as_str)
        }
    }
}

#[derive(Clone, Copy)]
enum OutputLayout {
    SequenceMajor,
    ClassMajor,
}

/// Greedy CTC decoding of a `[batch, steps, classes]` output.
///
/// A `[batch, classes, steps]` layout is recognised by its dimensions. Rows
/// that are not already probability distributions are passed through softmax.
pub fn decode_ctc(
    data: &[f32],
    shape: &[usize],
    charset: &CharacterSet,
) -> Result<Vec<Recognition>, InferError> {
    let classes = charset.classes();
    let (batch, sequence_len, layout) = match shape {
        [batch, seq, class] if *class == classes => (*batch, *seq, OutputLayout::SequenceMajor),
        [batch, class, seq] if *class == classes => (*batch, *seq, OutputLayout::ClassMajor),
        [seq, class] if *class == classes => (1, *seq, OutputLayout::SequenceMajor),
        other => {
            return Err(InferError::backend(format!(
                "unexpected recognizer output dimensions {other:?} for a character set of {classes} classes"
            )));
        }
    };

    let per_sample = sequence_len * classes;
    if per_sample == 0 {
        return Ok(vec![Recognition::new(String::new(), 0.0); batch]);
    }
    if data.len() < batch * per_sample {
        return Err(InferError::backend(
            "recognizer output buffer shorter than expected",
        ));
    }

    let mut results = Vec::with_capacity(batch);
    let mut row = vec![0.0f32; classes];
    for sample in data.chunks(per_sample).take(batch) {
        let mut text = String::new();
        let mut previous_idx: Option<usize> = None;
        let mut confidence_sum = 0.0f32;
        let mut confidence_count = 0usize;

        for step in 0..sequence_len {
            for (class, slot) in row.iter_mut().enumerate() {
                *slot = match layout {
                    OutputLayout::SequenceMajor => sample[step * classes + class],
                    OutputLayout::ClassMajor => sample[class * sequence_len + step],
                };
            }
            let (best_index, prob) = best_class(&row);
            if best_index != 0 && previous_idx != Some(best_index) {
                if let Some(symbol) = charset.symbol(best_index) {
                    text.push_str(symbol);
                    confidence_sum += prob;
                    confidence_count += 1;
                }
            }
            previous_idx = if best_index == 0 {
                None
            } else {
                Some(best_index)
            };
        }

        let confidence = if confidence_count > 0 {
            confidence_sum / confidence_count as f32
        } else {
            0.0
        };
        results.push(Recognition::new(text, confidence));
    }
    Ok(results)
}

/// Argmax over a `[batch, labels]` classifier output.
pub fn decode_orientations(
    data: &[f32],
    shape: &[usize],
    labels: &[String],
) -> Result<Vec<Orientation>, InferError> {
    let (batch, classes) = match shape {
        [batch, classes] => (*batch, *classes),
        [batch, classes, 1, 1] => (*batch, *classes),
        other => {
            return Err(InferError::backend(format!(
                "unexpected classifier output dimensions {other:?}"
            )));
        }
    };
    if classes != labels.len() {
        return Err(InferError::configuration(format!(
            "classifier produces {classes} classes but label_list has {} entries",
            labels.len()
        )));
    }
    if classes == 0 {
        return Err(InferError::configuration("label_list is empty"));
    }
    if data.len() < batch * classes {
        return Err(InferError::backend(
            "classifier output buffer shorter than expected",
        ));
    }

    Ok(data
        .chunks(classes)
        .take(batch)
        .map(|row| {
            let (index, score) = best_class(row);
            Orientation::new(labels[index].clone(), score)
        })
        .collect())
}

/// Returns the winning class and its probability.
fn best_class(row: &[f32]) -> (usize, f32) {
    let is_distribution = row.iter().all(|v| (0.0..=1.0).contains(v));
    let mut best_index = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (index, value) in row.iter().copied().enumerate() {
        if value > best_value {
            best_value = value;
            best_index = index;
        }
    }
    if is_distribution {
        return (best_index, best_value);
    }

    let sum: f32 = row.iter().map(|v| (v - best_value).exp()).sum();
    if sum <= 0.0 {
        (best_index, 0.0)
    } else {
        (best_index, 1.0 / sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(classes: usize, index: usize, prob: f32) -> Vec<f32> {
        let rest = (1.0 - prob) / (classes - 1) as f32;
        (0..classes)
            .map(|c| if c == index { prob } else { rest })
            .collect()
    }

    #[test]
    fn ctc_collapses_repeats_and_blanks() {
        let charset = CharacterSet::new(["a", "b", "c"], false);
        let steps = [1, 1, 0, 1, 2, 2, 0, 3];
        let data: Vec<f32> = steps
            .iter()
            .flat_map(|&i| one_hot(charset.classes(), i, 0.9))
            .collect();
        let decoded = decode_ctc(&data, &[1, steps.len(), charset.classes()], &charset).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].text, "aabc");
        assert!((decoded[0].score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn ctc_handles_batches_and_class_major_layout() {
        let charset = CharacterSet::new(["x", "y"], false);
        let classes = charset.classes();
        let first: Vec<Vec<f32>> = [1, 2].iter().map(|&i| one_hot(classes, i, 0.8)).collect();
        let second: Vec<Vec<f32>> = [0, 2].iter().map(|&i| one_hot(classes, i, 0.8)).collect();
        let mut data = Vec::new();
        for sample in [&first, &second] {
            for class in 0..classes {
                for step in sample.iter() {
                    data.push(step[class]);
                }
            }
        }
        let decoded = decode_ctc(&data, &[2, classes, 2], &charset).unwrap();
        let texts: Vec<_> = decoded.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["xy", "y"]);
    }

    #[test]
    fn ctc_applies_softmax_to_logits() {
        let charset = CharacterSet::new(["a"], false);
        let data = vec![-2.0, 3.0];
        let decoded = decode_ctc(&data, &[1, 1, 2], &charset).unwrap();
        assert_eq!(decoded[0].text, "a");
        let expected = 1.0 / (1.0 + (-5.0f32).exp());
        assert!((decoded[0].score - expected).abs() < 1e-5);
    }

    #[test]
    fn ctc_rejects_mismatched_dictionary() {
        let charset = CharacterSet::new(["a"], true);
        let err = decode_ctc(&[0.0; 10], &[1, 2, 5], &charset).unwrap_err();
        assert!(matches!(err, InferError::Backend { .. }));
    }

    #[test]
    fn dictionary_appends_space_once() {
        let charset = CharacterSet::from_dictionary("a\r\nb\n\nc\n", true);
        assert_eq!(charset.classes(), 5);
        let charset = CharacterSet::new(["a", " "], true);
        assert_eq!(charset.classes(), 3);
    }

    #[test]
    fn orientation_argmax_uses_labels() {
        let labels = vec!["0".to_string(), "180".to_string()];
        let decoded = decode_orientations(&[0.2, 0.8, 0.95, 0.05], &[2, 2], &labels).unwrap();
        assert_eq!(
            decoded,
            vec![Orientation::new("180", 0.8), Orientation::new("0", 0.95)]
        );
        assert!(decode_orientations(&[0.5; 3], &[1, 3], &labels).is_err());
    }

    #[test]
    fn db_map_yields_scaled_boxes() {
        let width = 20;
        let height = 10;
        let mut data = vec![0.0f32; width * height];
        for y in 2..8 {
            for x in 3..15 {
                data[y * width + x] = 0.9;
            }
        }
        // isolated speck below min_size
        data[8 * width + 18] = 0.95;

        let params = DbParams {
            unclip_ratio: 0.0,
            ..DbParams::default()
        };
        let map = ProbabilityMap {
            data: &data,
            width,
            height,
        };
        let boxes = boxes_from_map(map, &params, (40, 20)).unwrap();
        assert_eq!(boxes.len(), 1);
        let bbox = boxes[0];
        assert_eq!((bbox.left(), bbox.top()), (6.0, 4.0));
        assert_eq!((bbox.right(), bbox.bottom()), (30.0, 16.0));
        assert!((bbox.score - 0.9).abs() < 1e-5);
    }

    #[test]
    fn db_map_filters_low_scores_and_expands_boxes() {
        let width = 30;
        let height = 12;
        let mut data = vec![0.0f32; width * height];
        for y in 1..5 {
            for x in 1..11 {
                data[y * width + x] = 0.4;
            }
        }
        for y in 6..10 {
            for x in 15..25 {
                data[y * width + x] = 0.8;
            }
        }
        let map = ProbabilityMap {
            data: &data,
            width,
            height,
        };
        let boxes = boxes_from_map(map, &DbParams::default(), (30, 12)).unwrap();
        assert_eq!(boxes.len(), 1);
        // 10x4 region, distance = 40 * 1.5 / 28
        let distance = 40.0 * 1.5 / 28.0;
        assert!((boxes[0].left() - (15.0 - distance)).abs() < 1e-4);
        assert!((boxes[0].bottom() - (10.0 + distance).min(12.0)).abs() < 1e-4);
    }
}
