use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::args::InferArgs;
use crate::backends::{build_classifier, build_detector, build_recognizer};
use crate::error::InferError;
use crate::image_io::{list_images, partition, read_image};
use crate::input::StageFlags;
use crate::system::{TextSystem, sort_boxes};

/// Directory-level workload executed by one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchMode {
    Cls,
    Det,
    Rec,
    System,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown mode '{0}'; expected one of cls, det, rec, system")]
pub struct UnknownMode(pub String);

impl FromStr for BatchMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cls" => Ok(BatchMode::Cls),
            "det" => Ok(BatchMode::Det),
            "rec" => Ok(BatchMode::Rec),
            "system" => Ok(BatchMode::System),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Cls => "cls",
            BatchMode::Det => "det",
            BatchMode::Rec => "rec",
            BatchMode::System => "system",
        }
    }

    /// Runs the matching `predict_*` function.
    ///
    /// `process_id` overrides the partition index carried by `args`.
    pub fn run(
        &self,
        args: &InferArgs,
        image_dir: &Path,
        process_id: Option<usize>,
    ) -> Result<BatchSummary, InferError> {
        let args = args.for_process(process_id);
        match self {
            BatchMode::Cls => predict_cls(&args, image_dir),
            BatchMode::Det => predict_det(&args, image_dir),
            BatchMode::Rec => predict_rec(&args, image_dir),
            BatchMode::System => predict_system(&args, image_dir),
        }
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub mode: BatchMode,
    pub process_id: usize,
    pub processed: usize,
    pub failed: usize,
    pub results_path: PathBuf,
    pub elapsed: Duration,
}

/// Detects text boxes in every image of this worker's share.
pub fn predict_det(args: &InferArgs, image_dir: &Path) -> Result<BatchSummary, InferError> {
    let detector = build_detector(args)?;
    run_batch(BatchMode::Det, args, image_dir, |path| {
        let image = read_image(path)?;
        let mut boxes = detector.detect(&image)?;
        sort_boxes(&mut boxes);
        Ok(serde_json::to_value(boxes)?)
    })
}

/// Classifies the orientation of every image, each treated as one text crop.
pub fn predict_cls(args: &InferArgs, image_dir: &Path) -> Result<BatchSummary, InferError> {
    let classifier = build_classifier(args)?;
    run_batch(BatchMode::Cls, args, image_dir, |path| {
        let mut crops = [read_image(path)?];
        let orientations = classifier.classify(&mut crops)?;
        Ok(serde_json::to_value(orientations)?)
    })
}

/// Recognizes every image as a single text line.
pub fn predict_rec(args: &InferArgs, image_dir: &Path) -> Result<BatchSummary, InferError> {
    let recognizer = build_recognizer(args)?;
    run_batch(BatchMode::Rec, args, image_dir, |path| {
        let crops = [read_image(path)?];
        let recognitions = recognizer.recognize(&crops)?;
        Ok(serde_json::to_value(recognitions)?)
    })
}

/// Runs the full text system on every image.
pub fn predict_system(args: &InferArgs, image_dir: &Path) -> Result<BatchSummary, InferError> {
    let system = TextSystem::new(args)?;
    let flags = StageFlags::default().with_cls(args.use_angle_cls);
    run_batch(BatchMode::System, args, image_dir, |path| {
        let image = read_image(path)?;
        let result = system.run(&image, flags)?;
        Ok(serde_json::to_value(result.lines)?)
    })
}

/// Name of the result file written by one worker.
pub fn results_file_name(mode: BatchMode, process_id: usize, total: usize) -> String {
    if total > 1 {
        format!("{}_results_{process_id}.txt", mode.as_str())
    } else {
        format!("{}_results.txt", mode.as_str())
    }
}

/// Drives `handle` over this worker's share of `image_dir`.
///
/// Each successful image becomes one `<file>\t<json>` line in the results
/// file; failures are logged and counted.
pub fn run_batch<F>(
    mode: BatchMode,
    args: &InferArgs,
    image_dir: &Path,
    mut handle: F,
) -> Result<BatchSummary, InferError>
where
    F: FnMut(&Path) -> Result<serde_json::Value, InferError>,
{
    let started = Instant::now();
    let total = args.process_count();
    let process_id = args.process_id;
    if process_id >= total {
        return Err(InferError::configuration(format!(
            "process_id {process_id} is out of range for total_process_num {total}"
        )));
    }

    let files = partition(list_images(image_dir)?, process_id, total);
    fs::create_dir_all(&args.output_dir).map_err(|err| InferError::io(&args.output_dir, err))?;
    let results_path = args
        .output_dir
        .join(results_file_name(mode, process_id, total));
    let file = File::create(&results_path).map_err(|err| InferError::io(&results_path, err))?;
    let mut writer = BufWriter::new(file);

    info!(
        mode = %mode,
        process_id,
        images = files.len(),
        "starting batch"
    );
    let progress = batch_progress(args, files.len() as u64);

    let mut processed = 0usize;
    let mut failed = 0usize;
    for path in &files {
        let image_started = Instant::now();
        match handle(path) {
            Ok(value) => {
                let line = value.to_string();
                writeln!(writer, "{}\t{}", display_name(path, image_dir), line)
                    .map_err(|err| InferError::io(&results_path, err))?;
                info!(
                    mode = %mode,
                    image = %path.display(),
                    elapsed = ?image_started.elapsed(),
                    "{line}"
                );
                processed += 1;
            }
            Err(err) => {
                warn!(mode = %mode, image = %path.display(), "skipping image: {err}");
                failed += 1;
            }
        }
        progress.inc(1);
    }
    writer
        .flush()
        .map_err(|err| InferError::io(&results_path, err))?;
    progress.finish_and_clear();

    let summary = BatchSummary {
        mode,
        process_id,
        processed,
        failed,
        results_path,
        elapsed: started.elapsed(),
    };
    info!(
        mode = %mode,
        process_id,
        processed,
        failed,
        results = %summary.results_path.display(),
        "batch finished in {:.2?}",
        summary.elapsed
    );
    Ok(summary)
}

fn batch_progress(args: &InferArgs, len: u64) -> ProgressBar {
    if !args.show_progress || args.process_count() > 1 {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{bar:40.cyan/blue} {pos}/{len} images [{elapsed_precise}<{eta_precise}]",
    ) {
        bar.set_style(style);
    }
    bar
}

fn display_name(path: &Path, image_dir: &Path) -> String {
    path.strip_prefix(image_dir)
        .ok()
        .filter(|relative| !relative.as_os_str().is_empty())
        .unwrap_or(path)
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args_for(output_dir: &Path, process_id: usize, total: usize) -> InferArgs {
        InferArgs {
            output_dir: output_dir.to_path_buf(),
            process_id,
            total_process_num: total,
            show_progress: false,
            ..InferArgs::default()
        }
    }

    fn image_dir(count: usize) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..count {
            fs::write(dir.path().join(format!("img_{i}.png")), b"").unwrap();
        }
        dir
    }

    #[test]
    fn mode_parsing_is_exact() {
        assert_eq!("det".parse::<BatchMode>(), Ok(BatchMode::Det));
        assert_eq!("system".parse::<BatchMode>(), Ok(BatchMode::System));
        assert_eq!(
            "DET".parse::<BatchMode>(),
            Err(UnknownMode("DET".to_string()))
        );
        assert!("layout".parse::<BatchMode>().is_err());
    }

    #[test]
    fn results_file_carries_process_suffix_only_when_split() {
        assert_eq!(results_file_name(BatchMode::Det, 0, 1), "det_results.txt");
        assert_eq!(
            results_file_name(BatchMode::System, 2, 4),
            "system_results_2.txt"
        );
    }

    #[test]
    fn run_batch_processes_only_its_share() {
        let images = image_dir(5);
        let out = tempfile::tempdir().unwrap();
        let args = args_for(out.path(), 1, 2);
        let mut seen = Vec::new();
        let summary = run_batch(BatchMode::Rec, &args, images.path(), |path| {
            seen.push(path.file_name().unwrap().to_string_lossy().into_owned());
            Ok(json!({ "text": "ok" }))
        })
        .unwrap();

        assert_eq!(seen, vec!["img_1.png", "img_3.png"]);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.results_path, out.path().join("rec_results_1.txt"));
        let written = fs::read_to_string(&summary.results_path).unwrap();
        assert_eq!(
            written,
            "img_1.png\t{\"text\":\"ok\"}\nimg_3.png\t{\"text\":\"ok\"}\n"
        );
    }

    #[test]
    fn run_batch_counts_failures_and_continues() {
        let images = image_dir(3);
        let out = tempfile::tempdir().unwrap();
        let args = args_for(out.path(), 0, 1);
        let summary = run_batch(BatchMode::Det, &args, images.path(), |path| {
            if path.ends_with("img_1.png") {
                Err(InferError::invalid_input("broken"))
            } else {
                Ok(json!([]))
            }
        })
        .unwrap();
        assert_eq!((summary.processed, summary.failed), (2, 1));
        let written = fs::read_to_string(&summary.results_path).unwrap();
        assert_eq!(written.lines().count(), 2);
    }

    #[test]
    fn run_batch_rejects_out_of_range_process_id() {
        let images = image_dir(1);
        let out = tempfile::tempdir().unwrap();
        let args = args_for(out.path(), 3, 2);
        let err =
            run_batch(BatchMode::Cls, &args, images.path(), |_| Ok(json!(null))).unwrap_err();
        assert!(matches!(err, InferError::Configuration { .. }));
    }

    #[test]
    fn process_override_selects_share_and_results_file() {
        let images = image_dir(4);
        let out = tempfile::tempdir().unwrap();
        let args = args_for(out.path(), 0, 2).for_process(Some(1));
        let summary = run_batch(BatchMode::Det, &args, images.path(), |path| {
            Ok(json!(path.file_name().unwrap().to_string_lossy()))
        })
        .unwrap();

        assert_eq!(summary.process_id, 1);
        assert_eq!(summary.results_path, out.path().join("det_results_1.txt"));
        assert!(!out.path().join("det_results_0.txt").exists());
        let written = fs::read_to_string(&summary.results_path).unwrap();
        assert_eq!(written, "img_1.png\t\"img_1.png\"\nimg_3.png\t\"img_3.png\"\n");
    }

    #[test]
    fn missing_override_keeps_configured_process() {
        let args = args_for(Path::new("out"), 1, 3);
        assert_eq!(args.for_process(None).process_id, 1);
        assert_eq!(args.for_process(Some(2)).process_id, 2);
    }

    #[test]
    fn mode_run_without_models_fails_before_reading_images() {
        let images = image_dir(1);
        let out = tempfile::tempdir().unwrap();
        let args = args_for(out.path(), 0, 1);
        let err = BatchMode::Det
            .run(&args, images.path(), Some(0))
            .unwrap_err();
        assert!(matches!(
            err,
            InferError::Configuration { .. } | InferError::Backend { .. }
        ));
        assert!(!out.path().join("det_results.txt").exists());
    }
}
