//! Runs the default process executor from a binary that is not `agentocr`.
//!
//! Built without the libtest harness: the spawned workers re-execute this
//! binary, so `main` has to take the worker branch before anything else.

use std::path::Path;
use std::process::ExitCode;

use agentocr::infer::batch::run_batch;
use agentocr::infer::{
    BatchMode, BatchSummary, InferArgs, InferError, OcrResult, StageFlags, TextPipeline,
};
use agentocr::runner::{BatchExecutor, ProcessExecutor, run_if_worker_with};
use agentocr::{OcrSystem, OcrSystemError};
use image::RgbImage;
use serde_json::Value;

struct IdlePipeline;

impl TextPipeline for IdlePipeline {
    fn predict(&mut self, _: &RgbImage, _: StageFlags) -> Result<OcrResult, InferError> {
        Ok(OcrResult::empty())
    }
}

fn idle_loader(_: &InferArgs) -> Result<Box<dyn TextPipeline>, InferError> {
    Ok(Box::new(IdlePipeline))
}

fn name_only(
    mode: BatchMode,
    args: &InferArgs,
    image_dir: &Path,
) -> Result<BatchSummary, InferError> {
    run_batch(mode, args, image_dir, |path| {
        let name = path.file_name().map(|name| name.to_string_lossy().into_owned());
        Ok(Value::from(name.unwrap_or_default()))
    })
}

fn main() -> ExitCode {
    let mut nested = None;
    let worker = run_if_worker_with(|mode, args, image_dir| {
        let mut executor = ProcessExecutor::new();
        nested = Some(executor.spawn(mode, args, image_dir, 0).err());
        name_only(mode, args, image_dir)
    });
    if let Some(outcome) = worker {
        return match (nested, outcome) {
            (Some(Some(OcrSystemError::Worker { .. })), Ok(_)) => ExitCode::SUCCESS,
            (_, Err(err)) => {
                eprintln!("worker failed: {err}");
                ExitCode::FAILURE
            }
            _ => {
                eprintln!("worker was allowed to spawn another worker");
                ExitCode::from(3)
            }
        };
    }

    default_executor_runs_the_batch_in_workers();
    #[cfg(unix)]
    program_without_worker_entry_is_rejected();
    println!("embedded_worker: ok");
    ExitCode::SUCCESS
}

fn read_share(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("{}: {err}", path.display()))
        .lines()
        .map(|line| line.split('\t').next().unwrap().to_string())
        .collect()
}

fn default_executor_runs_the_batch_in_workers() {
    let images = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    for index in 0..4 {
        std::fs::write(images.path().join(format!("img_{index}.png")), b"").unwrap();
    }

    let mut system = OcrSystem::builder()
        .loader(idle_loader)
        .args(InferArgs {
            total_process_num: 2,
            output_dir: output.path().to_path_buf(),
            ..InferArgs::default()
        })
        .build()
        .unwrap();
    system.predict_det(images.path()).unwrap();

    assert_eq!(
        read_share(&output.path().join("det_results_0.txt")),
        ["img_0.png", "img_2.png"]
    );
    assert_eq!(
        read_share(&output.path().join("det_results_1.txt")),
        ["img_1.png", "img_3.png"]
    );
    assert!(system.is_loaded());
}

#[cfg(unix)]
fn program_without_worker_entry_is_rejected() {
    let images = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    std::fs::write(images.path().join("img_0.png"), b"").unwrap();

    let mut system = OcrSystem::builder()
        .loader(idle_loader)
        .executor(ProcessExecutor::with_program("true"))
        .args(InferArgs {
            total_process_num: 2,
            output_dir: output.path().to_path_buf(),
            ..InferArgs::default()
        })
        .build()
        .unwrap();
    let err = system.predict_rec(images.path()).unwrap_err();
    assert!(matches!(err, OcrSystemError::Worker { .. }), "{err}");
}
