use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use agentocr_infer::batch::results_file_name;
use agentocr_infer::{BatchMode, BatchSummary, InferArgs, InferError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::OcrSystemError;

/// Environment variable carrying a [`WorkerInvocation`] into a child process.
pub const WORKER_ENV: &str = "AGENTOCR_WORKER";

/// Everything a worker process needs to run its share of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub mode: BatchMode,
    pub image_dir: PathBuf,
    pub process_id: usize,
    pub args: InferArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    /// Exit code, or `None` when the worker was killed by a signal.
    Failed(Option<i32>),
}

pub trait WorkerHandle {
    fn process_id(&self) -> usize;

    /// Blocks until the worker exits.
    fn join(self: Box<Self>) -> Result<WorkerExit, OcrSystemError>;
}

/// Runs batch functions either in the calling process or in workers.
pub trait BatchExecutor {
    fn execute(
        &mut self,
        mode: BatchMode,
        args: &InferArgs,
        image_dir: &Path,
    ) -> Result<(), OcrSystemError>;

    fn spawn(
        &mut self,
        mode: BatchMode,
        args: &InferArgs,
        image_dir: &Path,
        process_id: usize,
    ) -> Result<Box<dyn WorkerHandle>, OcrSystemError>;
}

/// Executor that re-executes a program, the current binary by default, for
/// each worker.
///
/// The worker program must call [`run_if_worker`] (or [`run_if_worker_with`])
/// at the top of `main`. The `agentocr` binary does; a program embedding this
/// library either does the same or points [`ProcessExecutor::with_program`] at
/// the `agentocr` binary. A worker that exits cleanly without writing its
/// results file is reported as an error.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    program: Option<PathBuf>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: Some(program.into()),
        }
    }

    fn program(&self, process_id: usize) -> Result<PathBuf, OcrSystemError> {
        match &self.program {
            Some(program) => Ok(program.clone()),
            None => env::current_exe().map_err(|source| OcrSystemError::Spawn { process_id, source }),
        }
    }
}

impl BatchExecutor for ProcessExecutor {
    fn execute(
        &mut self,
        mode: BatchMode,
        args: &InferArgs,
        image_dir: &Path,
    ) -> Result<(), OcrSystemError> {
        mode.run(args, image_dir, None)?;
        Ok(())
    }

    fn spawn(
        &mut self,
        mode: BatchMode,
        args: &InferArgs,
        image_dir: &Path,
        process_id: usize,
    ) -> Result<Box<dyn WorkerHandle>, OcrSystemError> {
        if env::var_os(WORKER_ENV).is_some() {
            return Err(OcrSystemError::worker(format!(
                "refusing to spawn worker {process_id} from inside a worker; \
                 call runner::run_if_worker at the start of main"
            )));
        }

        let args = args.for_process(Some(process_id));
        let results = args
            .output_dir
            .join(results_file_name(mode, process_id, args.process_count()));
        match fs::remove_file(&results) {
            Ok(()) => debug!(results = %results.display(), "removed stale results file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(OcrSystemError::Spawn { process_id, source }),
        }

        let invocation = WorkerInvocation {
            mode,
            image_dir: image_dir.to_path_buf(),
            process_id,
            args,
        };
        let payload = serde_json::to_string(&invocation)
            .map_err(|err| OcrSystemError::worker(err.to_string()))?;
        let program = self.program(process_id)?;
        let child = Command::new(&program)
            .env(WORKER_ENV, payload)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| OcrSystemError::Spawn { process_id, source })?;
        debug!(process_id, pid = child.id(), program = %program.display(), "spawned worker");
        Ok(Box::new(ProcessWorker {
            process_id,
            child,
            results,
        }))
    }
}

struct ProcessWorker {
    process_id: usize,
    child: Child,
    results: PathBuf,
}

impl WorkerHandle for ProcessWorker {
    fn process_id(&self) -> usize {
        self.process_id
    }

    fn join(mut self: Box<Self>) -> Result<WorkerExit, OcrSystemError> {
        let status = self.child.wait().map_err(|source| OcrSystemError::Join {
            process_id: self.process_id,
            source,
        })?;
        debug!(process_id = self.process_id, %status, "worker exited");
        if !status.success() {
            return Ok(WorkerExit::Failed(status.code()));
        }
        if !self.results.exists() {
            return Err(OcrSystemError::worker(format!(
                "worker {} exited without writing {}; the worker program must call \
                 runner::run_if_worker",
                self.process_id,
                self.results.display()
            )));
        }
        Ok(WorkerExit::Success)
    }
}

pub fn parse_invocation(payload: &str) -> Result<WorkerInvocation, OcrSystemError> {
    let invocation: WorkerInvocation = serde_json::from_str(payload)
        .map_err(|err| OcrSystemError::worker(format!("{WORKER_ENV}: {err}")))?;
    let total = invocation.args.process_count();
    if invocation.process_id >= total {
        return Err(OcrSystemError::worker(format!(
            "process_id {} is out of range for total_process_num {total}",
            invocation.process_id
        )));
    }
    Ok(invocation)
}

/// Returns the invocation when this process was started as a worker.
pub fn worker_from_env() -> Result<Option<WorkerInvocation>, OcrSystemError> {
    match env::var(WORKER_ENV) {
        Ok(payload) => parse_invocation(&payload).map(Some),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(OcrSystemError::worker(format!("{WORKER_ENV}: {err}"))),
    }
}

/// Worker entry point for programs that run [`OcrSystem`](crate::OcrSystem)
/// batches across processes.
///
/// Returns `None` in an ordinary process. In a worker it runs the batch share
/// described by `AGENTOCR_WORKER` and returns the outcome; `main` should exit
/// with it instead of continuing.
pub fn run_if_worker() -> Option<Result<BatchSummary, OcrSystemError>> {
    run_if_worker_with(|mode, args, image_dir| mode.run(args, image_dir, None))
}

/// Like [`run_if_worker`] with a custom batch function.
pub fn run_if_worker_with<F>(batch: F) -> Option<Result<BatchSummary, OcrSystemError>>
where
    F: FnOnce(BatchMode, &InferArgs, &Path) -> Result<BatchSummary, InferError>,
{
    match worker_from_env() {
        Ok(Some(invocation)) => Some(run_worker_with(invocation, batch)),
        Ok(None) => None,
        Err(err) => Some(Err(err)),
    }
}

pub fn run_worker(invocation: WorkerInvocation) -> Result<BatchSummary, OcrSystemError> {
    run_worker_with(invocation, |mode, args, image_dir| {
        mode.run(args, image_dir, None)
    })
}

/// Runs `batch` with the invocation's arguments bound to its worker index.
pub fn run_worker_with<F>(
    invocation: WorkerInvocation,
    batch: F,
) -> Result<BatchSummary, OcrSystemError>
where
    F: FnOnce(BatchMode, &InferArgs, &Path) -> Result<BatchSummary, InferError>,
{
    let WorkerInvocation {
        mode,
        image_dir,
        process_id,
        args,
    } = invocation;
    info!(%mode, process_id, image_dir = %image_dir.display(), "worker started");
    let args = args.for_process(Some(process_id));
    Ok(batch(mode, &args, &image_dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(process_id: usize, total: usize) -> WorkerInvocation {
        WorkerInvocation {
            mode: BatchMode::Rec,
            image_dir: PathBuf::from("imgs"),
            process_id,
            args: InferArgs {
                total_process_num: total,
                process_id,
                ..InferArgs::default()
            },
        }
    }

    #[test]
    fn payload_survives_the_environment() {
        let payload = serde_json::to_string(&invocation(1, 3)).unwrap();
        assert_eq!(parse_invocation(&payload).unwrap(), invocation(1, 3));
    }

    #[test]
    fn bad_payloads_are_rejected() {
        assert!(matches!(
            parse_invocation("not json"),
            Err(OcrSystemError::Worker { .. })
        ));
        let payload = serde_json::to_string(&invocation(4, 2)).unwrap();
        assert!(matches!(
            parse_invocation(&payload),
            Err(OcrSystemError::Worker { .. })
        ));
    }

    fn share_of(results: &Path) -> Vec<String> {
        std::fs::read_to_string(results)
            .unwrap()
            .lines()
            .map(|line| line.split('\t').next().unwrap().to_string())
            .collect()
    }

    #[test]
    fn worker_runs_its_own_share() {
        let images = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        for index in 0..4 {
            std::fs::write(images.path().join(format!("img_{index}.png")), b"").unwrap();
        }
        let mut invocation = invocation(1, 2);
        invocation.image_dir = images.path().to_path_buf();
        invocation.args.process_id = 0;
        invocation.args.output_dir = output.path().to_path_buf();

        let summary = run_worker_with(invocation, |mode, args, image_dir| {
            agentocr_infer::batch::run_batch(mode, args, image_dir, |path| {
                Ok(serde_json::Value::from(path.display().to_string()))
            })
        })
        .unwrap();

        assert_eq!(summary.process_id, 1);
        assert_eq!(summary.processed, 2);
        assert_eq!(
            share_of(&output.path().join("rec_results_1.txt")),
            ["img_1.png", "img_3.png"]
        );
        assert!(!output.path().join("rec_results_0.txt").exists());
    }

    #[test]
    fn ordinary_process_is_not_a_worker() {
        if env::var_os(WORKER_ENV).is_some() {
            return;
        }
        let outcome = run_if_worker_with(|_, _, _| panic!("batch must not run"));
        assert!(outcome.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn process_exit_status_is_reported() {
        let output = tempfile::tempdir().unwrap();
        let args = InferArgs {
            total_process_num: 2,
            output_dir: output.path().to_path_buf(),
            ..InferArgs::default()
        };

        let mut failing = ProcessExecutor::with_program("false");
        let worker = failing.spawn(BatchMode::Det, &args, Path::new("."), 1).unwrap();
        assert_eq!(worker.process_id(), 1);
        assert_eq!(worker.join().unwrap(), WorkerExit::Failed(Some(1)));
    }

    #[cfg(unix)]
    #[test]
    fn clean_exit_without_results_is_an_error() {
        let output = tempfile::tempdir().unwrap();
        let stale = output.path().join("det_results_0.txt");
        std::fs::write(&stale, "old\t{}\n").unwrap();
        let args = InferArgs {
            total_process_num: 2,
            output_dir: output.path().to_path_buf(),
            ..InferArgs::default()
        };

        let mut silent = ProcessExecutor::with_program("true");
        let worker = silent.spawn(BatchMode::Det, &args, Path::new("."), 0).unwrap();
        assert!(!stale.exists());
        let err = worker.join().unwrap_err();
        assert!(matches!(err, OcrSystemError::Worker { .. }));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let output = tempfile::tempdir().unwrap();
        let args = InferArgs {
            total_process_num: 3,
            output_dir: output.path().to_path_buf(),
            ..InferArgs::default()
        };
        let mut executor = ProcessExecutor::with_program("/nonexistent/agentocr-worker");
        let err = executor
            .spawn(BatchMode::Det, &args, Path::new("."), 2)
            .err()
            .unwrap();
        assert!(matches!(err, OcrSystemError::Spawn { process_id: 2, .. }));
    }
}
