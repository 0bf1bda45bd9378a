use std::path::{Path, PathBuf};

use agentocr_infer::{
    BatchMode, InferArgs, InferError, OcrInput, OcrResult, StageFlags, TextPipeline, TextSystem,
    parse_args,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::OcrSystemError;
use crate::runner::{BatchExecutor, ProcessExecutor, WorkerExit};
use crate::settings::load_config_file;

/// Turns a configuration object into an argument set.
pub trait ArgsParser {
    fn parse(&self, config: &Value) -> Result<InferArgs, InferError>;
}

/// Builds the text system handle from an argument set.
pub trait SystemLoader {
    fn load(&self, args: &InferArgs) -> Result<Box<dyn TextPipeline>, InferError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultArgsParser;

impl ArgsParser for DefaultArgsParser {
    fn parse(&self, config: &Value) -> Result<InferArgs, InferError> {
        parse_args(config)
    }
}

impl<F> ArgsParser for F
where
    F: Fn(&Value) -> Result<InferArgs, InferError>,
{
    fn parse(&self, config: &Value) -> Result<InferArgs, InferError> {
        self(config)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextSystemLoader;

impl SystemLoader for TextSystemLoader {
    fn load(&self, args: &InferArgs) -> Result<Box<dyn TextPipeline>, InferError> {
        Ok(Box::new(TextSystem::new(args)?))
    }
}

impl<F> SystemLoader for F
where
    F: Fn(&InferArgs) -> Result<Box<dyn TextPipeline>, InferError>,
{
    fn load(&self, args: &InferArgs) -> Result<Box<dyn TextPipeline>, InferError> {
        self(args)
    }
}

enum ConfigSource {
    Value(Value),
    File(PathBuf),
}

pub struct OcrSystemBuilder {
    config: Option<ConfigSource>,
    args: Option<InferArgs>,
    parser: Box<dyn ArgsParser>,
    loader: Box<dyn SystemLoader>,
    executor: Box<dyn BatchExecutor>,
}

impl Default for OcrSystemBuilder {
    fn default() -> Self {
        Self {
            config: None,
            args: None,
            parser: Box::new(DefaultArgsParser),
            loader: Box::new(TextSystemLoader),
            executor: Box::new(ProcessExecutor::new()),
        }
    }
}

impl OcrSystemBuilder {
    pub fn config(mut self, config: Value) -> Self {
        self.config = Some(ConfigSource::Value(config));
        self
    }

    /// Reads the configuration from a JSON or `.toml` file at build time.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(ConfigSource::File(path.into()));
        self
    }

    /// Ready-made arguments; these take precedence over any configuration.
    pub fn args(mut self, args: InferArgs) -> Self {
        self.args = Some(args);
        self
    }

    pub fn parser(mut self, parser: impl ArgsParser + 'static) -> Self {
        self.parser = Box::new(parser);
        self
    }

    pub fn loader(mut self, loader: impl SystemLoader + 'static) -> Self {
        self.loader = Box::new(loader);
        self
    }

    pub fn executor(mut self, executor: impl BatchExecutor + 'static) -> Self {
        self.executor = Box::new(executor);
        self
    }

    /// Resolves the argument set and loads the text system.
    pub fn build(self) -> Result<OcrSystem, OcrSystemError> {
        let Self {
            config,
            args,
            parser,
            loader,
            executor,
        } = self;

        let args = match (args, config) {
            (Some(args), _) => args,
            (None, Some(source)) => {
                let config = match source {
                    ConfigSource::Value(value) => value,
                    ConfigSource::File(path) => Value::Object(load_config_file(&path)?),
                };
                parser
                    .parse(&config)
                    .map_err(|err| OcrSystemError::configuration(err.to_string()))?
            }
            (None, None) => {
                return Err(OcrSystemError::configuration(
                    "either a configuration or arguments must be supplied",
                ));
            }
        };

        let mut system = OcrSystem {
            args,
            text_sys: None,
            loader,
            executor,
        };
        system.load()?;
        Ok(system)
    }
}

/// Owns the loaded text system and the argument set it was built from.
///
/// Batch runs release the handle while they execute and reload it afterwards,
/// so no model is held in this process while workers build their own.
pub struct OcrSystem {
    args: InferArgs,
    text_sys: Option<Box<dyn TextPipeline>>,
    loader: Box<dyn SystemLoader>,
    executor: Box<dyn BatchExecutor>,
}

impl OcrSystem {
    pub fn builder() -> OcrSystemBuilder {
        OcrSystemBuilder::default()
    }

    /// Builds a system from a configuration object, or from `args` when given.
    pub fn new(config: Option<Value>, args: Option<InferArgs>) -> Result<Self, OcrSystemError> {
        let mut builder = Self::builder();
        if let Some(config) = config {
            builder = builder.config(config);
        }
        if let Some(args) = args {
            builder = builder.args(args);
        }
        builder.build()
    }

    pub fn args(&self) -> &InferArgs {
        &self.args
    }

    pub fn is_loaded(&self) -> bool {
        self.text_sys.is_some()
    }

    /// Constructs a fresh handle from the current arguments.
    pub fn load(&mut self) -> Result<(), OcrSystemError> {
        self.release();
        let handle = self.loader.load(&self.args)?;
        debug!("text system loaded");
        self.text_sys = Some(handle);
        Ok(())
    }

    pub fn acquire(&mut self) -> Result<(), OcrSystemError> {
        self.load()
    }

    pub fn release(&mut self) {
        if self.text_sys.take().is_some() {
            debug!("text system released");
        }
    }

    /// Runs `mode` over `image_dir` and reloads the handle afterwards.
    ///
    /// With more than one configured process the work is split across worker
    /// processes, which are all joined before this returns.
    ///
    /// The default [`ProcessExecutor`] starts workers by re-executing the
    /// current binary, so that binary must call
    /// [`runner::run_if_worker`](crate::runner::run_if_worker) first thing in
    /// `main`. Programs that cannot do so should install
    /// `ProcessExecutor::with_program` pointing at the `agentocr` binary.
    pub fn run(
        &mut self,
        mode: BatchMode,
        image_dir: impl AsRef<Path>,
    ) -> Result<(), OcrSystemError> {
        self.release();
        let outcome = self.dispatch(mode, image_dir.as_ref());
        let reloaded = self.acquire();
        outcome?;
        reloaded
    }

    fn dispatch(&mut self, mode: BatchMode, image_dir: &Path) -> Result<(), OcrSystemError> {
        let total = self.args.process_count();
        if total <= 1 {
            return self.executor.execute(mode, &self.args, image_dir);
        }

        info!(%mode, workers = total, image_dir = %image_dir.display(), "starting workers");
        let mut workers = Vec::with_capacity(total);
        let mut spawn_error = None;
        for process_id in 0..total {
            match self.executor.spawn(mode, &self.args, image_dir, process_id) {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    spawn_error = Some(err);
                    break;
                }
            }
        }

        let mut join_error = None;
        let mut failed = Vec::new();
        for worker in workers {
            let process_id = worker.process_id();
            match worker.join() {
                Ok(WorkerExit::Success) => {}
                Ok(WorkerExit::Failed(code)) => {
                    warn!(process_id, ?code, "worker failed");
                    failed.push((process_id, code));
                }
                Err(err) => {
                    warn!(process_id, "could not join worker: {err}");
                    join_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = spawn_error.or(join_error) {
            return Err(err);
        }
        if !failed.is_empty() {
            return Err(OcrSystemError::WorkerFailed { failed });
        }
        Ok(())
    }

    /// Runs the loaded text system on one image.
    pub fn ocr(
        &mut self,
        input: impl Into<OcrInput>,
        flags: StageFlags,
    ) -> Result<OcrResult, OcrSystemError> {
        let text_sys = self.text_sys.as_mut().ok_or(OcrSystemError::NotLoaded)?;
        let image = input.into().into_image()?;
        Ok(text_sys.predict(&image, flags)?)
    }

    pub fn predict_det(&mut self, image_dir: impl AsRef<Path>) -> Result<(), OcrSystemError> {
        self.run(BatchMode::Det, image_dir)
    }

    pub fn predict_cls(&mut self, image_dir: impl AsRef<Path>) -> Result<(), OcrSystemError> {
        self.run(BatchMode::Cls, image_dir)
    }

    pub fn predict_rec(&mut self, image_dir: impl AsRef<Path>) -> Result<(), OcrSystemError> {
        self.run(BatchMode::Rec, image_dir)
    }

    pub fn predict_system(&mut self, image_dir: impl AsRef<Path>) -> Result<(), OcrSystemError> {
        self.run(BatchMode::System, image_dir)
    }
}
