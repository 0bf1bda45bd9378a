pub mod cli;
mod error;
pub mod runner;
pub mod settings;
mod system;

use agentocr_infer::BatchMode;
use tracing::info;

pub use agentocr_infer as infer;
pub use error::OcrSystemError;
pub use system::{
    ArgsParser, DefaultArgsParser, OcrSystem, OcrSystemBuilder, SystemLoader, TextSystemLoader,
};

use cli::CliArgs;
use settings::resolve_settings;

/// Installs the global subscriber; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Command-line entry point: parse, merge the config file, run one mode.
pub fn command() -> Result<(), OcrSystemError> {
    run_command(cli::parse_cli(), OcrSystem::builder())
}

/// Runs a parsed command line with the given system builder.
///
/// The mode is validated before any model is loaded.
pub fn run_command(cli: CliArgs, builder: OcrSystemBuilder) -> Result<(), OcrSystemError> {
    let settings = resolve_settings(&cli)?;
    let mode: BatchMode = settings.mode.parse()?;
    info!(%mode, image_dir = %settings.image_dir.display(), "running");

    let mut system = builder.args(settings.args).build()?;
    match mode {
        BatchMode::Cls => system.predict_cls(&settings.image_dir),
        BatchMode::Det => system.predict_det(&settings.image_dir),
        BatchMode::Rec => system.predict_rec(&settings.image_dir),
        BatchMode::System => system.predict_system(&settings.image_dir),
    }
}
