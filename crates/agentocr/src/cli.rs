use std::ffi::OsString;
use std::path::PathBuf;

use agentocr_infer::InferArgs;
use clap::Parser;
use clap::error::{ContextKind, ContextValue, ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::OcrSystemError;

/// Parses the process arguments, exiting on `--help` or malformed input.
///
/// Unrecognized flags are logged and skipped.
pub fn parse_cli() -> CliArgs {
    match parse_known(std::env::args_os()) {
        Ok((args, ignored)) => {
            warn_ignored(&ignored);
            args
        }
        Err(err) => err.exit(),
    }
}

/// Like [`parse_cli`] but reports errors instead of exiting.
pub fn try_parse_cli<I, T>(argv: I) -> Result<CliArgs, OcrSystemError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let (args, ignored) =
        parse_known(argv).map_err(|err| OcrSystemError::configuration(err.to_string()))?;
    warn_ignored(&ignored);
    Ok(args)
}

/// Parses `argv`, returning the tokens clap rejected as unknown alongside the
/// arguments it understood.
pub fn parse_known<I, T>(argv: I) -> Result<(CliArgs, Vec<OsString>), clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut argv: Vec<OsString> = argv.into_iter().map(Into::into).collect();
    let mut ignored = Vec::new();
    loop {
        let err = match CliArgs::try_parse_from(&argv) {
            Ok(args) => return Ok((args, ignored)),
            Err(err) => err,
        };
        if err.kind() != ErrorKind::UnknownArgument {
            return Err(err);
        }
        let Some(ContextValue::String(unknown)) = err.get(ContextKind::InvalidArg) else {
            return Err(err);
        };
        let inline = format!("{unknown}=");
        let position = argv.iter().skip(1).position(|token| {
            token
                .to_str()
                .is_some_and(|token| token == unknown.as_str() || token.starts_with(&inline))
        });
        match position {
            Some(index) => ignored.push(argv.remove(index + 1)),
            None => return Err(err),
        }
    }
}

fn warn_ignored(ignored: &[OsString]) {
    if !ignored.is_empty() {
        warn!(?ignored, "ignoring unrecognized command-line arguments");
    }
}

#[derive(Debug, Clone, PartialEq, Parser, Serialize, Deserialize)]
#[command(
    name = "agentocr",
    about = "Run text detection, orientation classification and recognition over image folders",
    disable_help_subcommand = true
)]
pub struct CliArgs {
    /// Workload to run: cls, det, rec or system
    #[arg(value_name = "MODE")]
    pub mode: String,

    /// JSON (or .toml) file whose keys override the command line
    #[arg(long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory of images to process, or a single image file
    #[arg(long = "image_dir", alias = "image-dir", value_name = "DIR")]
    pub image_dir: PathBuf,

    #[command(flatten)]
    #[serde(flatten)]
    pub infer: InferArgs,
}
