use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use agentocr_infer::{InferArgs, merge_overrides};
use serde_json::{Map, Value};
use tracing::debug;

use crate::cli::CliArgs;

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    InvalidValue {
        path: Option<PathBuf>,
        field: &'static str,
        value: String,
    },
    NotFound {
        path: PathBuf,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(
                    f,
                    "failed to read config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Parse { path, source } => {
                write!(
                    f,
                    "failed to parse config file {}: {}",
                    path.display(),
                    source
                )
            }
            ConfigError::InvalidValue { path, field, value } => {
                if let Some(path) = path {
                    write!(
                        f,
                        "invalid value '{}' for '{}' in {}",
                        value,
                        field,
                        path.display()
                    )
                } else {
                    write!(f, "invalid value '{}' for '{}'", value, field)
                }
            }
            ConfigError::NotFound { path } => {
                write!(f, "config file {} does not exist", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source.as_ref()),
            ConfigError::InvalidValue { .. } => None,
            ConfigError::NotFound { .. } => None,
        }
    }
}

/// Command line after the optional config file has been folded in.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveSettings {
    pub mode: String,
    pub image_dir: PathBuf,
    pub args: InferArgs,
    pub config_path: Option<PathBuf>,
}

/// Applies the `--config` file, if any, on top of the parsed command line.
///
/// Every key in the file replaces the same-named command-line value,
/// including `mode` and `image_dir`.
pub fn resolve_settings(cli: &CliArgs) -> Result<EffectiveSettings, ConfigError> {
    let Some(path) = cli.config.as_deref() else {
        return Ok(EffectiveSettings {
            mode: cli.mode.clone(),
            image_dir: cli.image_dir.clone(),
            args: cli.infer.clone(),
            config_path: None,
        });
    };

    let overrides = load_config_file(path)?;
    debug!(config = %path.display(), keys = overrides.len(), "merging config file");
    let merged: CliArgs =
        merge_overrides(cli, &overrides).map_err(|err| ConfigError::InvalidValue {
            path: Some(path.to_path_buf()),
            field: "config",
            value: err.to_string(),
        })?;
    Ok(EffectiveSettings {
        mode: merged.mode,
        image_dir: merged.image_dir,
        args: merged.infer,
        config_path: Some(path.to_path_buf()),
    })
}

/// Reads a JSON object, or a TOML table for `.toml` files.
pub fn load_config_file(path: &Path) -> Result<Map<String, Value>, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value = if is_toml(path) {
        let table: toml::Table = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        serde_json::to_value(table).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?
    } else {
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?
    };
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::InvalidValue {
            path: Some(path.to_path_buf()),
            field: "config",
            value: format!("expected an object, got {other}"),
        }),
    }
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}
