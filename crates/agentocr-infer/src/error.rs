use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InferError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("backend error: {message}")]
    Backend { message: String },
    #[error("failed to serialize result: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl InferError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
