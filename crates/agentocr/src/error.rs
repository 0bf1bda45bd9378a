use std::io;

use agentocr_infer::{InferError, UnknownMode};
use thiserror::Error;

use crate::settings::ConfigError;

#[derive(Debug, Error)]
pub enum OcrSystemError {
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error(transparent)]
    Mode(#[from] UnknownMode),
    #[error("text system is not loaded; call load() first")]
    NotLoaded,
    #[error(transparent)]
    Infer(#[from] InferError),
    #[error(transparent)]
    Settings(#[from] ConfigError),
    #[error("failed to spawn worker {process_id}: {source}")]
    Spawn {
        process_id: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for worker {process_id}: {source}")]
    Join {
        process_id: usize,
        #[source]
        source: io::Error,
    },
    #[error("{} worker(s) failed: {}", .failed.len(), describe_failures(.failed))]
    WorkerFailed { failed: Vec<(usize, Option<i32>)> },
    #[error("worker error: {message}")]
    Worker { message: String },
}

impl OcrSystemError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn worker(message: impl Into<String>) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }
}

fn describe_failures(failed: &[(usize, Option<i32>)]) -> String {
    failed
        .iter()
        .map(|(process_id, code)| match code {
            Some(code) => format!("#{process_id} exited with {code}"),
            None => format!("#{process_id} terminated by signal"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}
